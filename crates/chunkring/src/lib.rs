#![deny(unsafe_code)]
#![deny(rustdoc::broken_intra_doc_links)]
#![deny(missing_docs)]

//! # Overview
//!
//! `chunkring` is the client-side retention buffer for chunks already sent
//! on the wire. It is the only place a client holds chunk bytes after
//! emission, decoupling transport buffering from re-reading the source file
//! on retransmission.
//!
//! # Design
//!
//! [`ChunkRing`] is a plain deque keyed by ascending `seek`, bounded to at
//! most `maxqueue` entries. `push` evicts the lowest-`seek` record once the
//! bound would be exceeded; `resend_from` walks forward from a requested
//! `seek` and returns every retained record at or after it. No indexing
//! structure is needed because retransmission always starts at a single
//! cursor, never a scattered set of offsets.
//!
//! # Invariants
//!
//! - Records are retained in strictly ascending `seek` order.
//! - `len() <= maxqueue` always holds after `push`.
//! - `resend_from(seek)` fails with [`Error::RetentionExhausted`] when `seek`
//!   is below [`ChunkRing::low_water`] — the ring cannot reconstruct bytes it
//!   has already evicted, and the caller must treat that as fatal.

use std::collections::VecDeque;

use thiserror::Error;

/// Failures surfaced by [`ChunkRing::resend_from`].
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The requested `seek` is below everything the ring still retains.
    #[error("requested resend from seek {requested}, but retention starts at {low_water}")]
    RetentionExhausted {
        /// The seek the caller asked to resend from.
        requested: u64,
        /// The lowest seek still retained by the ring.
        low_water: u64,
    },
}

/// One chunk the client has sent and may need to retransmit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkRecord {
    /// Byte offset at which `payload` begins.
    pub seek: u64,
    /// Chunk payload as sent on the wire.
    pub payload: Vec<u8>,
    /// Whether this was the final chunk of the upload.
    pub is_last: bool,
    /// SHA-256 trailer, present iff `is_last`.
    pub checksum_trailer: Option<[u8; 32]>,
}

/// Bounded, seek-ordered retention buffer of recently sent chunks.
#[derive(Debug, Clone)]
pub struct ChunkRing {
    maxqueue: usize,
    records: VecDeque<ChunkRecord>,
}

impl ChunkRing {
    /// Creates an empty ring retaining at most `maxqueue` records.
    #[must_use]
    pub fn new(maxqueue: usize) -> Self {
        Self {
            maxqueue: maxqueue.max(1),
            records: VecDeque::new(),
        }
    }

    /// Appends a newly sent chunk, evicting the oldest record if the ring is full.
    ///
    /// # Panics
    ///
    /// Panics if `record.seek` is not strictly greater than the seek of the
    /// most recently pushed record — the client state machine only ever
    /// advances its send pointer forward between pushes.
    pub fn push(&mut self, record: ChunkRecord) {
        if let Some(last) = self.records.back() {
            assert!(
                record.seek > last.seek,
                "chunk ring received out-of-order seek {} after {}",
                record.seek,
                last.seek
            );
        }
        if self.records.len() >= self.maxqueue {
            self.records.pop_front();
        }
        self.records.push_back(record);
    }

    /// Returns every retained record with `seek >= seek`, in ascending order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RetentionExhausted`] if `seek` is below
    /// [`ChunkRing::low_water`] — the gap means some bytes in between have
    /// already been evicted and cannot be reconstructed.
    pub fn resend_from(&self, seek: u64) -> Result<Vec<ChunkRecord>, Error> {
        if let Some(low) = self.low_water() {
            if seek < low {
                return Err(Error::RetentionExhausted {
                    requested: seek,
                    low_water: low,
                });
            }
        }
        Ok(self
            .records
            .iter()
            .filter(|r| r.seek >= seek)
            .cloned()
            .collect())
    }

    /// Lowest retained seek, or `None` if the ring is empty.
    #[must_use]
    pub fn low_water(&self) -> Option<u64> {
        self.records.front().map(|r| r.seek)
    }

    /// Highest retained seek, or `None` if the ring is empty.
    #[must_use]
    pub fn high_water(&self) -> Option<u64> {
        self.records.back().map(|r| r.seek)
    }

    /// Number of retained records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the ring currently retains no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Drops all retained records, e.g. once the upload completes.
    pub fn clear(&mut self) {
        self.records.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(seek: u64, len: usize) -> ChunkRecord {
        ChunkRecord {
            seek,
            payload: vec![0u8; len],
            is_last: false,
            checksum_trailer: None,
        }
    }

    #[test]
    fn push_evicts_lowest_seek_once_full() {
        let mut ring = ChunkRing::new(2);
        ring.push(record(0, 4));
        ring.push(record(4, 4));
        ring.push(record(8, 4));

        assert_eq!(ring.len(), 2);
        assert_eq!(ring.low_water(), Some(4));
        assert_eq!(ring.high_water(), Some(8));
    }

    #[test]
    fn resend_from_returns_ascending_suffix() {
        let mut ring = ChunkRing::new(4);
        ring.push(record(0, 4));
        ring.push(record(4, 4));
        ring.push(record(8, 2));

        let resent = ring.resend_from(4).unwrap();
        assert_eq!(resent.iter().map(|r| r.seek).collect::<Vec<_>>(), vec![4, 8]);
    }

    #[test]
    fn resend_below_low_water_is_retention_exhausted() {
        let mut ring = ChunkRing::new(1);
        ring.push(record(0, 4));
        ring.push(record(4, 4));

        assert_eq!(
            ring.resend_from(0),
            Err(Error::RetentionExhausted {
                requested: 0,
                low_water: 4,
            })
        );
    }

    #[test]
    fn resend_from_empty_ring_succeeds_with_no_records() {
        let ring = ChunkRing::new(4);
        assert_eq!(ring.resend_from(0), Ok(vec![]));
    }

    #[test]
    #[should_panic(expected = "out-of-order")]
    fn push_rejects_non_increasing_seek() {
        let mut ring = ChunkRing::new(4);
        ring.push(record(4, 4));
        ring.push(record(4, 4));
    }
}
