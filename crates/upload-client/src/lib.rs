#![deny(unsafe_code)]
#![deny(rustdoc::broken_intra_doc_links)]
#![deny(missing_docs)]

//! # Overview
//!
//! `upload-client` drives one file upload from initiation through streaming,
//! credit waits, retransmission, and commit acknowledgment. It implements
//! the explicit-state-machine redesign the protocol calls for: a single
//! [`ClientUpload::handle`] function mapping `(state, event) -> effects`,
//! so the whole transfer is testable without a live transport.
//!
//! # Design
//!
//! [`ClientState`] is `Init -> AwaitApproval -> Streaming -> Draining ->
//! AwaitFinish -> Done`, with `Failed` reachable from any state.
//! [`ClientEvent`] covers everything that can happen to the machine — a
//! decoded server message, a fired timer, a chunk read back from the source
//! file, a reconnect notification, or a cancellation request.
//! [`ClientEffect`] is the machine's only output: plain data describing what
//! the driving event loop must do (send a message, start or cancel a timer,
//! read the next chunk from disk, or report a terminal outcome). The
//! machine never touches a transport or a filesystem directly.
//!
//! # Invariants
//!
//! - The running SHA-256 digest is updated with exactly the bytes emitted,
//!   in send order, and only finalized once, on the last chunk.
//! - [`ClientEffect::ReadChunk`] is only emitted while `credit > 0`; the
//!   machine never asks the event loop to read ahead of its own credit.
//! - A `retention-exhausted` chunk-ring error during resynchronization is
//!   always fatal, never retried.

use checksum::Sha256;
use chunkring::{ChunkRecord, ChunkRing};
use tracing::{debug, warn};
use wire::{Message, CHECKSUM_LEN};

/// Maximum consecutive inactivity timeouts before the client gives up.
pub const MAX_RETRIES: u32 = 5;

/// States of the client upload state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientState {
    /// Not yet started.
    Init,
    /// `post-file` sent, waiting for `upload-approved` or `error`.
    AwaitApproval,
    /// Actively sending chunks while credit remains.
    Streaming,
    /// Out of credit, waiting for `transfer-credit` or `status-report`.
    Draining,
    /// Last chunk sent, waiting for `upload-finished`.
    AwaitFinish,
    /// Upload committed successfully.
    Done,
    /// Upload terminated with a fatal error.
    Failed {
        /// Wire-level error code, or a locally synthesized one.
        code: u32,
        /// Human-readable detail, reported to the user verbatim.
        msg: String,
    },
}

/// Inputs the client upload state machine reacts to.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// Begin the upload.
    Start,
    /// A message was received from the server.
    MessageReceived(Message),
    /// The approval timer fired without a response.
    ApprovalTimerFired,
    /// The inactivity timer fired while draining or awaiting the final commit ack.
    InactivityTimerFired,
    /// The event loop read the next chunk of source data in response to a
    /// prior [`ClientEffect::ReadChunk`].
    ChunkRead {
        /// Offset the read was requested at.
        seek: u64,
        /// Bytes read (may be shorter than requested only at EOF).
        data: Vec<u8>,
        /// Whether this chunk consumes the last byte of the source.
        is_eof: bool,
    },
    /// The transport reported that the byte-layer session was re-established.
    ReconnectNotified,
    /// The front end requested cancellation.
    Cancel,
}

/// Outputs of the client upload state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEffect {
    /// Send this message to the server.
    SendMessage(Message),
    /// Start (or restart) the approval timer.
    StartApprovalTimer,
    /// Cancel the approval timer.
    CancelApprovalTimer,
    /// Start (or restart) the inactivity timer.
    StartInactivityTimer,
    /// Cancel the inactivity timer.
    CancelInactivityTimer,
    /// Read up to `max_len` bytes of source data starting at `seek`.
    ReadChunk {
        /// Offset to read from.
        seek: u64,
        /// Maximum number of bytes to read.
        max_len: u32,
    },
    /// The upload completed successfully.
    ReportDone {
        /// Server-assigned identifier for the finalized upload.
        upload_id: String,
    },
    /// The upload terminated with a fatal error.
    ReportFailed {
        /// Wire-level or locally synthesized error code.
        code: u32,
        /// Human-readable detail.
        msg: String,
    },
}

/// Drives one client-side file upload.
pub struct ClientUpload {
    state: ClientState,
    filename: String,
    metadata_json: String,
    file_size: u64,
    chunksize: u32,
    maxqueue: u32,
    credit: u32,
    send_pointer: u64,
    retries: u32,
    sent_final: bool,
    ring: ChunkRing,
    hasher: Option<Sha256>,
}

impl ClientUpload {
    /// Creates a new client upload for a source file of `file_size` bytes.
    #[must_use]
    pub fn new(filename: impl Into<String>, metadata_json: impl Into<String>, file_size: u64) -> Self {
        Self {
            state: ClientState::Init,
            filename: filename.into(),
            metadata_json: metadata_json.into(),
            file_size,
            chunksize: 0,
            maxqueue: 0,
            credit: 0,
            send_pointer: 0,
            retries: 0,
            sent_final: false,
            ring: ChunkRing::new(1),
            hasher: Some(Sha256::new()),
        }
    }

    /// The machine's current state.
    #[must_use]
    pub fn state(&self) -> &ClientState {
        &self.state
    }

    /// Drives the machine with one event, returning the effects to perform.
    pub fn handle(&mut self, event: ClientEvent) -> Vec<ClientEffect> {
        match event {
            ClientEvent::Cancel => self.on_cancel(),
            ClientEvent::MessageReceived(Message::Error { code, msg }) => self.fail(code, msg),
            ClientEvent::Start => self.on_start(),
            ClientEvent::MessageReceived(msg) => self.on_message(msg),
            ClientEvent::ApprovalTimerFired => self.on_approval_timer(),
            ClientEvent::InactivityTimerFired => self.on_inactivity_timer(),
            ClientEvent::ChunkRead { seek, data, is_eof } => self.on_chunk_read(seek, data, is_eof),
            ClientEvent::ReconnectNotified => self.on_reconnect(),
        }
    }

    fn on_start(&mut self) -> Vec<ClientEffect> {
        if self.state != ClientState::Init {
            return Vec::new();
        }
        self.state = ClientState::AwaitApproval;
        debug!(filename = %self.filename, "sending post-file");
        vec![
            ClientEffect::SendMessage(Message::PostFile {
                filename: self.filename.clone(),
                meta: self.metadata_json.clone(),
            }),
            ClientEffect::StartApprovalTimer,
        ]
    }

    fn on_reconnect(&mut self) -> Vec<ClientEffect> {
        match self.state {
            ClientState::AwaitApproval => vec![ClientEffect::SendMessage(Message::PostFile {
                filename: self.filename.clone(),
                meta: self.metadata_json.clone(),
            })],
            _ => Vec::new(),
        }
    }

    fn on_message(&mut self, message: Message) -> Vec<ClientEffect> {
        match (&self.state, message) {
            (
                ClientState::AwaitApproval,
                Message::UploadApproved {
                    credit,
                    chunksize,
                    maxqueue,
                },
            ) => {
                self.credit = credit;
                self.chunksize = chunksize;
                self.maxqueue = maxqueue;
                self.ring = ChunkRing::new(maxqueue.max(1) as usize);
                self.state = ClientState::Streaming;
                let mut effects = vec![ClientEffect::CancelApprovalTimer];
                effects.extend(self.try_read_next());
                effects
            }
            (ClientState::Streaming | ClientState::Draining | ClientState::AwaitFinish, Message::StatusReport { seek, credit }) => {
                self.on_status_report(seek, credit)
            }
            (ClientState::Draining, Message::TransferCredit { amount }) => {
                self.credit += amount;
                self.state = ClientState::Streaming;
                let mut effects = vec![ClientEffect::CancelInactivityTimer];
                effects.extend(self.try_read_next());
                effects
            }
            (ClientState::AwaitFinish, Message::UploadFinished { upload_id }) => {
                self.state = ClientState::Done;
                self.ring.clear();
                vec![ClientEffect::CancelInactivityTimer, ClientEffect::ReportDone { upload_id }]
            }
            (_, other) => {
                warn!(?other, state = ?self.state, "unexpected message for current state");
                Vec::new()
            }
        }
    }

    fn on_status_report(&mut self, seek: u64, credit: u32) -> Vec<ClientEffect> {
        match self.ring.resend_from(seek) {
            Err(_) => self.fail(500, "retention-exhausted".to_string()),
            Ok(records) => {
                self.send_pointer = seek;
                self.credit = credit;
                self.state = ClientState::Streaming;
                let resent_final = records.iter().any(|r| r.is_last);
                let mut effects = vec![ClientEffect::CancelInactivityTimer];
                effects.extend(records.into_iter().map(|r| {
                    ClientEffect::SendMessage(chunk_record_to_message(&r))
                }));
                if resent_final || seek >= self.file_size {
                    self.sent_final = true;
                    self.state = ClientState::AwaitFinish;
                    effects.push(ClientEffect::StartInactivityTimer);
                } else {
                    effects.extend(self.try_read_next());
                }
                effects
            }
        }
    }

    fn on_approval_timer(&mut self) -> Vec<ClientEffect> {
        if self.state != ClientState::AwaitApproval {
            return Vec::new();
        }
        self.retries += 1;
        if self.retries > MAX_RETRIES {
            return self.fail(408, "timeout waiting for upload-approved".to_string());
        }
        vec![
            ClientEffect::SendMessage(Message::PostFile {
                filename: self.filename.clone(),
                meta: self.metadata_json.clone(),
            }),
            ClientEffect::StartApprovalTimer,
        ]
    }

    fn on_inactivity_timer(&mut self) -> Vec<ClientEffect> {
        if !matches!(self.state, ClientState::Draining | ClientState::AwaitFinish) {
            return Vec::new();
        }
        self.retries += 1;
        if self.retries > MAX_RETRIES {
            let msg = if self.state == ClientState::AwaitFinish {
                "timeout waiting for upload-finished".to_string()
            } else {
                "timeout waiting for transfer-credit".to_string()
            };
            return self.fail(408, msg);
        }
        vec![
            ClientEffect::SendMessage(Message::QueryStatus),
            ClientEffect::StartInactivityTimer,
        ]
    }

    fn on_chunk_read(&mut self, seek: u64, data: Vec<u8>, is_eof: bool) -> Vec<ClientEffect> {
        if self.state != ClientState::Streaming {
            return Vec::new();
        }
        if let Some(hasher) = self.hasher.as_mut() {
            hasher.update(&data);
        }

        let checksum = if is_eof {
            self.hasher.take().map(Sha256::finalize)
        } else {
            None
        };

        let record = ChunkRecord {
            seek,
            payload: data.clone(),
            is_last: is_eof,
            checksum_trailer: checksum,
        };
        self.ring.push(record);
        self.credit = self.credit.saturating_sub(1);
        self.send_pointer = seek + data.len() as u64;
        self.retries = 0;

        let message = Message::PostChunk {
            seek,
            data,
            last: is_eof,
            checksum,
        };
        let mut effects = vec![ClientEffect::SendMessage(message)];

        if is_eof {
            self.sent_final = true;
            self.state = ClientState::AwaitFinish;
            effects.push(ClientEffect::StartInactivityTimer);
        } else if self.credit == 0 {
            self.state = ClientState::Draining;
            effects.push(ClientEffect::StartInactivityTimer);
        } else {
            effects.extend(self.try_read_next());
        }
        effects
    }

    fn try_read_next(&mut self) -> Vec<ClientEffect> {
        if self.state != ClientState::Streaming || self.credit == 0 || self.sent_final {
            return Vec::new();
        }
        vec![ClientEffect::ReadChunk {
            seek: self.send_pointer,
            max_len: self.chunksize.max(1),
        }]
    }

    fn on_cancel(&mut self) -> Vec<ClientEffect> {
        if matches!(self.state, ClientState::Done | ClientState::Failed { .. }) {
            return Vec::new();
        }
        self.ring.clear();
        self.state = ClientState::Failed {
            code: 499,
            msg: "client-cancelled".to_string(),
        };
        vec![
            ClientEffect::SendMessage(Message::Error {
                code: 499,
                msg: "client-cancelled".to_string(),
            }),
            ClientEffect::ReportFailed {
                code: 499,
                msg: "client-cancelled".to_string(),
            },
        ]
    }

    fn fail(&mut self, code: u32, msg: String) -> Vec<ClientEffect> {
        self.ring.clear();
        self.state = ClientState::Failed {
            code,
            msg: msg.clone(),
        };
        vec![
            ClientEffect::SendMessage(Message::Error {
                code,
                msg: msg.clone(),
            }),
            ClientEffect::ReportFailed { code, msg },
        ]
    }
}

fn chunk_record_to_message(record: &ChunkRecord) -> Message {
    Message::PostChunk {
        seek: record.seek,
        data: record.payload.clone(),
        last: record.is_last,
        checksum: record.checksum_trailer,
    }
}

const _: () = assert!(CHECKSUM_LEN == 32);

#[cfg(test)]
mod tests {
    use super::*;

    fn approve(client: &mut ClientUpload, credit: u32, chunksize: u32, maxqueue: u32) {
        client.handle(ClientEvent::Start);
        client.handle(ClientEvent::MessageReceived(Message::UploadApproved {
            credit,
            chunksize,
            maxqueue,
        }));
    }

    #[test]
    fn happy_path_three_chunks() {
        let mut client = ClientUpload::new("report.bin", "{}", 10);
        approve(&mut client, 3, 4, 3);

        let effects = client.handle(ClientEvent::ChunkRead {
            seek: 0,
            data: b"hell".to_vec(),
            is_eof: false,
        });
        assert!(effects.iter().any(|e| matches!(e, ClientEffect::ReadChunk { seek: 4, .. })));

        client.handle(ClientEvent::ChunkRead {
            seek: 4,
            data: b"owor".to_vec(),
            is_eof: false,
        });
        let effects = client.handle(ClientEvent::ChunkRead {
            seek: 8,
            data: b"ld".to_vec(),
            is_eof: true,
        });

        assert!(matches!(client.state(), ClientState::AwaitFinish));
        let Some(ClientEffect::SendMessage(Message::PostChunk { checksum: Some(sum), last, .. })) =
            effects.first()
        else {
            panic!("expected final post-chunk effect");
        };
        assert!(*last);
        assert_eq!(*sum, Sha256::digest(b"helloworld"));

        let effects = client.handle(ClientEvent::MessageReceived(Message::UploadFinished {
            upload_id: "upload-1".to_string(),
        }));
        assert_eq!(
            effects,
            vec![
                ClientEffect::CancelInactivityTimer,
                ClientEffect::ReportDone {
                    upload_id: "upload-1".to_string()
                }
            ]
        );
        assert!(matches!(client.state(), ClientState::Done));
    }

    #[test]
    fn draining_resumes_on_transfer_credit() {
        let mut client = ClientUpload::new("report.bin", "{}", 12);
        approve(&mut client, 2, 4, 2);

        client.handle(ClientEvent::ChunkRead {
            seek: 0,
            data: vec![0u8; 4],
            is_eof: false,
        });
        let effects = client.handle(ClientEvent::ChunkRead {
            seek: 4,
            data: vec![0u8; 4],
            is_eof: false,
        });
        assert!(matches!(client.state(), ClientState::Draining));
        assert!(effects.contains(&ClientEffect::StartInactivityTimer));

        let effects = client.handle(ClientEvent::MessageReceived(Message::TransferCredit {
            amount: 1,
        }));
        assert!(matches!(client.state(), ClientState::Streaming));
        assert!(effects.iter().any(|e| matches!(e, ClientEffect::ReadChunk { seek: 8, .. })));
    }

    #[test]
    fn retention_exhausted_status_report_is_fatal() {
        let mut client = ClientUpload::new("report.bin", "{}", 100);
        approve(&mut client, 1, 4, 1);
        client.handle(ClientEvent::ChunkRead {
            seek: 0,
            data: vec![0u8; 4],
            is_eof: false,
        });
        // Ring now only retains seek=0; a status-report far behind it is exhausted.
        let effects = client.handle(ClientEvent::MessageReceived(Message::StatusReport {
            seek: 0,
            credit: 1,
        }));
        // seek 0 is still retained, so this one succeeds; now push past it to evict.
        assert!(!matches!(client.state(), ClientState::Failed { .. }));
        let _ = effects;

        client.handle(ClientEvent::ChunkRead {
            seek: 4,
            data: vec![0u8; 4],
            is_eof: false,
        });
        let effects = client.handle(ClientEvent::MessageReceived(Message::StatusReport {
            seek: 0,
            credit: 1,
        }));
        assert!(matches!(client.state(), ClientState::Failed { code: 500, .. }));
        assert!(effects
            .iter()
            .any(|e| matches!(e, ClientEffect::ReportFailed { code: 500, .. })));
        assert!(effects.contains(&ClientEffect::SendMessage(Message::Error {
            code: 500,
            msg: "retention-exhausted".to_string()
        })));
    }

    #[test]
    fn cancel_sends_error_and_fails() {
        let mut client = ClientUpload::new("report.bin", "{}", 10);
        approve(&mut client, 3, 4, 3);
        let effects = client.handle(ClientEvent::Cancel);
        assert!(matches!(client.state(), ClientState::Failed { code: 499, .. }));
        assert!(effects.contains(&ClientEffect::SendMessage(Message::Error {
            code: 499,
            msg: "client-cancelled".to_string()
        })));
    }

    #[test]
    fn zero_byte_file_sends_single_empty_last_chunk() {
        let mut client = ClientUpload::new("empty.bin", "{}", 0);
        approve(&mut client, 1, 4, 1);
        let effects = client.handle(ClientEvent::ChunkRead {
            seek: 0,
            data: vec![],
            is_eof: true,
        });
        let Some(ClientEffect::SendMessage(Message::PostChunk { data, last, checksum, .. })) =
            effects.first()
        else {
            panic!("expected post-chunk effect");
        };
        assert!(data.is_empty());
        assert!(*last);
        assert_eq!(checksum.unwrap(), Sha256::digest(b""));
    }
}
