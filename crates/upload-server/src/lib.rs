#![deny(unsafe_code)]
#![deny(rustdoc::broken_intra_doc_links)]
#![deny(missing_docs)]

//! # Overview
//!
//! `upload-server` is the per-`ClientIdentity` session state machine: it
//! validates the initial post, writes chunks into a staging file at the
//! declared seek offset, verifies the final checksum, promotes the staged
//! file, and coordinates with the credit controller. [`UploadRegistry`]
//! owns one [`ServerUpload`] per active identity, the server event loop's
//! only other piece of shared state besides the [`credit::CreditController`].
//!
//! # Design
//!
//! Same `handle(event) -> effects` shape as the client side:
//! [`ServerUpload::handle`] takes a [`ServerEvent`] plus the external
//! collaborators it needs for this call ([`storage::Staging`],
//! [`validator::MetadataValidator`], the credit controller) and returns the
//! [`ServerEffect`]s to perform — almost always just "send this message",
//! occasionally "this upload is finished/aborted, drop it". Disk writes and
//! validator calls happen synchronously inside `handle`; the binary is
//! expected to run the event loop on a blocking-friendly executor (or
//! dispatch through `tokio::task::spawn_blocking`) rather than have this
//! crate manage its own thread pool.
//!
//! # Invariants
//!
//! - `write_offset` is monotonically non-decreasing for every upload.
//! - A chunk whose `seek < write_offset` is silently discarded.
//! - A staged file is promoted only after its recomputed SHA-256 equals the
//!   client-supplied trailer.
//! - At most one active [`ServerUpload`] exists per identity at a time.

use std::collections::HashMap;

use credit::{CreditController, Identity};
use storage::Staging;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use validator::{MetadataValidator, Verdict};
use wire::Message;

/// Per-identity session states.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerState {
    /// No upload currently associated with this identity.
    Idle,
    /// Validating an incoming `post-file` (transient; never observed between calls).
    Validating,
    /// Writing chunks into the staging file.
    Writing,
    /// Verifying the final checksum and promoting the staged file.
    Committing,
    /// The upload was committed successfully.
    Finished,
    /// The upload was rejected before any staging file was created.
    Rejected {
        /// Wire-level error code reported to the peer.
        code: u32,
        /// Human-readable detail.
        msg: String,
    },
    /// The upload was aborted after a staging file existed.
    Aborted {
        /// Wire-level error code reported to the peer.
        code: u32,
        /// Human-readable detail.
        msg: String,
    },
}

/// Inputs the server upload state machine reacts to, already demultiplexed
/// to a single `ClientIdentity`.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// The peer announced a file upload.
    PostFile {
        /// Requested remote filename.
        filename: String,
        /// Opaque metadata JSON, verbatim text.
        metadata_json: String,
    },
    /// The peer delivered one chunk.
    PostChunk {
        /// Byte offset the chunk claims to start at.
        seek: u64,
        /// Chunk payload.
        data: Vec<u8>,
        /// Whether this is the final chunk.
        last: bool,
        /// SHA-256 trailer, present iff `last`.
        checksum: Option<[u8; 32]>,
    },
    /// The peer asked to resynchronize.
    QueryStatus,
    /// The transport reported this identity's byte-layer session was
    /// re-established.
    PeerReconnected,
}

/// Outputs of the server upload state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEffect {
    /// Send this message to the peer.
    SendMessage(Message),
    /// The upload reached a terminal successful state; the registry should
    /// drop this session after processing remaining effects.
    Finished,
    /// The upload reached a terminal failure state; the registry should drop
    /// this session after processing remaining effects.
    Aborted,
}

/// Server-wide tunables a [`ServerUpload`] applies uniformly to new uploads.
#[derive(Debug, Clone, Copy)]
pub struct ServerConfig {
    /// Chunk size the server asks every client to use.
    pub chunksize: u32,
    /// Per-upload ceiling on outstanding credit.
    pub maxqueue: u32,
}

/// One server-side upload session, keyed by a single `ClientIdentity`.
pub struct ServerUpload<S: Staging> {
    state: ServerState,
    identity: Identity,
    upload_id: Option<String>,
    filename: String,
    metadata_json: String,
    chunksize: u32,
    write_offset: u64,
    hasher: Option<checksum::Sha256>,
    handle: Option<S::Handle>,
}

impl<S: Staging> ServerUpload<S> {
    /// Creates an idle session for `identity`.
    #[must_use]
    pub fn new(identity: Identity) -> Self {
        Self {
            state: ServerState::Idle,
            identity,
            upload_id: None,
            filename: String::new(),
            metadata_json: String::new(),
            chunksize: 0,
            write_offset: 0,
            hasher: None,
            handle: None,
        }
    }

    /// The session's current state.
    #[must_use]
    pub fn state(&self) -> &ServerState {
        &self.state
    }

    /// Drives the session with one event.
    #[allow(clippy::too_many_arguments)]
    pub fn handle(
        &mut self,
        event: ServerEvent,
        staging: &S,
        validator: &dyn MetadataValidator,
        credit: &mut CreditController,
        config: &ServerConfig,
        now: u64,
    ) -> Vec<ServerEffect> {
        match event {
            ServerEvent::PostFile {
                filename,
                metadata_json,
            } => self.on_post_file(filename, metadata_json, staging, validator, credit, config, now),
            ServerEvent::PostChunk {
                seek,
                data,
                last,
                checksum,
            } => self.on_post_chunk(seek, data, last, checksum, staging, credit, now),
            ServerEvent::QueryStatus => self.on_query_status(credit),
            ServerEvent::PeerReconnected => {
                if self.state == ServerState::Writing {
                    credit.reissue_after_resume(&self.identity, now);
                }
                Vec::new()
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn on_post_file(
        &mut self,
        filename: String,
        metadata_json: String,
        staging: &S,
        validator: &dyn MetadataValidator,
        credit: &mut CreditController,
        config: &ServerConfig,
        now: u64,
    ) -> Vec<ServerEffect> {
        match &self.state {
            ServerState::Idle => {
                self.accept_new(filename, metadata_json, staging, validator, credit, config, now)
            }
            ServerState::Writing if self.filename == filename => {
                // Idempotent re-announcement: answer with the current parameters.
                let credit_outstanding = credit.credit_outstanding(&self.identity).unwrap_or(0);
                vec![
                    ServerEffect::SendMessage(Message::UploadApproved {
                        credit: credit_outstanding,
                        chunksize: config.chunksize,
                        maxqueue: config.maxqueue,
                    }),
                    ServerEffect::SendMessage(Message::StatusReport {
                        seek: self.write_offset,
                        credit: credit_outstanding,
                    }),
                ]
            }
            ServerState::Writing => {
                // Conflicting filename: abort the in-flight upload, then accept the new one.
                warn!(identity = ?self.identity, "conflicting post-file aborts in-flight upload");
                self.abort_in_flight(staging, credit, 409, "conflicting post-file".to_string());
                self.accept_new(filename, metadata_json, staging, validator, credit, config, now)
            }
            _ => self.accept_new(filename, metadata_json, staging, validator, credit, config, now),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn accept_new(
        &mut self,
        filename: String,
        metadata_json: String,
        staging: &S,
        validator: &dyn MetadataValidator,
        credit: &mut CreditController,
        config: &ServerConfig,
        now: u64,
    ) -> Vec<ServerEffect> {
        self.state = ServerState::Validating;
        if let Err(e) = storage::validate_filename(&filename) {
            self.state = ServerState::Idle;
            return vec![ServerEffect::SendMessage(Message::Error {
                code: 400,
                msg: e.to_string(),
            })];
        }

        match validator.validate(&filename, &metadata_json) {
            Verdict::Permanent(code, msg) => {
                self.state = ServerState::Idle;
                vec![ServerEffect::SendMessage(Message::Error { code, msg })]
            }
            Verdict::Transient(msg) => {
                self.state = ServerState::Idle;
                vec![ServerEffect::SendMessage(Message::Error { code: 503, msg })]
            }
            Verdict::Accept => {
                let upload_id = Uuid::new_v4().to_string();
                let handle = match staging.open(&upload_id) {
                    Ok(h) => h,
                    Err(e) => {
                        self.state = ServerState::Idle;
                        error!(%e, "failed to open staging file");
                        return vec![ServerEffect::SendMessage(Message::Error {
                            code: 500,
                            msg: "storage error".to_string(),
                        })];
                    }
                };

                let initial_credit = credit.on_accept(self.identity.clone(), config.maxqueue, now);
                self.upload_id = Some(upload_id.clone());
                self.filename = filename;
                self.metadata_json = metadata_json;
                self.chunksize = config.chunksize;
                self.write_offset = 0;
                self.hasher = Some(checksum::Sha256::new());
                self.handle = Some(handle);
                self.state = ServerState::Writing;
                info!(upload_id, "upload approved");

                vec![ServerEffect::SendMessage(Message::UploadApproved {
                    credit: initial_credit,
                    chunksize: config.chunksize,
                    maxqueue: config.maxqueue,
                })]
            }
        }
    }

    fn on_post_chunk(
        &mut self,
        seek: u64,
        data: Vec<u8>,
        last: bool,
        checksum: Option<[u8; 32]>,
        staging: &S,
        credit: &mut CreditController,
        now: u64,
    ) -> Vec<ServerEffect> {
        if self.state != ServerState::Writing {
            return Vec::new();
        }

        if data.len() as u64 > u64::from(self.chunksize) {
            return self.fail_writing(staging, credit, 413, "chunk-too-large".to_string());
        }
        if seek < self.write_offset {
            debug!(seek, write_offset = self.write_offset, "discarding duplicate chunk");
            return Vec::new();
        }
        if seek > self.write_offset {
            let credit_outstanding = credit.credit_outstanding(&self.identity).unwrap_or(0);
            return vec![ServerEffect::SendMessage(Message::StatusReport {
                seek: self.write_offset,
                credit: credit_outstanding,
            })];
        }

        let Some(handle) = self.handle.as_mut() else {
            return self.fail_writing(staging, credit, 500, "no staging handle".to_string());
        };
        if let Err(e) = staging.write_at(handle, seek, &data) {
            error!(%e, "staging write failed");
            return self.fail_writing(staging, credit, 500, "storage error".to_string());
        }

        if let Some(hasher) = self.hasher.as_mut() {
            hasher.update(&data);
        }
        self.write_offset += data.len() as u64;
        credit.on_chunk_received(&self.identity, now);

        if !last {
            let mut effects = Vec::new();
            if let Some(amount) = credit.on_write_complete(&self.identity, now) {
                effects.push(ServerEffect::SendMessage(Message::TransferCredit { amount }));
            }
            return effects;
        }

        self.state = ServerState::Committing;
        let Some(trailer) = checksum else {
            return self.fail_writing(staging, credit, 400, "missing checksum trailer".to_string());
        };
        let final_digest = self.hasher.take().map(checksum::Sha256::finalize).unwrap_or([0u8; 32]);

        if final_digest != trailer {
            warn!(upload_id = ?self.upload_id, "checksum mismatch on commit");
            if let Some(h) = self.handle.take() {
                let _ = staging.abort(h);
            }
            credit.on_disconnect(&self.identity);
            self.state = ServerState::Aborted {
                code: 422,
                msg: "checksum-mismatch".to_string(),
            };
            return vec![
                ServerEffect::SendMessage(Message::Error {
                    code: 422,
                    msg: "checksum-mismatch".to_string(),
                }),
                ServerEffect::Aborted,
            ];
        }

        let upload_id = self.upload_id.clone().unwrap_or_default();
        let hex = checksum::to_hex(&final_digest);
        let Some(h) = self.handle.take() else {
            return self.fail_writing(staging, credit, 500, "no staging handle".to_string());
        };
        if let Err(e) = staging.finalize(h, &self.filename, &self.metadata_json, &hex) {
            error!(%e, "promotion failed");
            credit.on_disconnect(&self.identity);
            self.state = ServerState::Aborted {
                code: 500,
                msg: "storage error".to_string(),
            };
            return vec![
                ServerEffect::SendMessage(Message::Error {
                    code: 500,
                    msg: "storage error".to_string(),
                }),
                ServerEffect::Aborted,
            ];
        }

        credit.on_disconnect(&self.identity);
        self.state = ServerState::Finished;
        info!(upload_id, "upload finished");
        vec![
            ServerEffect::SendMessage(Message::UploadFinished { upload_id }),
            ServerEffect::Finished,
        ]
    }

    fn on_query_status(&mut self, credit: &mut CreditController) -> Vec<ServerEffect> {
        if self.state != ServerState::Writing {
            return Vec::new();
        }
        let credit_outstanding = credit.credit_outstanding(&self.identity).unwrap_or(0);
        vec![ServerEffect::SendMessage(Message::StatusReport {
            seek: self.write_offset,
            credit: credit_outstanding,
        })]
    }

    fn fail_writing(
        &mut self,
        staging: &S,
        credit: &mut CreditController,
        code: u32,
        msg: String,
    ) -> Vec<ServerEffect> {
        self.abort_in_flight(staging, credit, code, msg.clone());
        vec![
            ServerEffect::SendMessage(Message::Error { code, msg }),
            ServerEffect::Aborted,
        ]
    }

    fn abort_in_flight(&mut self, staging: &S, credit: &mut CreditController, code: u32, msg: String) {
        if let Some(h) = self.handle.take() {
            let _ = staging.abort(h);
        }
        credit.on_disconnect(&self.identity);
        self.state = ServerState::Aborted { code, msg };
    }

    /// Forcibly aborts this session regardless of its current state, e.g.
    /// after the credit controller reports a [`credit::TimeoutAction::FatalTimeout`]
    /// for this identity. A no-op if the session already reached a terminal
    /// state.
    pub fn force_abort(&mut self, staging: &S, credit: &mut CreditController, code: u32, msg: String) {
        if matches!(
            self.state,
            ServerState::Finished | ServerState::Rejected { .. } | ServerState::Aborted { .. }
        ) {
            return;
        }
        self.abort_in_flight(staging, credit, code, msg);
    }
}

/// Owns one [`ServerUpload`] per active `ClientIdentity`.
pub struct UploadRegistry<S: Staging> {
    uploads: HashMap<Identity, ServerUpload<S>>,
}

impl<S: Staging> UploadRegistry<S> {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            uploads: HashMap::new(),
        }
    }

    /// Dispatches `event` to the session for `identity`, creating one if
    /// necessary, and returns the effects to perform. Sessions that reach a
    /// terminal state are removed from the registry after this call.
    #[allow(clippy::too_many_arguments)]
    pub fn dispatch(
        &mut self,
        identity: Identity,
        event: ServerEvent,
        staging: &S,
        validator: &dyn MetadataValidator,
        credit: &mut CreditController,
        config: &ServerConfig,
        now: u64,
    ) -> Vec<ServerEffect> {
        let upload = self
            .uploads
            .entry(identity.clone())
            .or_insert_with(|| ServerUpload::new(identity.clone()));
        let effects = upload.handle(event, staging, validator, credit, config, now);

        if effects
            .iter()
            .any(|e| matches!(e, ServerEffect::Finished | ServerEffect::Aborted))
        {
            self.uploads.remove(&identity);
        }
        effects
    }

    /// Returns the state of the session for `identity`, if one exists.
    #[must_use]
    pub fn state_of(&self, identity: &Identity) -> Option<&ServerState> {
        self.uploads.get(identity).map(ServerUpload::state)
    }

    /// Forcibly aborts and drops the session for `identity`, if one exists.
    /// The event loop calls this after the credit controller reports a
    /// [`credit::TimeoutAction::FatalTimeout`] for an unresponsive upload.
    pub fn abort_identity(
        &mut self,
        identity: &Identity,
        staging: &S,
        credit: &mut CreditController,
        code: u32,
        msg: String,
    ) {
        if let Some(mut upload) = self.uploads.remove(identity) {
            upload.force_abort(staging, credit, code, msg);
        }
    }

    /// Number of currently active sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.uploads.len()
    }

    /// Whether the registry currently tracks no sessions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.uploads.is_empty()
    }
}

impl<S: Staging> Default for UploadRegistry<S> {
    fn default() -> Self {
        Self::new()
    }
}
