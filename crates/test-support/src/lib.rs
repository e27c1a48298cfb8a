#![deny(unsafe_code)]
#![deny(rustdoc::broken_intra_doc_links)]
#![deny(missing_docs)]

//! # Overview
//!
//! `test-support` wires `upload-client` and `upload-server` together over the
//! in-process [`transport::ChannelTransport`]/[`transport::ChannelRoutingTransport`]
//! pair, centralizing shared scaffolding so every integration test file does
//! not reassemble the same plumbing.
//!
//! # Design
//!
//! [`ServerHarness`] owns the server-side collaborators (credit controller,
//! staging, validator, registry) plus a fake millisecond clock the test
//! advances explicitly, since both state machines take `now` as a plain
//! `u64` rather than reading the system clock. [`drive_client_once`] and
//! [`apply_client_effects`] replay the same effect-handling loop
//! `bin/oc-upload`'s `drive` function runs, minus real timers: tests fire
//! [`upload_client::ClientEvent::ApprovalTimerFired`] and
//! [`upload_client::ClientEvent::InactivityTimerFired`] explicitly instead of
//! waiting on a clock.

use std::path::Path;

use credit::{CreditController, TimeoutAction};
use storage::FsStaging;
use transport::{channel_pair, ChannelRoutingTransport, ChannelTransport, RoutingTransport, Transport};
use upload_client::{ClientEffect, ClientEvent, ClientUpload};
use upload_server::{ServerConfig, ServerEffect, ServerEvent, UploadRegistry};
use validator::SchemaValidator;
use wire::Message;

/// Server-side collaborators and a fake clock, assembled the way
/// `bin/oc-upload-server`'s event loop assembles them.
pub struct ServerHarness {
    /// The routing transport new client connections attach to via [`ServerHarness::connect`].
    pub routing: ChannelRoutingTransport,
    staging: FsStaging,
    validator: SchemaValidator,
    /// The shared credit controller, exposed so tests can assert on outstanding credit directly.
    pub credit: CreditController,
    registry: UploadRegistry<FsStaging>,
    config: ServerConfig,
    now: u64,
}

impl ServerHarness {
    /// Creates a harness staging into `staging_root` and promoting into
    /// `destination_root`, with the given global credit budget and per-upload
    /// parameters.
    #[must_use]
    pub fn new(
        staging_root: &Path,
        destination_root: &Path,
        global_budget_chunks: u32,
        maxqueue: u32,
        chunksize: u32,
    ) -> Self {
        Self {
            routing: ChannelRoutingTransport::new(),
            staging: FsStaging::new(staging_root, destination_root),
            validator: SchemaValidator,
            credit: CreditController::new(global_budget_chunks),
            registry: UploadRegistry::new(),
            config: ServerConfig { chunksize, maxqueue },
            now: 0,
        }
    }

    /// Attaches a new client transport for `identity`. Calling this again
    /// with an identity already attached simulates a reconnect.
    pub fn connect(&mut self, identity: Vec<u8>) -> ChannelTransport {
        channel_pair(&mut self.routing, identity)
    }

    /// Advances the harness's fake clock by `delta` milliseconds.
    pub fn advance(&mut self, delta: u64) -> u64 {
        self.now += delta;
        self.now
    }

    /// The state currently tracked for `identity`, if any.
    #[must_use]
    pub fn state_of(&self, identity: &Vec<u8>) -> Option<&upload_server::ServerState> {
        self.registry.state_of(identity)
    }

    /// The number of currently active server-side sessions.
    #[must_use]
    pub fn active_sessions(&self) -> usize {
        self.registry.len()
    }

    /// Processes every record currently buffered on the routing transport,
    /// dispatching each through the registry and sending back any effects.
    /// Returns the number of records processed.
    pub fn pump(&mut self) -> usize {
        self.pump_n(usize::MAX)
    }

    /// Processes at most `limit` records currently buffered on the routing
    /// transport, leaving the rest queued. Lets a test simulate a transport
    /// that delivered only some of what the client already sent.
    pub fn pump_n(&mut self, limit: usize) -> usize {
        let mut processed = 0;
        while processed < limit {
            let Some((identity, frames)) = self.routing.recv().expect("routing transport recv") else {
                break;
            };
            processed += 1;
            let message = Message::decode(&frames).expect("server received a well-formed message");
            let event = to_server_event(message);
            let effects = self.registry.dispatch(
                identity.clone(),
                event,
                &self.staging,
                &self.validator,
                &mut self.credit,
                &self.config,
                self.now,
            );
            self.send_effects(&identity, effects);
        }
        processed
    }

    /// Discards the next buffered record without dispatching it, simulating
    /// a frame the transport lost in flight. Returns whether a record was
    /// available to discard.
    pub fn drop_next(&mut self) -> bool {
        self.routing.recv().expect("routing transport recv").is_some()
    }

    /// Delivers a reconnect notification for `identity` through the registry,
    /// mirroring what the event loop does after [`RoutingTransport::take_reconnected`].
    pub fn notify_reconnected(&mut self, identity: &Vec<u8>) {
        let effects = self.registry.dispatch(
            identity.clone(),
            ServerEvent::PeerReconnected,
            &self.staging,
            &self.validator,
            &mut self.credit,
            &self.config,
            self.now,
        );
        self.send_effects(identity, effects);
    }

    /// Runs one idle-timeout sweep at the harness's current clock value,
    /// applying probes and fatal aborts, and returns the actions taken.
    pub fn sweep(&mut self, idle_timeout_ms: u64) -> Vec<TimeoutAction> {
        let actions = self.credit.on_timeout(self.now, idle_timeout_ms);
        for action in &actions {
            match action {
                TimeoutAction::Probe(identity) => {
                    let effects = self.registry.dispatch(
                        identity.clone(),
                        ServerEvent::QueryStatus,
                        &self.staging,
                        &self.validator,
                        &mut self.credit,
                        &self.config,
                        self.now,
                    );
                    self.send_effects(identity, effects);
                }
                TimeoutAction::FatalTimeout(identity) => {
                    self.registry.abort_identity(
                        identity,
                        &self.staging,
                        &mut self.credit,
                        408,
                        "timeout".to_string(),
                    );
                }
            }
        }
        actions
    }

    /// Redistributes any globally free credit budget across uploads still
    /// below their own `maxqueue`, mirroring the periodic rebalance the real
    /// event loop runs after its idle-timeout sweep. Returns the grants made.
    pub fn rebalance(&mut self) -> Vec<(Vec<u8>, u32)> {
        let grants = self.credit.rebalance(self.now);
        for (identity, amount) in &grants {
            self.routing
                .send(identity, Message::TransferCredit { amount: *amount }.encode())
                .expect("routing transport send");
        }
        grants
    }

    fn send_effects(&mut self, identity: &Vec<u8>, effects: Vec<ServerEffect>) {
        for effect in effects {
            if let ServerEffect::SendMessage(message) = effect {
                self.routing
                    .send(identity, message.encode())
                    .expect("routing transport send");
            }
        }
    }
}

fn to_server_event(message: Message) -> ServerEvent {
    match message {
        Message::PostFile { filename, meta } => ServerEvent::PostFile {
            filename,
            metadata_json: meta,
        },
        Message::PostChunk {
            seek,
            data,
            last,
            checksum,
        } => ServerEvent::PostChunk {
            seek,
            data,
            last,
            checksum,
        },
        Message::QueryStatus => ServerEvent::QueryStatus,
        other => panic!("unexpected client-to-server message in test harness: {other:?}"),
    }
}

/// Drains every record currently buffered on `transport`, feeding each
/// through `client` and applying the resulting effects against `source`.
pub fn drive_client_once(client: &mut ClientUpload, transport: &mut ChannelTransport, source: &[u8]) {
    while let Some(frames) = transport.recv().expect("client transport recv") {
        let message = Message::decode(&frames).expect("client received a well-formed message");
        let effects = client.handle(ClientEvent::MessageReceived(message));
        apply_client_effects(client, transport, source, effects);
    }
}

/// Applies one batch of [`ClientEffect`]s: sends messages over `transport`,
/// serves [`ClientEffect::ReadChunk`] out of `source`, and recurses on any
/// follow-up events those reads produce. Timer effects are left for the
/// caller to act on explicitly.
pub fn apply_client_effects(
    client: &mut ClientUpload,
    transport: &mut ChannelTransport,
    source: &[u8],
    effects: Vec<ClientEffect>,
) {
    let mut follow_up = Vec::new();
    for effect in effects {
        match effect {
            ClientEffect::SendMessage(message) => {
                transport.send(message.encode()).expect("client transport send");
            }
            ClientEffect::ReadChunk { seek, max_len } => {
                let start = seek as usize;
                let end = (start + max_len as usize).min(source.len());
                let data = source[start..end].to_vec();
                let is_eof = seek + data.len() as u64 >= source.len() as u64;
                follow_up.push(ClientEvent::ChunkRead { seek, data, is_eof });
            }
            ClientEffect::StartApprovalTimer
            | ClientEffect::CancelApprovalTimer
            | ClientEffect::StartInactivityTimer
            | ClientEffect::CancelInactivityTimer
            | ClientEffect::ReportDone { .. }
            | ClientEffect::ReportFailed { .. } => {}
        }
    }
    for event in follow_up {
        let effects = client.handle(event);
        apply_client_effects(client, transport, source, effects);
    }
}
