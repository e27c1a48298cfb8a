#![deny(unsafe_code)]

//! # Overview
//!
//! `oc-upload-server` is the daemon front end for the upload protocol. It
//! binds the routing transport, owns the single [`credit::CreditController`]
//! and [`upload_server::UploadRegistry`] the event loop drives, and dispatches
//! decoded wire messages per `ClientIdentity`.
//!
//! # Design
//!
//! A single-threaded poll loop: one event loop demultiplexes inbound frames
//! by identity into per-upload state objects, runs an idle-timeout sweep
//! over the credit controller each tick, and never holds a session across an
//! `.await` point. Configuration layers `clap` flags over an optional TOML
//! file, flags winning on conflict.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::ExitCode as ProcessExitCode;
use std::time::{Duration, Instant};

use clap::Parser;
use credit::{CreditController, TimeoutAction};
use serde::Deserialize;
use storage::FsStaging;
use transport::{AuthorizedKeys, RoutingTransport, TcpRoutingTransport};
use upload_server::{ServerConfig, ServerEffect, ServerEvent, UploadRegistry};
use validator::SchemaValidator;
use wire::Message;

/// How often the event loop sweeps the credit controller for idle uploads.
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// How long the event loop sleeps between transport polls when idle.
const POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, Parser)]
#[command(name = "oc-upload-server", about = "Accept file uploads over the oc-upload protocol")]
struct Args {
    /// Optional TOML configuration file; explicit flags override its values.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Port to listen on.
    #[arg(long)]
    port: Option<u16>,
    /// Directory partial uploads are staged under.
    #[arg(long)]
    staging_root: Option<PathBuf>,
    /// Directory completed uploads are promoted into.
    #[arg(long)]
    destination_root: Option<PathBuf>,
    /// Directory of approved client public keys.
    #[arg(long)]
    authorized_keys: Option<PathBuf>,
    /// Global outstanding-credit budget, in whole chunks.
    #[arg(long)]
    global_credit_budget: Option<u32>,
    /// Per-upload ceiling on outstanding credit.
    #[arg(long)]
    max_queue: Option<u32>,
    /// Chunk size the server asks every client to use, in bytes.
    #[arg(long)]
    chunk_size: Option<u32>,
    /// Idle-upload timeout, in seconds, before a probe is sent.
    #[arg(long)]
    idle_timeout_secs: Option<u64>,
    /// Increase log verbosity; may be repeated.
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

/// The subset of [`Args`] loadable from a TOML configuration file.
#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    port: Option<u16>,
    staging_root: Option<PathBuf>,
    destination_root: Option<PathBuf>,
    authorized_keys: Option<PathBuf>,
    global_credit_budget: Option<u32>,
    max_queue: Option<u32>,
    chunk_size: Option<u32>,
    idle_timeout_secs: Option<u64>,
}

/// Fully resolved runtime configuration: CLI flags override the config file,
/// which overrides these built-in defaults.
#[derive(Debug, Clone)]
struct RuntimeOptions {
    port: u16,
    staging_root: PathBuf,
    destination_root: PathBuf,
    authorized_keys: PathBuf,
    global_credit_budget: u32,
    max_queue: u32,
    chunk_size: u32,
    idle_timeout: Duration,
}

impl RuntimeOptions {
    fn resolve(args: &Args, file: &FileConfig) -> Result<Self, String> {
        let staging_root = args
            .staging_root
            .clone()
            .or_else(|| file.staging_root.clone())
            .ok_or("--staging-root is required (flag or config file)")?;
        let destination_root = args
            .destination_root
            .clone()
            .or_else(|| file.destination_root.clone())
            .ok_or("--destination-root is required (flag or config file)")?;
        let authorized_keys = args
            .authorized_keys
            .clone()
            .or_else(|| file.authorized_keys.clone())
            .ok_or("--authorized-keys is required (flag or config file)")?;

        Ok(Self {
            port: args.port.or(file.port).unwrap_or(8889),
            staging_root,
            destination_root,
            authorized_keys,
            global_credit_budget: args
                .global_credit_budget
                .or(file.global_credit_budget)
                .unwrap_or(1024),
            max_queue: args.max_queue.or(file.max_queue).unwrap_or(8),
            chunk_size: args.chunk_size.or(file.chunk_size).unwrap_or(64 * 1024),
            idle_timeout: Duration::from_secs(args.idle_timeout_secs.or(file.idle_timeout_secs).unwrap_or(300)),
        })
    }
}

fn load_file_config(path: Option<&PathBuf>) -> Result<FileConfig, String> {
    let Some(path) = path else {
        return Ok(FileConfig::default());
    };
    let text = std::fs::read_to_string(path).map_err(|e| format!("{}: {e}", path.display()))?;
    toml::from_str(&text).map_err(|e| format!("{}: {e}", path.display()))
}

fn main() -> ProcessExitCode {
    let args = Args::parse();
    logging::init(args.verbose);

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("failed to build tokio runtime");
    // The event loop itself is synchronous (plain blocking sockets and file
    // I/O); it runs on a blocking-friendly task the same way `daemon` layers
    // tokio over its synchronous connection-handling core.
    let code = runtime.block_on(tokio::task::spawn_blocking(move || run(args)));
    match code {
        Ok(cli_support::ExitCode::Success) => ProcessExitCode::SUCCESS,
        Ok(other) => ProcessExitCode::from(u8::try_from(other.code()).unwrap_or(255)),
        Err(_) => ProcessExitCode::FAILURE,
    }
}

fn run(args: Args) -> cli_support::ExitCode {
    let file_config = match load_file_config(args.config.as_ref()) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("failed to load config file: {e}");
            return cli_support::ExitCode::UsageError;
        }
    };
    let options = match RuntimeOptions::resolve(&args, &file_config) {
        Ok(opts) => opts,
        Err(e) => {
            eprintln!("{e}");
            return cli_support::ExitCode::UsageError;
        }
    };

    if let Err(e) = std::fs::create_dir_all(&options.staging_root) {
        eprintln!("failed to create staging root {}: {e}", options.staging_root.display());
        return cli_support::ExitCode::LocalIoError;
    }
    if let Err(e) = std::fs::create_dir_all(&options.destination_root) {
        eprintln!(
            "failed to create destination root {}: {e}",
            options.destination_root.display()
        );
        return cli_support::ExitCode::LocalIoError;
    }

    let staging = FsStaging::new(&options.staging_root, &options.destination_root);
    let validator = SchemaValidator;
    let authorized_keys = AuthorizedKeys::new(&options.authorized_keys);
    let mut routing = match TcpRoutingTransport::bind(("0.0.0.0", options.port), authorized_keys) {
        Ok(routing) => routing,
        Err(e) => {
            eprintln!("failed to bind port {}: {e}", options.port);
            return cli_support::ExitCode::TimeoutOrTransport;
        }
    };

    tracing::info!(port = options.port, "oc-upload-server listening");
    event_loop(&mut routing, &staging, &validator, &options);
    cli_support::ExitCode::Success
}

fn event_loop(
    routing: &mut TcpRoutingTransport,
    staging: &FsStaging,
    validator: &SchemaValidator,
    options: &RuntimeOptions,
) {
    let started = Instant::now();
    let now_ms = |started: Instant| started.elapsed().as_millis() as u64;

    let mut credit = CreditController::new(options.global_credit_budget);
    let mut registry: UploadRegistry<FsStaging> = UploadRegistry::new();
    let config = ServerConfig {
        chunksize: options.chunk_size,
        maxqueue: options.max_queue,
    };
    let mut last_sweep = Instant::now();

    loop {
        let mut did_work = false;

        match routing.recv() {
            Ok(Some((identity, frames))) => {
                did_work = true;
                handle_inbound(
                    routing,
                    &mut registry,
                    staging,
                    validator,
                    &mut credit,
                    &config,
                    identity,
                    frames,
                    now_ms(started),
                );
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(%e, "routing transport receive error");
            }
        }

        if let Some(identity) = routing.take_reconnected() {
            did_work = true;
            let effects = registry.dispatch(
                identity.clone(),
                ServerEvent::PeerReconnected,
                staging,
                validator,
                &mut credit,
                &config,
                now_ms(started),
            );
            send_all(routing, &identity, effects);
        }

        if last_sweep.elapsed() >= SWEEP_INTERVAL {
            did_work = true;
            sweep_idle_uploads(routing, &mut registry, staging, validator, &mut credit, &config, options, started);
            last_sweep = Instant::now();
        }

        if !did_work {
            std::thread::sleep(POLL_INTERVAL);
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn handle_inbound(
    routing: &mut TcpRoutingTransport,
    registry: &mut UploadRegistry<FsStaging>,
    staging: &FsStaging,
    validator: &SchemaValidator,
    credit: &mut CreditController,
    config: &ServerConfig,
    identity: transport::Identity,
    frames: Vec<transport::Frame>,
    now: u64,
) {
    let message = match Message::decode(&frames) {
        Ok(message) => message,
        Err(e) => {
            tracing::warn!(?identity, %e, "malformed frame");
            let _ = routing.send(
                &identity,
                Message::Error {
                    code: 400,
                    msg: e.to_string(),
                }
                .encode(),
            );
            registry.abort_identity(&identity, staging, credit, 400, e.to_string());
            return;
        }
    };

    let event = match message {
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
        Message::Error { code, msg } => {
            tracing::info!(?identity, code, %msg, "peer reported error, aborting upload");
            registry.abort_identity(&identity, staging, credit, code, msg);
            return;
        }
        other => {
            tracing::warn!(?identity, ?other, "unexpected message from peer");
            return;
        }
    };

    let effects = registry.dispatch(identity.clone(), event, staging, validator, credit, config, now);
    send_all(routing, &identity, effects);
}

fn send_all(routing: &mut TcpRoutingTransport, identity: &transport::Identity, effects: Vec<ServerEffect>) {
    for effect in effects {
        if let ServerEffect::SendMessage(message) = effect {
            if let Err(e) = routing.send(identity, message.encode()) {
                tracing::warn!(?identity, %e, "failed to send message to peer");
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn sweep_idle_uploads(
    routing: &mut TcpRoutingTransport,
    registry: &mut UploadRegistry<FsStaging>,
    staging: &FsStaging,
    validator: &SchemaValidator,
    credit: &mut CreditController,
    config: &ServerConfig,
    options: &RuntimeOptions,
    started: Instant,
) {
    let now = started.elapsed().as_millis() as u64;
    let idle_timeout_ms = u64::try_from(options.idle_timeout.as_millis()).unwrap_or(u64::MAX);
    let actions = credit.on_timeout(now, idle_timeout_ms);

    // Collect per-identity probe/fatal actions before mutating the registry
    // so a single sweep never double-dispatches for the same identity.
    let mut probes: HashMap<transport::Identity, ()> = HashMap::new();
    for action in actions {
        match action {
            TimeoutAction::Probe(identity) => {
                probes.insert(identity, ());
            }
            TimeoutAction::FatalTimeout(identity) => {
                tracing::warn!(?identity, "upload exceeded unanswered-probe budget, aborting");
                let _ = routing.send(
                    &identity,
                    Message::Error {
                        code: 408,
                        msg: "timeout".to_string(),
                    }
                    .encode(),
                );
                registry.abort_identity(&identity, staging, credit, 408, "timeout".to_string());
            }
        }
    }

    for identity in probes.into_keys() {
        let effects = registry.dispatch(
            identity.clone(),
            ServerEvent::QueryStatus,
            staging,
            validator,
            credit,
            config,
            now,
        );
        send_all(routing, &identity, effects);
    }

    // Redistribute any global budget freed up since the last sweep (e.g. by
    // a completed or aborted upload) across uploads still below their own
    // `maxqueue`, preferring the lowest `credit_outstanding / maxqueue`
    // ratio as the fair-share tie-break.
    for (identity, amount) in credit.rebalance(now) {
        let _ = routing.send(&identity, Message::TransferCredit { amount }.encode());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args() -> Args {
        Args {
            config: None,
            port: None,
            staging_root: Some(PathBuf::from("/tmp/staging")),
            destination_root: Some(PathBuf::from("/tmp/dest")),
            authorized_keys: Some(PathBuf::from("/tmp/keys")),
            global_credit_budget: None,
            max_queue: None,
            chunk_size: None,
            idle_timeout_secs: None,
            verbose: 0,
        }
    }

    #[test]
    fn resolve_applies_defaults_when_flags_and_file_are_silent() {
        let options = RuntimeOptions::resolve(&args(), &FileConfig::default()).unwrap();
        assert_eq!(options.port, 8889);
        assert_eq!(options.max_queue, 8);
        assert_eq!(options.chunk_size, 64 * 1024);
        assert_eq!(options.idle_timeout, Duration::from_secs(300));
    }

    #[test]
    fn resolve_prefers_cli_flags_over_file_config() {
        let mut a = args();
        a.port = Some(9000);
        let file = FileConfig {
            port: Some(1234),
            ..FileConfig::default()
        };
        let options = RuntimeOptions::resolve(&a, &file).unwrap();
        assert_eq!(options.port, 9000);
    }

    #[test]
    fn resolve_falls_back_to_file_config_when_flag_absent() {
        let mut a = args();
        a.port = None;
        let file = FileConfig {
            port: Some(1234),
            ..FileConfig::default()
        };
        let options = RuntimeOptions::resolve(&a, &file).unwrap();
        assert_eq!(options.port, 1234);
    }

    #[test]
    fn resolve_requires_staging_root() {
        let mut a = args();
        a.staging_root = None;
        assert!(RuntimeOptions::resolve(&a, &FileConfig::default()).is_err());
    }

    #[test]
    fn command_parses_long_flags() {
        let parsed = Args::try_parse_from([
            "oc-upload-server",
            "--staging-root",
            "/tmp/s",
            "--destination-root",
            "/tmp/d",
            "--authorized-keys",
            "/tmp/k",
            "--port",
            "9999",
        ])
        .unwrap();
        assert_eq!(parsed.port, Some(9999));
    }
}
