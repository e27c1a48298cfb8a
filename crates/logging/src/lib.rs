#![deny(unsafe_code)]
#![deny(rustdoc::broken_intra_doc_links)]
#![deny(missing_docs)]

//! # Overview
//!
//! `logging` initializes the `tracing` subscriber both binaries and the
//! workspace integration tests use. It exists so initialization happens
//! exactly once per process regardless of how many call sites request it.
//!
//! # Design
//!
//! [`init`] is guarded by a [`std::sync::OnceLock`] so repeated calls (a
//! binary's `main` plus any test harness that also wants logs) are
//! idempotent rather than panicking on a double-init.

use std::sync::OnceLock;

use tracing_subscriber::EnvFilter;

static INIT: OnceLock<()> = OnceLock::new();

/// Initializes the global `tracing` subscriber at a verbosity derived from
/// `verbosity` (0 = warn, 1 = info, 2 = debug, 3+ = trace), falling back to
/// the `RUST_LOG` environment variable when set. Safe to call more than
/// once; only the first call takes effect.
pub fn init(verbosity: u8) {
    INIT.get_or_init(|| {
        let default_level = match verbosity {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        };
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(default_level));
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    });
}
