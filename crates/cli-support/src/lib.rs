#![deny(unsafe_code)]
#![deny(rustdoc::broken_intra_doc_links)]
#![deny(missing_docs)]

//! # Overview
//!
//! `cli-support` holds the small pieces of plumbing shared by both
//! front-end binaries: the process [`ExitCode`] (distinct from the wire
//! protocol's own error namespace) and a formatter for reporting the
//! server's `(code, msg)` pair verbatim to the user.
//!
//! # Design
//!
//! [`ExitCode`] is a `#[repr(i32)]` enum, one variant per distinct process
//! outcome, rather than reusing the wire error codes directly — process
//! exit status and protocol error code are different namespaces that happen
//! to both originate from the same failure.

use std::fmt;

/// Process exit status for `oc-upload`, one variant per distinct outcome of
/// a CLI invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    /// Upload completed and was committed by the server.
    Success = 0,
    /// Local I/O error (could not read the source file, write metadata, etc).
    LocalIoError = 1,
    /// Usage error: bad CLI arguments.
    UsageError = 2,
    /// Server rejected the upload (validation, conflict, or other permanent error).
    ValidationRejected = 3,
    /// Final checksum did not match.
    ChecksumMismatch = 4,
    /// Timed out or the transport failed beyond recovery.
    TimeoutOrTransport = 5,
    /// The upload was cancelled by the user.
    Cancelled = 6,
}

impl ExitCode {
    /// Maps a wire-level error code to the closest process exit status.
    #[must_use]
    pub fn from_wire_error_code(code: u32) -> Self {
        match code {
            403 | 409 => ExitCode::ValidationRejected,
            422 => ExitCode::ChecksumMismatch,
            408 | 401 | 500 | 503 => ExitCode::TimeoutOrTransport,
            499 => ExitCode::Cancelled,
            _ => ExitCode::TimeoutOrTransport,
        }
    }

    /// The raw process exit status value.
    #[must_use]
    pub fn code(self) -> i32 {
        self as i32
    }
}

impl fmt::Display for ExitCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ExitCode::Success => "success",
            ExitCode::LocalIoError => "local I/O error",
            ExitCode::UsageError => "usage error",
            ExitCode::ValidationRejected => "validation rejected",
            ExitCode::ChecksumMismatch => "checksum mismatch",
            ExitCode::TimeoutOrTransport => "timeout or transport failure",
            ExitCode::Cancelled => "cancelled",
        };
        f.write_str(label)
    }
}

/// Renders the server's `(code, msg)` error pair for direct display to the
/// user, verbatim.
#[must_use]
pub fn render_peer_error(code: u32, msg: &str) -> String {
    format!("server reported error {code}: {msg}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_checksum_mismatch() {
        assert_eq!(
            ExitCode::from_wire_error_code(422),
            ExitCode::ChecksumMismatch
        );
    }

    #[test]
    fn maps_cancelled() {
        assert_eq!(ExitCode::from_wire_error_code(499), ExitCode::Cancelled);
    }

    #[test]
    fn renders_peer_error_verbatim_fields() {
        let rendered = render_peer_error(422, "checksum-mismatch");
        assert!(rendered.contains("422"));
        assert!(rendered.contains("checksum-mismatch"));
    }
}
