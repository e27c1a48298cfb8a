#![deny(unsafe_code)]
#![deny(rustdoc::broken_intra_doc_links)]
#![deny(missing_docs)]

//! # Overview
//!
//! `validator` defines the metadata-approval policy the server consults on
//! every `post-file`. The core treats validation as an opaque, pluggable
//! decision; it never inspects metadata fields itself.
//!
//! # Design
//!
//! [`MetadataValidator::validate`] returns one of three outcomes —
//! [`Verdict::Accept`], a transient rejection the peer may retry, or a
//! permanent rejection carrying the wire-level error code to report.
//! [`SchemaValidator`] is the crate's only concrete implementation: a
//! minimal placeholder that merely requires metadata to parse as a JSON
//! object, standing in for whatever real approval policy a deployment
//! plugs in.

use serde_json::Value;

/// Outcome of validating one upload's metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Metadata is acceptable; proceed to `WRITING`.
    Accept,
    /// Rejected, but the condition may clear — safe for the peer to retry.
    Transient(String),
    /// Permanently rejected with a wire-level error code to report.
    Permanent(u32, String),
}

/// Pluggable metadata-approval policy.
pub trait MetadataValidator {
    /// Validates `metadata_json` for a declared `filename`.
    fn validate(&self, filename: &str, metadata_json: &str) -> Verdict;
}

/// Minimal placeholder validator: metadata must parse as a JSON object.
///
/// This exists only so the workspace has something to run against the real
/// protocol engine; it does not implement any actual business policy, which
/// is left to the deployment.
#[derive(Debug, Clone, Copy, Default)]
pub struct SchemaValidator;

impl MetadataValidator for SchemaValidator {
    fn validate(&self, _filename: &str, metadata_json: &str) -> Verdict {
        match serde_json::from_str::<Value>(metadata_json) {
            Ok(Value::Object(_)) => Verdict::Accept,
            Ok(_) => Verdict::Permanent(403, "metadata must be a JSON object".to_string()),
            Err(e) => Verdict::Permanent(403, format!("metadata is not valid JSON: {e}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_json_object() {
        let v = SchemaValidator;
        assert_eq!(v.validate("f.bin", "{\"a\":1}"), Verdict::Accept);
    }

    #[test]
    fn rejects_non_object_json() {
        let v = SchemaValidator;
        assert_eq!(
            v.validate("f.bin", "[1,2,3]"),
            Verdict::Permanent(403, "metadata must be a JSON object".to_string())
        );
    }

    #[test]
    fn rejects_malformed_json() {
        let v = SchemaValidator;
        let verdict = v.validate("f.bin", "not json");
        assert!(matches!(verdict, Verdict::Permanent(403, _)));
    }
}
