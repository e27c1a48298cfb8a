#![deny(unsafe_code)]
#![deny(rustdoc::broken_intra_doc_links)]
#![deny(missing_docs)]

//! # Overview
//!
//! `checksum` provides the streaming SHA-256 hasher both endpoints run
//! incrementally over a file's bytes so the final chunk's trailer can be
//! compared without buffering the whole file in memory.
//!
//! # Design
//!
//! [`Sha256`] wraps [`sha2::Sha256`] behind the same minimal streaming shape
//! upstream's own strong-digest wrapper uses: `new`, `update`, `finalize`,
//! plus a one-shot [`Sha256::digest`] convenience for tests and small blobs.

/// Number of bytes in a SHA-256 digest.
pub const DIGEST_LEN: usize = 32;

/// Streaming SHA-256 hasher.
#[derive(Clone, Debug, Default)]
pub struct Sha256 {
    inner: sha2::Sha256,
}

impl Sha256 {
    /// Creates a hasher with empty state.
    #[must_use]
    pub fn new() -> Self {
        use digest::Digest;
        Self {
            inner: sha2::Sha256::new(),
        }
    }

    /// Feeds additional bytes into the digest state, in order.
    pub fn update(&mut self, data: &[u8]) {
        use digest::Digest;
        self.inner.update(data);
    }

    /// Finalizes the digest and returns the 256-bit output.
    #[must_use]
    pub fn finalize(self) -> [u8; DIGEST_LEN] {
        use digest::Digest;
        self.inner.finalize().into()
    }

    /// Computes the SHA-256 digest of `data` in one shot.
    #[must_use]
    pub fn digest(data: &[u8]) -> [u8; DIGEST_LEN] {
        let mut hasher = Self::new();
        hasher.update(data);
        hasher.finalize()
    }
}

/// Renders a digest as lowercase hex, matching the `.sha256` sidecar format.
#[must_use]
pub fn to_hex(digest: &[u8; DIGEST_LEN]) -> String {
    use std::fmt::Write as _;
    let mut out = String::with_capacity(DIGEST_LEN * 2);
    for byte in digest {
        let _ = write!(&mut out, "{byte:02x}");
    }
    out
}
