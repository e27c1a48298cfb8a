#![deny(unsafe_code)]
#![deny(rustdoc::broken_intra_doc_links)]
#![deny(missing_docs)]

//! # Overview
//!
//! `storage` is the server's on-disk staging and promotion layer, the
//! external collaborator the protocol engine calls through three operations:
//! open a staging file, write at an offset, finalize with metadata. The core
//! protocol engine never touches a filesystem path directly; it only calls
//! through [`Staging`].
//!
//! # Design
//!
//! [`FsStaging`] keeps partial uploads under a staging root (named by
//! `upload_id`, so concurrent uploads never collide) and promotes them with a
//! same-filesystem rename into a destination root on successful commit,
//! alongside a `.meta` sidecar (the accepted metadata JSON, verbatim) and a
//! `.sha256` sidecar (lowercase hex digest, single line), exactly as the
//! persisted-state layout requires.
//!
//! # Invariants
//!
//! - A destination file never appears without its `.meta` and `.sha256`
//!   siblings, and vice versa — [`FsStaging::finalize`] writes all three or
//!   none (promotion happens last, after both sidecars are durably written).
//! - [`FsStaging::finalize`] fails with [`Error::DestinationExists`] rather
//!   than overwrite; filename uniquification on collision is a dispatch-layer
//!   policy this crate does not implement.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Failures surfaced by [`Staging`] implementations.
#[derive(Debug, Error)]
pub enum Error {
    /// Underlying I/O failure.
    #[error("storage I/O error: {0}")]
    Io(#[from] io::Error),
    /// `finalize` was asked to promote onto an already-existing destination.
    #[error("destination already exists: {0}")]
    DestinationExists(PathBuf),
    /// The requested filename violated the naming constraints.
    #[error("invalid filename: {0}")]
    InvalidFilename(String),
}

/// Validates a client-supplied filename: non-empty, at most 256 UTF-8
/// bytes, no path separators, no NUL byte, no leading `..`.
pub fn validate_filename(filename: &str) -> Result<(), Error> {
    if filename.is_empty() {
        return Err(Error::InvalidFilename("filename is empty".into()));
    }
    if filename.len() > 256 {
        return Err(Error::InvalidFilename("filename exceeds 256 bytes".into()));
    }
    if filename.contains('/') || filename.contains('\\') {
        return Err(Error::InvalidFilename("filename contains a path separator".into()));
    }
    if filename.contains('\0') {
        return Err(Error::InvalidFilename("filename contains a NUL byte".into()));
    }
    if filename.starts_with("..") {
        return Err(Error::InvalidFilename("filename begins with `..`".into()));
    }
    Ok(())
}

/// The three storage operations the server upload state machine drives.
pub trait Staging {
    /// A handle to one in-progress staged upload.
    type Handle;

    /// Opens a fresh staging file named by `upload_id`.
    fn open(&self, upload_id: &str) -> Result<Self::Handle, Error>;

    /// Writes `data` at byte offset `seek` within the staged file.
    fn write_at(&self, handle: &mut Self::Handle, seek: u64, data: &[u8]) -> Result<(), Error>;

    /// Verifies `filename`, then atomically promotes the staged file to the
    /// destination root, writing the `.meta` and `.sha256` sidecars.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DestinationExists`] if a file already occupies the
    /// destination path; the caller is responsible for surfacing this as a
    /// `500 internal` to the peer, since wire-level and storage-level
    /// failure are distinct namespaces.
    fn finalize(
        &self,
        handle: Self::Handle,
        filename: &str,
        metadata_json: &str,
        checksum_hex: &str,
    ) -> Result<(), Error>;

    /// Discards a staged upload without promoting it.
    fn abort(&self, handle: Self::Handle) -> Result<(), Error>;
}

/// A staged upload under [`FsStaging`].
pub struct FsHandle {
    upload_id: String,
    file: File,
    path: PathBuf,
}

/// Filesystem-backed [`Staging`] implementation.
#[derive(Debug, Clone)]
pub struct FsStaging {
    staging_root: PathBuf,
    destination_root: PathBuf,
}

impl FsStaging {
    /// Creates a staging area rooted at `staging_root`, promoting into
    /// `destination_root`. Both directories must already exist.
    #[must_use]
    pub fn new(staging_root: impl Into<PathBuf>, destination_root: impl Into<PathBuf>) -> Self {
        Self {
            staging_root: staging_root.into(),
            destination_root: destination_root.into(),
        }
    }
}

impl Staging for FsStaging {
    type Handle = FsHandle;

    fn open(&self, upload_id: &str) -> Result<Self::Handle, Error> {
        let path = self.staging_root.join(upload_id);
        let file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .read(true)
            .open(&path)?;
        Ok(FsHandle {
            upload_id: upload_id.to_string(),
            file,
            path,
        })
    }

    fn write_at(&self, handle: &mut Self::Handle, seek: u64, data: &[u8]) -> Result<(), Error> {
        handle.file.seek(SeekFrom::Start(seek))?;
        handle.file.write_all(data)?;
        Ok(())
    }

    fn finalize(
        &self,
        handle: Self::Handle,
        filename: &str,
        metadata_json: &str,
        checksum_hex: &str,
    ) -> Result<(), Error> {
        validate_filename(filename)?;
        handle.file.sync_all()?;
        drop(handle.file);

        let destination = self.destination_root.join(filename);
        if destination.exists() {
            return Err(Error::DestinationExists(destination));
        }

        let meta_path = path_with_suffix(&destination, ".meta");
        let sha_path = path_with_suffix(&destination, ".sha256");
        fs::write(&meta_path, metadata_json)?;
        fs::write(&sha_path, format!("{checksum_hex}\n"))?;

        fs::rename(&handle.path, &destination)?;
        Ok(())
    }

    fn abort(&self, handle: Self::Handle) -> Result<(), Error> {
        drop(handle.file);
        match fs::remove_file(&handle.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Io(e)),
        }
    }
}

fn path_with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(suffix);
    PathBuf::from(os)
}

impl FsHandle {
    /// The `upload_id` this handle was opened with.
    #[must_use]
    pub fn upload_id(&self) -> &str {
        &self.upload_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn staging() -> (tempfile::TempDir, tempfile::TempDir, FsStaging) {
        let staging_dir = tempfile::tempdir().unwrap();
        let dest_dir = tempfile::tempdir().unwrap();
        let fs = FsStaging::new(staging_dir.path(), dest_dir.path());
        (staging_dir, dest_dir, fs)
    }

    #[test]
    fn open_write_finalize_produces_file_and_sidecars() {
        let (_staging_dir, dest_dir, fs) = staging();
        let mut handle = fs.open("upload-1").unwrap();
        fs.write_at(&mut handle, 0, b"hello").unwrap();
        fs.write_at(&mut handle, 5, b"world").unwrap();

        let digest = checksum::Sha256::digest(b"helloworld");
        let hex = checksum::to_hex(&digest);
        fs.finalize(handle, "report.bin", "{\"k\":1}", &hex).unwrap();

        let contents = fs::read(dest_dir.path().join("report.bin")).unwrap();
        assert_eq!(contents, b"helloworld");
        let meta = fs::read_to_string(dest_dir.path().join("report.bin.meta")).unwrap();
        assert_eq!(meta, "{\"k\":1}");
        let sidecar = fs::read_to_string(dest_dir.path().join("report.bin.sha256")).unwrap();
        assert_eq!(sidecar.trim(), hex);
    }

    #[test]
    fn finalize_rejects_existing_destination() {
        let (_staging_dir, dest_dir, fs) = staging();
        fs::write(dest_dir.path().join("report.bin"), b"existing").unwrap();

        let mut handle = fs.open("upload-2").unwrap();
        fs.write_at(&mut handle, 0, b"data").unwrap();
        let result = fs.finalize(handle, "report.bin", "{}", "deadbeef");
        assert!(matches!(result, Err(Error::DestinationExists(_))));
    }

    #[test]
    fn abort_removes_staging_file() {
        let (staging_dir, _dest_dir, fs) = staging();
        let handle = fs.open("upload-3").unwrap();
        let path = staging_dir.path().join("upload-3");
        assert!(path.exists());
        fs.abort(handle).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn validate_filename_rejects_path_separators_and_dotdot() {
        assert!(validate_filename("../escape").is_err());
        assert!(validate_filename("a/b").is_err());
        assert!(validate_filename("").is_err());
        assert!(validate_filename("ok-name.bin").is_ok());
    }
}
