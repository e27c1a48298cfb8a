//! End-to-end tests driving the real `oc-upload` and `oc-upload-server`
//! binaries against each other over a loopback TCP socket.

use std::net::{Ipv4Addr, SocketAddr, TcpStream};
use std::process::{Child, Command, Output, Stdio};
use std::time::{Duration, Instant};

use assert_cmd::prelude::*;
use predicates::prelude::*;

fn binary_output(name: &str, args: &[&str]) -> Output {
    Command::cargo_bin(name)
        .unwrap_or_else(|e| panic!("failed to locate {name}: {e}"))
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("failed to run {name}: {e}"))
}

#[test]
fn client_help_lists_usage() {
    let output = binary_output("oc-upload", &["--help"]);
    assert!(output.status.success());
    let stdout = String::from_utf8(output.stdout).unwrap();
    assert!(stdout.contains("Usage:"));
    assert!(stdout.contains("oc-upload"));
}

#[test]
fn client_without_operands_shows_usage() {
    let output = binary_output("oc-upload", &[]);
    assert!(!output.status.success());
    let mut combined = output.stdout;
    combined.extend_from_slice(&output.stderr);
    let combined = String::from_utf8(combined).unwrap();
    assert!(combined.contains("Usage:"));
}

#[test]
fn server_help_lists_usage() {
    let output = binary_output("oc-upload-server", &["--help"]);
    assert!(output.status.success());
    let stdout = String::from_utf8(output.stdout).unwrap();
    assert!(stdout.contains("Usage:"));
    assert!(stdout.contains("oc-upload-server"));
}

#[test]
fn server_rejects_unknown_flag() {
    Command::cargo_bin("oc-upload-server")
        .unwrap()
        .arg("--definitely-not-a-flag")
        .assert()
        .failure()
        .stderr(predicate::str::contains("unexpected argument"));
}

/// A running `oc-upload-server` child process, killed on drop so a panicking
/// assertion never leaves an orphaned listener bound to the test's port.
struct ServerProcess {
    child: Child,
    port: u16,
}

impl ServerProcess {
    fn spawn(staging: &std::path::Path, destination: &std::path::Path, authorized_keys: &std::path::Path) -> Self {
        let port = allocate_ephemeral_port();
        let child = Command::cargo_bin("oc-upload-server")
            .unwrap()
            .arg("--staging-root")
            .arg(staging)
            .arg("--destination-root")
            .arg(destination)
            .arg("--authorized-keys")
            .arg(authorized_keys)
            .arg("--port")
            .arg(port.to_string())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .expect("failed to spawn oc-upload-server");
        let server = Self { child, port };
        server.wait_until_accepting();
        server
    }

    fn wait_until_accepting(&self) {
        const TIMEOUT: Duration = Duration::from_secs(10);
        let target = SocketAddr::from((Ipv4Addr::LOCALHOST, self.port));
        let deadline = Instant::now() + TIMEOUT;
        loop {
            if let Ok(stream) = TcpStream::connect_timeout(&target, Duration::from_millis(100)) {
                drop(stream);
                return;
            }
            if Instant::now() >= deadline {
                panic!("oc-upload-server never started accepting connections on port {}", self.port);
            }
            std::thread::sleep(Duration::from_millis(50));
        }
    }
}

impl Drop for ServerProcess {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn allocate_ephemeral_port() -> u16 {
    std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
        .expect("bind ephemeral port for test")
        .local_addr()
        .expect("local addr")
        .port()
}

/// Pre-authorizes `identity_hex` by creating the file
/// `transport::AuthorizedKeys` checks for, without depending on the
/// `transport` crate directly.
fn authorize(authorized_keys_root: &std::path::Path, identity_hex: &str) {
    std::fs::write(authorized_keys_root.join(identity_hex), b"").unwrap();
}

#[test]
fn uploads_a_real_file_end_to_end_over_tcp() {
    let staging = tempfile::tempdir().unwrap();
    let destination = tempfile::tempdir().unwrap();
    let authorized_keys = tempfile::tempdir().unwrap();
    let source_dir = tempfile::tempdir().unwrap();

    let identity_hex = "aa11bb22cc33dd44";
    authorize(authorized_keys.path(), identity_hex);

    let source_path = source_dir.path().join("report.bin");
    let contents = b"the quick brown fox jumps over the lazy dog".to_vec();
    std::fs::write(&source_path, &contents).unwrap();

    let server = ServerProcess::spawn(staging.path(), destination.path(), authorized_keys.path());

    Command::cargo_bin("oc-upload")
        .unwrap()
        .arg("127.0.0.1")
        .arg(&source_path)
        .arg("--port")
        .arg(server.port.to_string())
        .arg("--identity-hex")
        .arg(identity_hex)
        .arg("-k")
        .arg("origin:integration-test")
        .assert()
        .success()
        .stdout(predicate::str::contains("upload finished"));

    let written = std::fs::read(destination.path().join("report.bin")).unwrap();
    assert_eq!(written, contents);
    let meta = std::fs::read_to_string(destination.path().join("report.bin.meta")).unwrap();
    assert!(meta.contains("origin"));
    assert!(meta.contains("integration-test"));
}

#[test]
fn unauthorized_identity_is_rejected_before_any_upload_progresses() {
    let staging = tempfile::tempdir().unwrap();
    let destination = tempfile::tempdir().unwrap();
    let authorized_keys = tempfile::tempdir().unwrap();
    let source_dir = tempfile::tempdir().unwrap();

    // No identity is ever written into `authorized_keys`, so every connection
    // is refused regardless of which identity the client presents.
    let source_path = source_dir.path().join("report.bin");
    std::fs::write(&source_path, b"payload").unwrap();

    let server = ServerProcess::spawn(staging.path(), destination.path(), authorized_keys.path());

    Command::cargo_bin("oc-upload")
        .unwrap()
        .arg("127.0.0.1")
        .arg(&source_path)
        .arg("--port")
        .arg(server.port.to_string())
        .arg("--identity-hex")
        .arg("0102030405060708")
        .assert()
        .code(5); // ExitCode::TimeoutOrTransport

    assert!(!destination.path().join("report.bin").exists());
}

#[test]
fn malformed_identity_hex_is_a_usage_error() {
    let source_dir = tempfile::tempdir().unwrap();
    let source_path = source_dir.path().join("report.bin");
    std::fs::write(&source_path, b"payload").unwrap();

    Command::cargo_bin("oc-upload")
        .unwrap()
        .arg("127.0.0.1")
        .arg(&source_path)
        .arg("--identity-hex")
        .arg("not-hex")
        .assert()
        .code(2); // ExitCode::UsageError
}
