#![deny(unsafe_code)]
#![deny(rustdoc::broken_intra_doc_links)]
#![deny(missing_docs)]

//! # Overview
//!
//! `transport` is the boundary between the protocol engine and the
//! authenticated, encrypted, message-oriented byte layer treated here as an
//! external collaborator. It does not perform the CURVE handshake itself —
//! that is out of scope for the core — but it defines the trait shape a real
//! CURVE transport would implement, and the authorization-store check point
//! the handshake would occupy.
//!
//! # Design
//!
//! Two roles, because the client and the server sit on opposite sides of a
//! multiplexed routing socket:
//!
//! - [`Transport`]: the client's single-peer view. Send and receive frame
//!   lists; observe whether the underlying byte session was re-established
//!   since the last poll.
//! - [`RoutingTransport`]: the server's multi-peer view. Every send and
//!   receive is keyed by [`Identity`], the opaque transport-level peer
//!   identifier (`ClientIdentity`).
//!
//! [`ChannelTransport`]/[`ChannelRoutingTransport`] are an in-process,
//! thread-safe pair used by tests and the workspace integration suite.
//! [`TcpTransport`]/[`TcpRoutingTransport`] are a minimal length-prefixed
//! framing over plain TCP, used by the two binaries; they consult
//! [`AuthorizedKeys`] the way a real handshake would consult its peer key
//! store, even though the bytes on the wire are not actually encrypted.
//!
//! # Errors
//!
//! All fallible operations return [`Error`], a `thiserror` enum covering I/O
//! failure, a malformed frame-length prefix, an oversized frame, and
//! rejection by the authorization store.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream, ToSocketAddrs};
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use thiserror::Error;

/// One positional argument of a wire record, as produced by `wire::Message::encode`.
pub type Frame = Vec<u8>;

/// Opaque transport-level peer identifier (`ClientIdentity`).
pub type Identity = Vec<u8>;

/// Largest single frame this transport will read from the wire.
pub const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

/// Failures surfaced by transport implementations.
#[derive(Debug, Error)]
pub enum Error {
    /// The peer closed the connection, or the channel partner was dropped.
    #[error("connection closed")]
    ConnectionClosed,
    /// Underlying I/O failure.
    #[error("transport I/O error: {0}")]
    Io(#[from] io::Error),
    /// A frame declared a length exceeding [`MAX_FRAME_LEN`].
    #[error("frame length {0} exceeds maximum of {MAX_FRAME_LEN}")]
    FrameTooLarge(u32),
    /// The peer's identity was not present in the authorization store.
    #[error("peer identity rejected by authorization store")]
    Unauthorized,
}

/// Single-peer transport, the shape the client endpoint drives.
pub trait Transport {
    /// Sends one record (already-encoded frame list) to the peer.
    fn send(&mut self, frames: Vec<Frame>) -> Result<(), Error>;

    /// Polls for the next available record, returning `None` if none is
    /// currently buffered. Never blocks.
    fn recv(&mut self) -> Result<Option<Vec<Frame>>, Error>;

    /// Returns and clears whether the byte-layer session was re-established
    /// since the last call, signaling the client should expect the server
    /// to resynchronize via `status-report`.
    fn take_reconnected(&mut self) -> bool;
}

/// Multi-peer, identity-keyed transport, the shape the server's routing
/// endpoint drives.
pub trait RoutingTransport {
    /// Sends one record to a specific peer.
    fn send(&mut self, identity: &Identity, frames: Vec<Frame>) -> Result<(), Error>;

    /// Polls for the next available `(identity, record)` pair, returning
    /// `None` if none is currently buffered. Never blocks.
    fn recv(&mut self) -> Result<Option<(Identity, Vec<Frame>)>, Error>;

    /// Returns the identity of a peer whose byte-layer session was
    /// re-established since the last call, if any.
    fn take_reconnected(&mut self) -> Option<Identity>;
}

/// A directory of approved peer public keys, consulted during handshake.
///
/// Keys are represented as lowercase-hex file names under `root`; a peer
/// whose identity does not correspond to a file there is rejected before any
/// protocol message is processed.
#[derive(Debug, Clone)]
pub struct AuthorizedKeys {
    root: PathBuf,
}

impl AuthorizedKeys {
    /// Opens an authorization store rooted at `root`. The directory is read
    /// lazily on each check, so keys may be added or removed at runtime.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Returns whether `identity` is present in the store.
    #[must_use]
    pub fn is_authorized(&self, identity: &[u8]) -> bool {
        let hex = to_hex(identity);
        self.root.join(hex).is_file()
    }
}

fn to_hex(bytes: &[u8]) -> String {
    use std::fmt::Write as _;
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(&mut out, "{b:02x}");
    }
    out
}

// ---------------------------------------------------------------------
// In-process channel transport, used by tests.
// ---------------------------------------------------------------------

/// In-process client-side endpoint backed by `std::sync::mpsc`.
pub struct ChannelTransport {
    identity: Identity,
    outbound: Sender<(Identity, Vec<Frame>)>,
    inbound: Receiver<Vec<Frame>>,
    reconnected: Arc<Mutex<bool>>,
}

/// In-process server-side routing endpoint paired with one or more
/// [`ChannelTransport`]s created through [`channel_pair`].
pub struct ChannelRoutingTransport {
    inbound_tx: Sender<(Identity, Vec<Frame>)>,
    inbound_rx: Receiver<(Identity, Vec<Frame>)>,
    outbound: HashMap<Identity, Sender<Vec<Frame>>>,
    reconnect_pending: Arc<Mutex<Vec<Identity>>>,
}

impl ChannelRoutingTransport {
    /// Creates a server-side routing endpoint with no peers yet attached.
    #[must_use]
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel();
        Self {
            inbound_tx: tx,
            inbound_rx: rx,
            outbound: HashMap::new(),
            reconnect_pending: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl Default for ChannelRoutingTransport {
    fn default() -> Self {
        Self::new()
    }
}

/// Creates a linked client/server transport pair for a given `identity`,
/// attaching the client end to `routing`'s peer set. Calling this again with
/// the same `identity` simulates a transport reconnect: the old client
/// handle is replaced and the routing side reports it via
/// [`RoutingTransport::take_reconnected`].
pub fn channel_pair(routing: &mut ChannelRoutingTransport, identity: Identity) -> ChannelTransport {
    let (to_client, from_server) = mpsc::channel::<Vec<Frame>>();

    let reconnecting = routing.outbound.contains_key(&identity);
    routing.outbound.insert(identity.clone(), to_client);
    if reconnecting {
        routing.reconnect_pending.lock().unwrap().push(identity.clone());
    }

    ChannelTransport {
        identity,
        outbound: routing.inbound_tx.clone(),
        inbound: from_server,
        reconnected: Arc::new(Mutex::new(false)),
    }
}

impl Transport for ChannelTransport {
    fn send(&mut self, frames: Vec<Frame>) -> Result<(), Error> {
        self.outbound
            .send((self.identity.clone(), frames))
            .map_err(|_| Error::ConnectionClosed)
    }

    fn recv(&mut self) -> Result<Option<Vec<Frame>>, Error> {
        match self.inbound.try_recv() {
            Ok(frames) => Ok(Some(frames)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(Error::ConnectionClosed),
        }
    }

    fn take_reconnected(&mut self) -> bool {
        let mut flag = self.reconnected.lock().unwrap();
        std::mem::replace(&mut *flag, false)
    }
}

impl RoutingTransport for ChannelRoutingTransport {
    fn send(&mut self, identity: &Identity, frames: Vec<Frame>) -> Result<(), Error> {
        self.outbound
            .get(identity)
            .ok_or(Error::ConnectionClosed)?
            .send(frames)
            .map_err(|_| Error::ConnectionClosed)
    }

    fn recv(&mut self) -> Result<Option<(Identity, Vec<Frame>)>, Error> {
        match self.inbound_rx.try_recv() {
            Ok(msg) => Ok(Some(msg)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Ok(None),
        }
    }

    fn take_reconnected(&mut self) -> Option<Identity> {
        self.reconnect_pending.lock().unwrap().pop()
    }
}

// ---------------------------------------------------------------------
// TCP transport, used by the two binaries.
// ---------------------------------------------------------------------

const POLL_TIMEOUT: Duration = Duration::from_millis(10);

fn write_record(stream: &mut TcpStream, frames: &[Frame]) -> Result<(), Error> {
    stream.write_all(&(frames.len() as u32).to_be_bytes())?;
    for frame in frames {
        let len = u32::try_from(frame.len()).map_err(|_| Error::FrameTooLarge(u32::MAX))?;
        if len > MAX_FRAME_LEN {
            return Err(Error::FrameTooLarge(len));
        }
        stream.write_all(&len.to_be_bytes())?;
        stream.write_all(frame)?;
    }
    stream.flush()?;
    Ok(())
}

fn read_exact_or_none(stream: &mut TcpStream, buf: &mut [u8]) -> Result<bool, Error> {
    match stream.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::TimedOut => {
            Ok(false)
        }
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(Error::ConnectionClosed),
        Err(e) => Err(Error::Io(e)),
    }
}

fn read_record(stream: &mut TcpStream) -> Result<Option<Vec<Frame>>, Error> {
    let mut count_buf = [0u8; 4];
    if !read_exact_or_none(stream, &mut count_buf)? {
        return Ok(None);
    }
    let count = u32::from_be_bytes(count_buf);
    let mut frames = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let mut len_buf = [0u8; 4];
        stream
            .read_exact(&mut len_buf)
            .map_err(|e| map_mid_record_error(e))?;
        let len = u32::from_be_bytes(len_buf);
        if len > MAX_FRAME_LEN {
            return Err(Error::FrameTooLarge(len));
        }
        let mut payload = vec![0u8; len as usize];
        stream
            .read_exact(&mut payload)
            .map_err(|e| map_mid_record_error(e))?;
        frames.push(payload);
    }
    Ok(Some(frames))
}

fn map_mid_record_error(e: io::Error) -> Error {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        Error::ConnectionClosed
    } else {
        Error::Io(e)
    }
}

/// Client-side TCP transport. On connect, sends a single identity frame so
/// the server can route subsequent records and consult its authorization
/// store, then behaves as a plain length-prefixed framed stream.
pub struct TcpTransport {
    stream: TcpStream,
}

impl TcpTransport {
    /// Connects to `addr`, announcing `identity` as the first frame.
    pub fn connect(addr: impl ToSocketAddrs, identity: &Identity) -> Result<Self, Error> {
        let mut stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true).ok();
        write_record(&mut stream, std::slice::from_ref(identity))?;
        stream.set_read_timeout(Some(POLL_TIMEOUT))?;
        Ok(Self { stream })
    }
}

impl Transport for TcpTransport {
    fn send(&mut self, frames: Vec<Frame>) -> Result<(), Error> {
        write_record(&mut self.stream, &frames)
    }

    fn recv(&mut self) -> Result<Option<Vec<Frame>>, Error> {
        read_record(&mut self.stream)
    }

    fn take_reconnected(&mut self) -> bool {
        false
    }
}

struct PeerConnection {
    stream: TcpStream,
}

/// Server-side routing TCP transport. Accepts connections on a background
/// thread, checks each new peer's announced identity against
/// [`AuthorizedKeys`], and multiplexes reads/writes across all attached
/// peers.
pub struct TcpRoutingTransport {
    peers: Arc<Mutex<HashMap<Identity, PeerConnection>>>,
    inbound: Receiver<(Identity, Vec<Frame>)>,
    reconnect_pending: Arc<Mutex<Vec<Identity>>>,
}

impl TcpRoutingTransport {
    /// Binds `addr` and begins accepting connections, authorizing peers
    /// against `authorized_keys`.
    pub fn bind(addr: impl ToSocketAddrs, authorized_keys: AuthorizedKeys) -> Result<Self, Error> {
        let listener = TcpListener::bind(addr)?;
        let peers: Arc<Mutex<HashMap<Identity, PeerConnection>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let reconnect_pending = Arc::new(Mutex::new(Vec::new()));
        let (tx, rx) = mpsc::channel();

        let accept_peers = Arc::clone(&peers);
        let accept_reconnect = Arc::clone(&reconnect_pending);
        thread::spawn(move || {
            for incoming in listener.incoming() {
                let Ok(mut stream) = incoming else { continue };
                stream.set_read_timeout(Some(POLL_TIMEOUT)).ok();
                let Ok(Some(identity_frame)) = (loop {
                    match read_record(&mut stream) {
                        Ok(Some(frames)) => break Ok(Some(frames)),
                        Ok(None) => continue,
                        Err(e) => break Err(e),
                    }
                }) else {
                    continue;
                };
                let Some(identity) = identity_frame.into_iter().next() else {
                    continue;
                };
                if !authorized_keys.is_authorized(&identity) {
                    tracing::warn!(?identity, "rejecting unauthorized peer");
                    continue;
                }

                let reconnecting = accept_peers.lock().unwrap().contains_key(&identity);
                if reconnecting {
                    accept_reconnect.lock().unwrap().push(identity.clone());
                }
                accept_peers
                    .lock()
                    .unwrap()
                    .insert(identity.clone(), PeerConnection { stream: clone_stream(&stream) });

                let read_peers = Arc::clone(&accept_peers);
                let forward = tx.clone();
                let mut reader_stream = stream;
                let reader_identity = identity.clone();
                thread::spawn(move || loop {
                    match read_record(&mut reader_stream) {
                        Ok(Some(frames)) => {
                            if forward.send((reader_identity.clone(), frames)).is_err() {
                                break;
                            }
                        }
                        Ok(None) => continue,
                        Err(_) => {
                            read_peers.lock().unwrap().remove(&reader_identity);
                            break;
                        }
                    }
                });
            }
        });

        Ok(Self {
            peers,
            inbound: rx,
            reconnect_pending,
        })
    }
}

fn clone_stream(stream: &TcpStream) -> TcpStream {
    stream.try_clone().expect("TCP stream clone should not fail")
}

impl RoutingTransport for TcpRoutingTransport {
    fn send(&mut self, identity: &Identity, frames: Vec<Frame>) -> Result<(), Error> {
        let mut peers = self.peers.lock().unwrap();
        let peer = peers.get_mut(identity).ok_or(Error::ConnectionClosed)?;
        write_record(&mut peer.stream, &frames)
    }

    fn recv(&mut self) -> Result<Option<(Identity, Vec<Frame>)>, Error> {
        match self.inbound.try_recv() {
            Ok(msg) => Ok(Some(msg)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Ok(None),
        }
    }

    fn take_reconnected(&mut self) -> Option<Identity> {
        self.reconnect_pending.lock().unwrap().pop()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authorized_keys_rejects_unknown_identity() {
        let dir = tempfile::tempdir().unwrap();
        let store = AuthorizedKeys::new(dir.path());
        assert!(!store.is_authorized(b"stranger"));
    }

    #[test]
    fn authorized_keys_accepts_known_identity() {
        let dir = tempfile::tempdir().unwrap();
        let identity = b"known-peer".to_vec();
        std::fs::write(dir.path().join(to_hex(&identity)), b"").unwrap();
        let store = AuthorizedKeys::new(dir.path());
        assert!(store.is_authorized(&identity));
    }

    #[test]
    fn channel_transport_round_trips_client_to_server() {
        let mut routing = ChannelRoutingTransport::new();
        let mut client = channel_pair(&mut routing, vec![1, 2, 3]);

        client.send(vec![b"post-file".to_vec()]).unwrap();
        thread::sleep(Duration::from_millis(20));

        let (identity, frames) = routing.recv().unwrap().expect("message should arrive");
        assert_eq!(identity, vec![1, 2, 3]);
        assert_eq!(frames, vec![b"post-file".to_vec()]);
    }

    #[test]
    fn channel_transport_round_trips_server_to_client() {
        let mut routing = ChannelRoutingTransport::new();
        let mut client = channel_pair(&mut routing, vec![9]);

        routing
            .send(&vec![9], vec![b"upload-approved".to_vec()])
            .unwrap();

        let frames = client.recv().unwrap().expect("message should arrive");
        assert_eq!(frames, vec![b"upload-approved".to_vec()]);
    }
}
