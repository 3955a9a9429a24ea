// src/server/handshake.rs - Node identity handshake
//
// Five step exchange run on a freshly accepted socket before it is admitted:
//
// | Step | Direction       | Bytes                               |
// |------|-----------------|-------------------------------------|
// | 1    | client → server | magic `69 04 02 00`                 |
// | 2    | server → client | magic reversed `00 02 04 69`        |
// | 3    | client → server | continue byte `69`                  |
// | 4    | server → client | u32 big-endian length + UTF-8 name  |
// | 5    | client → server | decision `01` accept / `00` reject  |
//
// One deadline covers the whole exchange. Any violation, timeout or broken
// pipe closes the socket.

use crate::error::HandshakeError;
use crate::server::classify::EventKind;
use crate::server::connection::Connection;
use crate::server::registry::{Admission, HandlerResult};
use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use log::{debug, info, warn};
use regex::Regex;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::os::unix::io::AsRawFd;
use std::time::{Duration, Instant};

pub const MAGIC: [u8; 4] = [0x69, 0x04, 0x02, 0x00];
pub const CONTINUE: u8 = 0x69;
pub const ACCEPT: u8 = 0x01;
pub const REJECT: u8 = 0x00;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);
const MAX_NAME_LEN: u32 = 64 * 1024;

pub fn reversed_magic() -> [u8; 4] {
    let mut reversed = MAGIC;
    reversed.reverse();
    reversed
}

/// Length-prefixed node name message.
pub fn encode_name(name: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + name.len());
    // writing into a Vec cannot fail
    let _ = buf.write_u32::<BigEndian>(name.len() as u32);
    buf.extend_from_slice(name.as_bytes());
    buf
}

struct Deadline(Instant);

impl Deadline {
    fn after(timeout: Duration) -> Self {
        Deadline(Instant::now() + timeout)
    }

    fn remaining(&self) -> Result<Duration, HandshakeError> {
        let left = self.0.saturating_duration_since(Instant::now());
        if left.is_zero() {
            return Err(HandshakeError::Timeout);
        }
        Ok(left)
    }
}

/// Blocking mode and timeouts to put back after a successful exchange.
struct SavedSocket {
    nonblocking: bool,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
}

impl SavedSocket {
    fn capture(stream: &TcpStream) -> io::Result<Self> {
        // SAFETY: F_GETFL on a descriptor owned by `stream` reads flags only.
        let flags = unsafe { libc::fcntl(stream.as_raw_fd(), libc::F_GETFL) };
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            nonblocking: flags & libc::O_NONBLOCK != 0,
            read_timeout: stream.read_timeout()?,
            write_timeout: stream.write_timeout()?,
        })
    }

    fn restore(&self, stream: &TcpStream) -> io::Result<()> {
        stream.set_read_timeout(self.read_timeout)?;
        stream.set_write_timeout(self.write_timeout)?;
        stream.set_nonblocking(self.nonblocking)
    }
}

/// Read until `buf` is full or the peer closes. Returns bytes read.
fn read_up_to(stream: &mut TcpStream, buf: &mut [u8], deadline: &Deadline) -> Result<usize, HandshakeError> {
    let mut filled = 0;
    while filled < buf.len() {
        stream.set_read_timeout(Some(deadline.remaining()?))?;
        match stream.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(filled)
}

fn read_byte(stream: &mut TcpStream, deadline: &Deadline) -> Result<Option<u8>, HandshakeError> {
    let mut byte = [0u8; 1];
    let n = read_up_to(stream, &mut byte, deadline)?;
    Ok((n == 1).then_some(byte[0]))
}

fn write_all(stream: &mut TcpStream, data: &[u8], deadline: &Deadline) -> Result<(), HandshakeError> {
    stream.set_write_timeout(Some(deadline.remaining()?))?;
    stream.write_all(data)?;
    Ok(())
}

fn close(stream: &TcpStream) {
    if let Err(e) = stream.shutdown(Shutdown::Both) {
        debug!("Handshake socket shutdown error: {:?}", e);
    }
}

/// Server side of the exchange.
#[derive(Debug, Clone)]
pub struct Handshake {
    node_name: String,
    timeout: Duration,
}

impl Handshake {
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    /// Run steps 1-5 on `stream`. On success the original blocking mode and
    /// timeouts are restored; on failure the socket is shut down.
    pub fn accept(&self, stream: &mut TcpStream) -> Result<(), HandshakeError> {
        match SavedSocket::capture(stream) {
            Ok(saved) => self.accept_restoring(stream, &saved),
            Err(e) => {
                close(stream);
                Err(e.into())
            }
        }
    }

    fn accept_restoring(&self, stream: &mut TcpStream, saved: &SavedSocket) -> Result<(), HandshakeError> {
        let result = stream
            .set_nonblocking(false)
            .map_err(HandshakeError::from)
            .and_then(|_| self.exchange(stream))
            .and_then(|_| saved.restore(stream).map_err(HandshakeError::from));
        if result.is_err() {
            close(stream);
        }
        result
    }

    fn exchange(&self, stream: &mut TcpStream) -> Result<(), HandshakeError> {
        let deadline = Deadline::after(self.timeout);

        debug!("Handshake: waiting for magic");
        let mut magic = [0u8; 4];
        let n = read_up_to(stream, &mut magic, &deadline)?;
        if n != MAGIC.len() || magic != MAGIC {
            return Err(HandshakeError::BadMagic(magic[..n].to_vec()));
        }

        debug!("Handshake: echoing reversed magic");
        write_all(stream, &reversed_magic(), &deadline)?;

        match read_byte(stream, &deadline)? {
            Some(CONTINUE) => {}
            other => return Err(HandshakeError::BadAck(other)),
        }

        debug!("Handshake: sending node name {:?}", self.node_name);
        write_all(stream, &encode_name(&self.node_name), &deadline)?;

        match read_byte(stream, &deadline)? {
            None | Some(REJECT) => Err(HandshakeError::Rejected),
            Some(_) => Ok(()),
        }
    }

    /// Wrap a handler so CONNECT events must complete the handshake first.
    ///
    /// A failed exchange denies the connection without calling `inner`. After
    /// a successful one `inner` runs and its admission is final. Other events
    /// pass straight through.
    pub fn wrap<H>(self, mut inner: H) -> impl FnMut(EventKind, &mut Connection) -> HandlerResult + Send + 'static
    where
        H: FnMut(EventKind, &mut Connection) -> HandlerResult + Send + 'static,
    {
        move |kind: EventKind, conn: &mut Connection| -> HandlerResult {
            if kind != EventKind::Connect {
                return inner(kind, conn);
            }

            match self.accept(conn.stream_mut()) {
                Ok(()) => {
                    info!("Handshake with {} completed", conn.peer_addr());
                    inner(kind, conn)
                }
                Err(e) => {
                    warn!("Handshake with {} failed: {}", conn.peer_addr(), e);
                    Ok(Admission::Deny)
                }
            }
        }
    }
}

/// Node name requirement for the client side.
#[derive(Debug, Clone)]
pub enum NamePattern {
    Exact(String),
    /// Anchored: the whole name must match.
    Regex(Regex),
    /// One or more word characters, as `\w+`.
    AnyWord,
}

impl NamePattern {
    pub fn exact(name: impl Into<String>) -> Self {
        NamePattern::Exact(name.into())
    }

    pub fn regex(pattern: &str) -> Result<Self, regex::Error> {
        Ok(NamePattern::Regex(Regex::new(&format!("^(?:{pattern})$"))?))
    }

    /// Any non-empty word.
    pub fn any() -> Self {
        NamePattern::AnyWord
    }

    pub fn matches(&self, name: &str) -> bool {
        match self {
            NamePattern::Exact(expected) => expected == name,
            NamePattern::Regex(re) => re.is_match(name),
            NamePattern::AnyWord => !name.is_empty() && name.chars().all(|c| c.is_alphanumeric() || c == '_'),
        }
    }
}

impl Default for NamePattern {
    fn default() -> Self {
        Self::any()
    }
}

/// Client side of the exchange. Returns the peer's node name.
///
/// The socket is shut down on every failure path; on success its timeouts
/// are restored.
pub fn do_handshake(stream: &mut TcpStream, pattern: &NamePattern) -> Result<String, HandshakeError> {
    do_handshake_with_timeout(stream, pattern, DEFAULT_TIMEOUT)
}

pub fn do_handshake_with_timeout(
    stream: &mut TcpStream,
    pattern: &NamePattern,
    timeout: Duration,
) -> Result<String, HandshakeError> {
    let saved = SavedSocket::capture(stream).map_err(HandshakeError::from)?;
    let result = stream
        .set_nonblocking(false)
        .map_err(HandshakeError::from)
        .and_then(|_| client_exchange(stream, pattern, &Deadline::after(timeout)));

    match result {
        Ok(name) => {
            saved.restore(stream)?;
            Ok(name)
        }
        Err(e) => {
            debug!("Client handshake failed: {}", e);
            close(stream);
            Err(e)
        }
    }
}

fn client_exchange(
    stream: &mut TcpStream,
    pattern: &NamePattern,
    deadline: &Deadline,
) -> Result<String, HandshakeError> {
    write_all(stream, &MAGIC, deadline)?;

    let mut echo = [0u8; 4];
    let n = read_up_to(stream, &mut echo, deadline)?;
    if n != echo.len() || echo != reversed_magic() {
        return Err(HandshakeError::BadMagic(echo[..n].to_vec()));
    }

    write_all(stream, &[CONTINUE], deadline)?;

    let mut header = [0u8; 4];
    if read_up_to(stream, &mut header, deadline)? != header.len() {
        return Err(HandshakeError::BrokenPipe);
    }
    let len = BigEndian::read_u32(&header);
    if len > MAX_NAME_LEN {
        return Err(HandshakeError::NameTooLong(len));
    }
    let mut raw = vec![0u8; len as usize];
    if read_up_to(stream, &mut raw, deadline)? != raw.len() {
        return Err(HandshakeError::BrokenPipe);
    }
    let name = String::from_utf8(raw)?;

    if !pattern.matches(&name) {
        // best effort, the socket is closed right after
        let _ = write_all(stream, &[REJECT], deadline);
        return Err(HandshakeError::NameMismatch(name));
    }

    write_all(stream, &[ACCEPT], deadline)?;
    Ok(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::connection::tests::connection_pair;
    use std::net::TcpListener;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;

    fn stream_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("Failed to bind");
        let addr = listener.local_addr().expect("Failed to get address");
        let client = TcpStream::connect(addr).expect("Failed to connect");
        let (server, _) = listener.accept().expect("Failed to accept");
        (server, client)
    }

    #[test]
    fn test_reversed_magic() {
        assert_eq!(reversed_magic(), [0x00, 0x02, 0x04, 0x69]);
    }

    #[test]
    fn test_encode_name() {
        assert_eq!(encode_name("node"), b"\x00\x00\x00\x04node".to_vec());
    }

    #[test]
    fn test_wire_exchange_success() {
        let (mut server, mut client) = stream_pair();

        let peer = thread::spawn(move || {
            client.write_all(&[0x69, 0x04, 0x02, 0x00]).unwrap();
            let mut echo = [0u8; 4];
            client.read_exact(&mut echo).unwrap();
            assert_eq!(echo, [0x00, 0x02, 0x04, 0x69]);

            client.write_all(&[0x69]).unwrap();
            let mut name = [0u8; 8];
            client.read_exact(&mut name).unwrap();
            assert_eq!(&name, b"\x00\x00\x00\x04node");

            client.write_all(&[0x01]).unwrap();
            client
        });

        Handshake::new("node").accept(&mut server).expect("handshake should succeed");
        let _client = peer.join().unwrap();
    }

    #[test]
    fn test_wrong_magic_closes() {
        let (mut server, mut client) = stream_pair();
        client.write_all(&[0, 0, 0, 0, 0, 0]).unwrap();

        let err = Handshake::new("node").accept(&mut server).unwrap_err();
        assert!(matches!(err, HandshakeError::BadMagic(ref got) if got == &[0, 0, 0, 0]));

        // server closed: client sees EOF (or a reset because of unread bytes)
        client.set_read_timeout(Some(Duration::from_secs(1))).unwrap();
        let mut buf = [0u8; 4];
        match client.read(&mut buf) {
            Ok(n) => assert_eq!(n, 0),
            Err(e) => assert_eq!(e.kind(), io::ErrorKind::ConnectionReset),
        }
    }

    #[test]
    fn test_failed_restore_closes_socket() {
        let (mut server, mut client) = stream_pair();
        let peer = thread::spawn(move || {
            client.write_all(&MAGIC).unwrap();
            let mut echo = [0u8; 4];
            client.read_exact(&mut echo).unwrap();
            client.write_all(&[CONTINUE]).unwrap();
            let mut name = [0u8; 8];
            client.read_exact(&mut name).unwrap();
            client.write_all(&[ACCEPT]).unwrap();
            client
        });

        // a zero timeout is rejected by the socket layer
        let saved = SavedSocket {
            nonblocking: false,
            read_timeout: Some(Duration::ZERO),
            write_timeout: None,
        };
        let result = Handshake::new("node").accept_restoring(&mut server, &saved);
        assert!(matches!(result, Err(HandshakeError::Io(_))));

        let mut client = peer.join().unwrap();
        client.set_read_timeout(Some(Duration::from_secs(1))).unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).expect("Failed to read"), 0);
    }

    #[test]
    fn test_bad_ack_and_rejection() {
        let (mut server, mut client) = stream_pair();
        let peer = thread::spawn(move || {
            client.write_all(&MAGIC).unwrap();
            let mut echo = [0u8; 4];
            client.read_exact(&mut echo).unwrap();
            client.write_all(&[0x42]).unwrap();
            client
        });
        let err = Handshake::new("node").accept(&mut server).unwrap_err();
        assert!(matches!(err, HandshakeError::BadAck(Some(0x42))));
        peer.join().unwrap();

        let (mut server, mut client) = stream_pair();
        let peer = thread::spawn(move || {
            client.write_all(&MAGIC).unwrap();
            let mut echo = [0u8; 4];
            client.read_exact(&mut echo).unwrap();
            client.write_all(&[CONTINUE]).unwrap();
            let mut name = [0u8; 8];
            client.read_exact(&mut name).unwrap();
            client.write_all(&[REJECT]).unwrap();
            client
        });
        let err = Handshake::new("node").accept(&mut server).unwrap_err();
        assert!(matches!(err, HandshakeError::Rejected));
        peer.join().unwrap();
    }

    #[test]
    fn test_silent_peer_times_out() {
        let (mut server, _client) = stream_pair();
        let started = Instant::now();
        let err = Handshake::new("node")
            .with_timeout(Duration::from_millis(100))
            .accept(&mut server)
            .unwrap_err();
        assert!(matches!(err, HandshakeError::Timeout));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_client_and_server_agree() {
        let (mut server, mut client) = stream_pair();
        let peer = thread::spawn(move || {
            let name = do_handshake(&mut client, &NamePattern::exact("node")).expect("client handshake");
            (name, client)
        });

        Handshake::new("node").accept(&mut server).expect("server handshake");
        let (name, client) = peer.join().unwrap();
        assert_eq!(name, "node");

        // timeouts restored: none were set before
        assert_eq!(client.read_timeout().unwrap(), None);
        assert_eq!(server.read_timeout().unwrap(), None);
    }

    #[test]
    fn test_client_rejects_unmatched_name() {
        let (mut server, mut client) = stream_pair();
        let peer = thread::spawn(move || do_handshake(&mut client, &NamePattern::regex("db-\\d+").unwrap()));

        let server_result = Handshake::new("cache-1").accept(&mut server);
        assert!(matches!(server_result, Err(HandshakeError::Rejected)));

        let client_result = peer.join().unwrap();
        assert!(matches!(client_result, Err(HandshakeError::NameMismatch(ref n)) if n == "cache-1"));
    }

    #[test]
    fn test_name_patterns() {
        assert!(NamePattern::any().matches("node_1"));
        assert!(!NamePattern::any().matches("node 1"));
        assert!(!NamePattern::any().matches(""));

        let re = NamePattern::regex("node|db").unwrap();
        assert!(re.matches("db"));
        assert!(!re.matches("dbx"));

        assert!(NamePattern::exact("n").matches("n"));
        assert!(!NamePattern::exact("n").matches("n2"));
    }

    #[test]
    fn test_wrap_denies_without_calling_inner() {
        let (mut conn, mut client) = connection_pair();
        let called = Arc::new(AtomicBool::new(false));
        let flag = called.clone();
        let mut handler = Handshake::new("node").wrap(move |_, _| {
            flag.store(true, Ordering::SeqCst);
            Ok(Admission::Accept)
        });

        client.write_all(&[0, 0, 0, 0, 0, 0]).unwrap();
        let admission = handler(EventKind::Connect, &mut conn).unwrap();
        assert_eq!(admission, Admission::Deny);
        assert!(!called.load(Ordering::SeqCst));

        // other events bypass the exchange
        handler(EventKind::Receive, &mut conn).unwrap();
        assert!(called.load(Ordering::SeqCst));
    }

    #[test]
    fn test_wrap_admits_after_success() {
        let (mut conn, mut client) = connection_pair();
        let mut handler = Handshake::new("node").wrap(|_, _| Ok(Admission::Accept));

        let peer = thread::spawn(move || {
            let result = do_handshake(&mut client, &NamePattern::exact("node"));
            (result, client)
        });

        let admission = handler(EventKind::Connect, &mut conn).unwrap();
        assert_eq!(admission, Admission::Accept);
        let (result, _client) = peer.join().unwrap();
        assert_eq!(result.unwrap(), "node");
    }
}
