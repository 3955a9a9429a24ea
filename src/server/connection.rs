// src/server/connection.rs - Accepted socket state
//
// A Connection owns its socket, its response queue and the request being
// assembled on it. Poller interest is derived from the queue: WRITE while
// output is pending, READ otherwise. The reactor re-syncs the kernel
// registration after every handler call.

use crate::error::QueueFullError;
use crate::http::pipeline::PendingRequest;
use crate::server::poller::Interest;
use crate::server::write_queue::{ResponseQueue, WriteOutcome};
use bytes::Bytes;
use log::debug;
use std::fmt;
use std::io::{self, Read};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};

// ============================================================================
// Connection Token - Prevents ID reuse conflicts
// ============================================================================

/// Connection token - slab slot plus a generation counter bumped on reuse
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionToken {
    pub id: usize,
    pub generation: u32,
}

impl ConnectionToken {
    pub(crate) fn new(id: usize, generation: u32) -> Self {
        Self { id, generation }
    }

    /// Layout: [generation: 32 bits][id: 32 bits]
    #[cfg(target_pointer_width = "64")]
    pub(crate) fn to_poller_token(self) -> usize {
        ((self.generation as usize) << 32) | (self.id & 0xFFFF_FFFF)
    }

    #[cfg(target_pointer_width = "64")]
    pub(crate) fn from_poller_token(token: usize) -> Self {
        Self {
            id: token & 0xFFFF_FFFF,
            generation: (token >> 32) as u32,
        }
    }

    #[cfg(target_pointer_width = "32")]
    pub(crate) fn to_poller_token(self) -> usize {
        self.id
    }

    #[cfg(target_pointer_width = "32")]
    pub(crate) fn from_poller_token(token: usize) -> Self {
        Self { id: token, generation: 0 }
    }
}

impl fmt::Display for ConnectionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.id, self.generation)
    }
}

/// Result of one bounded read
#[derive(Debug)]
pub enum ReadOutcome {
    Data(Bytes),
    /// Peer closed its write side
    Closed,
    WouldBlock,
}

pub struct Connection {
    token: ConnectionToken,
    stream: TcpStream,
    fd: RawFd,
    peer_addr: SocketAddr,
    queue: ResponseQueue,
    pending: Option<PendingRequest>,
    read_buffer: Vec<u8>,
    closing: bool,
    /// Interest currently installed in the poller, `None` until registered
    registered: Option<Interest>,
}

impl Connection {
    pub(crate) fn new(
        token: ConnectionToken,
        stream: TcpStream,
        peer_addr: SocketAddr,
        max_queued_bytes: usize,
    ) -> Self {
        let fd = stream.as_raw_fd();
        Self {
            token,
            stream,
            fd,
            peer_addr,
            queue: ResponseQueue::with_limit(max_queued_bytes),
            pending: None,
            read_buffer: Vec::new(),
            closing: false,
            registered: None,
        }
    }

    pub fn token(&self) -> ConnectionToken {
        self.token
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }

    /// Direct socket access, used by the handshake before admission.
    pub fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    /// Interest the connection wants: WRITE iff output is queued.
    pub fn interest(&self) -> Interest {
        if self.queue.is_empty() {
            Interest::READABLE
        } else {
            Interest::WRITABLE
        }
    }

    /// Queue a response. The first buffer queued on an idle connection flips
    /// it to write interest.
    ///
    /// If the queue limit would be reached the buffer is dropped and the
    /// connection is marked closing.
    pub fn send_response(&mut self, data: impl Into<Bytes>) -> Result<(), QueueFullError> {
        let was_empty = self.queue.is_empty();
        if let Err(e) = self.queue.push(data.into()) {
            debug!("Connection {} {}, closing", self.token, e);
            self.closing = true;
            return Err(e);
        }
        if was_empty && !self.queue.is_empty() {
            debug!("Connection {} switched to write interest", self.token);
        }
        Ok(())
    }

    /// Append a further part behind already queued output.
    pub fn add_response(&mut self, data: impl Into<Bytes>) -> Result<(), QueueFullError> {
        self.send_response(data)
    }

    pub fn response_queue(&self) -> &ResponseQueue {
        &self.queue
    }

    #[cfg(test)]
    pub(crate) fn response_queue_mut(&mut self) -> &mut ResponseQueue {
        &mut self.queue
    }

    pub fn has_pending_output(&self) -> bool {
        !self.queue.is_empty()
    }

    /// Write the head of the response queue once.
    pub fn write_once(&mut self) -> io::Result<WriteOutcome> {
        self.queue.write_once(&mut self.stream)
    }

    /// Read at most `max` bytes.
    pub fn read_chunk(&mut self, max: usize) -> io::Result<ReadOutcome> {
        if self.read_buffer.len() < max {
            self.read_buffer.resize(max, 0);
        }
        match self.stream.read(&mut self.read_buffer[..max]) {
            Ok(0) => Ok(ReadOutcome::Closed),
            Ok(n) => Ok(ReadOutcome::Data(Bytes::copy_from_slice(&self.read_buffer[..n]))),
            Err(ref e)
                if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::Interrupted =>
            {
                Ok(ReadOutcome::WouldBlock)
            }
            Err(e) => Err(e),
        }
    }

    /// Non-destructive one byte peek, returns the number of bytes seen.
    pub fn peek_byte(&self) -> io::Result<usize> {
        let mut buf = [0u8; 1];
        self.stream.peek(&mut buf)
    }

    /// Request teardown once queued output has drained.
    pub fn mark_closing(&mut self) {
        self.closing = true;
    }

    /// Discard queued output and close on the next sync.
    pub fn abort(&mut self) {
        self.queue.clear();
        self.closing = true;
    }

    pub fn is_closing(&self) -> bool {
        self.closing
    }

    pub(crate) fn pending_mut(&mut self) -> &mut Option<PendingRequest> {
        &mut self.pending
    }

    pub fn has_pending_request(&self) -> bool {
        self.pending.is_some()
    }

    pub(crate) fn registered_interest(&self) -> Option<Interest> {
        self.registered
    }

    pub(crate) fn set_registered_interest(&mut self, interest: Option<Interest>) {
        self.registered = interest;
    }

    pub(crate) fn set_nonblocking(&self) -> io::Result<()> {
        self.stream.set_nonblocking(true)
    }

    pub(crate) fn shutdown(&self) {
        if let Err(e) = self.stream.shutdown(Shutdown::Both) {
            debug!("Socket shutdown error (expected if already closed): {:?}", e);
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("token", &self.token)
            .field("fd", &self.fd)
            .field("peer_addr", &self.peer_addr)
            .field("queued", &self.queue.len())
            .field("closing", &self.closing)
            .finish()
    }
}
