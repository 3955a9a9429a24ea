// src/server/reactor.rs - Single-threaded event loop
//
// Core features:
// - One listener plus every admitted connection under one Poller
// - Level-triggered readiness, one classified event per notification
// - Handlers run on the loop thread, one at a time
// - Poller interest re-synced from the response queue after every handler
// - ConnectionToken generations reject stale events for recycled slots
// - Cross-thread commands drained at every wake

use crate::server::classify::{classify, Classified, EventKind};
use crate::server::connection::{Connection, ConnectionToken};
use crate::server::poller::{Event, Interest, Poller};
use crate::server::registry::{Admission, HandlerRegistry};
use crate::server::write_queue::WriteOutcome;
use crate::server::ServerConfig;
use bytes::Bytes;
use log::{debug, error, info, trace, warn};
use std::collections::HashMap;
use std::io;
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// Constants
// ============================================================================

/// Poller token reserved for the listening socket.
pub(crate) const LISTENER_TOKEN: usize = usize::MAX;

const DEFAULT_MAX_CONNECTIONS: usize = 10000; // Default max connections (auto-adjusted by system FD limit)

pub(crate) const STATUS_INIT: usize = 0;
pub(crate) const STATUS_RUN: usize = 1;
pub(crate) const STATUS_END: usize = 2;

// ============================================================================
// System Helpers
// ============================================================================

/// Soft limit of open files, or None if unavailable.
fn get_fd_limit() -> Option<usize> {
    use std::mem::MaybeUninit;
    let mut rlim = MaybeUninit::<libc::rlimit>::uninit();
    // SAFETY: rlim is a valid pointer to uninitialized memory,
    // getrlimit will initialize it if successful
    if unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, rlim.as_mut_ptr()) } == 0 {
        // SAFETY: getrlimit returned 0, so rlim is now initialized
        let rlim = unsafe { rlim.assume_init() };
        return Some(rlim.rlim_cur as usize);
    }
    None
}

/// Calculate effective max connections based on config and system limits.
///
/// - Uses configured value or DEFAULT_MAX_CONNECTIONS (10000)
/// - Caps at 80% of the fd limit, leaving headroom for the listener,
///   the poller and anything else the process opens
///
/// The result is at least 1.
pub fn effective_max_connections(config_max: Option<usize>) -> usize {
    let config_value = config_max.unwrap_or(DEFAULT_MAX_CONNECTIONS);
    let result = if let Some(fd_limit) = get_fd_limit() {
        let fd_based_limit = (fd_limit as f64 * 0.8) as usize;
        config_value.min(fd_based_limit)
    } else {
        config_value
    };
    result.max(1)
}

/// Bind the listening socket and apply the configured backlog.
fn bind_listener(address: SocketAddr, backlog: i32) -> io::Result<TcpListener> {
    let listener = TcpListener::bind(address)?;
    // std listens with its own backlog; listen() again only resizes the queue
    // SAFETY: fd belongs to `listener`, which outlives the call.
    if unsafe { libc::listen(listener.as_raw_fd(), backlog) } != 0 {
        return Err(io::Error::last_os_error());
    }
    listener.set_nonblocking(true)?;
    Ok(listener)
}

fn refuse(stream: TcpStream) {
    if let Err(e) = stream.shutdown(Shutdown::Both) {
        debug!("Socket shutdown error (expected if already closed): {:?}", e);
    }
}

// ============================================================================
// Commands
// ============================================================================

/// Requests sent to the loop from other threads.
#[derive(Debug)]
pub(crate) enum Command {
    Send(ConnectionToken, Bytes),
    Close(ConnectionToken),
}

// ============================================================================
// Reactor
// ============================================================================

pub(crate) struct Reactor {
    /// Event poller
    poller: Poller,
    listener: TcpListener,
    local_addr: SocketAddr,
    /// Connection storage (using slab allocation)
    connections: slab::Slab<Connection>,
    /// Generation counter (for each slot)
    generations: HashMap<usize, u32>,
    pub(crate) registry: HandlerRegistry,
    status: Arc<AtomicUsize>,
    commands: crossbeam_channel::Receiver<Command>,
    poll_timeout: Duration,
    max_connections: usize,
    max_queued_bytes: usize,
}

impl Reactor {
    /// Bind the listener and register it for READ.
    pub fn bind(
        config: &ServerConfig,
        status: Arc<AtomicUsize>,
        commands: crossbeam_channel::Receiver<Command>,
    ) -> io::Result<Self> {
        let mut poller = Poller::new()?;
        let listener = bind_listener(config.address, config.backlog)?;
        let local_addr = listener.local_addr()?;
        poller.register(listener.as_raw_fd(), LISTENER_TOKEN, Interest::READABLE)?;

        Ok(Self {
            poller,
            listener,
            local_addr,
            connections: slab::Slab::with_capacity(1024),
            generations: HashMap::new(),
            registry: HandlerRegistry::new(),
            status,
            commands,
            poll_timeout: config.poll_timeout,
            max_connections: effective_max_connections(config.max_connections),
            max_queued_bytes: config.max_queued_bytes,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    #[cfg(test)]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Run until the status flag reads STATUS_END, then close everything.
    pub fn run(mut self) {
        info!(
            "Event loop started on {} (max_connections: {})",
            self.local_addr, self.max_connections
        );

        loop {
            // 1. Check stop signal
            if self.status.load(Ordering::Acquire) == STATUS_END {
                info!("Event loop received stop signal");
                break;
            }

            // 2. Commands from other threads
            self.process_commands();

            // 3. Poll IO events
            let events = match self.poller.poll(Some(self.poll_timeout)) {
                Ok(events) => events,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!("Poller error: {:?}", e);
                    continue;
                }
            };

            // 4. Classify and dispatch
            for event in events {
                self.process_event(&event);
            }
        }

        self.shutdown();
    }

    fn process_event(&mut self, event: &Event) {
        let (id, classified) = if event.token == LISTENER_TOKEN {
            (None, classify(event, LISTENER_TOKEN, || Ok(0)))
        } else {
            let Some(id) = self.validate_connection(event.token) else {
                return;
            };
            let conn = &self.connections[id];
            (Some(id), classify(event, LISTENER_TOKEN, || conn.peek_byte()))
        };

        match (classified, id) {
            (Classified::Event(EventKind::Connect), _) => self.handle_connect(),
            (Classified::Event(EventKind::Disconnect), Some(id)) => self.close_connection(id),
            (Classified::Event(EventKind::Receive), Some(id)) => self.handle_receive(id),
            (Classified::Event(EventKind::Response), Some(id)) => self.handle_response(id),
            (classified, _) => debug!("Skipping {:?} for {:?}", classified, event),
        }
    }

    /// Validate connection exists and generation matches
    ///
    /// Returns Some(id) if connection is valid, None if stale event
    fn validate_connection(&self, poller_token: usize) -> Option<usize> {
        let token = ConnectionToken::from_poller_token(poller_token);
        self.lookup(token)
    }

    fn lookup(&self, token: ConnectionToken) -> Option<usize> {
        let conn = self.connections.get(token.id)?;
        if conn.token().generation == token.generation {
            return Some(token.id);
        }
        debug!(
            "Stale event for connection {}: expected gen {}, got {}",
            token.id,
            conn.token().generation,
            token.generation
        );
        None
    }

    // ------------------------------------------------------------------------
    // CONNECT
    // ------------------------------------------------------------------------

    fn handle_connect(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer_addr)) => self.admit(stream, peer_addr),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("Accept failed: {}", e);
                    break;
                }
            }
        }
    }

    fn admit(&mut self, stream: TcpStream, peer_addr: SocketAddr) {
        if self.connections.len() >= self.max_connections {
            warn!(
                "Refusing {}: max connections limit reached ({}/{})",
                peer_addr,
                self.connections.len(),
                self.max_connections
            );
            refuse(stream);
            return;
        }

        let id = self.connections.vacant_key();
        let generation = self.generations.entry(id).or_insert(0);
        *generation = generation.wrapping_add(1);
        let token = ConnectionToken::new(id, *generation);

        let mut conn = Connection::new(token, stream, peer_addr, self.max_queued_bytes);

        // no handler: accept
        let admission = match self.registry.dispatch(EventKind::Connect, &mut conn) {
            None => Admission::Accept,
            Some(Ok(admission)) => admission,
            Some(Err(_)) => Admission::Deny,
        };
        if admission == Admission::Deny {
            debug!("Connection {} from {} denied", token, peer_addr);
            conn.shutdown();
            return;
        }

        if let Err(e) = conn.set_nonblocking() {
            warn!("Failed to make connection {} non-blocking: {}", token, e);
            conn.shutdown();
            return;
        }

        // a CONNECT handler may already have queued a greeting
        let interest = conn.interest();
        if let Err(e) = self.poller.register(conn.fd(), token.to_poller_token(), interest) {
            error!("Failed to register connection {}: {}", token, e);
            conn.shutdown();
            return;
        }
        conn.set_registered_interest(Some(interest));
        self.connections.insert(conn);

        debug!("Connection {} from {} added", token, peer_addr);
        self.sync_connection(id);
    }

    // ------------------------------------------------------------------------
    // DISCONNECT
    // ------------------------------------------------------------------------

    /// Remove, deregister and shut down, then hand the closed snapshot to
    /// the handler.
    fn close_connection(&mut self, id: usize) {
        let Some(mut conn) = self.connections.try_remove(id) else {
            return;
        };
        if let Err(e) = self.poller.deregister(conn.fd()) {
            debug!("Failed to deregister connection {} from poller: {:?}", conn.token(), e);
        }
        conn.set_registered_interest(None);
        conn.shutdown();

        self.registry.dispatch(EventKind::Disconnect, &mut conn);

        debug!("Connection {} removed", conn.token());
    }

    // ------------------------------------------------------------------------
    // RECEIVE / RESPONSE
    // ------------------------------------------------------------------------

    fn handle_receive(&mut self, id: usize) {
        let conn = &mut self.connections[id];
        if self.registry.dispatch(EventKind::Receive, conn).is_none() {
            trace!("No RECEIVE handler, dropping event for {}", conn.token());
        }
        self.sync_connection(id);
    }

    /// Without a RESPONSE handler the loop drains the queue itself.
    fn handle_response(&mut self, id: usize) {
        let conn = &mut self.connections[id];
        if self.registry.dispatch(EventKind::Response, conn).is_none() {
            write_head(conn);
        }
        self.sync_connection(id);
    }

    /// Close a drained closing connection, otherwise bring the poller
    /// registration in line with the response queue.
    fn sync_connection(&mut self, id: usize) {
        let Some(conn) = self.connections.get_mut(id) else {
            return;
        };

        if conn.is_closing() && !conn.has_pending_output() {
            self.close_connection(id);
            return;
        }

        let desired = conn.interest();
        if conn.registered_interest() == Some(desired) {
            return;
        }
        match self.poller.modify(conn.fd(), conn.token().to_poller_token(), desired) {
            Ok(()) => conn.set_registered_interest(Some(desired)),
            Err(e) => {
                warn!("Failed to update interest for connection {}: {:?}", conn.token(), e);
                self.close_connection(id);
            }
        }
    }

    // ------------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------------

    fn process_commands(&mut self) {
        while let Ok(command) = self.commands.try_recv() {
            let token = match &command {
                Command::Send(token, _) | Command::Close(token) => *token,
            };
            let Some(id) = self.lookup(token) else {
                debug!("Dropping {:?}: connection {} is gone", command, token);
                continue;
            };

            let conn = &mut self.connections[id];
            match command {
                Command::Send(_, data) => {
                    if let Err(e) = conn.send_response(data) {
                        warn!("Connection {}: {}", token, e);
                    }
                }
                Command::Close(_) => conn.mark_closing(),
            }
            self.sync_connection(id);
        }
    }

    fn shutdown(&mut self) {
        let count = self.connections.len();
        for conn in self.connections.drain() {
            if let Err(e) = self.poller.deregister(conn.fd()) {
                debug!("Failed to deregister connection {}: {:?}", conn.token(), e);
            }
            conn.shutdown();
        }
        if let Err(e) = self.poller.deregister(self.listener.as_raw_fd()) {
            debug!("Failed to deregister listener: {:?}", e);
        }
        info!("Event loop stopped, closed {} connection(s)", count);
    }
}

/// One write of the head buffer; transport failures abort the connection.
pub(crate) fn write_head(conn: &mut Connection) {
    match conn.write_once() {
        Ok(WriteOutcome::Partial { bytes_written }) => {
            trace!("Connection {} partial write of {} bytes", conn.token(), bytes_written);
        }
        Ok(_) => {}
        Err(e) => {
            debug!("Connection {} write error: {:?}", conn.token(), e);
            conn.abort();
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::connection::ReadOutcome;
    use crate::server::registry::EventKey;
    use std::io::{Read, Write};
    use std::sync::Mutex;
    use std::thread;

    fn test_config() -> ServerConfig {
        ServerConfig::default()
            .address(SocketAddr::from(([127, 0, 0, 1], 0)))
            .poll_timeout(Duration::from_millis(20))
    }

    fn spawn(reactor: Reactor) -> thread::JoinHandle<()> {
        thread::Builder::new()
            .name("reactor-test".to_string())
            .spawn(move || reactor.run())
            .expect("Failed to spawn reactor thread")
    }

    #[test]
    fn test_effective_max_connections() {
        assert!(effective_max_connections(None) >= 1);
        assert!(effective_max_connections(Some(5)) <= 5);
        assert_eq!(effective_max_connections(Some(0)), 1);
    }

    #[test]
    fn test_bind_reports_local_addr() {
        let status = Arc::new(AtomicUsize::new(STATUS_INIT));
        let (_tx, rx) = crossbeam_channel::unbounded();
        let reactor = Reactor::bind(&test_config(), status, rx).expect("Failed to bind reactor");
        assert_ne!(reactor.local_addr().port(), 0);
        assert_eq!(reactor.connection_count(), 0);
    }

    #[test]
    fn test_events_reach_handlers_in_order() {
        let status = Arc::new(AtomicUsize::new(STATUS_RUN));
        let (_tx, rx) = crossbeam_channel::unbounded();
        let mut reactor = Reactor::bind(&test_config(), status.clone(), rx).expect("Failed to bind reactor");
        let addr = reactor.local_addr();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();
        reactor.registry.handler(EventKey::AllEvents, move |kind, conn: &mut Connection| {
            log.lock().unwrap().push(kind);
            if kind == EventKind::Receive {
                let mut buf = [0u8; 64];
                let n = conn.stream_mut().read(&mut buf)?;
                conn.send_response(Bytes::copy_from_slice(&buf[..n]))?;
            }
            if kind == EventKind::Response {
                write_head(conn);
            }
            Ok(Admission::Accept)
        });
        let worker = spawn(reactor);

        let mut client = TcpStream::connect(addr).expect("Failed to connect");
        client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        client.write_all(b"echo").unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).expect("Failed to read echo");
        assert_eq!(&buf, b"echo");

        drop(client);
        thread::sleep(Duration::from_millis(200));
        status.store(STATUS_END, Ordering::Release);
        worker.join().unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(
            *seen,
            vec![
                EventKind::Connect,
                EventKind::Receive,
                EventKind::Response,
                EventKind::Disconnect
            ]
        );
    }

    #[test]
    fn test_denied_connection_is_closed() {
        let status = Arc::new(AtomicUsize::new(STATUS_RUN));
        let (_tx, rx) = crossbeam_channel::unbounded();
        let mut reactor = Reactor::bind(&test_config(), status.clone(), rx).expect("Failed to bind reactor");
        let addr = reactor.local_addr();
        reactor.registry.handler(EventKind::Connect, |_, _| Ok(Admission::Deny));
        let worker = spawn(reactor);

        let mut client = TcpStream::connect(addr).expect("Failed to connect");
        client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let mut buf = [0u8; 1];
        match client.read(&mut buf) {
            Ok(n) => assert_eq!(n, 0),
            Err(e) => assert_eq!(e.kind(), io::ErrorKind::ConnectionReset),
        }

        status.store(STATUS_END, Ordering::Release);
        worker.join().unwrap();
    }

    #[test]
    fn test_connection_limit_refuses() {
        let status = Arc::new(AtomicUsize::new(STATUS_RUN));
        let (_tx, rx) = crossbeam_channel::unbounded();
        let config = test_config().max_connections(1);
        let reactor = Reactor::bind(&config, status.clone(), rx).expect("Failed to bind reactor");
        let addr = reactor.local_addr();
        let worker = spawn(reactor);

        let first = TcpStream::connect(addr).expect("Failed to connect");
        thread::sleep(Duration::from_millis(100));
        let mut second = TcpStream::connect(addr).expect("Failed to connect");
        second.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let mut buf = [0u8; 1];
        match second.read(&mut buf) {
            Ok(n) => assert_eq!(n, 0),
            Err(e) => assert_eq!(e.kind(), io::ErrorKind::ConnectionReset),
        }

        drop(first);
        status.store(STATUS_END, Ordering::Release);
        worker.join().unwrap();
    }

    #[test]
    fn test_commands_send_and_close() {
        let status = Arc::new(AtomicUsize::new(STATUS_RUN));
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut reactor = Reactor::bind(&test_config(), status.clone(), rx).expect("Failed to bind reactor");
        let addr = reactor.local_addr();

        let (token_tx, token_rx) = crossbeam_channel::bounded(1);
        reactor.registry.handler(EventKind::Connect, move |_, conn: &mut Connection| {
            let _ = token_tx.send(conn.token());
            Ok(Admission::Accept)
        });
        let worker = spawn(reactor);

        let mut client = TcpStream::connect(addr).expect("Failed to connect");
        client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let token = token_rx.recv_timeout(Duration::from_secs(2)).expect("no CONNECT");

        tx.send(Command::Send(token, Bytes::from_static(b"pushed"))).unwrap();
        tx.send(Command::Close(token)).unwrap();

        let mut received = Vec::new();
        client.read_to_end(&mut received).expect("Failed to read");
        assert_eq!(received, b"pushed");

        status.store(STATUS_END, Ordering::Release);
        worker.join().unwrap();
    }

    #[test]
    fn test_small_reads_still_see_every_byte() {
        let status = Arc::new(AtomicUsize::new(STATUS_RUN));
        let (_tx, rx) = crossbeam_channel::unbounded();
        let mut reactor = Reactor::bind(&test_config(), status.clone(), rx).expect("Failed to bind reactor");
        let addr = reactor.local_addr();

        let (data_tx, data_rx) = crossbeam_channel::unbounded();
        reactor.registry.handler(EventKind::Receive, move |_, conn: &mut Connection| {
            // one 4 byte read per notification
            if let ReadOutcome::Data(data) = conn.read_chunk(4)? {
                let _ = data_tx.send(data);
            }
            Ok(Admission::Accept)
        });
        let worker = spawn(reactor);

        let request = b"GET /level HTTP/1.1\r\n\r\n";
        let mut client = TcpStream::connect(addr).expect("Failed to connect");
        client.write_all(request).unwrap();

        let mut received = Vec::new();
        while received.len() < request.len() {
            let chunk = data_rx.recv_timeout(Duration::from_secs(2)).expect("bytes left unread");
            assert!(chunk.len() <= 4);
            received.extend_from_slice(&chunk);
        }
        assert_eq!(received, request);

        drop(client);
        status.store(STATUS_END, Ordering::Release);
        worker.join().unwrap();
    }

    #[test]
    fn test_disconnect_handler_sees_closed_untracked_connection() {
        let status = Arc::new(AtomicUsize::new(STATUS_RUN));
        let (_tx, rx) = crossbeam_channel::unbounded();
        let mut reactor = Reactor::bind(&test_config(), status.clone(), rx).expect("Failed to bind reactor");
        let addr = reactor.local_addr();

        let (seen_tx, seen_rx) = crossbeam_channel::bounded(1);
        reactor.registry.handler(EventKind::Disconnect, move |_, conn: &mut Connection| {
            let registered = conn.registered_interest();
            let write = conn.stream_mut().write_all(b"still-writable");
            let mut buf = [0u8; 8];
            let read = conn.stream_mut().read(&mut buf);
            let _ = seen_tx.send((registered, write.is_err(), matches!(read, Ok(0) | Err(_))));
            Ok(Admission::Accept)
        });
        let worker = spawn(reactor);

        let mut client = TcpStream::connect(addr).expect("Failed to connect");
        client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        client.shutdown(Shutdown::Write).unwrap();

        let (registered, write_failed, read_closed) =
            seen_rx.recv_timeout(Duration::from_secs(2)).expect("no DISCONNECT");
        assert_eq!(registered, None);
        assert!(write_failed);
        assert!(read_closed);

        let mut received = Vec::new();
        let _ = client.read_to_end(&mut received);
        assert!(received.is_empty());

        status.store(STATUS_END, Ordering::Release);
        worker.join().unwrap();
    }

    #[test]
    fn test_unclassified_event_is_skipped() {
        let status = Arc::new(AtomicUsize::new(STATUS_RUN));
        let (_tx, rx) = crossbeam_channel::unbounded();
        let mut reactor = Reactor::bind(&test_config(), status.clone(), rx).expect("Failed to bind reactor");
        let addr = reactor.local_addr();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();
        reactor.registry.handler(EventKey::AllEvents, move |kind, conn: &mut Connection| {
            log.lock().unwrap().push(kind);
            if kind == EventKind::Receive {
                if let ReadOutcome::Data(data) = conn.read_chunk(64)? {
                    conn.send_response(data)?;
                }
            }
            if kind == EventKind::Response {
                write_head(conn);
            }
            Ok(Admission::Accept)
        });

        let _first = TcpStream::connect(addr).expect("Failed to connect");
        thread::sleep(Duration::from_millis(50));
        reactor.handle_connect();
        assert_eq!(reactor.connection_count(), 1);
        let (id, conn) = reactor.connections.iter().next().expect("connection tracked");
        let token = conn.token();
        assert_eq!(id, token.id);

        // no readiness bits at all
        reactor.process_event(&Event {
            token: token.to_poller_token(),
            readable: false,
            writable: false,
            error: false,
            hangup: false,
        });
        assert_eq!(reactor.connection_count(), 1);
        assert_eq!(*seen.lock().unwrap(), vec![EventKind::Connect]);

        let worker = spawn(reactor);
        let mut second = TcpStream::connect(addr).expect("Failed to connect");
        second.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        second.write_all(b"ping").unwrap();
        let mut buf = [0u8; 4];
        second.read_exact(&mut buf).expect("loop stopped serving");
        assert_eq!(&buf, b"ping");

        status.store(STATUS_END, Ordering::Release);
        worker.join().unwrap();
    }
}
