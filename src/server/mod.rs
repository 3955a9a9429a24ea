//! Socket-level event server.
//!
//! An [`EventServer`] owns one listening socket and every connection it
//! admits. Readiness notifications are classified into [`EventKind`]s and
//! dispatched to the handlers registered on the server:
//!
//! ```rust,ignore
//! use ev_server::server::{Admission, EventKind, EventServer, ReadOutcome, ServerConfig};
//!
//! let mut server = EventServer::bind(ServerConfig::default())?;
//! server
//!     .handler(EventKind::Connect, |_, conn| {
//!         println!("hello {}", conn.peer_addr());
//!         Ok(Admission::Accept)
//!     })
//!     .handler(EventKind::Receive, |_, conn| {
//!         if let ReadOutcome::Data(_) = conn.read_chunk(64)? {
//!             conn.send_response(&b"pong"[..])?;
//!         }
//!         Ok(Admission::Accept)
//!     });
//! server.start(false)?;
//! ```

pub mod classify;
pub mod connection;
pub mod handshake;
pub mod poller;
pub(crate) mod reactor;
pub mod registry;
pub mod write_queue;

pub use classify::EventKind;
pub use connection::{Connection, ConnectionToken, ReadOutcome};
pub use handshake::{do_handshake, Handshake, NamePattern};
pub use poller::Interest;
pub use reactor::effective_max_connections;
pub use registry::{Admission, EventKey, HandlerResult};
pub use write_queue::{WriteOutcome, DEFAULT_MAX_QUEUED_BYTES};

use crate::error::{Error, Result};
use bytes::Bytes;
use log::{debug, error, info, warn};
use reactor::{Command, Reactor, STATUS_END, STATUS_INIT, STATUS_RUN};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

pub const DEFAULT_BACKLOG: i32 = 128;
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(1);
pub const DEFAULT_RECEIVE_BLOCK_SIZE: usize = 4096;

/// Listener and event loop settings.
///
/// ```rust,ignore
/// let config = ServerConfig::default()
///     .address("127.0.0.1:0".parse()?)
///     .backlog(64)
///     .max_connections(512);
/// ```
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub(crate) address: SocketAddr,
    pub(crate) backlog: i32,
    pub(crate) poll_timeout: Duration,
    pub(crate) receive_block_size: usize,
    pub(crate) max_connections: Option<usize>,
    pub(crate) max_queued_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: SocketAddr::from(([0, 0, 0, 0], 9090)),
            backlog: DEFAULT_BACKLOG,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            receive_block_size: DEFAULT_RECEIVE_BLOCK_SIZE,
            max_connections: None,
            max_queued_bytes: DEFAULT_MAX_QUEUED_BYTES,
        }
    }
}

impl ServerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn address(mut self, address: SocketAddr) -> Self {
        self.address = address;
        self
    }

    /// Pending-connection queue length passed to `listen(2)`.
    pub fn backlog(mut self, backlog: i32) -> Self {
        self.backlog = backlog;
        self
    }

    /// Upper bound on one poller wait, and so on stop latency.
    pub fn poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    /// Bytes read per RECEIVE by the request pipeline.
    pub fn receive_block_size(mut self, size: usize) -> Self {
        self.receive_block_size = size.max(1);
        self
    }

    /// Capped at 80% of the process fd limit, see [`effective_max_connections`].
    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = Some(max);
        self
    }

    /// Per-connection cap on queued response bytes.
    pub fn max_queued_bytes(mut self, max: usize) -> Self {
        self.max_queued_bytes = max;
        self
    }

    pub fn get_address(&self) -> SocketAddr {
        self.address
    }

    pub fn get_receive_block_size(&self) -> usize {
        self.receive_block_size
    }
}

/// Cloneable cross-thread control for a running server.
///
/// Commands are picked up by the event loop on its next wake.
#[derive(Clone)]
pub struct ServerHandle {
    status: Arc<AtomicUsize>,
    commands: crossbeam_channel::Sender<Command>,
    local_addr: SocketAddr,
}

impl ServerHandle {
    pub fn stop(&self) {
        self.status.store(STATUS_END, Ordering::Release);
    }

    pub fn is_running(&self) -> bool {
        self.status.load(Ordering::Acquire) == STATUS_RUN
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Queue `data` on the connection identified by `token`.
    ///
    /// Silently dropped by the loop if the connection is already gone.
    pub fn send_response(&self, token: ConnectionToken, data: impl Into<Bytes>) -> Result<()> {
        self.command(Command::Send(token, data.into()))
    }

    /// Close `token` once its queued output has drained.
    pub fn close(&self, token: ConnectionToken) -> Result<()> {
        self.command(Command::Close(token))
    }

    fn command(&self, command: Command) -> Result<()> {
        if self.status.load(Ordering::Acquire) == STATUS_END {
            return Err(Error::Stopped);
        }
        self.commands.send(command).map_err(|_| Error::Stopped)
    }
}

/// Event loop running on its own thread.
pub struct WorkerHandle {
    thread: JoinHandle<()>,
    status: Arc<AtomicUsize>,
}

impl WorkerHandle {
    pub fn stop(&self) {
        self.status.store(STATUS_END, Ordering::Release);
    }

    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Wait for the loop to exit. Does not stop it.
    pub fn join(self) -> thread::Result<()> {
        self.thread.join()
    }
}

pub struct EventServer {
    local_addr: SocketAddr,
    config: ServerConfig,
    status: Arc<AtomicUsize>,
    commands: crossbeam_channel::Sender<Command>,
    /// Present until the loop starts or the server is stopped.
    reactor: Option<Reactor>,
}

impl EventServer {
    /// Bind the listening socket. The loop does not run until [`start`](Self::start).
    pub fn bind(config: ServerConfig) -> Result<Self> {
        let status = Arc::new(AtomicUsize::new(STATUS_INIT));
        let (commands, receiver) = crossbeam_channel::unbounded();
        let reactor = Reactor::bind(&config, status.clone(), receiver)?;
        let local_addr = reactor.local_addr();
        debug!("Listening socket bound to {} (backlog {})", local_addr, config.backlog);

        Ok(Self {
            local_addr,
            config,
            status,
            commands,
            reactor: Some(reactor),
        })
    }

    /// Actual bound address, useful with port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Register `handler` for `on_event`, replacing any previous one.
    ///
    /// Handlers are fixed once the loop starts; later registrations are
    /// ignored with a warning.
    pub fn add_handler<F>(&mut self, handler: F, on_event: impl Into<EventKey>)
    where
        F: FnMut(EventKind, &mut Connection) -> HandlerResult + Send + 'static,
    {
        let on_event = on_event.into();
        match self.reactor.as_mut() {
            Some(reactor) => reactor.registry.add_handler(handler, on_event),
            None => warn!("Ignoring handler for {:?}: server already started", on_event),
        }
    }

    /// Chaining form of [`add_handler`](Self::add_handler).
    pub fn handler<F>(&mut self, on_event: impl Into<EventKey>, handler: F) -> &mut Self
    where
        F: FnMut(EventKind, &mut Connection) -> HandlerResult + Send + 'static,
    {
        self.add_handler(handler, on_event);
        self
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            status: self.status.clone(),
            commands: self.commands.clone(),
            local_addr: self.local_addr,
        }
    }

    pub fn is_running(&self) -> bool {
        self.status.load(Ordering::Acquire) == STATUS_RUN
    }

    pub fn is_stopped(&self) -> bool {
        self.status.load(Ordering::Acquire) == STATUS_END
    }

    /// Run the event loop.
    ///
    /// With `threaded` the loop moves to a named worker thread and a
    /// [`WorkerHandle`] is returned at once. Otherwise this call blocks until
    /// the server is stopped through a [`ServerHandle`].
    ///
    /// # Errors
    ///
    /// * [`Error::AlreadyRunning`] if the loop is running.
    /// * [`Error::Stopped`] if the server was stopped.
    /// * [`Error::ThreadSpawn`] if the worker thread could not be created.
    pub fn start(&mut self, threaded: bool) -> Result<Option<WorkerHandle>> {
        match self.status.load(Ordering::Acquire) {
            STATUS_RUN => return Err(Error::AlreadyRunning),
            STATUS_END => return Err(Error::Stopped),
            _ => {}
        }
        let Some(reactor) = self.reactor.take() else {
            return Err(Error::AlreadyRunning);
        };

        self.status.store(STATUS_RUN, Ordering::Release);
        info!("Serving on {}", self.local_addr);

        if !threaded {
            reactor.run();
            return Ok(None);
        }

        let result = thread::Builder::new()
            .name(format!("ev-server-{}", self.local_addr.port()))
            .spawn(move || reactor.run());
        match result {
            Ok(thread) => Ok(Some(WorkerHandle {
                thread,
                status: self.status.clone(),
            })),
            Err(e) => {
                error!("Failed to spawn event loop thread: {e}");
                self.status.store(STATUS_END, Ordering::Release);
                Err(Error::ThreadSpawn(e))
            }
        }
    }

    /// Ask the loop to exit. A server that never started closes its
    /// listener and poller here.
    pub fn stop(&mut self) {
        self.status.store(STATUS_END, Ordering::Release);
        if self.reactor.take().is_some() {
            debug!("Server on {} stopped before start", self.local_addr);
        }
    }
}

impl Drop for EventServer {
    fn drop(&mut self) {
        self.stop();
    }
}
