//! HTTP-like request/response layer on top of [`EventServer`].
//!
//! ```rust,ignore
//! use ev_server::http::{service_fn, HttpServer, Response, StatusCode};
//! use ev_server::server::ServerConfig;
//!
//! let mut server = HttpServer::bind(
//!     ServerConfig::default(),
//!     service_fn(|request, responder| {
//!         responder.send(Response::text(StatusCode::OK, format!("hello {}", request.path())))?;
//!         Ok(())
//!     }),
//! )?;
//! server.redirect("/old", "/new");
//! server.start(false)?;
//! ```

pub mod dispatch;
pub mod parser;
pub mod pipeline;
pub mod request;
pub mod response;

pub use dispatch::{service_fn, DirLoader, Responder, Service, StaticLoader};
pub use pipeline::BodySink;
pub use request::{Headers, Request};
pub use response::{Response, StatusCode};

use crate::error::{HandlerError, Result};
use crate::server::reactor::write_head;
use crate::server::{
    Admission, Connection, EventKey, EventKind, EventServer, Handshake, HandlerResult, ReadOutcome,
    ServerConfig, ServerHandle, WorkerHandle,
};
use bytes::Bytes;
use dispatch::Dispatcher;
use log::{debug, info, warn};
use pipeline::{Feed, PendingRequest};
use std::net::SocketAddr;

/// Per-event behaviour of an HTTP connection.
struct HttpConnections {
    dispatcher: Dispatcher,
    receive_block_size: usize,
}

impl HttpConnections {
    fn handle(&mut self, kind: EventKind, conn: &mut Connection) -> HandlerResult {
        match kind {
            EventKind::Connect => info!("[NEW-CONNECTION] Client: {}", conn.peer_addr()),
            EventKind::Disconnect => info!("[DISCONNECTED] Client: {}", conn.peer_addr()),
            EventKind::Receive => self.receive(conn),
            EventKind::Response => write_head(conn),
        }
        Ok(Admission::Accept)
    }

    fn receive(&mut self, conn: &mut Connection) {
        let data = match conn.read_chunk(self.receive_block_size) {
            Ok(ReadOutcome::Data(data)) => data,
            Ok(ReadOutcome::WouldBlock) => return,
            Ok(ReadOutcome::Closed) => {
                conn.mark_closing();
                return;
            }
            Err(e) => {
                debug!("Connection {} read error: {:?}", conn.token(), e);
                conn.abort();
                return;
            }
        };
        self.feed(conn, data);
    }

    /// Feed bytes, dispatching every request they complete.
    fn feed(&mut self, conn: &mut Connection, mut data: Bytes) {
        while !data.is_empty() && !conn.is_closing() {
            let mut pending = conn
                .pending_mut()
                .take()
                .unwrap_or_else(|| PendingRequest::new(conn.token(), conn.peer_addr()));

            let dispatcher = &mut self.dispatcher;
            let mut sinks = |request: &Request| dispatcher.body_sink(request);
            match pending.feed(&data, &mut sinks) {
                Ok(Feed::Incomplete) => {
                    *conn.pending_mut() = Some(pending);
                    return;
                }
                Ok(Feed::Complete { request, consumed }) => {
                    debug!("{} from {}", request, conn.peer_addr());
                    self.dispatcher.dispatch(&request, conn);
                    if request.wants_close() {
                        conn.mark_closing();
                    }
                    data = data.slice(consumed..);
                }
                Err(e) => {
                    warn!("Malformed request from {}: {}", conn.peer_addr(), e);
                    if let Err(e) = conn.send_response(Response::bad_request().to_bytes()) {
                        debug!("Connection {}: {}", conn.token(), e);
                    }
                    conn.mark_closing();
                    return;
                }
            }
        }
    }
}

/// Request/response server: an [`EventServer`] with the request pipeline
/// registered for every event.
pub struct HttpServer {
    server: EventServer,
    dispatcher: Option<Dispatcher>,
    handshake: Option<Handshake>,
}

impl HttpServer {
    pub fn bind(config: ServerConfig, service: impl Service + 'static) -> Result<Self> {
        Ok(Self {
            server: EventServer::bind(config)?,
            dispatcher: Some(Dispatcher::new(service)),
            handshake: None,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.server.local_addr()
    }

    pub fn handle(&self) -> ServerHandle {
        self.server.handle()
    }

    fn dispatcher(&mut self) -> Option<&mut Dispatcher> {
        if self.dispatcher.is_none() {
            warn!("HTTP server already started, setting ignored");
        }
        self.dispatcher.as_mut()
    }

    /// Answer `from` with a `302` to `to`, before any routing.
    pub fn redirect(&mut self, from: impl Into<String>, to: impl Into<String>) -> &mut Self {
        if let Some(d) = self.dispatcher() {
            d.add_redirect(from, to);
        }
        self
    }

    /// Send `/static/...` paths to the static loader (on by default).
    pub fn auto_static_distribution(&mut self, enabled: bool) -> &mut Self {
        if let Some(d) = self.dispatcher() {
            d.set_auto_static_distribution(enabled);
        }
        self
    }

    pub fn static_loader(&mut self, loader: impl StaticLoader + 'static) -> &mut Self {
        if let Some(d) = self.dispatcher() {
            d.set_loader(loader);
        }
        self
    }

    pub fn not_found_handler<F>(&mut self, handler: F) -> &mut Self
    where
        F: FnMut(&Request, &mut Responder<'_>) -> std::result::Result<(), HandlerError> + Send + 'static,
    {
        if let Some(d) = self.dispatcher() {
            d.set_not_found(handler);
        }
        self
    }

    pub fn internal_error_handler<F>(&mut self, handler: F) -> &mut Self
    where
        F: FnMut(&Request, &mut Responder<'_>) -> std::result::Result<(), HandlerError> + Send + 'static,
    {
        if let Some(d) = self.dispatcher() {
            d.set_internal_error(handler);
        }
        self
    }

    /// Require peers to complete the node handshake before admission.
    pub fn handshake(&mut self, handshake: Handshake) -> &mut Self {
        self.handshake = Some(handshake);
        self
    }

    /// See [`EventServer::start`].
    pub fn start(&mut self, threaded: bool) -> Result<Option<WorkerHandle>> {
        if let Some(dispatcher) = self.dispatcher.take() {
            let mut connections = HttpConnections {
                dispatcher,
                receive_block_size: self.server.config().get_receive_block_size(),
            };
            let handler = move |kind: EventKind, conn: &mut Connection| connections.handle(kind, conn);
            match self.handshake.take() {
                Some(handshake) => self.server.add_handler(handshake.wrap(handler), EventKey::AllEvents),
                None => self.server.add_handler(handler, EventKey::AllEvents),
            }
        }
        self.server.start(threaded)
    }

    pub fn stop(&mut self) {
        self.server.stop();
    }

    pub fn is_running(&self) -> bool {
        self.server.is_running()
    }
}
