//! **ev-server** is a single-threaded, readiness-driven socket server.
//!
//! One event loop owns a listening socket and every connection it admits.
//! Kernel readiness notifications are classified into semantic events and
//! handed to user handlers registered per event kind.
//!
//! # Architecture
//!
//! - **Linux**: epoll (level-triggered)
//! - **macOS/BSD**: kqueue
//!
//! ## Key Components
//!
//! - `EventServer`: listener, handler registry and the event loop
//! - `Poller`: IO multiplexer abstraction
//! - `ResponseQueue`: per-connection ordered output with partial-write tracking
//! - `Handshake`: node identity exchange run before a connection is admitted
//! - `HttpServer`: incremental request assembly and dispatch on top of `EventServer`
//!
//! ## Events
//!
//! | Event | Raised when | Connection state |
//! |-------|-------------|------------------|
//! | CONNECT | listener readable | accepted, not yet tracked |
//! | RECEIVE | peek sees at least one byte | tracked, READ interest |
//! | RESPONSE | socket writable | tracked, WRITE interest |
//! | DISCONNECT | peek sees EOF, reset or hang-up | already untracked |
//!
//! A connection has WRITE interest exactly while its response queue is
//! non-empty.
//!
//! # Example
//!
//! ```rust,ignore
//! use ev_server::server::{Admission, EventKind, EventServer, ReadOutcome, ServerConfig};
//!
//! let mut server = EventServer::bind(ServerConfig::default())?;
//! server.handler(EventKind::Receive, |_, conn| {
//!     if let ReadOutcome::Data(_) = conn.read_chunk(4096)? {
//!         conn.send_response(&b"HTTP/1.1 200 OK\r\nContent-Length: 11\r\n\r\nHello World"[..])?;
//!     }
//!     Ok(Admission::Accept)
//! });
//! let worker = server.start(true)?.expect("threaded start");
//! // ...
//! server.stop();
//! worker.join().ok();
//! ```

pub mod error;
pub mod http;
pub mod server;

pub use error::{Error, Result};
pub use http::{HttpServer, Request, Response};
pub use server::{EventServer, ServerConfig, ServerHandle};
