// src/http/dispatch.rs - Completed request → response
//
// Order for every request:
// 1. redirect table (exact path)
// 2. `/static/` prefix → static loader, when auto distribution is on
// 3. the service
// Not-found and internal errors go to their handler slots. Errors raised
// inside those slots are only logged.

use crate::error::{HandlerError, QueueFullError, ServiceError};
use crate::http::pipeline::BodySink;
use crate::http::request::Request;
use crate::http::response::Response;
use crate::server::registry::panic_message;
use crate::server::{Connection, ConnectionToken};
use bytes::Bytes;
use log::{debug, error};
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Component, Path, PathBuf};

pub const STATIC_PREFIX: &str = "/static/";

/// Write access to the connection a request arrived on.
pub struct Responder<'a> {
    conn: &'a mut Connection,
    responded: bool,
}

impl<'a> Responder<'a> {
    pub(crate) fn new(conn: &'a mut Connection) -> Self {
        Self {
            conn,
            responded: false,
        }
    }

    pub fn send(&mut self, response: Response) -> Result<(), QueueFullError> {
        self.send_raw(response.to_bytes())
    }

    /// Queue bytes as they are.
    pub fn send_raw(&mut self, data: impl Into<Bytes>) -> Result<(), QueueFullError> {
        self.conn.send_response(data)?;
        self.responded = true;
        Ok(())
    }

    /// Close the connection after queued output drains.
    pub fn close(&mut self) {
        self.conn.mark_closing();
    }

    pub fn has_responded(&self) -> bool {
        self.responded
    }

    pub fn token(&self) -> ConnectionToken {
        self.conn.token()
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.conn.peer_addr()
    }
}

/// Application side of the HTTP server.
pub trait Service: Send {
    fn call(&mut self, request: &Request, responder: &mut Responder<'_>) -> Result<(), ServiceError>;

    /// Sink for a chunked or multipart body. `None` buffers it in the request.
    fn body_sink(&mut self, _request: &Request) -> Option<Box<dyn BodySink>> {
        None
    }

    /// Used in log lines.
    fn name(&self) -> &str {
        "service"
    }
}

/// [`Service`] backed by a closure.
pub struct ServiceFn<F> {
    f: F,
}

pub fn service_fn<F>(f: F) -> ServiceFn<F>
where
    F: FnMut(&Request, &mut Responder<'_>) -> Result<(), ServiceError> + Send,
{
    ServiceFn { f }
}

impl<F> Service for ServiceFn<F>
where
    F: FnMut(&Request, &mut Responder<'_>) -> Result<(), ServiceError> + Send,
{
    fn call(&mut self, request: &Request, responder: &mut Responder<'_>) -> Result<(), ServiceError> {
        (self.f)(request, responder)
    }
}

/// Source of responses for `/static/...` paths.
pub trait StaticLoader: Send {
    /// `path` is the full request path. `io::ErrorKind::NotFound` selects
    /// the not-found handler.
    fn load(&mut self, path: &str) -> io::Result<Response>;
}

/// Serves files below a root directory.
#[derive(Debug, Clone)]
pub struct DirLoader {
    root: PathBuf,
}

impl DirLoader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &str) -> Option<PathBuf> {
        let relative = Path::new(path.strip_prefix(STATIC_PREFIX)?);
        if !relative.components().all(|c| matches!(c, Component::Normal(_))) {
            return None;
        }
        Some(self.root.join(relative))
    }
}

impl StaticLoader for DirLoader {
    fn load(&mut self, path: &str) -> io::Result<Response> {
        let file = self
            .resolve(path)
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))?;
        let body = std::fs::read(&file)?;
        Ok(Response::ok()
            .header("Content-Type", content_type(&file))
            .body(body))
    }
}

fn content_type(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("html") | Some("htm") => "text/html; charset=utf-8",
        Some("css") => "text/css",
        Some("js") => "application/javascript",
        Some("json") => "application/json",
        Some("txt") => "text/plain; charset=utf-8",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("svg") => "image/svg+xml",
        _ => "application/octet-stream",
    }
}

pub type ErrorHandler = Box<dyn FnMut(&Request, &mut Responder<'_>) -> Result<(), HandlerError> + Send>;

fn default_not_found(_: &Request, responder: &mut Responder<'_>) -> Result<(), HandlerError> {
    responder.send(Response::not_found())?;
    Ok(())
}

fn default_internal_error(_: &Request, responder: &mut Responder<'_>) -> Result<(), HandlerError> {
    responder.send(Response::internal_error())?;
    Ok(())
}

pub struct Dispatcher {
    service: Box<dyn Service>,
    loader: Option<Box<dyn StaticLoader>>,
    auto_static_distribution: bool,
    redirects: HashMap<String, String>,
    not_found: ErrorHandler,
    internal_error: ErrorHandler,
}

impl Dispatcher {
    pub fn new(service: impl Service + 'static) -> Self {
        Self {
            service: Box::new(service),
            loader: None,
            auto_static_distribution: true,
            redirects: HashMap::new(),
            not_found: Box::new(default_not_found),
            internal_error: Box::new(default_internal_error),
        }
    }

    pub fn set_loader(&mut self, loader: impl StaticLoader + 'static) {
        self.loader = Some(Box::new(loader));
    }

    pub fn set_auto_static_distribution(&mut self, enabled: bool) {
        self.auto_static_distribution = enabled;
    }

    pub fn add_redirect(&mut self, from: impl Into<String>, to: impl Into<String>) {
        self.redirects.insert(from.into(), to.into());
    }

    pub fn set_not_found<F>(&mut self, handler: F)
    where
        F: FnMut(&Request, &mut Responder<'_>) -> Result<(), HandlerError> + Send + 'static,
    {
        self.not_found = Box::new(handler);
    }

    pub fn set_internal_error<F>(&mut self, handler: F)
    where
        F: FnMut(&Request, &mut Responder<'_>) -> Result<(), HandlerError> + Send + 'static,
    {
        self.internal_error = Box::new(handler);
    }

    pub fn body_sink(&mut self, request: &Request) -> Option<Box<dyn BodySink>> {
        self.service.body_sink(request)
    }

    pub fn dispatch(&mut self, request: &Request, conn: &mut Connection) {
        let mut responder = Responder::new(conn);

        if let Some(location) = self.redirects.get(request.path()) {
            debug!("Redirecting {} to {}", request.path(), location);
            if let Err(e) = responder.send(Response::redirect(location)) {
                error!("Failed to queue redirect for {}: {}", request, e);
            }
            return;
        }

        if self.auto_static_distribution && request.path().starts_with(STATIC_PREFIX) {
            if let Some(loader) = self.loader.as_mut() {
                let loaded = panic::catch_unwind(AssertUnwindSafe(|| loader.load(request.path())));
                match loaded {
                    Ok(Ok(response)) => {
                        if let Err(e) = responder.send(response) {
                            error!("Failed to queue static response for {}: {}", request, e);
                        }
                    }
                    Ok(Err(e)) if e.kind() == io::ErrorKind::NotFound => {
                        self.run_not_found(request, &mut responder);
                    }
                    Ok(Err(e)) => {
                        error!("Static loader failed on {}: {}", request, e);
                        self.run_internal_error(request, &mut responder);
                    }
                    Err(payload) => {
                        error!("Static loader failed on {}: {}", request, panic_message(payload));
                        self.run_internal_error(request, &mut responder);
                    }
                }
                return;
            }
        }

        let service = &mut self.service;
        let result = panic::catch_unwind(AssertUnwindSafe(|| service.call(request, &mut responder)));
        match result {
            Ok(Ok(())) => {
                if !responder.has_responded() {
                    debug!("{} left {} without a response", self.service.name(), request);
                }
            }
            Ok(Err(ServiceError::NotFound)) => self.run_not_found(request, &mut responder),
            Ok(Err(ServiceError::Internal(e))) => {
                error!("caught an unhandled error in {} on {}: {}", self.service.name(), request, e);
                self.run_internal_error(request, &mut responder);
            }
            Err(payload) => {
                error!(
                    "caught an unhandled error in {} on {}: {}",
                    self.service.name(),
                    request,
                    panic_message(payload)
                );
                self.run_internal_error(request, &mut responder);
            }
        }
    }

    fn run_not_found(&mut self, request: &Request, responder: &mut Responder<'_>) {
        run_error_handler("not-found", &mut self.not_found, request, responder);
    }

    fn run_internal_error(&mut self, request: &Request, responder: &mut Responder<'_>) {
        run_error_handler("internal-error", &mut self.internal_error, request, responder);
    }
}

fn run_error_handler(slot: &str, handler: &mut ErrorHandler, request: &Request, responder: &mut Responder<'_>) {
    let result = panic::catch_unwind(AssertUnwindSafe(|| handler(request, responder)));
    let failure = match result {
        Ok(Ok(())) => return,
        Ok(Err(e)) => e.to_string(),
        Err(payload) => panic_message(payload),
    };
    error!("caught an unhandled error in {} handler on {}: {}", slot, request, failure);
}
