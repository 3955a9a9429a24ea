// src/http/pipeline.rs - Per-connection request assembly
//
// A PendingRequest lives in its Connection from the first RECEIVE of a
// message until message-complete. The Request is materialised when the
// head completes; body bytes are buffered or handed to a sink.

use crate::error::ParseError;
use crate::http::parser::{MessageParser, ParserCallbacks, RequestHead};
use crate::http::request::Request;
use crate::server::ConnectionToken;
use bytes::BytesMut;
use std::net::SocketAddr;

/// Receives a streamed request body piece by piece.
pub trait BodySink: Send {
    fn on_chunk(&mut self, chunk: &[u8]);

    fn on_complete(&mut self) {}
}

/// Asked once per streamable request for a sink; `None` buffers the body.
pub type SinkFactory<'a> = dyn FnMut(&Request) -> Option<Box<dyn BodySink>> + 'a;

/// Result of feeding bytes into a pending request.
#[derive(Debug)]
pub enum Feed {
    /// More bytes are needed.
    Incomplete,
    /// Message finished after `consumed` bytes of the input.
    Complete { request: Request, consumed: usize },
}

struct Assembly {
    token: ConnectionToken,
    peer_addr: SocketAddr,
    request: Option<Request>,
    body: BytesMut,
    sink: Option<Box<dyn BodySink>>,
    complete: bool,
}

struct Callbacks<'a, 'b> {
    assembly: &'a mut Assembly,
    sinks: &'a mut SinkFactory<'b>,
}

impl ParserCallbacks for Callbacks<'_, '_> {
    fn on_headers_complete(&mut self, head: RequestHead) {
        let mut request = Request::from_head(head, self.assembly.token, self.assembly.peer_addr);
        if request.wants_stream() {
            if let Some(sink) = (self.sinks)(&request) {
                request.set_streamed();
                self.assembly.sink = Some(sink);
            }
        }
        self.assembly.request = Some(request);
    }

    fn on_body(&mut self, chunk: &[u8]) {
        match self.assembly.sink.as_mut() {
            Some(sink) => sink.on_chunk(chunk),
            None => self.assembly.body.extend_from_slice(chunk),
        }
    }

    fn on_message_complete(&mut self) {
        self.assembly.complete = true;
        if let Some(sink) = self.assembly.sink.as_mut() {
            sink.on_complete();
        }
    }
}

pub struct PendingRequest {
    parser: MessageParser,
    assembly: Assembly,
}

impl PendingRequest {
    pub fn new(token: ConnectionToken, peer_addr: SocketAddr) -> Self {
        Self {
            parser: MessageParser::new(),
            assembly: Assembly {
                token,
                peer_addr,
                request: None,
                body: BytesMut::new(),
                sink: None,
                complete: false,
            },
        }
    }

    /// Head parsed, request object available.
    pub fn request(&self) -> Option<&Request> {
        self.assembly.request.as_ref()
    }

    pub fn is_headers_complete(&self) -> bool {
        self.parser.is_headers_complete()
    }

    pub fn feed(&mut self, data: &[u8], sinks: &mut SinkFactory<'_>) -> Result<Feed, ParseError> {
        let mut callbacks = Callbacks {
            assembly: &mut self.assembly,
            sinks,
        };
        let consumed = self.parser.execute(data, &mut callbacks)?;

        if !self.assembly.complete {
            return Ok(Feed::Incomplete);
        }
        // on_headers_complete always precedes on_message_complete
        let Some(mut request) = self.assembly.request.take() else {
            return Err(ParseError::Head("message completed without a head".to_string()));
        };
        if !request.is_streamed() {
            request.set_body(self.assembly.body.split().freeze());
        }
        Ok(Feed::Complete { request, consumed })
    }
}
