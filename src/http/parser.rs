// src/http/parser.rs - Streaming HTTP/1.x request parser
//
// - Head parsed with httparse once the blank line has arrived
// - Body framed by Content-Length or chunked transfer coding
// - Chunk extensions ignored, trailers skipped
// - Stops right after message-complete; trailing bytes belong to the next request

use crate::error::ParseError;
use bytes::{Buf, BytesMut};
use log::trace;

pub const MAX_HEAD_SIZE: usize = 64 * 1024;
const MAX_HEADERS: usize = 64;
const MAX_LINE_SIZE: usize = 4096;

/// Request line and headers, as received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    pub target: String,
    /// Minor version: 0 for HTTP/1.0, 1 for HTTP/1.1
    pub version: u8,
    pub headers: Vec<(String, String)>,
}

impl RequestHead {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

pub trait ParserCallbacks {
    fn on_headers_complete(&mut self, head: RequestHead);
    fn on_body(&mut self, chunk: &[u8]);
    fn on_message_complete(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Head,
    Body { remaining: u64 },
    ChunkSize,
    ChunkData { remaining: u64 },
    ChunkDataEnd,
    Trailers,
    Done,
}

#[derive(Debug)]
pub struct MessageParser {
    state: State,
    buffer: BytesMut,
    method: Option<String>,
    version: Option<u8>,
    max_head_size: usize,
}

impl Default for MessageParser {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageParser {
    pub fn new() -> Self {
        Self::with_max_head_size(MAX_HEAD_SIZE)
    }

    pub fn with_max_head_size(max_head_size: usize) -> Self {
        Self {
            state: State::Head,
            buffer: BytesMut::new(),
            method: None,
            version: None,
            max_head_size,
        }
    }

    /// Request method, once the head is parsed.
    pub fn method(&self) -> Option<&str> {
        self.method.as_deref()
    }

    /// `(1, minor)`, once the head is parsed.
    pub fn version(&self) -> Option<(u8, u8)> {
        self.version.map(|minor| (1, minor))
    }

    pub fn is_headers_complete(&self) -> bool {
        self.state != State::Head
    }

    pub fn is_message_complete(&self) -> bool {
        self.state == State::Done
    }

    /// Feed received bytes.
    ///
    /// Returns how many bytes of `data` belong to the current message. When
    /// the message completes before the end of `data`, the rest is left
    /// unconsumed. Incomplete input is buffered internally.
    pub fn execute<C: ParserCallbacks>(&mut self, data: &[u8], callbacks: &mut C) -> Result<usize, ParseError> {
        if self.state == State::Done {
            return Ok(0);
        }

        self.buffer.extend_from_slice(data);
        let result = self.advance(callbacks);
        let leftover = if self.state == State::Done {
            self.buffer.split().len()
        } else {
            0
        };
        result?;
        Ok(data.len() - leftover)
    }

    fn advance<C: ParserCallbacks>(&mut self, callbacks: &mut C) -> Result<(), ParseError> {
        loop {
            match self.state {
                State::Head => {
                    if !self.parse_head(callbacks)? {
                        return Ok(());
                    }
                }
                State::Body { remaining } => {
                    if self.buffer.is_empty() {
                        return Ok(());
                    }
                    let remaining = self.body_bytes(remaining, callbacks);
                    if remaining == 0 {
                        self.complete(callbacks);
                        return Ok(());
                    }
                    self.state = State::Body { remaining };
                }
                State::ChunkSize => match httparse::parse_chunk_size(&self.buffer) {
                    Ok(httparse::Status::Complete((consumed, size))) => {
                        self.buffer.advance(consumed);
                        trace!("chunk of {} bytes", size);
                        self.state = if size == 0 {
                            State::Trailers
                        } else {
                            State::ChunkData { remaining: size }
                        };
                    }
                    Ok(httparse::Status::Partial) => {
                        if self.buffer.len() > MAX_LINE_SIZE {
                            return Err(ParseError::Chunk);
                        }
                        return Ok(());
                    }
                    Err(_) => return Err(ParseError::Chunk),
                },
                State::ChunkData { remaining } => {
                    if self.buffer.is_empty() {
                        return Ok(());
                    }
                    let remaining = self.body_bytes(remaining, callbacks);
                    self.state = if remaining == 0 {
                        State::ChunkDataEnd
                    } else {
                        State::ChunkData { remaining }
                    };
                }
                State::ChunkDataEnd => {
                    if self.buffer.len() < 2 {
                        return Ok(());
                    }
                    if &self.buffer[..2] != b"\r\n" {
                        return Err(ParseError::Chunk);
                    }
                    self.buffer.advance(2);
                    self.state = State::ChunkSize;
                }
                State::Trailers => {
                    let Some(end) = find_crlf(&self.buffer) else {
                        if self.buffer.len() > MAX_LINE_SIZE {
                            return Err(ParseError::Chunk);
                        }
                        return Ok(());
                    };
                    self.buffer.advance(end + 2);
                    if end == 0 {
                        self.complete(callbacks);
                        return Ok(());
                    }
                }
                State::Done => return Ok(()),
            }
        }
    }

    /// Returns false when more input is needed.
    fn parse_head<C: ParserCallbacks>(&mut self, callbacks: &mut C) -> Result<bool, ParseError> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut headers);

        let consumed = match req.parse(&self.buffer)? {
            httparse::Status::Complete(n) => n,
            httparse::Status::Partial => {
                if self.buffer.len() > self.max_head_size {
                    return Err(ParseError::HeadTooLarge(self.max_head_size));
                }
                return Ok(false);
            }
        };

        let head = RequestHead {
            method: req.method.unwrap_or_default().to_string(),
            target: req.path.unwrap_or_default().to_string(),
            version: req.version.unwrap_or(1),
            headers: req
                .headers
                .iter()
                .map(|h| (h.name.to_string(), String::from_utf8_lossy(h.value).into_owned()))
                .collect(),
        };
        self.buffer.advance(consumed);

        let chunked = head
            .header("transfer-encoding")
            .map(|te| te.split(',').any(|t| t.trim().eq_ignore_ascii_case("chunked")))
            .unwrap_or(false);
        let body = if chunked {
            State::ChunkSize
        } else {
            match head.header("content-length") {
                Some(len) => {
                    let len = len.trim().parse::<u64>().map_err(|_| ParseError::ContentLength)?;
                    State::Body { remaining: len }
                }
                None => State::Body { remaining: 0 },
            }
        };

        self.method = Some(head.method.clone());
        self.version = Some(head.version);
        self.state = body;
        callbacks.on_headers_complete(head);

        if self.state == (State::Body { remaining: 0 }) {
            self.complete(callbacks);
        }
        Ok(true)
    }

    /// Hand up to `remaining` buffered bytes to `on_body`.
    fn body_bytes<C: ParserCallbacks>(&mut self, remaining: u64, callbacks: &mut C) -> u64 {
        let take = remaining.min(self.buffer.len() as u64) as usize;
        let chunk = self.buffer.split_to(take);
        callbacks.on_body(&chunk);
        remaining - take as u64
    }

    fn complete<C: ParserCallbacks>(&mut self, callbacks: &mut C) {
        self.state = State::Done;
        callbacks.on_message_complete();
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}
