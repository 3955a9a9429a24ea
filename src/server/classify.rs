use crate::server::poller::Event;
use std::fmt;
use std::io;

/// Semantic event delivered to handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Connect,
    Disconnect,
    Receive,
    Response,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventKind::Connect => "CONNECT",
            EventKind::Disconnect => "DISCONNECT",
            EventKind::Receive => "RECEIVE",
            EventKind::Response => "RESPONSE",
        };
        f.write_str(name)
    }
}

/// Classifier output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classified {
    Event(EventKind),
    /// Spurious wake or a readiness combination with no meaning here.
    Unclassified,
}

/// Map a readiness notification to a semantic event.
///
/// `peek` performs a non-destructive one byte read on the connection and is
/// only called when the readable bit is set.
pub fn classify<P>(event: &Event, listener_token: usize, peek: P) -> Classified
where
    P: FnOnce() -> io::Result<usize>,
{
    if event.token == listener_token {
        return Classified::Event(EventKind::Connect);
    }

    if event.is_readable() {
        return match peek() {
            Ok(0) => Classified::Event(EventKind::Disconnect),
            Ok(_) => Classified::Event(EventKind::Receive),
            Err(ref e)
                if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::Interrupted =>
            {
                Classified::Unclassified
            }
            // reset, abort, not connected...
            Err(_) => Classified::Event(EventKind::Disconnect),
        };
    }

    if event.is_writable() {
        return Classified::Event(EventKind::Response);
    }

    if event.is_hangup() {
        return Classified::Event(EventKind::Disconnect);
    }

    Classified::Unclassified
}
