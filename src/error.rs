use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Error returned by user handlers.
///
/// Boxed so a handler can `?` any error type; the dispatch boundary logs it
/// and never lets it reach the event loop.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("server already started")]
    AlreadyRunning,

    #[error("server has been stopped and cannot be started again")]
    Stopped,

    #[error("failed to spawn event loop thread: {0}")]
    ThreadSpawn(std::io::Error),

    #[error(transparent)]
    QueueFull(#[from] QueueFullError),
}

/// Returned when appending a response would push a connection's queued
/// output to or past its limit.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("response queue full ({queued} bytes queued, limit {limit})")]
pub struct QueueFullError {
    pub queued: usize,
    pub limit: usize,
}

/// Handshake failures. Every variant closes the peer socket.
#[derive(Error, Debug)]
pub enum HandshakeError {
    #[error("unexpected magic bytes {0:02x?}")]
    BadMagic(Vec<u8>),

    #[error("unexpected acknowledgement byte {0:?}")]
    BadAck(Option<u8>),

    #[error("peer declined the connection")]
    Rejected,

    #[error("peer node name {0:?} does not match the required pattern")]
    NameMismatch(String),

    #[error("node name length {0} exceeds limit")]
    NameTooLong(u32),

    #[error("node name is not valid UTF-8")]
    InvalidName(#[from] std::string::FromUtf8Error),

    #[error("handshake timed out")]
    Timeout,

    #[error("broken pipe during handshake")]
    BrokenPipe,

    #[error("IO error during handshake: {0}")]
    Io(std::io::Error),
}

impl HandshakeError {
    /// Whether the failure was caused by the peer breaking the protocol
    /// rather than by the transport.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            HandshakeError::BadMagic(_)
                | HandshakeError::BadAck(_)
                | HandshakeError::Rejected
                | HandshakeError::NameMismatch(_)
                | HandshakeError::NameTooLong(_)
                | HandshakeError::InvalidName(_)
        )
    }
}

impl From<std::io::Error> for HandshakeError {
    fn from(e: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match e.kind() {
            // set_read_timeout surfaces as WouldBlock on unix, TimedOut elsewhere
            ErrorKind::WouldBlock | ErrorKind::TimedOut => HandshakeError::Timeout,
            ErrorKind::BrokenPipe | ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted => {
                HandshakeError::BrokenPipe
            }
            _ => HandshakeError::Io(e),
        }
    }
}

/// Malformed input from the streaming message parser.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("malformed request head: {0}")]
    Head(String),

    #[error("invalid Content-Length header")]
    ContentLength,

    #[error("invalid chunk framing")]
    Chunk,

    #[error("request head exceeds {0} bytes")]
    HeadTooLarge(usize),
}

impl From<httparse::Error> for ParseError {
    fn from(e: httparse::Error) -> Self {
        ParseError::Head(e.to_string())
    }
}

/// Outcome signalled by the routing collaborator and the static loader.
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("not found")]
    NotFound,

    #[error("internal error: {0}")]
    Internal(HandlerError),
}

impl From<QueueFullError> for ServiceError {
    fn from(e: QueueFullError) -> Self {
        ServiceError::Internal(Box::new(e))
    }
}

impl From<std::io::Error> for ServiceError {
    fn from(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::NotFound {
            ServiceError::NotFound
        } else {
            ServiceError::Internal(Box::new(e))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_io_error_maps_to_handshake_timeout() {
        let err: HandshakeError = io::Error::from(io::ErrorKind::WouldBlock).into();
        assert!(matches!(err, HandshakeError::Timeout));

        let err: HandshakeError = io::Error::from(io::ErrorKind::TimedOut).into();
        assert!(matches!(err, HandshakeError::Timeout));
    }

    #[test]
    fn test_io_error_maps_to_broken_pipe() {
        let err: HandshakeError = io::Error::from(io::ErrorKind::BrokenPipe).into();
        assert!(matches!(err, HandshakeError::BrokenPipe));
        assert!(!err.is_protocol_violation());
    }

    #[test]
    fn test_protocol_violation_classification() {
        assert!(HandshakeError::BadMagic(vec![0; 4]).is_protocol_violation());
        assert!(HandshakeError::BadAck(None).is_protocol_violation());
        assert!(!HandshakeError::Timeout.is_protocol_violation());
    }

    #[test]
    fn test_not_found_io_error_maps_to_service_not_found() {
        let err: ServiceError = io::Error::from(io::ErrorKind::NotFound).into();
        assert!(matches!(err, ServiceError::NotFound));

        let err: ServiceError = io::Error::from(io::ErrorKind::PermissionDenied).into();
        assert!(matches!(err, ServiceError::Internal(_)));
    }
}
