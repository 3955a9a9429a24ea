// src/server/write_queue.rs - Per-connection response queue
//
// - Ordered output buffers, head tracked with a write offset
// - One write attempt per RESPONSE readiness
// - Head popped only once every byte has been accepted by the transport
// - Queued bytes capped; an append that would reach the cap is refused

use crate::error::QueueFullError;
use bytes::Bytes;
use std::collections::VecDeque;
use std::io::{self, Write};

pub const DEFAULT_MAX_QUEUED_BYTES: usize = 4 * 1024 * 1024;

/// Queue entry
struct WriteEntry {
    data: Bytes,
    offset: usize,
}

impl WriteEntry {
    fn remaining(&self) -> &[u8] {
        &self.data[self.offset..]
    }

    fn advance(&mut self, n: usize) {
        self.offset += n;
    }

    fn is_complete(&self) -> bool {
        self.offset >= self.data.len()
    }
}

/// Result of a single write attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Head buffer fully sent and popped
    Complete { bytes_written: usize },
    /// Transport accepted only part of the head buffer
    Partial { bytes_written: usize },
    /// Transport not ready, nothing written
    WouldBlock,
    /// Queue was empty
    Idle,
}

pub struct ResponseQueue {
    queue: VecDeque<WriteEntry>,
    total_bytes: usize,
    max_bytes: usize,
}

impl ResponseQueue {
    pub fn new() -> Self {
        Self::with_limit(DEFAULT_MAX_QUEUED_BYTES)
    }

    pub fn with_limit(max_bytes: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(8),
            total_bytes: 0,
            max_bytes,
        }
    }

    /// Append a buffer to the tail.
    ///
    /// Empty buffers are accepted and dropped; they would otherwise sit at the
    /// head and keep the connection in write interest without progress.
    pub fn push(&mut self, data: Bytes) -> Result<(), QueueFullError> {
        if data.is_empty() {
            return Ok(());
        }
        if self.total_bytes.saturating_add(data.len()) >= self.max_bytes {
            return Err(QueueFullError {
                queued: self.total_bytes,
                limit: self.max_bytes,
            });
        }
        self.total_bytes += data.len();
        self.queue.push_back(WriteEntry { data, offset: 0 });
        Ok(())
    }

    /// Write the unsent part of the head buffer once.
    ///
    /// `Ok(0)` from the writer means the peer can no longer receive and is
    /// reported as `WriteZero`.
    pub fn write_once<W: Write>(&mut self, writer: &mut W) -> io::Result<WriteOutcome> {
        let Some(entry) = self.queue.front_mut() else {
            return Ok(WriteOutcome::Idle);
        };

        match writer.write(entry.remaining()) {
            Ok(0) => Err(io::Error::from(io::ErrorKind::WriteZero)),
            Ok(n) => {
                entry.advance(n);
                self.total_bytes = self.total_bytes.saturating_sub(n);
                if entry.is_complete() {
                    self.queue.pop_front();
                    Ok(WriteOutcome::Complete { bytes_written: n })
                } else {
                    Ok(WriteOutcome::Partial { bytes_written: n })
                }
            }
            Err(ref e)
                if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::Interrupted =>
            {
                Ok(WriteOutcome::WouldBlock)
            }
            Err(e) => Err(e),
        }
    }

    /// Drop every queued buffer, sent or not.
    pub fn clear(&mut self) {
        self.queue.clear();
        self.total_bytes = 0;
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Number of buffers awaiting transmission, the partially sent head included.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Bytes not yet accepted by the transport.
    pub fn pending_bytes(&self) -> usize {
        self.total_bytes
    }

    /// Unsent remainder of the head buffer.
    pub fn front_remaining(&self) -> Option<&[u8]> {
        self.queue.front().map(WriteEntry::remaining)
    }
}

impl Default for ResponseQueue {
    fn default() -> Self {
        Self::new()
    }
}
