//! Per-client inbound and outbound buffering.
//!
//! ## Line Framer
//!
//! `LineFramer` accumulates raw bytes from a client until a newline shows up.
//! The bytes held between calls are always the unterminated tail of a line:
//! complete lines are split off as soon as they are seen. Capacity grows on
//! demand (`BytesMut` doubles), so a single line may be arbitrarily long
//! unless a limit is configured.
//!
//! ## Outbound Queue
//!
//! `OutboundQueue` holds fully formatted messages waiting for the socket to
//! accept them. Entries are shared `Bytes` and are never modified once
//! queued. A short write leaves the head in place and records how much of it
//! already went out, so the next attempt resumes from that offset.

use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;
use std::io::{self, Write};

const INITIAL_LINE_CAPACITY: usize = 256;

/// Error returned when an inbound line exceeds the configured limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("line exceeds {limit} bytes")]
pub struct LineTooLong {
    pub limit: usize,
}

/// Lines produced by one `LineFramer::feed` call.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Framed {
    /// Complete lines, oldest first.
    pub lines: Vec<Bytes>,
    /// Set when the line after `lines` exceeded the limit.
    pub overflow: Option<LineTooLong>,
}

impl Framed {
    fn overflowed(lines: Vec<Bytes>, e: LineTooLong) -> Self {
        Self {
            lines,
            overflow: Some(e),
        }
    }
}

/// Incremental newline framer for one client.
#[derive(Debug)]
pub struct LineFramer {
    buf: BytesMut,
    /// Longest line accepted (0 = unbounded).
    max_line_len: usize,
}

impl LineFramer {
    /// Create a framer. `max_line_len` of 0 disables the limit.
    pub fn new(max_line_len: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(INITIAL_LINE_CAPACITY),
            max_line_len,
        }
    }

    /// Append `bytes` and return every line completed by them, in order.
    ///
    /// Returned lines exclude the terminating newline. Only the newly
    /// appended region is scanned: the retained tail never holds a newline.
    ///
    /// If a line runs past the limit, framing stops there. Lines completed
    /// before it are still returned and `overflow` is set.
    pub fn feed(&mut self, bytes: &[u8]) -> Framed {
        let mut scan_from = self.buf.len();
        self.buf.extend_from_slice(bytes);

        let mut lines = Vec::new();
        while let Some(pos) = self.buf[scan_from..].iter().position(|&b| b == b'\n') {
            if let Err(e) = self.check_len(scan_from + pos) {
                return Framed::overflowed(lines, e);
            }
            let mut line = self.buf.split_to(scan_from + pos + 1);
            line.truncate(line.len() - 1);
            lines.push(line.freeze());
            scan_from = 0;
        }

        match self.check_len(self.buf.len()) {
            Ok(()) => Framed {
                lines,
                overflow: None,
            },
            Err(e) => Framed::overflowed(lines, e),
        }
    }

    /// Bytes of the current partial line.
    pub fn pending(&self) -> &[u8] {
        &self.buf
    }

    fn check_len(&self, len: usize) -> Result<(), LineTooLong> {
        if self.max_line_len != 0 && len > self.max_line_len {
            return Err(LineTooLong {
                limit: self.max_line_len,
            });
        }
        Ok(())
    }
}

/// Outcome of a single transmission attempt on the queue head.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// The head was completely written and removed.
    Sent,
    /// Some bytes of the head were written; the rest stays queued.
    Partial,
    /// The socket cannot take more data right now; nothing was written.
    Blocked,
    /// Nothing is queued.
    Idle,
}

/// Result of draining a queue as far as the socket allows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushStatus {
    /// Every queued message went out.
    Drained,
    /// The socket stopped accepting data with messages still queued.
    Blocked,
}

/// FIFO of formatted messages awaiting transmission to one client.
#[derive(Debug, Default)]
pub struct OutboundQueue {
    pending: VecDeque<Bytes>,
    /// Bytes of the head already written.
    written: usize,
}

impl OutboundQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a message to the tail.
    pub fn enqueue(&mut self, message: Bytes) {
        if !message.is_empty() {
            self.pending.push_back(message);
        }
    }

    /// Number of queued messages, including a partially written head.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Total bytes still to be written.
    pub fn pending_bytes(&self) -> usize {
        self.pending.iter().map(Bytes::len).sum::<usize>() - self.written
    }

    /// Make one write of the unsent part of the head.
    ///
    /// Errors other than would-block are returned to the caller, which owns
    /// the decision to tear the connection down.
    pub fn try_send_head<W: Write>(&mut self, writer: &mut W) -> io::Result<SendOutcome> {
        let Some(head) = self.pending.front() else {
            return Ok(SendOutcome::Idle);
        };

        loop {
            match writer.write(&head[self.written..]) {
                Ok(0) => {
                    return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0"));
                }
                Ok(n) => {
                    self.written += n;
                    if self.written < head.len() {
                        return Ok(SendOutcome::Partial);
                    }
                    self.pending.pop_front();
                    self.written = 0;
                    return Ok(SendOutcome::Sent);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(SendOutcome::Blocked);
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Send queued messages until the queue is empty or the writer blocks.
    pub fn flush<W: Write>(&mut self, writer: &mut W) -> io::Result<FlushStatus> {
        loop {
            match self.try_send_head(writer)? {
                SendOutcome::Sent | SendOutcome::Partial => continue,
                SendOutcome::Blocked => return Ok(FlushStatus::Blocked),
                SendOutcome::Idle => return Ok(FlushStatus::Drained),
            }
        }
    }
}
