//! Line oriented framing of the inbound byte stream.
//!
//! Bytes read off the socket are appended to an internal buffer and drained
//! as complete CRLF terminated lines, one at a time. Draining line by line is
//! what makes pipelining work: a DATA command in the middle of a read buffer
//! flips the session into body mode before the following lines are consumed.
//!
//! A trailing partial line stays buffered. The framer never judges it; the
//! connection driver decides what it means: carried over to the next read in
//! body mode (a body line may be longer than one read, bounded only by the
//! message size cap), a framing violation in command mode.

use bytes::{Bytes, BytesMut};
use std::fmt;

/// Read buffer size and therefore the longest acceptable command line.
pub const MAX_LINE_LENGTH: usize = 8 * 1024;

/// How command mode input can break the framing rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramingError {
    /// Command mode input did not end with CRLF.
    MissingCrlf,
    /// A command line filled the whole read buffer without a CRLF.
    LineTooLong,
}

impl fmt::Display for FramingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FramingError::MissingCrlf => write!(f, "input does not end in crlf"),
            FramingError::LineTooLong => write!(f, "line exceeds {} bytes", MAX_LINE_LENGTH),
        }
    }
}

impl std::error::Error for FramingError {}

#[derive(Debug, Default)]
pub struct LineFramer {
    buffer: BytesMut,
}

impl LineFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one read worth of bytes.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Drain the next complete line, CRLF stripped.
    pub fn next_line(&mut self) -> Option<Bytes> {
        let at = find_crlf(&self.buffer)?;
        let mut line = self.buffer.split_to(at + 2);
        line.truncate(at);
        Some(line.freeze())
    }

    /// Bytes held back waiting for their CRLF.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Drop everything buffered. Used across the STARTTLS handshake so no
    /// plaintext bytes leak into the encrypted session, and when an
    /// unterminated body line already blew the message size cap.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

fn find_crlf(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|pair| pair == b"\r\n")
}
