//! Per-connection read and write buffers.

use tracing::trace;

use crate::error::BufferError;
use crate::protocol::Reply;

/// Growable input buffer holding unconsumed bytes from the socket.
///
/// Bytes in `consumed..filled` have been read but not yet split into lines.
#[derive(Debug)]
pub struct ReadBuffer {
    buf: Vec<u8>,
    consumed: usize,
    filled: usize,
    limit: usize,
}

impl ReadBuffer {
    pub fn new(initial: usize, limit: usize) -> Self {
        let initial = initial.max(1);
        Self {
            buf: vec![0; initial],
            consumed: 0,
            filled: 0,
            limit: limit.max(initial),
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn buffered(&self) -> usize {
        self.filled - self.consumed
    }

    pub fn has_line(&self) -> bool {
        self.buf[self.consumed..self.filled].contains(&b'\n')
    }

    /// Split off the next complete line, without its terminator. A trailing
    /// `\r` is dropped only when the line is longer than one byte.
    pub fn take_line(&mut self) -> Option<Vec<u8>> {
        let pending = &self.buf[self.consumed..self.filled];
        let newline = pending.iter().position(|&b| b == b'\n')?;

        let mut line = &pending[..newline];
        if line.len() > 1 && line.ends_with(b"\r") {
            line = &line[..line.len() - 1];
        }
        let line = line.to_vec();
        self.consumed += newline + 1;
        if self.consumed == self.filled {
            self.consumed = 0;
            self.filled = 0;
        }
        Some(line)
    }

    /// Free space to read into. Moves unconsumed bytes to the front and
    /// doubles the buffer when it is full.
    pub fn spare_mut(&mut self) -> Result<&mut [u8], BufferError> {
        self.compact();
        if self.filled == self.buf.len() {
            self.grow()?;
        }
        Ok(&mut self.buf[self.filled..])
    }

    /// Record `n` bytes written into the slice returned by `spare_mut`.
    pub fn advance(&mut self, n: usize) {
        self.filled = (self.filled + n).min(self.buf.len());
    }

    /// Drop everything buffered so far.
    pub fn discard(&mut self) {
        self.consumed = 0;
        self.filled = 0;
    }

    fn compact(&mut self) {
        if self.consumed == 0 {
            return;
        }
        self.buf.copy_within(self.consumed..self.filled, 0);
        self.filled -= self.consumed;
        self.consumed = 0;
    }

    fn grow(&mut self) -> Result<(), BufferError> {
        let current = self.buf.len();
        if current >= self.limit {
            return Err(BufferError::LimitExceeded { limit: self.limit });
        }
        let requested = current.saturating_mul(2).min(self.limit);
        self.buf
            .try_reserve_exact(requested - current)
            .map_err(|_| BufferError::AllocationFailed { requested })?;
        self.buf.resize(requested, 0);
        trace!(from = current, to = requested, "grew read buffer");
        Ok(())
    }
}

/// Outgoing reply bytes plus a flush cursor.
#[derive(Debug)]
pub struct WriteBuffer {
    buf: Vec<u8>,
    flushed: usize,
    capacity: usize,
}

impl WriteBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
            flushed: 0,
            capacity,
        }
    }

    /// Queue a reply followed by CRLF. A reply that does not fit in the
    /// remaining space is replaced by `LineTooLong`.
    pub fn push_reply(&mut self, reply: &Reply) {
        let mut text = reply.to_string();
        if self.buf.len() + text.len() + 2 > self.capacity {
            text = Reply::LineTooLong.to_string();
        }
        self.buf.extend_from_slice(text.as_bytes());
        self.buf.extend_from_slice(b"\r\n");
    }

    pub fn pending(&self) -> &[u8] {
        &self.buf[self.flushed..]
    }

    pub fn is_empty(&self) -> bool {
        self.flushed == self.buf.len()
    }

    /// Mark `n` bytes as written to the socket.
    pub fn consume(&mut self, n: usize) {
        self.flushed = (self.flushed + n).min(self.buf.len());
        if self.is_empty() {
            self.buf.clear();
            self.flushed = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;

    use super::*;

    fn fill(buffer: &mut ReadBuffer, bytes: &[u8]) -> Result<()> {
        let mut rest = bytes;
        while !rest.is_empty() {
            let spare = buffer.spare_mut()?;
            let n = spare.len().min(rest.len());
            spare[..n].copy_from_slice(&rest[..n]);
            buffer.advance(n);
            rest = &rest[n..];
        }
        Ok(())
    }

    #[test]
    fn lines_are_split_and_carriage_returns_trimmed() -> Result<()> {
        let mut buffer = ReadBuffer::new(64, 64);
        fill(&mut buffer, b"lock a r\r\nfind a\n\r\npart")?;

        assert_eq!(buffer.take_line().as_deref(), Some(&b"lock a r"[..]));
        assert_eq!(buffer.take_line().as_deref(), Some(&b"find a"[..]));
        // a lone carriage return is kept
        assert_eq!(buffer.take_line().as_deref(), Some(&b"\r"[..]));
        assert_eq!(buffer.take_line(), None);
        assert_eq!(buffer.buffered(), 4);

        fill(&mut buffer, b"ial\n")?;
        assert_eq!(buffer.take_line().as_deref(), Some(&b"partial"[..]));
        assert_eq!(buffer.buffered(), 0);
        Ok(())
    }

    #[test]
    fn invalid_utf8_is_passed_through_unchanged() -> Result<()> {
        let mut buffer = ReadBuffer::new(16, 16);
        fill(&mut buffer, b"lock \xff w\r\n")?;
        assert_eq!(buffer.take_line().as_deref(), Some(&b"lock \xff w"[..]));
        Ok(())
    }

    #[test]
    fn buffer_doubles_until_the_limit() -> Result<()> {
        let mut buffer = ReadBuffer::new(4, 16);
        fill(&mut buffer, b"0123456789")?;
        assert_eq!(buffer.capacity(), 16);

        fill(&mut buffer, b"abcdef")?;
        assert_eq!(
            buffer.spare_mut().err(),
            Some(BufferError::LimitExceeded { limit: 16 })
        );

        buffer.discard();
        assert_eq!(buffer.buffered(), 0);
        assert_eq!(buffer.spare_mut()?.len(), 16);
        Ok(())
    }

    #[test]
    fn compaction_reclaims_consumed_bytes() -> Result<()> {
        let mut buffer = ReadBuffer::new(8, 8);
        fill(&mut buffer, b"ab\ncdef")?;
        assert_eq!(buffer.take_line().as_deref(), Some(&b"ab"[..]));

        assert_eq!(buffer.spare_mut()?.len(), 4);
        fill(&mut buffer, b"\n")?;
        assert_eq!(buffer.take_line().as_deref(), Some(&b"cdef"[..]));
        Ok(())
    }

    #[test]
    fn replies_are_crlf_terminated_and_flushed_incrementally() {
        let mut buffer = WriteBuffer::new(64);
        buffer.push_reply(&Reply::LockSuccess);
        assert_eq!(buffer.pending(), b"+OK, lock success\r\n");

        buffer.consume(5);
        assert_eq!(buffer.pending(), b"lock success\r\n");
        buffer.consume(100);
        assert!(buffer.is_empty());
        assert!(buffer.pending().is_empty());
    }

    #[test]
    fn oversized_reply_is_replaced() {
        let mut buffer = WriteBuffer::new(20);
        buffer.push_reply(&Reply::Help);
        assert_eq!(buffer.pending(), b"-ERR, server output line too long\r\n");
    }
}
