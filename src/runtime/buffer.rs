//! Fixed-capacity connection buffers.
//!
//! Every connection owns exactly one read buffer and one write buffer, both
//! of a fixed size. Buffers are handed out by a `BufferPool` and returned to
//! it when the connection is torn down, so a busy relay does not allocate on
//! every accept.
//!
//! ## Framing
//!
//! `ReadBuffer` accumulates raw bytes and splits off complete `\n`-terminated
//! lines, stripping an optional `\r` before the terminator. Whatever follows
//! the last terminator is moved to the front of the buffer and kept until the
//! rest of the line arrives. `WriteBuffer` is an append-only queue of
//! outgoing lines, drained from the front.

use std::io::{self, Read};

/// Pool of equally sized buffers.
///
/// Buffers are allocated lazily up to `limit` and recycled through a free
/// list (LIFO for cache locality).
pub struct BufferPool {
    /// Buffers ready to be handed out again.
    free_list: Vec<Box<[u8]>>,
    /// Size of each buffer.
    buffer_size: usize,
    /// Maximum number of buffers handed out at once.
    limit: usize,
    /// Buffers currently handed out.
    outstanding: usize,
}

impl BufferPool {
    /// Create a new buffer pool.
    ///
    /// # Arguments
    /// * `prealloc` - Number of buffers to allocate up front (capped at `limit`)
    /// * `limit` - Maximum number of buffers in use at the same time
    /// * `size` - Size of each buffer in bytes
    pub fn new(prealloc: usize, limit: usize, size: usize) -> Self {
        let free_list = (0..prealloc.min(limit))
            .map(|_| vec![0u8; size].into_boxed_slice())
            .collect();

        Self {
            free_list,
            buffer_size: size,
            limit,
            outstanding: 0,
        }
    }

    /// Take a zeroed buffer from the pool.
    ///
    /// Returns `None` if `limit` buffers are already in use.
    pub fn alloc(&mut self) -> Option<Box<[u8]>> {
        if self.outstanding >= self.limit {
            return None;
        }
        let buf = match self.free_list.pop() {
            Some(mut buf) => {
                buf.fill(0);
                buf
            }
            None => vec![0u8; self.buffer_size].into_boxed_slice(),
        };
        self.outstanding += 1;
        Some(buf)
    }

    /// Return a buffer to the pool.
    pub fn free(&mut self, buf: Box<[u8]>) {
        debug_assert_eq!(buf.len(), self.buffer_size, "foreign buffer returned to pool");
        debug_assert!(self.outstanding > 0, "more buffers freed than allocated");
        self.outstanding -= 1;
        self.free_list.push(buf);
    }

    /// Get the size of each buffer.
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Maximum number of buffers in use at once.
    pub fn capacity(&self) -> usize {
        self.limit
    }

    /// Number of buffers that can still be handed out.
    pub fn available(&self) -> usize {
        self.limit - self.outstanding
    }
}

/// Inbound bytes awaiting line extraction.
#[derive(Debug, Default)]
pub struct ReadBuffer {
    buf: Box<[u8]>,
    /// Length of the valid prefix.
    used: usize,
    /// Prefix already known to contain no terminator.
    scanned: usize,
}

impl ReadBuffer {
    pub fn new(buf: Box<[u8]>) -> Self {
        Self {
            buf,
            used: 0,
            scanned: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn used(&self) -> usize {
        self.used
    }

    /// True once the buffer holds `capacity` bytes without a terminator.
    pub fn is_full(&self) -> bool {
        self.used == self.buf.len()
    }

    /// Bytes received but not yet consumed as a line.
    pub fn pending(&self) -> &[u8] {
        &self.buf[..self.used]
    }

    /// Perform a single read into the unused tail of the buffer.
    ///
    /// Must not be called on a full buffer: a zero-length read would be
    /// indistinguishable from end of stream.
    pub fn fill_from<R: Read>(&mut self, src: &mut R) -> io::Result<usize> {
        debug_assert!(!self.is_full(), "read into a full buffer");
        let n = src.read(&mut self.buf[self.used..])?;
        self.used += n;
        Ok(n)
    }

    /// Hand every complete line to `on_line`, in order, then compact.
    ///
    /// Lines are passed without their `\n` (and without a `\r` directly in
    /// front of it). Returns the number of lines extracted.
    pub fn drain_lines(&mut self, mut on_line: impl FnMut(&[u8])) -> usize {
        let mut start = 0;
        let mut pos = self.scanned;
        let mut lines = 0;

        while let Some(offset) = self.buf[pos..self.used].iter().position(|&b| b == b'\n') {
            let end = pos + offset;
            let mut line = &self.buf[start..end];
            if let [head @ .., b'\r'] = line {
                line = head;
            }
            on_line(line);
            lines += 1;
            start = end + 1;
            pos = start;
        }

        if start > 0 {
            self.buf.copy_within(start..self.used, 0);
            self.used -= start;
        }
        self.scanned = self.used;
        lines
    }

    /// Release the underlying storage.
    pub fn into_inner(self) -> Box<[u8]> {
        self.buf
    }
}

/// A line did not fit into a peer's write buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Overflow {
    /// Bytes the line needs, delimiter included.
    pub needed: usize,
    /// Bytes left in the buffer.
    pub available: usize,
}

/// Outbound bytes queued for a connection.
#[derive(Debug, Default)]
pub struct WriteBuffer {
    buf: Box<[u8]>,
    /// Length of the pending prefix.
    used: usize,
}

impl WriteBuffer {
    pub fn new(buf: Box<[u8]>) -> Self {
        Self { buf, used: 0 }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    /// Bytes waiting to be written, oldest first.
    pub fn pending(&self) -> &[u8] {
        &self.buf[..self.used]
    }

    /// Queue `line` followed by a single `\n`.
    ///
    /// Either the whole line and its delimiter are queued, or nothing is.
    pub fn push_line(&mut self, line: &[u8]) -> Result<(), Overflow> {
        let needed = line.len() + 1;
        let available = self.buf.len() - self.used;
        if needed > available {
            return Err(Overflow { needed, available });
        }

        let end = self.used + line.len();
        self.buf[self.used..end].copy_from_slice(line);
        self.buf[end] = b'\n';
        self.used += needed;
        Ok(())
    }

    /// Drop the first `n` pending bytes after they were written out.
    pub fn consume(&mut self, n: usize) {
        debug_assert!(n <= self.used, "consumed more than pending");
        self.buf.copy_within(n..self.used, 0);
        self.used -= n;
    }

    /// Release the underlying storage.
    pub fn into_inner(self) -> Box<[u8]> {
        self.buf
    }
}
