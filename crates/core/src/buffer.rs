//! Reusable byte buffers for socket I/O.

use std::sync::Arc;

use bytes::{Buf, Bytes, BytesMut};
use parking_lot::Mutex;

/// Default size of a pooled I/O buffer.
pub const DEFAULT_BUFFER_SIZE: usize = 8 * 1024;

/// A read cursor over a growable byte buffer.
///
/// Bytes in `[position, limit)` are unconsumed. The parser consumes bytes one
/// at a time or in bulk slices; [`ByteCursor::compact`] shifts the unconsumed
/// tail back to offset zero so the next socket read can append. The buffer
/// refuses to grow past `max_size`, which bounds the size of any single
/// logical token (request line, header field, chunk-size line).
#[derive(Debug)]
pub struct ByteCursor {
    buf: BytesMut,
    pos: usize,
    max_size: usize,
}

impl ByteCursor {
    /// Creates a cursor with the given initial capacity and growth bound.
    #[must_use]
    pub fn with_capacity(capacity: usize, max_size: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
            pos: 0,
            max_size: max_size.max(capacity),
        }
    }

    /// Current read offset.
    #[must_use]
    pub fn position(&self) -> usize {
        self.pos
    }

    /// One past the last readable byte.
    #[must_use]
    pub fn limit(&self) -> usize {
        self.buf.len()
    }

    /// Total writable capacity before compaction or growth.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.buf.capacity()
    }

    /// Number of unconsumed bytes.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Returns the next unconsumed byte without advancing.
    #[must_use]
    pub fn peek(&self) -> Option<u8> {
        self.buf.get(self.pos).copied()
    }

    /// Returns the next `n` unconsumed bytes without advancing, if present.
    #[must_use]
    pub fn peek_at(&self, n: usize) -> Option<&[u8]> {
        self.buf.get(self.pos..self.pos + n)
    }

    /// Advances past `n` unconsumed bytes.
    pub fn skip(&mut self, n: usize) {
        debug_assert!(n <= self.remaining());
        self.pos += n.min(self.remaining());
    }

    /// Consumes and returns the next byte.
    pub fn next_byte(&mut self) -> Option<u8> {
        let b = self.peek()?;
        self.pos += 1;
        Some(b)
    }

    /// Steps the cursor back one byte. Only valid after `next_byte`.
    pub fn rewind(&mut self) {
        debug_assert!(self.pos > 0);
        self.pos -= 1;
    }

    /// Splits off up to `n` unconsumed bytes as a zero-copy slice.
    pub fn take_bytes(&mut self, n: usize) -> Bytes {
        self.compact();
        let n = n.min(self.buf.len());
        self.buf.split_to(n).freeze()
    }

    /// Drops the consumed prefix, moving unconsumed bytes to offset zero.
    pub fn compact(&mut self) {
        if self.pos > 0 {
            self.buf.advance(self.pos);
            self.pos = 0;
        }
    }

    /// Makes room for another socket read.
    ///
    /// Returns `false` when the unconsumed region has already reached
    /// `max_size`, meaning a single token is larger than the server accepts.
    pub fn reserve(&mut self, additional: usize) -> bool {
        self.compact();
        if self.buf.len() >= self.max_size {
            return false;
        }
        let room = self.max_size - self.buf.len();
        self.buf.reserve(additional.min(room).max(1));
        true
    }

    /// The writable tail used with `AsyncReadExt::read_buf`.
    pub fn writable(&mut self) -> &mut BytesMut {
        &mut self.buf
    }
}

/// A fixed-size free list of reusable buffers.
///
/// Connections check a staging buffer out for the lifetime of a write and
/// return it when done; the pool caps how many detached buffers are retained.
#[derive(Debug)]
pub struct BufferPool {
    free: Mutex<Vec<BytesMut>>,
    buf_size: usize,
    max_pooled: usize,
}

impl BufferPool {
    /// Creates a pool handing out buffers of `buf_size` bytes.
    #[must_use]
    pub fn new(buf_size: usize, max_pooled: usize) -> Arc<Self> {
        Arc::new(Self {
            free: Mutex::new(Vec::new()),
            buf_size,
            max_pooled,
        })
    }

    /// Checks out a cleared buffer.
    #[must_use]
    pub fn get(&self) -> BytesMut {
        let mut free = self.free.lock();
        match free.pop() {
            Some(mut buf) => {
                buf.clear();
                buf
            }
            None => BytesMut::with_capacity(self.buf_size),
        }
    }

    /// Returns a buffer to the pool.
    pub fn put(&self, buf: BytesMut) {
        if buf.capacity() < self.buf_size {
            return;
        }
        let mut free = self.free.lock();
        if free.len() < self.max_pooled {
            free.push(buf);
        }
    }
}
