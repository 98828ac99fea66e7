//! Pooled fixed-size buffers for response content
//!
//! A [`BufferPool`] hands out [`PooledBuffer`]s of `buffer_size` bytes. Each
//! buffer goes back to the pool when it is dropped, so content is released
//! exactly once no matter which path (success, interceptor error, client
//! disconnect) drops it. [`BufferedContent`] is the growable sequence of
//! buffers holding one exchange's body, bounded by `max_content_size`.

use crate::config::BufferConfig;
use crate::conduit::ConduitError;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Upper bound of idle buffers kept for reuse.
const MAX_IDLE_BUFFERS: usize = 1024;

pub struct BufferPool {
    buffer_size: usize,
    max_content_size: usize,
    idle: Mutex<Vec<BytesMut>>,
    outstanding: AtomicUsize,
}

impl BufferPool {
    pub fn new(buffer_size: usize, max_content_size: usize) -> Arc<Self> {
        Arc::new(Self {
            buffer_size: buffer_size.max(1),
            max_content_size,
            idle: Mutex::new(Vec::new()),
            outstanding: AtomicUsize::new(0),
        })
    }

    pub fn from_config(config: &BufferConfig) -> Arc<Self> {
        Self::new(config.buffer_size, config.max_content_size)
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn max_content_size(&self) -> usize {
        self.max_content_size
    }

    /// Number of buffers one exchange may hold.
    pub fn max_buffers(&self) -> usize {
        1 + self.max_content_size / self.buffer_size
    }

    pub fn acquire(self: &Arc<Self>) -> PooledBuffer {
        let buf = self
            .idle
            .lock()
            .pop()
            .unwrap_or_else(|| BytesMut::with_capacity(self.buffer_size));
        self.outstanding.fetch_add(1, Ordering::AcqRel);

        PooledBuffer {
            buf: Some(buf),
            pool: Arc::clone(self),
        }
    }

    /// Buffers currently handed out and not yet returned.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    pub fn idle(&self) -> usize {
        self.idle.lock().len()
    }

    fn release(&self, mut buf: BytesMut) {
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
        buf.clear();

        let mut idle = self.idle.lock();
        if idle.len() < MAX_IDLE_BUFFERS && buf.capacity() >= self.buffer_size {
            idle.push(buf);
        }
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("buffer_size", &self.buffer_size)
            .field("max_content_size", &self.max_content_size)
            .field("outstanding", &self.outstanding())
            .finish()
    }
}

/// A buffer on loan from a [`BufferPool`].
pub struct PooledBuffer {
    buf: Option<BytesMut>,
    pool: Arc<BufferPool>,
}

impl PooledBuffer {
    /// Bytes that still fit in this buffer.
    pub fn remaining(&self) -> usize {
        self.pool.buffer_size - self.len()
    }

    pub fn len(&self) -> usize {
        self.buf.as_ref().map_or(0, |b| b.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy as much of `data` as fits; returns the number of bytes taken.
    pub fn put(&mut self, data: &[u8]) -> usize {
        let n = data.len().min(self.remaining());
        if let Some(buf) = self.buf.as_mut() {
            buf.extend_from_slice(&data[..n]);
        }
        n
    }

    pub fn as_slice(&self) -> &[u8] {
        self.buf.as_deref().unwrap_or(&[])
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.release(buf);
        }
    }
}

/// Body content held in pooled buffers.
pub struct BufferedContent {
    pool: Arc<BufferPool>,
    buffers: Vec<PooledBuffer>,
    len: usize,
}

/// A copy takes its own buffers from the same pool.
impl Clone for BufferedContent {
    fn clone(&self) -> Self {
        let buffers = self
            .buffers
            .iter()
            .map(|source| {
                let mut copy = self.pool.acquire();
                copy.put(source.as_slice());
                copy
            })
            .collect();
        Self {
            pool: self.pool.clone(),
            buffers,
            len: self.len,
        }
    }
}

impl BufferedContent {
    pub fn new(pool: Arc<BufferPool>) -> Self {
        Self {
            pool,
            buffers: Vec::new(),
            len: 0,
        }
    }

    /// Append bytes, filling the last buffer before taking new ones.
    pub fn append(&mut self, mut data: &[u8]) -> Result<(), ConduitError> {
        self.check_fits(self.len + data.len())?;

        self.len += data.len();
        while !data.is_empty() {
            if self.buffers.last().map_or(true, |b| b.remaining() == 0) {
                self.buffers.push(self.pool.acquire());
            }
            if let Some(last) = self.buffers.last_mut() {
                let n = last.put(data);
                data = &data[n..];
            }
        }

        Ok(())
    }

    /// Transfer `data` into the content, dropping what was there before.
    /// Content that does not fit leaves the current content untouched.
    pub fn replace(&mut self, data: &[u8]) -> Result<(), ConduitError> {
        self.check_fits(data.len())?;
        self.release();
        self.append(data)
    }

    fn check_fits(&self, total: usize) -> Result<(), ConduitError> {
        if total.div_ceil(self.pool.buffer_size) > self.pool.max_buffers() {
            return Err(ConduitError::ContentTooLarge {
                limit: self.pool.max_content_size,
            });
        }
        Ok(())
    }

    /// Return every buffer to the pool.
    pub fn release(&mut self) {
        self.buffers.clear();
        self.len = 0;
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    pub fn chunks(&self) -> impl Iterator<Item = &[u8]> {
        self.buffers
            .iter()
            .map(PooledBuffer::as_slice)
            .filter(|chunk| !chunk.is_empty())
    }

    pub fn to_bytes(&self) -> Bytes {
        if self.buffers.len() == 1 {
            return Bytes::copy_from_slice(self.buffers[0].as_slice());
        }

        let mut out = BytesMut::with_capacity(self.len);
        for chunk in self.chunks() {
            out.extend_from_slice(chunk);
        }
        out.freeze()
    }
}

impl std::fmt::Debug for BufferedContent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferedContent")
            .field("len", &self.len)
            .field("buffers", &self.buffers.len())
            .finish()
    }
}
