//! Free list of datagram buffers.

use bytes::BytesMut;
use tracing::{debug, trace};

/// Recycles MTU-sized buffers for datagram assembly.
///
/// Owned by the heartbeat, so no locking is involved. Buffers are cleared on
/// return; a buffer that grew beyond the regular capacity or arrives while
/// the pool is full is discarded.
#[derive(Debug)]
pub struct BufferPool {
    buf_size: usize,
    max_pooled: usize,
    buffers: Vec<BytesMut>,
}

impl BufferPool {
    /// Create an empty pool of `buf_size`-byte buffers holding at most `max_pooled`.
    pub fn new(buf_size: usize, max_pooled: usize) -> Self {
        Self {
            buf_size,
            max_pooled,
            buffers: Vec::with_capacity(max_pooled),
        }
    }

    /// Take a cleared buffer, allocating when the pool is empty.
    pub fn acquire(&mut self) -> BytesMut {
        if let Some(buffer) = self.buffers.pop() {
            trace!("reusing pooled buffer");
            return buffer;
        }
        trace!("pool empty: allocating buffer");
        BytesMut::with_capacity(self.buf_size)
    }

    /// Hand a buffer back for reuse.
    pub fn release(&mut self, mut buffer: BytesMut) {
        if buffer.capacity() != self.buf_size {
            debug!(
                capacity = buffer.capacity(),
                expected = self.buf_size,
                "discarding buffer with irregular capacity"
            );
            return;
        }
        if self.buffers.len() >= self.max_pooled {
            trace!("pool is full: discarding returned buffer");
            return;
        }
        buffer.clear();
        self.buffers.push(buffer);
    }

    /// Buffers currently available.
    pub fn available(&self) -> usize {
        self.buffers.len()
    }
}
