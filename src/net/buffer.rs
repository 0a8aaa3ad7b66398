//! Free list of I/O buffers shared by connections.

use bytes::BytesMut;
use crossbeam_queue::ArrayQueue;

/// Recycles `BytesMut` buffers so idle keep-alive connections hold none.
///
/// Buffers that grew past `16 × capacity` (large bodies) are dropped instead
/// of retained.
#[derive(Debug)]
pub struct BufferPool {
    free: ArrayQueue<BytesMut>,
    capacity: usize,
}

impl BufferPool {
    pub fn new(capacity: usize, max_retained: usize) -> Self {
        Self {
            free: ArrayQueue::new(max_retained.max(1)),
            capacity,
        }
    }

    /// Takes a cleared buffer, allocating when the free list is empty.
    pub fn acquire(&self) -> BytesMut {
        self.free
            .pop()
            .unwrap_or_else(|| BytesMut::with_capacity(self.capacity))
    }

    pub fn release(&self, mut buf: BytesMut) {
        if buf.capacity() > self.capacity.saturating_mul(16) {
            return;
        }
        buf.clear();
        let _ = self.free.push(buf);
    }

    pub fn buffer_capacity(&self) -> usize {
        self.capacity
    }

    pub fn retained(&self) -> usize {
        self.free.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn released_buffers_are_reused_cleared() {
        let pool = BufferPool::new(128, 2);
        let mut buf = pool.acquire();
        buf.extend_from_slice(b"leftover");
        pool.release(buf);
        assert_eq!(pool.retained(), 1);
        let again = pool.acquire();
        assert!(again.is_empty());
        assert!(again.capacity() >= 128);
    }

    #[test]
    fn oversized_and_surplus_buffers_are_dropped() {
        let pool = BufferPool::new(16, 1);
        pool.release(BytesMut::with_capacity(1024));
        assert_eq!(pool.retained(), 0);
        pool.release(BytesMut::with_capacity(16));
        pool.release(BytesMut::with_capacity(16));
        assert_eq!(pool.retained(), 1);
    }
}
