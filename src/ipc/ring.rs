/*!
 * Bounded Ring Buffer
 * Fixed-capacity byte FIFO backing each direction of a pipe endpoint
 */

use thiserror::Error;

/// Ring buffer failures. A failed call never mutates the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RingError {
    #[error("Ring overflow: requested {requested} bytes, {free} free")]
    Overflow { requested: usize, free: usize },

    #[error("Ring underflow: requested {requested} bytes, {taken} buffered")]
    Underflow { requested: usize, taken: usize },
}

pub type RingResult<T> = Result<T, RingError>;

/// Fixed-capacity circular byte queue
///
/// `start` is the read cursor, `end` the write cursor. Both wrap modulo the
/// capacity and `taken() + free() == size()` holds after every call.
///
/// # Thread Safety
/// No internal locking. Each pipe endpoint guards its pair of rings with a
/// single mutex.
#[derive(Debug, Default)]
pub struct RingBuffer {
    storage: Box<[u8]>,
    start: usize,
    end: usize,
    free: usize,
}

impl RingBuffer {
    /// Create a ring with the given capacity. A zero capacity ring accepts nothing.
    pub fn new(capacity: usize) -> Self {
        let mut ring = Self::default();
        ring.set_size(capacity);
        ring
    }

    /// Allocate storage and reset both cursors. Discards any buffered bytes.
    pub fn set_size(&mut self, capacity: usize) {
        self.storage = vec![0u8; capacity].into_boxed_slice();
        self.start = 0;
        self.end = 0;
        self.free = capacity;
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.storage.len()
    }

    #[inline]
    pub fn free(&self) -> usize {
        self.free
    }

    #[inline]
    pub fn taken(&self) -> usize {
        self.size() - self.free
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.taken() == 0
    }

    /// Copy all of `data` in behind the write cursor, or nothing at all
    pub fn append(&mut self, data: &[u8]) -> RingResult<()> {
        let len = data.len();
        if len > self.free {
            return Err(RingError::Overflow {
                requested: len,
                free: self.free,
            });
        }
        if len == 0 {
            return Ok(());
        }

        let capacity = self.size();
        let first = len.min(capacity - self.end);
        let (head, tail) = data.split_at(first);
        self.storage[self.end..self.end + first].copy_from_slice(head);
        self.storage[..tail.len()].copy_from_slice(tail);

        self.end = (self.end + len) % capacity;
        self.free -= len;
        Ok(())
    }

    /// Copy the oldest `out.len()` bytes without consuming them
    pub fn peek_front(&self, out: &mut [u8]) -> RingResult<()> {
        let len = out.len();
        let taken = self.taken();
        if len > taken {
            return Err(RingError::Underflow {
                requested: len,
                taken,
            });
        }
        if len == 0 {
            return Ok(());
        }

        let first = len.min(self.size() - self.start);
        let (head, tail) = out.split_at_mut(first);
        head.copy_from_slice(&self.storage[self.start..self.start + first]);
        let tail_len = tail.len();
        tail.copy_from_slice(&self.storage[..tail_len]);
        Ok(())
    }

    /// Copy out and consume the oldest `out.len()` bytes
    pub fn pop_front(&mut self, out: &mut [u8]) -> RingResult<()> {
        self.peek_front(out)?;
        self.advance(out.len());
        Ok(())
    }

    /// Consume the oldest `count` bytes without copying them
    pub fn discard_front(&mut self, count: usize) -> RingResult<()> {
        let taken = self.taken();
        if count > taken {
            return Err(RingError::Underflow {
                requested: count,
                taken,
            });
        }
        self.advance(count);
        Ok(())
    }

    fn advance(&mut self, count: usize) {
        if count == 0 {
            return;
        }
        self.start = (self.start + count) % self.size();
        self.free += count;
    }
}
