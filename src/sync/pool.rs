//! Reuse pool for raw snapshot buffers.

use smallvec::SmallVec;

use crate::SAVED_FRAME_SLOTS;

/// A small bounded pool of save buffers handed to the simulation's save
/// callback, avoiding allocator churn on the per-frame save path.
///
/// The size hint tracks the largest snapshot observed so far; it only
/// grows within a session, so acquired buffers always have room for the
/// next save without reallocating.
#[derive(Debug, Default)]
pub(crate) struct StateBufferPool {
    buffers: SmallVec<[Vec<u8>; SAVED_FRAME_SLOTS]>,
    size_hint: usize,
}

impl StateBufferPool {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Raises the size hint to at least `size`.
    pub(crate) fn note_size(&mut self, size: usize) {
        if size > self.size_hint {
            self.size_hint = size;
        }
    }

    pub(crate) fn size_hint(&self) -> usize {
        self.size_hint
    }

    /// Takes the smallest pooled buffer whose capacity covers the size
    /// hint, cleared and ready to be filled. Returns `None` when the hint
    /// is unset or nothing in the pool is large enough.
    pub(crate) fn acquire(&mut self) -> Option<Vec<u8>> {
        if self.size_hint == 0 || self.buffers.is_empty() {
            return None;
        }

        let mut best: Option<(usize, usize)> = None;
        for (index, buffer) in self.buffers.iter().enumerate() {
            let capacity = buffer.capacity();
            if capacity >= self.size_hint
                && best.map_or(true, |(_, best_cap)| capacity < best_cap)
            {
                best = Some((index, capacity));
            }
        }

        let (index, _) = best?;
        let mut buffer = self.buffers.swap_remove(index);
        buffer.clear();
        Some(buffer)
    }

    /// Returns a buffer to the pool. Dropped instead when it carries no
    /// capacity or the pool is already at the ring depth.
    pub(crate) fn recycle(&mut self, buffer: Vec<u8>) {
        if buffer.capacity() == 0 || self.buffers.len() >= SAVED_FRAME_SLOTS {
            return;
        }
        self.buffers.push(buffer);
    }

    /// Drops every pooled buffer and resets the size hint.
    pub(crate) fn clear(&mut self) {
        self.buffers.clear();
        self.size_hint = 0;
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.buffers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_without_hint_returns_none() {
        let mut pool = StateBufferPool::new();
        pool.recycle(Vec::with_capacity(64));
        assert!(pool.acquire().is_none());
    }

    #[test]
    fn test_acquire_prefers_smallest_fit() {
        let mut pool = StateBufferPool::new();
        pool.note_size(32);
        pool.recycle(Vec::with_capacity(128));
        pool.recycle(Vec::with_capacity(64));
        pool.recycle(Vec::with_capacity(16));

        let buffer = pool.acquire().expect("a buffer fits");
        assert!(buffer.capacity() >= 32);
        assert!(buffer.capacity() < 128);
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn test_acquired_buffer_is_cleared() {
        let mut pool = StateBufferPool::new();
        pool.note_size(4);
        let mut dirty = Vec::with_capacity(16);
        dirty.extend_from_slice(&[1, 2, 3]);
        pool.recycle(dirty);
        let buffer = pool.acquire().expect("a buffer fits");
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_recycle_respects_bound() {
        let mut pool = StateBufferPool::new();
        for _ in 0..SAVED_FRAME_SLOTS + 3 {
            pool.recycle(Vec::with_capacity(8));
        }
        assert_eq!(pool.len(), SAVED_FRAME_SLOTS);
    }

    #[test]
    fn test_recycle_drops_capacityless_buffers() {
        let mut pool = StateBufferPool::new();
        pool.recycle(Vec::new());
        assert_eq!(pool.len(), 0);
    }

    #[test]
    fn test_hint_is_monotonic() {
        let mut pool = StateBufferPool::new();
        pool.note_size(100);
        pool.note_size(50);
        assert_eq!(pool.size_hint(), 100);
    }

    #[test]
    fn test_clear_resets_hint() {
        let mut pool = StateBufferPool::new();
        pool.note_size(100);
        pool.recycle(Vec::with_capacity(128));
        pool.clear();
        assert_eq!(pool.size_hint(), 0);
        assert_eq!(pool.len(), 0);
    }
}
