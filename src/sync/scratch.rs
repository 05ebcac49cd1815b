//! Reusable scratch byte buffers.

/// A growable byte region reused across decode, reconstruct and last-state
/// operations so the hot path does not allocate at steady state.
///
/// `ensure(n)` grows the backing storage amortized and sets the logical
/// size; `reset` drops the logical size while keeping capacity; `free`
/// releases the backing memory.
#[derive(Debug, Default, Clone)]
pub(crate) struct ScratchBuffer {
    data: Vec<u8>,
}

impl ScratchBuffer {
    pub(crate) fn new() -> Self {
        Self { data: Vec::new() }
    }

    /// Grows the buffer to at least `size` bytes and sets the logical size.
    /// A non-positive size is equivalent to `reset`. Contents beyond what
    /// the caller writes are zero.
    pub(crate) fn ensure(&mut self, size: usize) {
        if size == 0 {
            self.data.clear();
            return;
        }
        if self.data.len() < size {
            self.data.resize(size, 0);
        } else {
            self.data.truncate(size);
        }
    }

    /// Sets the logical size to zero, keeping capacity for reuse.
    pub(crate) fn reset(&mut self) {
        self.data.clear();
    }

    /// Releases the backing memory.
    pub(crate) fn free(&mut self) {
        self.data = Vec::new();
    }

    pub(crate) fn len(&self) -> usize {
        self.data.len()
    }

    pub(crate) fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub(crate) fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }
}
