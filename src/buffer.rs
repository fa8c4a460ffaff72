//! Per-session reusable record buffer.

/// A growable scratch buffer that never shrinks.
///
/// Starts empty; only grows when a record does not fit the caller's
/// default buffer.
#[derive(Debug, Default)]
pub struct ScratchBuffer {
    buf: Vec<u8>,
}

impl ScratchBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remembered capacity. Zero until the first growth.
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn is_allocated(&self) -> bool {
        !self.buf.is_empty()
    }

    /// Return a buffer of at least `n` bytes, reallocating to exactly `n`
    /// when the current one is smaller.
    pub fn ensure_capacity(&mut self, n: usize) -> &mut [u8] {
        if self.buf.len() < n {
            self.buf.reserve_exact(n - self.buf.len());
            self.buf.resize(n, 0);
        }
        &mut self.buf
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}
