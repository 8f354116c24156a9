//! Fixed-capacity byte region handed between the input thread and workers.

/// A chunk of raw newline-delimited input.
///
/// Holds `capacity` bytes with `[start, end)` cursors over the valid,
/// unconsumed part. The backing storage is allocated once and never grows.
pub struct RecordBuffer {
    bytes: Box<[u8]>,
    start: usize,
    end: usize,
}

impl RecordBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            bytes: vec![0; capacity].into_boxed_slice(),
            start: 0,
            end: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.bytes.len()
    }

    pub fn start(&self) -> usize {
        self.start
    }

    pub fn end(&self) -> usize {
        self.end
    }

    /// Valid bytes `[start, end)`.
    pub fn data(&self) -> &[u8] {
        &self.bytes[self.start..self.end]
    }

    /// Writable tail `[end, capacity)`; follow with [`advance_end`](Self::advance_end).
    pub fn spare_mut(&mut self) -> &mut [u8] {
        &mut self.bytes[self.end..]
    }

    pub fn advance_end(&mut self, n: usize) {
        self.end = (self.end + n).min(self.bytes.len());
    }

    /// Appends `data` if it fits entirely. Returns `false` otherwise.
    pub fn extend_from_slice(&mut self, data: &[u8]) -> bool {
        if data.len() > self.bytes.len() - self.end {
            return false;
        }
        self.bytes[self.end..self.end + data.len()].copy_from_slice(data);
        self.end += data.len();
        true
    }

    /// Marks `n` leading bytes as consumed.
    pub fn consume(&mut self, n: usize) {
        self.start = (self.start + n).min(self.end);
    }

    /// Keeps only the first `len` valid bytes.
    pub fn truncate(&mut self, len: usize) {
        self.end = self.start + len.min(self.end - self.start);
    }

    pub fn clear(&mut self) {
        self.start = 0;
        self.end = 0;
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn is_full(&self) -> bool {
        self.end == self.bytes.len()
    }
}

impl std::fmt::Debug for RecordBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordBuffer")
            .field("capacity", &self.bytes.len())
            .field("start", &self.start)
            .field("end", &self.end)
            .finish()
    }
}
