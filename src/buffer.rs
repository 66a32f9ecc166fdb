//! Growable byte buffer with a read cursor.
//!
//! Each connection owns one of these for inbound and one for outbound data.
//! Buffers are only ever touched by the owning loop's thread, so there is no
//! synchronization here. The contiguous-slice-then-advance pattern lets the
//! write path hand `as_slice()` straight to the write syscall and account for
//! partial writes afterwards.

/// A growable byte buffer supporting append at the tail and consumption at
/// the head.
#[derive(Debug, Default)]
pub struct Buffer {
    data: Vec<u8>,
    read_pos: usize,
}

/// Consumed prefixes below this size are reclaimed lazily; above it, a
/// compaction shifts the unread tail to the front.
const COMPACT_MIN: usize = 4096;

impl Buffer {
    /// Create an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty buffer with pre-reserved capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Buffer {
            data: Vec::with_capacity(capacity),
            read_pos: 0,
        }
    }

    /// Number of unread bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len() - self.read_pos
    }

    /// True if there are no unread bytes.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.read_pos == self.data.len()
    }

    /// Append bytes at the tail.
    pub fn push(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Contiguous view of all unread bytes.
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data[self.read_pos..]
    }

    /// Mark `n` bytes as consumed.
    ///
    /// # Panics
    ///
    /// Panics if `n` exceeds the unread length.
    pub fn advance(&mut self, n: usize) {
        assert!(
            n <= self.len(),
            "advance({}) exceeds unread bytes ({})",
            n,
            self.len()
        );
        self.read_pos += n;

        if self.read_pos == self.data.len() {
            // Fully drained: reset in place, keeping the allocation.
            self.data.clear();
            self.read_pos = 0;
        } else if self.read_pos >= COMPACT_MIN && self.read_pos * 2 >= self.data.len() {
            self.data.drain(..self.read_pos);
            self.read_pos = 0;
        }
    }

    /// Discard all unread bytes, keeping the allocation.
    pub fn clear(&mut self) {
        self.data.clear();
        self.read_pos = 0;
    }
}
