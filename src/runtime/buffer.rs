//! Per-session growable byte buffer.
//!
//! Each session owns exactly one `GrowableBuffer` and reuses it for every
//! phase of every frame cycle: the 4-byte header, the request body and the
//! encoded response all live in the same region. Capacity only ever doubles,
//! so a connection with recurring payload sizes stops allocating after its
//! first few requests.
//!
//! The buffer keeps a cursor pair in the style of a NIO byte buffer:
//!
//! ```text
//! 0 ........ position ........ limit ........ capacity
//! |  filled  |    remaining    |     spare     |
//! ```

/// Default starting capacity for new sessions.
pub const DEFAULT_INITIAL_CAPACITY: usize = 1024;

/// A reusable byte region that grows by capacity doubling.
#[derive(Debug)]
pub struct GrowableBuffer {
    /// Backing storage; `data.len()` is the capacity.
    data: Vec<u8>,
    /// Next byte to read into or write from.
    position: usize,
    /// End of the active region.
    limit: usize,
    /// Number of reallocations performed.
    resizes: usize,
}

impl GrowableBuffer {
    /// Create a buffer with `initial` bytes of capacity (at least 1).
    pub fn new(initial: usize) -> Self {
        let initial = initial.max(1);
        Self {
            data: vec![0u8; initial],
            position: 0,
            limit: initial,
            resizes: 0,
        }
    }

    /// Prepare the buffer for a new region of `required` bytes.
    ///
    /// Cursors are reset and the limit is left unset (equal to capacity).
    /// When capacity is insufficient it is doubled until it covers
    /// `required` and fresh storage is allocated; old contents are dropped.
    pub fn ensure_capacity(&mut self, required: usize) {
        let capacity = self.data.len();
        if required > capacity {
            let mut grown = capacity;
            while grown < required {
                grown = grown.saturating_mul(2);
            }
            self.data = vec![0u8; grown];
            self.resizes += 1;
        }
        self.position = 0;
        self.limit = self.data.len();
    }

    /// Reset cursors and bound the active region to `len` bytes, growing if needed.
    pub fn prepare(&mut self, len: usize) {
        self.ensure_capacity(len);
        self.limit = len;
    }

    /// Total bytes of storage.
    #[cfg(test)]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn position(&self) -> usize {
        self.position
    }

    #[cfg(test)]
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Bytes between the cursor and the limit.
    pub fn remaining(&self) -> usize {
        self.limit - self.position
    }

    /// Whether the cursor has reached the limit.
    pub fn is_full(&self) -> bool {
        self.position == self.limit
    }

    /// Number of reallocations since creation.
    #[cfg(test)]
    pub fn resizes(&self) -> usize {
        self.resizes
    }

    /// Bytes already consumed, `[0, position)`.
    pub fn filled(&self) -> &[u8] {
        &self.data[..self.position]
    }

    /// The active region still to be read into or written from.
    pub fn remaining_slice(&self) -> &[u8] {
        &self.data[self.position..self.limit]
    }

    /// Mutable view of the active region.
    pub fn remaining_slice_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.position..self.limit]
    }

    /// Move the cursor forward after `n` bytes were transferred.
    ///
    /// # Panics
    /// Panics if `n` exceeds [`remaining`](Self::remaining).
    pub fn advance(&mut self, n: usize) {
        assert!(n <= self.remaining(), "advance past limit");
        self.position += n;
    }
}
