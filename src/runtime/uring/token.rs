//! Operation tokens for correlating io_uring completions.
//!
//! Every submitted entry carries a token as its `user_data`. The token maps
//! back to the operation kind and the session slot it belongs to.

use slab::Slab;

/// Kind of an in-flight operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpType {
    /// Read on the dispatcher's eventfd.
    Wake,
    /// Receive into a session's buffer.
    Read {
        /// Session slot in the dispatcher.
        slot: usize,
    },
    /// Send from a session's buffer.
    Write {
        /// Session slot in the dispatcher.
        slot: usize,
    },
}

/// Slab-backed token allocator with O(1) lookup.
pub struct TokenAllocator {
    ops: Slab<OpType>,
}

impl TokenAllocator {
    pub fn new(capacity: usize) -> Self {
        Self {
            ops: Slab::with_capacity(capacity),
        }
    }

    /// Allocate a token (the `user_data` value) for an operation.
    pub fn alloc(&mut self, op: OpType) -> u64 {
        self.ops.insert(op) as u64
    }

    /// Release a token once its completion arrived.
    ///
    /// Returns `None` for unknown or already released tokens.
    pub fn free(&mut self, token: u64) -> Option<OpType> {
        self.ops.try_remove(token as usize)
    }

    /// Operations still in flight.
    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_allocator() {
        let mut tokens = TokenAllocator::new(16);

        let wake = tokens.alloc(OpType::Wake);
        let read = tokens.alloc(OpType::Read { slot: 1 });
        assert_eq!(tokens.len(), 2);

        assert_eq!(tokens.free(wake), Some(OpType::Wake));
        assert_eq!(tokens.free(wake), None);
        assert_eq!(tokens.len(), 1);

        // Slab reuses slots
        assert_eq!(tokens.alloc(OpType::Write { slot: 1 }), wake);

        assert_eq!(tokens.free(read), Some(OpType::Read { slot: 1 }));
        assert_eq!(tokens.free(wake), Some(OpType::Write { slot: 1 }));
        assert!(tokens.is_empty());
    }

    #[test]
    fn test_unknown_token() {
        let mut tokens = TokenAllocator::new(1);
        assert_eq!(tokens.free(42), None);
    }
}
