use crate::Address;

/// A failed read or write of a heap word.
///
/// Produced by [`HeapMemory`](crate::HeapMemory) implementations when an
/// address is outside the memory they can reach, misaligned, or (for remote
/// memory) simply unreadable right now.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
#[error("cannot access heap word at {addr}")]
pub struct MemoryError {
    /// The address that could not be accessed.
    pub addr: Address,
}

/// Errors produced by the free-list space and its scanner.
///
/// Only [`SpaceError::Exhausted`] is expected during normal operation. Every
/// other variant means the heap or its bookkeeping is corrupt, or the caller
/// broke an API contract, and the operation that produced it must not be
/// retried blindly.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum SpaceError {
    /// [`configure`](crate::configure) has not been called yet.
    #[error("the heap layout has not been configured")]
    NotConfigured,

    /// [`configure`](crate::configure) was called again with different
    /// constants.
    #[error("the heap layout was already configured with different constants")]
    AlreadyConfigured,

    /// The layout constants are inconsistent.
    #[error("invalid heap layout: {0}")]
    InvalidLayout(&'static str),

    /// No tier has a free block large enough.
    #[error("no free block of {requested} words is available")]
    Exhausted {
        /// The requested size, after adjustment, in words.
        requested: usize,
    },

    /// A free chunk's tag reports an impossible size.
    #[error("free chunk at {addr} reports an invalid size of {words} words")]
    CorruptChunk {
        /// Start of the chunk.
        addr: Address,
        /// The size found in its tag.
        words: usize,
    },

    /// A collaborator reported a zero-sized block.
    #[error("block at {addr} reports a zero size")]
    CorruptBlock {
        /// Start of the block.
        addr: Address,
    },

    /// No size class exists for this size.
    #[error("there is no size class for {words} words")]
    InvalidSizeClass {
        /// The offending size.
        words: usize,
    },

    /// A chunk was handed to a size class of a different size.
    #[error("a chunk of {actual} words does not belong in the {nominal}-word size class")]
    SizeClassMismatch {
        /// The size class's nominal size.
        nominal: usize,
        /// The chunk's size.
        actual: usize,
    },

    /// A block is outside the space, misaligned, or too small to be freed.
    #[error("block at {start} of {words} words is not a valid block of this space")]
    InvalidBlock {
        /// Start of the block.
        start: Address,
        /// Its size in words.
        words: usize,
    },

    /// A running free-space total would have gone negative.
    #[error("free-space accounting underflow: {total} words tracked, removing {removed}")]
    AccountingUnderflow {
        /// The total before the update.
        total: usize,
        /// The amount being removed.
        removed: usize,
    },

    /// A running free-space total disagrees with the chunks actually found on
    /// the structure it summarizes.
    #[error("free-space accounting mismatch: {tracked} words tracked, {found} words found")]
    AccountingMismatch {
        /// The running total.
        tracked: usize,
        /// The sum over the chunks found.
        found: usize,
    },

    /// Reading or writing the heap failed.
    #[error(transparent)]
    Memory(#[from] MemoryError),
}

impl SpaceError {
    /// Does this error indicate corruption or a logic bug, rather than a
    /// recoverable out-of-space condition?
    pub fn is_fatal(&self) -> bool {
        !matches!(self, SpaceError::Exhausted { .. })
    }
}

/// Shorthand for results produced by this crate.
pub type Result<T, E = SpaceError> = core::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_exhaustion_is_recoverable() {
        assert!(!SpaceError::Exhausted { requested: 4 }.is_fatal());
        assert!(SpaceError::CorruptChunk {
            addr: Address::new(0x1000),
            words: 0
        }
        .is_fatal());
        assert!(SpaceError::from(MemoryError {
            addr: Address::new(0x10)
        })
        .is_fatal());
    }

    #[test]
    fn messages_name_the_address() {
        let err = SpaceError::CorruptBlock {
            addr: Address::new(0x2a0),
        };
        assert_eq!(err.to_string(), "block at 0x2a0 reports a zero size");
    }
}
