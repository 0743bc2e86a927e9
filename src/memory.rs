//! Access to the words of the heap being managed.
//!
//! Nothing in this crate dereferences heap addresses directly. Every read and
//! write goes through a [`HeapMemory`] capability, so the same space and
//! scanner logic work against live in-process memory, a snapshot, another
//! process's memory, or a simulated buffer in tests.

use core::fmt;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::chunk::{self, ChunkTag};
use crate::MemoryError;

/// A byte address in the heap being managed.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Address(usize);

impl Address {
    /// Create an address from its raw value.
    #[inline]
    pub const fn new(raw: usize) -> Self {
        Address(raw)
    }

    /// The raw value of this address.
    #[inline]
    pub const fn get(self) -> usize {
        self.0
    }

    /// The address `bytes` bytes above this one.
    #[inline]
    pub const fn add_bytes(self, bytes: usize) -> Self {
        Address(self.0 + bytes)
    }

    /// The number of bytes from `lower` up to this address.
    #[inline]
    pub fn bytes_since(self, lower: Address) -> usize {
        debug_assert!(lower <= self, "{lower} is above {self}");
        self.0 - lower.0
    }

    /// Is this address a multiple of `align`?
    #[inline]
    pub fn is_aligned(self, align: usize) -> bool {
        debug_assert!(align.is_power_of_two());
        self.0 & (align - 1) == 0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Read access to heap words.
///
/// Implementations must tolerate reads racing with writes made through other
/// handles: a reader may see stale words, but never a torn one.
pub trait HeapMemory {
    /// Read the word at `addr`.
    fn read_word(&self, addr: Address) -> Result<usize, MemoryError>;

    /// Read the free-chunk tag at `addr`, if the word there carries one.
    #[inline]
    fn read_tag_at(&self, addr: Address) -> Result<Option<ChunkTag>, MemoryError> {
        Ok(chunk::decode_tag(self.read_word(addr)?))
    }
}

/// Write access to heap words.
pub trait HeapMemoryMut: HeapMemory {
    /// Write `word` at `addr`.
    fn write_word(&self, addr: Address, word: usize) -> Result<(), MemoryError>;
}

impl<T> HeapMemory for &T
where
    T: HeapMemory + ?Sized,
{
    #[inline]
    fn read_word(&self, addr: Address) -> Result<usize, MemoryError> {
        (**self).read_word(addr)
    }
}

impl<T> HeapMemoryMut for &T
where
    T: HeapMemoryMut + ?Sized,
{
    #[inline]
    fn write_word(&self, addr: Address, word: usize) -> Result<(), MemoryError> {
        (**self).write_word(addr, word)
    }
}

/// An in-process heap made of atomic words starting at a chosen base address.
///
/// Reads and writes are relaxed atomic operations, so a scanner thread can
/// read the buffer while mutator and collector threads modify it.
pub struct WordBuffer {
    base: Address,
    word_bytes: usize,
    words: Box<[AtomicUsize]>,
}

impl WordBuffer {
    /// Create a zero-filled buffer of `len` words of `word_bytes` bytes each,
    /// whose first word lives at `base`.
    pub fn new(base: Address, word_bytes: usize, len: usize) -> Self {
        assert!(word_bytes.is_power_of_two());
        assert!(base.is_aligned(word_bytes));
        let words = (0..len).map(|_| AtomicUsize::new(0)).collect();
        WordBuffer {
            base,
            word_bytes,
            words,
        }
    }

    /// The address of the first word.
    pub fn base(&self) -> Address {
        self.base
    }

    /// The address one past the last word.
    pub fn end(&self) -> Address {
        self.base.add_bytes(self.words.len() * self.word_bytes)
    }

    /// The number of words in the buffer.
    pub fn len(&self) -> usize {
        self.words.len()
    }

    /// Is this buffer zero words long?
    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    fn slot(&self, addr: Address) -> Result<&AtomicUsize, MemoryError> {
        if addr < self.base || !addr.is_aligned(self.word_bytes) {
            return Err(MemoryError { addr });
        }
        self.words
            .get(addr.bytes_since(self.base) / self.word_bytes)
            .ok_or(MemoryError { addr })
    }
}

impl fmt::Debug for WordBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WordBuffer")
            .field("base", &self.base)
            .field("end", &self.end())
            .field("word_bytes", &self.word_bytes)
            .finish()
    }
}

impl HeapMemory for WordBuffer {
    #[inline]
    fn read_word(&self, addr: Address) -> Result<usize, MemoryError> {
        Ok(self.slot(addr)?.load(Ordering::Relaxed))
    }
}

impl HeapMemoryMut for WordBuffer {
    #[inline]
    fn write_word(&self, addr: Address, word: usize) -> Result<(), MemoryError> {
        self.slot(addr)?.store(word, Ordering::Relaxed);
        Ok(())
    }
}
