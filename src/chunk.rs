//! The free chunk header protocol.
//!
//! A free chunk describes itself in place: its first word is a tag holding the
//! chunk's size, and its second word links it to the next chunk on whichever
//! list currently owns it. Any reader holding only a [`HeapMemory`] can
//! recognize free space without consulting the lists.
//!
//! ```text
//! word 0: size_in_words << 2 | 0b11
//! word 1: address of the next chunk, or 0
//! ```
//!
//! Object models must never put a word with both low bits set at the start
//! of a live object.

use crate::{Address, HeapMemory, HeapMemoryMut, MemoryError, Result, SpaceError, SpaceLayout};

/// The number of header words every free chunk carries.
pub const HEADER_WORDS: usize = 2;

const FREE_MARK: usize = 0b11;
const MARK_MASK: usize = 0b11;
const SIZE_SHIFT: u32 = 2;

/// A decoded free-chunk tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkTag {
    /// The chunk's size as written in its tag. Zero means corruption.
    pub words: usize,
}

/// Decode a heap word as a free-chunk tag.
#[inline]
pub fn decode_tag(word: usize) -> Option<ChunkTag> {
    (word & MARK_MASK == FREE_MARK).then(|| ChunkTag {
        words: word >> SIZE_SHIFT,
    })
}

/// Encode a free-chunk tag for a chunk of `words` words.
#[inline]
pub fn encode_tag(words: usize) -> usize {
    debug_assert!(words <= usize::MAX >> SIZE_SHIFT);
    (words << SIZE_SHIFT) | FREE_MARK
}

/// A free chunk: a block of heap words carrying a chunk header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Chunk {
    /// The address of the chunk's first word.
    pub start: Address,
    /// The chunk's size in words.
    pub words: usize,
}

impl Chunk {
    /// Describe the chunk of `words` words at `start`. Does not touch memory.
    pub fn new(start: Address, words: usize) -> Self {
        Chunk { start, words }
    }

    /// The address one past the chunk's last word.
    pub fn end(&self, layout: &SpaceLayout) -> Address {
        self.start.add_bytes(layout.words_to_bytes(self.words))
    }

    /// Write this chunk's header into the heap, with no successor.
    pub fn write_header<M>(&self, memory: &M, layout: &SpaceLayout) -> Result<(), MemoryError>
    where
        M: HeapMemoryMut + ?Sized,
    {
        debug_assert!(self.words >= layout.min_chunk_words());
        memory.write_word(self.start, encode_tag(self.words))?;
        self.set_next(memory, layout, None)
    }

    /// Read the chunk at `start`, checking that its tag is present and sane.
    pub fn read<M>(memory: &M, layout: &SpaceLayout, start: Address) -> Result<Chunk>
    where
        M: HeapMemory + ?Sized,
    {
        match memory.read_tag_at(start)? {
            Some(ChunkTag { words }) if words >= layout.min_chunk_words() => {
                Ok(Chunk { start, words })
            }
            Some(ChunkTag { words }) => Err(SpaceError::CorruptChunk { addr: start, words }),
            None => Err(SpaceError::CorruptChunk {
                addr: start,
                words: 0,
            }),
        }
    }

    /// The next chunk on this chunk's list.
    pub fn next<M>(&self, memory: &M, layout: &SpaceLayout) -> Result<Option<Address>, MemoryError>
    where
        M: HeapMemory + ?Sized,
    {
        let link = memory.read_word(self.link_addr(layout))?;
        Ok((link != 0).then_some(Address::new(link)))
    }

    /// Point this chunk's link at `next`.
    pub fn set_next<M>(
        &self,
        memory: &M,
        layout: &SpaceLayout,
        next: Option<Address>,
    ) -> Result<(), MemoryError>
    where
        M: HeapMemoryMut + ?Sized,
    {
        memory.write_word(self.link_addr(layout), next.map_or(0, Address::get))
    }

    /// Erase the tag so that this memory no longer reads as a free chunk.
    pub fn mark_not_free<M>(&self, memory: &M) -> Result<(), MemoryError>
    where
        M: HeapMemoryMut + ?Sized,
    {
        memory.write_word(self.start, 0)
    }

    /// Split off the first `words` words, writing a header for the remainder
    /// and then shrinking this chunk's tag to cover only the front.
    ///
    /// Returns the `(front, remainder)` pair. The remainder must be at least a
    /// minimum chunk.
    ///
    /// Once this returns, no tag in the heap spans the boundary between the
    /// two, so the remainder may be handed to another thread while the front
    /// is still tagged as free.
    pub fn split<M>(&self, memory: &M, layout: &SpaceLayout, words: usize) -> Result<(Chunk, Chunk)>
    where
        M: HeapMemoryMut + ?Sized,
    {
        debug_assert!(words + layout.min_chunk_words() <= self.words);
        let front = Chunk::new(self.start, words);
        let rest = Chunk::new(front.end(layout), self.words - words);
        rest.write_header(memory, layout)?;
        memory.write_word(front.start, encode_tag(words))?;
        Ok((front, rest))
    }

    fn link_addr(&self, layout: &SpaceLayout) -> Address {
        self.start.add_bytes(layout.heap_word_bytes)
    }
}
