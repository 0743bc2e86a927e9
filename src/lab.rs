//! The linear allocation block: a bump-pointer allocator over an extent
//! carved from the dictionary.

use crate::{Address, Chunk, HeapMemoryMut, MemoryError, SpaceLayout};

/// A contiguous extent reserved for bump allocation.
///
/// While the block is non-empty, `[start, start + remaining)` is tracked by no
/// free list or dictionary, and carries a chunk tag at `start` so that heap
/// walkers step over it as free space. Carving never leaves fewer than a
/// minimum chunk behind, unless it leaves nothing at all.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LinearAllocBlock {
    start: Address,
    remaining_words: usize,
    refill_words: usize,
}

impl LinearAllocBlock {
    /// An empty block that refills itself `refill_words` at a time.
    pub const fn new(refill_words: usize) -> Self {
        LinearAllocBlock {
            start: Address::new(0),
            remaining_words: 0,
            refill_words,
        }
    }

    /// The next address to be handed out.
    #[inline]
    pub fn start(&self) -> Address {
        self.start
    }

    /// The number of words left in the block.
    #[inline]
    pub fn remaining_words(&self) -> usize {
        self.remaining_words
    }

    /// Is the block empty?
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.remaining_words == 0
    }

    /// How many words a refill satisfying a request of `min_words` takes.
    ///
    /// Never leaves a remainder too small to carry a chunk header once the
    /// request is carved.
    pub fn refill_size(&self, min_words: usize, layout: &SpaceLayout) -> usize {
        let size = self.refill_words.max(min_words);
        if size > min_words && size - min_words < layout.min_chunk_words() {
            min_words + layout.min_chunk_words()
        } else {
            size
        }
    }

    /// Can `words` be carved from this block?
    #[inline]
    pub fn can_allocate(&self, words: usize, layout: &SpaceLayout) -> bool {
        words == self.remaining_words || words + layout.min_chunk_words() <= self.remaining_words
    }

    /// Bump-allocate `words` words, or return `None` when the block must be
    /// refilled first.
    ///
    /// The remainder's tag is rewritten at its new start.
    pub fn try_allocate<M>(
        &mut self,
        memory: &M,
        layout: &SpaceLayout,
        words: usize,
    ) -> Result<Option<Address>, MemoryError>
    where
        M: HeapMemoryMut + ?Sized,
    {
        if words == 0 || !self.can_allocate(words, layout) {
            return Ok(None);
        }

        let addr = self.start;
        let rest = self.remaining_words - words;
        let next = addr.add_bytes(layout.words_to_bytes(words));
        if rest > 0 {
            Chunk::new(next, rest).write_header(memory, layout)?;
        }
        Chunk::new(addr, words).mark_not_free(memory)?;

        self.start = next;
        self.remaining_words = rest;
        Ok(Some(addr))
    }

    /// Take over `chunk` as the new extent. The block must be empty.
    pub fn install(&mut self, chunk: Chunk) {
        debug_assert!(self.is_empty());
        self.start = chunk.start;
        self.remaining_words = chunk.words;
    }

    /// Give up the current extent, returning it as a chunk to be freed.
    pub fn retire(&mut self) -> Option<Chunk> {
        if self.is_empty() {
            return None;
        }
        let chunk = Chunk::new(self.start, self.remaining_words);
        self.remaining_words = 0;
        Some(chunk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{HeapMemory, WordBuffer};

    #[test]
    fn bumps_and_advertises_the_remainder() {
        let layout = SpaceLayout::lp64();
        let mem = WordBuffer::new(Address::new(0x800), 8, 64);
        let chunk = Chunk::new(Address::new(0x800), 64);
        chunk.write_header(&mem, &layout).unwrap();

        let mut lab = LinearAllocBlock::new(64);
        lab.install(chunk);

        assert_eq!(lab.try_allocate(&mem, &layout, 5), Ok(Some(Address::new(0x800))));
        assert_eq!(lab.remaining_words(), 59);
        assert_eq!(lab.start(), Address::new(0x828));
        assert_eq!(mem.read_tag_at(Address::new(0x800)), Ok(None));
        assert_eq!(
            Chunk::read(&mem, &layout, Address::new(0x828)),
            Ok(Chunk::new(Address::new(0x828), 59))
        );

        assert_eq!(lab.try_allocate(&mem, &layout, 5), Ok(Some(Address::new(0x828))));
        assert_eq!(lab.remaining_words(), 54);
    }

    #[test]
    fn never_leaves_a_sliver() {
        let layout = SpaceLayout::lp64();
        let mem = WordBuffer::new(Address::new(0), 8, 8);
        let mut lab = LinearAllocBlock::new(8);
        lab.install(Chunk::new(Address::new(0), 8));

        // 8 - 6 = 2 words, less than a minimum chunk.
        assert_eq!(lab.try_allocate(&mem, &layout, 6), Ok(None));
        assert_eq!(lab.try_allocate(&mem, &layout, 5), Ok(Some(Address::new(0))));
        assert_eq!(lab.try_allocate(&mem, &layout, 3), Ok(Some(Address::new(40))));
        assert!(lab.is_empty());
        assert_eq!(lab.retire(), None);
    }

    #[test]
    fn retire_hands_back_the_rest() {
        let layout = SpaceLayout::lp64();
        let mut lab = LinearAllocBlock::new(32);
        assert_eq!(lab.refill_size(10, &layout), 32);
        assert_eq!(lab.refill_size(30, &layout), 33);
        assert_eq!(lab.refill_size(100, &layout), 100);
        lab.install(Chunk::new(Address::new(0x40), 32));
        assert_eq!(lab.retire(), Some(Chunk::new(Address::new(0x40), 32)));
        assert!(lab.is_empty());
    }
}
