//! The free-list space: a contiguous heap range whose free memory is tracked
//! by size class lists, a large-block dictionary and a linear allocation
//! block.
//!
//! Allocation tries, in order:
//!
//! 1. For sizes with a size class, the exact size class. O(1).
//!
//! 2. For sizes below the LAB's refill quantum, bump allocation from the
//!    linear allocation block (LAB), refilling it from the dictionary when it
//!    runs dry. The LAB turns a run of small requests into a single
//!    dictionary search.
//!
//! 3. Best fit from the dictionary, splitting off any excess.
//!
//! 4. For sizes with a size class, a larger size class, splitting off any
//!    excess.
//!
//! Sizes without a size class go straight to the dictionary. Freed blocks go
//! back to their size class or to the dictionary, and are never coalesced
//! with their neighbors.
//!
//! Every piece of free memory, including the LAB's unused tail, carries a
//! chunk tag in its first word. A [`BoundaryScanner`] walking the space can
//! therefore always tell free memory from live objects without taking any
//! of the space's locks.

use core::fmt;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::dictionary::{ChunkOrder, TreeDictionary};
use crate::indexed::IndexedFreeLists;
use crate::lab::LinearAllocBlock;
use crate::lock::{Lock, Mutex};
use crate::scan::{BoundaryRecovery, BoundaryScanner, MemRegion, ObjectModel, ScanReport};
use crate::{layout, Address, Chunk, HeapMemory, HeapMemoryMut, Result, SpaceError, SpaceLayout};
use cfg_if::cfg_if;

cfg_if! {
    if #[cfg(any(debug_assertions, feature = "verify"))] {
        /// Run [`FreeListSpace::verify`] after every allocation and free.
        const CHECK_INTEGRITY: bool = true;
    } else {
        const CHECK_INTEGRITY: bool = false;
    }
}

/// Per-space tuning.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SpaceConfig {
    /// How many words the LAB takes from the dictionary at a time.
    pub lab_refill_words: usize,
    /// Which of several same-sized dictionary chunks to hand out first.
    pub chunk_order: ChunkOrder,
}

impl Default for SpaceConfig {
    fn default() -> Self {
        SpaceConfig {
            lab_refill_words: 64,
            chunk_order: ChunkOrder::Lifo,
        }
    }
}

/// A block handed out by [`FreeListSpace::allocate`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HeapBlock {
    /// The block's first word.
    pub start: Address,
    /// The block's size in words.
    pub words: usize,
}

impl HeapBlock {
    /// The address one past the block's last word.
    pub fn end(&self, layout: &SpaceLayout) -> Address {
        self.start.add_bytes(layout.words_to_bytes(self.words))
    }
}

/// A free-list managed heap space over `[bottom, end)` of the memory `M`.
///
/// Each free structure is guarded by its own lock of type `L`; see the
/// [`Lock`] trait. Locks are always taken in the order LAB, dictionary, size
/// class, and freeing a block takes only one of them.
///
/// The free-space totals are mirrored in atomics, so the accounting methods
/// never lock and are O(number of size classes). Memory moving between
/// structures is always removed from its source's total before it is added
/// to its destination's, so a reader may see too little free space but never
/// too much.
pub struct FreeListSpace<M, L> {
    memory: M,
    bottom: Address,
    end: Address,
    layout: &'static SpaceLayout,
    config: SpaceConfig,

    indexed: IndexedFreeLists<L>,

    dictionary: Mutex<TreeDictionary, L>,
    /// Mirrors the dictionary's total, written with the dictionary locked.
    dictionary_words: AtomicUsize,

    lab: Mutex<LinearAllocBlock, L>,
    /// Mirrors the LAB's remaining words, written with the LAB locked.
    lab_words: AtomicUsize,

    /// The dictionary and LAB mirrors summed. Chunks move back and forth
    /// between the two, so `free_words` reads them as one value.
    unindexed_words: AtomicUsize,
}

impl<M, L> FreeListSpace<M, L>
where
    M: HeapMemoryMut,
    L: Lock + Default,
{
    /// Create a space over `[bottom, end)` of `memory`, all of it free.
    ///
    /// The heap layout must already be [configured](crate::configure). Both
    /// bounds must be aligned to the minimum object alignment, and a
    /// non-empty space must be able to hold at least one minimum chunk.
    pub fn new(memory: M, bottom: Address, end: Address, config: SpaceConfig) -> Result<Self> {
        let layout = layout()?;
        let align = layout.min_object_alignment_bytes;
        if bottom > end || !bottom.is_aligned(align) || !end.is_aligned(align) {
            return Err(SpaceError::InvalidBlock {
                start: bottom,
                words: 0,
            });
        }
        let capacity = end.bytes_since(bottom) / layout.heap_word_bytes;
        if capacity != 0 && capacity < layout.min_chunk_words() {
            return Err(SpaceError::InvalidBlock {
                start: bottom,
                words: capacity,
            });
        }

        let space = FreeListSpace {
            memory,
            bottom,
            end,
            layout,
            config,
            indexed: IndexedFreeLists::new(layout),
            dictionary: Mutex::new(TreeDictionary::new(config.chunk_order), L::default()),
            dictionary_words: AtomicUsize::new(0),
            lab: Mutex::new(LinearAllocBlock::new(config.lab_refill_words), L::default()),
            lab_words: AtomicUsize::new(0),
            unindexed_words: AtomicUsize::new(0),
        };
        space.free_everything()?;
        log::debug!("created free-list space {space}");
        Ok(space)
    }
}

impl<M, L> FreeListSpace<M, L>
where
    M: HeapMemoryMut,
    L: Lock,
{
    /// The memory this space lives in.
    #[inline]
    pub fn memory(&self) -> &M {
        &self.memory
    }

    /// The layout this space was created with.
    #[inline]
    pub fn layout(&self) -> &'static SpaceLayout {
        self.layout
    }

    /// This space's tuning.
    #[inline]
    pub fn config(&self) -> &SpaceConfig {
        &self.config
    }

    /// The space's first address.
    #[inline]
    pub fn bottom(&self) -> Address {
        self.bottom
    }

    /// One past the space's last address.
    #[inline]
    pub fn end(&self) -> Address {
        self.end
    }

    /// Does the space contain `addr`?
    #[inline]
    pub fn contains(&self, addr: Address) -> bool {
        self.bottom <= addr && addr < self.end
    }

    /// Does a free chunk start at `addr`?
    pub fn is_free_chunk(&self, addr: Address) -> Result<bool> {
        Ok(self.contains(addr) && self.memory.read_tag_at(addr)?.is_some())
    }

    /// Does `[start, start + words)` lie within the space?
    fn spans(&self, start: Address, words: usize) -> bool {
        start >= self.bottom
            && start <= self.end
            && words <= self.end.bytes_since(start) / self.layout.heap_word_bytes
    }

    /// Allocate a block of at least `words` words.
    ///
    /// The request is rounded up to the allocation granularity and minimum
    /// block size, and the returned block is exactly that size. Its first word
    /// is cleared; the rest is left as it was.
    pub fn allocate(&self, words: usize) -> Result<HeapBlock> {
        if words > self.capacity_words() {
            return Err(SpaceError::Exhausted { requested: words });
        }
        let words = self.layout.adjust_object_words(words);

        let chunk = if self.indexed.is_small(words) {
            self.allocate_small(words)?
        } else {
            self.allocate_large(words)?
        };
        let Some(chunk) = chunk else {
            log::trace!("cannot allocate {words} words");
            return Err(SpaceError::Exhausted { requested: words });
        };
        debug_assert_eq!(chunk.words, words);

        chunk.mark_not_free(&self.memory)?;
        self.check_integrity()?;
        Ok(HeapBlock {
            start: chunk.start,
            words,
        })
    }

    fn allocate_small(&self, words: usize) -> Result<Option<Chunk>> {
        if let Some(chunk) = self.indexed.allocate(&self.memory, self.layout, words)? {
            log::trace!("allocated {words} words at {} from its size class", chunk.start);
            return Ok(Some(chunk));
        }

        if words < self.config.lab_refill_words {
            if let Some(start) = self.allocate_from_lab(words)? {
                log::trace!("allocated {words} words at {start} from the LAB");
                return Ok(Some(Chunk::new(start, words)));
            }
        }

        if let Some(chunk) = self.allocate_large(words)? {
            return Ok(Some(chunk));
        }

        match self.indexed.best_fit(&self.memory, self.layout, words)? {
            Some(chunk) => {
                log::trace!(
                    "allocated {words} words at {} by splitting a {}-word chunk",
                    chunk.start,
                    chunk.words
                );
                let (front, rest) = chunk.split(&self.memory, self.layout, words)?;
                self.free_chunk(rest)?;
                Ok(Some(front))
            }
            None => Ok(None),
        }
    }

    fn allocate_large(&self, words: usize) -> Result<Option<Chunk>> {
        let mut dictionary = self.dictionary.lock();
        let chunk = self.take_from_dictionary(&mut dictionary, words)?;
        if let Some(chunk) = chunk {
            log::trace!("allocated {words} words at {} from the dictionary", chunk.start);
        }
        Ok(chunk)
    }

    /// Bump-allocate from the LAB, refilling it from the dictionary if needed.
    fn allocate_from_lab(&self, words: usize) -> Result<Option<Address>> {
        let mut lab = self.lab.lock();
        if let Some(start) = lab.try_allocate(&self.memory, self.layout, words)? {
            self.publish_lab_words(&lab)?;
            return Ok(Some(start));
        }

        let refill = lab.refill_size(words, self.layout);
        let mut dictionary = self.dictionary.lock();
        let Some(chunk) = self.take_from_dictionary(&mut dictionary, refill)? else {
            return Ok(None);
        };
        if let Some(leftover) = lab.retire() {
            self.publish_lab_words(&lab)?;
            self.free_chunk_locked(&mut dictionary, leftover)?;
        }
        drop(dictionary);

        chunk.write_header(&self.memory, self.layout)?;
        lab.install(chunk);
        log::debug!("refilled the LAB with {} words at {}", chunk.words, chunk.start);

        let start = lab.try_allocate(&self.memory, self.layout, words)?;
        self.publish_lab_words(&lab)?;
        debug_assert!(start.is_some());
        Ok(start)
    }

    /// Take a chunk of exactly `words` words from the dictionary, splitting a
    /// larger one and returning the excess.
    ///
    /// The dictionary's mirror is published before the excess is freed, since
    /// the excess may land in a size class.
    fn take_from_dictionary(
        &self,
        dictionary: &mut TreeDictionary,
        words: usize,
    ) -> Result<Option<Chunk>> {
        let min_chunk = self.layout.min_chunk_words();
        let Some(mut chunk) = dictionary.allocate(&self.memory, self.layout, words)? else {
            return Ok(None);
        };

        if chunk.words != words && chunk.words < words + min_chunk {
            // The excess would be too small to free, so look for a chunk that
            // can be split and put this one back.
            let larger = dictionary.allocate(&self.memory, self.layout, words + min_chunk)?;
            dictionary.free(&self.memory, self.layout, chunk)?;
            match larger {
                Some(larger) => chunk = larger,
                None => return Ok(None),
            }
        }

        self.publish_dictionary_words(dictionary)?;
        if chunk.words == words {
            return Ok(Some(chunk));
        }
        let (front, rest) = chunk.split(&self.memory, self.layout, words)?;
        self.free_chunk_locked(dictionary, rest)?;
        Ok(Some(front))
    }

    /// Return `block` to the space.
    ///
    /// The block must have come from [`allocate`](Self::allocate) (or be a
    /// well-formed part of such a block) and must not already be free.
    pub fn free(&self, block: HeapBlock) -> Result<()> {
        let HeapBlock { start, words } = block;
        if !self.spans(start, words)
            || !start.is_aligned(self.layout.min_object_alignment_bytes)
            || words < self.layout.min_chunk_words()
            || words % self.layout.index_set_stride() != 0
            || self.memory.read_tag_at(start)?.is_some()
        {
            return Err(SpaceError::InvalidBlock { start, words });
        }

        self.free_chunk(Chunk::new(start, words))?;
        log::trace!("freed {words} words at {start}");
        self.check_integrity()
    }

    /// Write `chunk`'s header and file it under its size class or in the
    /// dictionary.
    fn free_chunk(&self, chunk: Chunk) -> Result<()> {
        if self.indexed.is_small(chunk.words) {
            chunk.write_header(&self.memory, self.layout)?;
            self.indexed.free(&self.memory, self.layout, chunk)
        } else {
            let mut dictionary = self.dictionary.lock();
            self.free_chunk_locked(&mut dictionary, chunk)
        }
    }

    fn free_chunk_locked(&self, dictionary: &mut TreeDictionary, chunk: Chunk) -> Result<()> {
        chunk.write_header(&self.memory, self.layout)?;
        if self.indexed.is_small(chunk.words) {
            self.indexed.free(&self.memory, self.layout, chunk)
        } else {
            dictionary.free(&self.memory, self.layout, chunk)?;
            self.publish_dictionary_words(dictionary)
        }
    }

    /// Store the dictionary's total in its mirror. Called with the dictionary
    /// locked.
    fn publish_dictionary_words(&self, dictionary: &TreeDictionary) -> Result<()> {
        let words = dictionary.total_free_words();
        let old = self.dictionary_words.swap(words, Ordering::Relaxed);
        self.adjust_unindexed_words(old, words)
    }

    /// Store the LAB's remaining words in its mirror. Called with the LAB
    /// locked.
    fn publish_lab_words(&self, lab: &LinearAllocBlock) -> Result<()> {
        let words = lab.remaining_words();
        let old = self.lab_words.swap(words, Ordering::Relaxed);
        self.adjust_unindexed_words(old, words)
    }

    fn adjust_unindexed_words(&self, old: usize, new: usize) -> Result<()> {
        if new >= old {
            self.unindexed_words.fetch_add(new - old, Ordering::Release);
            return Ok(());
        }
        let removed = old - new;
        self.unindexed_words
            .fetch_update(Ordering::Release, Ordering::Relaxed, |total| {
                total.checked_sub(removed)
            })
            .map(drop)
            .map_err(|total| SpaceError::AccountingUnderflow { total, removed })
    }

    /// Give the LAB's unused tail back to the free structures.
    pub fn retire_lab(&self) -> Result<()> {
        let mut lab = self.lab.lock();
        if let Some(chunk) = lab.retire() {
            self.publish_lab_words(&lab)?;
            log::debug!("retiring {} LAB words at {}", chunk.words, chunk.start);
            self.free_chunk(chunk)?;
        }
        Ok(())
    }

    /// Forget every allocation and make the whole space a single free chunk.
    pub fn reset(&mut self) -> Result<()> {
        self.indexed.clear();
        self.dictionary.get_mut().clear();
        *self.dictionary_words.get_mut() = 0;
        *self.lab.get_mut() = LinearAllocBlock::new(self.config.lab_refill_words);
        *self.lab_words.get_mut() = 0;
        *self.unindexed_words.get_mut() = 0;
        self.free_everything()?;
        log::debug!("reset free-list space {self}");
        Ok(())
    }

    fn free_everything(&self) -> Result<()> {
        let capacity = self.capacity_words();
        if capacity > 0 {
            self.free_chunk(Chunk::new(self.bottom, capacity))?;
        }
        Ok(())
    }

    /// The size of the space in words.
    #[inline]
    pub fn capacity_words(&self) -> usize {
        self.end.bytes_since(self.bottom) / self.layout.heap_word_bytes
    }

    /// The number of free words: everything on a size class list or in the
    /// dictionary, plus the LAB's unused tail.
    ///
    /// Size classes are read in ascending order and before the dictionary and
    /// LAB, which is the opposite direction to every transfer between them.
    pub fn free_words(&self) -> usize {
        let indexed = self.indexed.free_words();
        indexed + self.unindexed_words.load(Ordering::Acquire)
    }

    /// The number of words not free.
    ///
    /// Fails with [`SpaceError::AccountingUnderflow`] if the free-space
    /// totals exceed the capacity, which means they are corrupt.
    pub fn used_words(&self) -> Result<usize> {
        let capacity = self.capacity_words();
        let free = self.free_words();
        capacity
            .checked_sub(free)
            .ok_or(SpaceError::AccountingUnderflow {
                total: capacity,
                removed: free,
            })
    }

    /// The size of the space in bytes.
    pub fn capacity_bytes(&self) -> usize {
        self.layout.words_to_bytes(self.capacity_words())
    }

    /// The number of free bytes.
    pub fn free_bytes(&self) -> usize {
        self.layout.words_to_bytes(self.free_words())
    }

    /// The number of bytes not free.
    pub fn used_bytes(&self) -> Result<usize> {
        Ok(self.layout.words_to_bytes(self.used_words()?))
    }

    /// The number of free words in the dictionary.
    pub fn dictionary_free_words(&self) -> usize {
        self.dictionary_words.load(Ordering::Relaxed)
    }

    /// The number of words left in the LAB.
    pub fn lab_remaining_words(&self) -> usize {
        self.lab_words.load(Ordering::Relaxed)
    }

    /// The number of free chunks in the size class for `words`.
    pub fn size_class_count(&self, words: usize) -> Result<usize> {
        self.indexed.count(words)
    }

    /// The live regions of the space, as found by walking it.
    pub fn scan<O, R>(&self, objects: &O, recovery: R) -> Result<Vec<MemRegion>>
    where
        O: ObjectModel + ?Sized,
        R: BoundaryRecovery,
    {
        BoundaryScanner::new(&self.memory, self.layout, objects, recovery).scan(self.bottom, self.end)
    }

    /// The live and free extents of the space, as found by walking it.
    pub fn scan_extents<O, R>(&self, objects: &O, recovery: R) -> Result<ScanReport>
    where
        O: ObjectModel + ?Sized,
        R: BoundaryRecovery,
    {
        BoundaryScanner::new(&self.memory, self.layout, objects, recovery)
            .scan_extents(self.bottom, self.end)
    }

    /// The number of used words, found by walking the space rather than from
    /// the running totals. An incomplete walk only counts what it reached.
    pub fn used_words_by_scan<O, R>(&self, objects: &O, recovery: R) -> Result<usize>
    where
        O: ObjectModel + ?Sized,
        R: BoundaryRecovery,
    {
        Ok(self.scan_extents(objects, recovery)?.live_words(self.layout))
    }

    /// Check every free structure against the heap and against each other:
    /// chunk tags match their lists, the running totals match the chunks, and
    /// no two free chunks overlap or leave the space.
    ///
    /// Holds every lock for the duration.
    pub fn verify(&self) -> Result<()> {
        let lab = self.lab.lock();
        let mut dictionary = self.dictionary.lock();

        let mut chunks = Vec::new();
        let mut collect = |chunk: Chunk| {
            if !self.spans(chunk.start, chunk.words) {
                return Err(SpaceError::InvalidBlock {
                    start: chunk.start,
                    words: chunk.words,
                });
            }
            chunks.push(chunk);
            Ok(())
        };
        dictionary.verify(&self.memory, self.layout, &mut collect)?;
        self.indexed.verify(&self.memory, self.layout, &mut collect)?;
        if !lab.is_empty() {
            let chunk = Chunk::read(&self.memory, self.layout, lab.start())?;
            if chunk.words != lab.remaining_words() {
                return Err(SpaceError::CorruptChunk {
                    addr: chunk.start,
                    words: chunk.words,
                });
            }
            collect(chunk)?;
        }

        let tracked = self.dictionary_words.load(Ordering::Relaxed);
        if tracked != dictionary.total_free_words() {
            return Err(SpaceError::AccountingMismatch {
                tracked,
                found: dictionary.total_free_words(),
            });
        }
        let tracked = self.lab_words.load(Ordering::Relaxed);
        if tracked != lab.remaining_words() {
            return Err(SpaceError::AccountingMismatch {
                tracked,
                found: lab.remaining_words(),
            });
        }
        let tracked = self.unindexed_words.load(Ordering::Relaxed);
        let found = dictionary.total_free_words() + lab.remaining_words();
        if tracked != found {
            return Err(SpaceError::AccountingMismatch { tracked, found });
        }

        chunks.sort_unstable_by_key(|c| c.start);
        for pair in chunks.windows(2) {
            if pair[0].end(self.layout) > pair[1].start {
                return Err(SpaceError::CorruptChunk {
                    addr: pair[1].start,
                    words: pair[1].words,
                });
            }
        }
        Ok(())
    }

    #[inline]
    fn check_integrity(&self) -> Result<()> {
        if CHECK_INTEGRITY {
            self.verify()
        } else {
            Ok(())
        }
    }
}

impl<M, L> fmt::Display for FreeListSpace<M, L>
where
    M: HeapMemoryMut,
    L: Lock,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let capacity = self.capacity_words();
        let free = self.free_words();
        write!(f, "[{}, {}) capacity={capacity} ", self.bottom, self.end)?;
        match capacity.checked_sub(free) {
            Some(used) => {
                let percent = if capacity == 0 { 0 } else { used * 100 / capacity };
                write!(f, "used({percent}%)={used} free={free}")
            }
            None => write!(f, "used=<underflow> free={free}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scan::{BlockSize, NoRecovery};
    use crate::{configure, ChunkTag, MemoryError, SingleThreadedLock, SpinLock, WordBuffer};

    struct TaggedObjects;

    impl ObjectModel for TaggedObjects {
        fn object_size_at(
            &self,
            memory: &dyn HeapMemory,
            addr: Address,
        ) -> Result<BlockSize, MemoryError> {
            let word = memory.read_word(addr)?;
            Ok(if word & 0b11 == 0b01 {
                BlockSize::Known(word >> 2)
            } else {
                BlockSize::Unknown
            })
        }
    }

    const BOTTOM: Address = Address::new(0x10_000);

    fn space(words: usize) -> FreeListSpace<WordBuffer, SingleThreadedLock> {
        let _ = env_logger::try_init();
        configure(SpaceLayout::lp64()).unwrap();
        let memory = WordBuffer::new(BOTTOM, 8, words);
        let end = memory.end();
        FreeListSpace::new(memory, BOTTOM, end, SpaceConfig::default()).unwrap()
    }

    fn at(word: usize) -> Address {
        BOTTOM.add_bytes(word * 8)
    }

    fn initialize(space: &FreeListSpace<WordBuffer, impl Lock>, block: HeapBlock) {
        space
            .memory()
            .write_word(block.start, (block.words << 2) | 0b01)
            .unwrap();
    }

    #[test]
    fn single_live_object() {
        let space = space(1000);
        let block = space.allocate(40).unwrap();
        assert_eq!(block, HeapBlock { start: at(0), words: 40 });
        initialize(&space, block);

        assert_eq!(
            space.scan(&TaggedObjects, NoRecovery),
            Ok(vec![MemRegion::new(at(0), at(40))])
        );
        assert_eq!(space.free_words(), 960);
        assert_eq!(space.capacity_words(), 1000);
        assert_eq!(space.used_words(), Ok(40));
        assert_eq!(space.used_words_by_scan(&TaggedObjects, NoRecovery), Ok(40));
        assert_eq!(
            space.to_string(),
            "[0x10000, 0x11f40) capacity=1000 used(4%)=40 free=960"
        );
    }

    #[test]
    fn lab_refill_quantum() {
        let space = space(1000);
        assert_eq!(space.allocate(5).unwrap().start, at(0));
        assert_eq!(space.lab_remaining_words(), 59);
        assert_eq!(space.dictionary_free_words(), 936);

        assert_eq!(space.allocate(5).unwrap().start, at(5));
        assert_eq!(space.lab_remaining_words(), 54);
        assert_eq!(space.dictionary_free_words(), 936);

        // The LAB's tail reads as free memory.
        assert_eq!(space.is_free_chunk(at(10)), Ok(true));
        assert_eq!(space.is_free_chunk(at(5)), Ok(false));
    }

    #[test]
    fn allocation_is_exact_and_capacity_is_conserved() {
        let space = space(4096);
        let mut blocks = Vec::new();
        for words in [1, 2, 3, 7, 64, 100, 256, 257, 300, 1000, 5] {
            let before = space.free_words();
            let block = space.allocate(words).unwrap();
            assert_eq!(block.words, words.max(3));
            assert_eq!(space.free_words(), before - block.words);
            assert_eq!(space.free_words() + space.used_words().unwrap(), space.capacity_words());
            blocks.push(block);
        }

        blocks.sort_by_key(|b| b.start);
        for pair in blocks.windows(2) {
            assert!(pair[0].end(space.layout()) <= pair[1].start);
        }

        for block in blocks {
            let before = space.free_words();
            space.free(block).unwrap();
            assert_eq!(space.free_words(), before + block.words);
        }
        space.retire_lab().unwrap();
        assert_eq!(space.free_words(), space.capacity_words());
        space.verify().unwrap();
    }

    #[test]
    fn free_then_allocate_reuses_the_block() {
        let space = space(1000);
        let a = space.allocate(10).unwrap();
        let _b = space.allocate(10).unwrap();
        space.free(a).unwrap();
        assert_eq!(space.size_class_count(10), Ok(1));
        assert_eq!(space.allocate(10), Ok(a));
        assert_eq!(space.size_class_count(10), Ok(0));

        let big = space.allocate(300).unwrap();
        space.free(big).unwrap();
        assert_eq!(space.allocate(300), Ok(big));
    }

    #[test]
    fn splits_and_exhaustion() {
        // Small enough that the whole space starts out in a size class.
        let space = space(100);
        assert_eq!(space.size_class_count(100), Ok(1));
        assert_eq!(space.dictionary_free_words(), 0);

        assert_eq!(space.allocate(60).unwrap().start, at(0));
        assert_eq!(space.size_class_count(40), Ok(1));
        assert_eq!(space.lab_remaining_words(), 0);

        // Splitting the 40-word chunk would leave a 2-word sliver.
        assert_eq!(
            space.allocate(38),
            Err(SpaceError::Exhausted { requested: 38 })
        );
        assert!(!space.allocate(38).unwrap_err().is_fatal());

        assert_eq!(space.allocate(30).unwrap().start, at(60));
        assert_eq!(space.size_class_count(10), Ok(1));
        assert_eq!(space.allocate(10).unwrap().start, at(90));
        assert_eq!(space.free_words(), 0);
        assert_eq!(
            space.allocate(1),
            Err(SpaceError::Exhausted { requested: 3 })
        );
        assert_eq!(
            space.to_string(),
            "[0x10000, 0x10320) capacity=100 used(100%)=100 free=0"
        );
    }

    /// A heap that, whenever a chunk tag is cleared, records the tag and what
    /// a scanner walking the heap at that moment would report.
    struct WatchedMemory {
        inner: WordBuffer,
        cleared: std::sync::Mutex<Vec<(Address, ChunkTag, ScanReport)>>,
    }

    impl HeapMemory for WatchedMemory {
        fn read_word(&self, addr: Address) -> Result<usize, MemoryError> {
            self.inner.read_word(addr)
        }
    }

    impl HeapMemoryMut for WatchedMemory {
        fn write_word(&self, addr: Address, word: usize) -> Result<(), MemoryError> {
            if word == 0 {
                if let Some(tag) = self.inner.read_tag_at(addr)? {
                    let report = BoundaryScanner::new(
                        &self.inner,
                        layout().unwrap(),
                        &TaggedObjects,
                        NoRecovery,
                    )
                    .scan_extents(self.inner.base(), self.inner.end())
                    .unwrap();
                    self.cleared.lock().unwrap().push((addr, tag, report));
                }
            }
            self.inner.write_word(addr, word)
        }
    }

    fn watched(words: usize) -> FreeListSpace<WatchedMemory, SingleThreadedLock> {
        configure(SpaceLayout::lp64()).unwrap();
        let inner = WordBuffer::new(BOTTOM, 8, words);
        let end = inner.end();
        let memory = WatchedMemory {
            inner,
            cleared: Default::default(),
        };
        FreeListSpace::new(memory, BOTTOM, end, SpaceConfig::default()).unwrap()
    }

    /// The remainder of a split is published while the front still carries a
    /// tag. That tag must already cover only the front, or a scanner would
    /// step over objects allocated from the remainder by other threads.
    #[test]
    fn split_fronts_only_claim_themselves() {
        // From the dictionary.
        let space = watched(1000);
        let block = space.allocate(300).unwrap();
        assert_eq!(block.start, at(0));
        let cleared = space.memory().cleared.lock().unwrap();
        let (addr, tag, report) = cleared.last().unwrap();
        assert_eq!((*addr, *tag), (at(0), ChunkTag { words: 300 }));
        assert_eq!(report.extents[0].region, MemRegion::new(at(0), at(300)));
        assert_eq!(report.extents[1].region, MemRegion::new(at(300), at(1000)));
        drop(cleared);

        // From a larger size class.
        let space = watched(256);
        let block = space.allocate(100).unwrap();
        assert_eq!(block.start, at(0));
        assert_eq!(space.size_class_count(156), Ok(1));
        let cleared = space.memory().cleared.lock().unwrap();
        let (addr, tag, report) = cleared.last().unwrap();
        assert_eq!((*addr, *tag), (at(0), ChunkTag { words: 100 }));
        assert_eq!(report.extents[0].region, MemRegion::new(at(0), at(100)));
    }

    #[test]
    fn only_small_requests_use_the_lab() {
        let space = space(1000);
        space.allocate(5).unwrap();
        assert_eq!(space.lab_remaining_words(), 59);

        // Too big for the LAB's tail, but not retiring it.
        let block = space.allocate(100).unwrap();
        assert_eq!(block.start, at(64));
        assert_eq!(space.lab_remaining_words(), 59);
        assert_eq!(space.size_class_count(59), Ok(0));
        assert_eq!(space.dictionary_free_words(), 836);
        assert_eq!(space.used_words(), Ok(105));
    }

    #[test]
    fn dictionary_remainders_in_size_classes_are_counted_once() {
        let space = space(300);
        let block = space.allocate(100).unwrap();
        assert_eq!(block.start, at(0));
        assert_eq!(space.size_class_count(200), Ok(1));
        assert_eq!(space.dictionary_free_words(), 0);
        assert_eq!(space.free_words(), 200);
        assert_eq!(space.used_words(), Ok(100));
        space.verify().unwrap();
    }

    #[test]
    fn accounting_underflow_is_an_error() {
        let space = space(1000);
        assert_eq!(
            space.adjust_unindexed_words(2000, 0),
            Err(SpaceError::AccountingUnderflow {
                total: 1000,
                removed: 2000
            })
        );
        // The failed update left the total alone.
        assert_eq!(space.free_words(), 1000);
        assert_eq!(space.used_words(), Ok(0));
    }

    #[test]
    fn invalid_frees_are_rejected() {
        let space = space(256);
        let block = space.allocate(8).unwrap();
        let invalid = |start, words| Err(SpaceError::InvalidBlock { start, words });

        assert_eq!(
            space.free(HeapBlock { start: at(250), words: 8 }),
            invalid(at(250), 8)
        );
        assert_eq!(
            space.free(HeapBlock { start: Address::new(0x10_004), words: 8 }),
            invalid(Address::new(0x10_004), 8)
        );
        assert_eq!(
            space.free(HeapBlock { start: at(0), words: 2 }),
            invalid(at(0), 2)
        );
        // Already free.
        assert_eq!(
            space.free(HeapBlock { start: at(8), words: 8 }),
            invalid(at(8), 8)
        );

        space.free(block).unwrap();
        assert_eq!(space.free(block), invalid(at(0), 8));
    }

    #[test]
    fn retire_and_reset() {
        let mut space = space(1000);
        space.allocate(5).unwrap();
        space.retire_lab().unwrap();
        assert_eq!(space.lab_remaining_words(), 0);
        assert_eq!(space.size_class_count(59), Ok(1));
        assert_eq!(space.free_words(), 995);

        space.allocate(500).unwrap();
        space.reset().unwrap();
        assert_eq!(space.free_words(), 1000);
        assert_eq!(space.dictionary_free_words(), 1000);
        assert_eq!(space.size_class_count(59), Ok(0));
        space.verify().unwrap();
    }

    #[test]
    fn verify_detects_clobbered_chunks() {
        let space = space(1000);
        space.allocate(5).unwrap();
        space.verify().unwrap();
        // Overwrite the tag of the dictionary's 936-word chunk.
        space.memory().write_word(at(64), 0).unwrap();
        assert!(space.verify().is_err());
    }

    #[test]
    fn scan_agrees_with_accounting() {
        let space = space(2048);
        let mut live = Vec::new();
        for (i, words) in [4, 9, 300, 17, 80, 3, 1000].into_iter().enumerate() {
            let block = space.allocate(words).unwrap();
            initialize(&space, block);
            if i % 2 == 0 {
                live.push(block);
            } else {
                space.free(block).unwrap();
            }
        }

        let report = space.scan_extents(&TaggedObjects, NoRecovery).unwrap();
        assert!(report.is_complete());
        assert_eq!(Ok(report.live_words(space.layout())), space.used_words());
        assert_eq!(report.free_words(space.layout()), space.free_words());
        for block in live {
            assert!(report
                .live_regions()
                .any(|r| r.contains(block.start) && block.end(space.layout()) <= r.end));
        }
    }

    #[test]
    fn empty_and_malformed_spaces() {
        configure(SpaceLayout::lp64()).unwrap();
        let memory = WordBuffer::new(BOTTOM, 8, 2);
        assert_eq!(
            FreeListSpace::<_, SingleThreadedLock>::new(&memory, BOTTOM, at(2), SpaceConfig::default())
                .err(),
            Some(SpaceError::InvalidBlock { start: BOTTOM, words: 2 })
        );

        let empty =
            FreeListSpace::<_, SingleThreadedLock>::new(&memory, BOTTOM, BOTTOM, SpaceConfig::default())
                .unwrap();
        assert_eq!(empty.free_words(), 0);
        assert_eq!(empty.to_string(), "[0x10000, 0x10000) capacity=0 used(0%)=0 free=0");
        assert_eq!(
            empty.allocate(1),
            Err(SpaceError::Exhausted { requested: 1 })
        );
    }

    #[test]
    fn concurrent_allocation() {
        let _ = env_logger::try_init();
        configure(SpaceLayout::lp64()).unwrap();
        let memory = WordBuffer::new(BOTTOM, 8, 1 << 16);
        let end = memory.end();
        let space =
            FreeListSpace::<_, SpinLock>::new(memory, BOTTOM, end, SpaceConfig::default()).unwrap();

        let done = std::sync::atomic::AtomicBool::new(false);

        std::thread::scope(|s| {
            let workers: Vec<_> = (0..4)
                .map(|t| {
                    let space = &space;
                    s.spawn(move || {
                        let mut blocks = Vec::new();
                        for i in 0..200 {
                            // Mostly LAB-sized, with some dictionary splits
                            // whose remainders land in size classes.
                            let words = if i % 10 == 0 {
                                200 + (t * 37 + i * 11) % 100
                            } else {
                                3 + (t * 7 + i * 13) % 60
                            };
                            blocks.push(space.allocate(words).unwrap());
                            if i % 3 == 0 {
                                space.free(blocks.swap_remove(0)).unwrap();
                            }
                        }
                        for block in blocks {
                            space.free(block).unwrap();
                        }
                    })
                })
                .collect();

            // Accounting never reports more free words than exist.
            s.spawn(|| {
                while !done.load(Ordering::Acquire) {
                    let free = space.free_words();
                    assert!(free <= space.capacity_words(), "{free} free words");
                    assert!(space.used_words().is_ok());
                }
            });

            for worker in workers {
                worker.join().unwrap();
            }
            done.store(true, Ordering::Release);
        });

        space.retire_lab().unwrap();
        space.verify().unwrap();
        assert_eq!(space.free_words(), space.capacity_words());
    }
}
