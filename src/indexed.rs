//! Segregated free lists: one LIFO list of exactly-sized chunks per small size
//! class.

use core::sync::atomic::{AtomicUsize, Ordering};

use crate::lock::{Lock, Mutex};
use crate::{Address, Chunk, HeapMemoryMut, Result, SpaceError, SpaceLayout};

/// A single size class.
struct SizeClassBucket<L> {
    /// The size of every chunk on this list.
    nominal_words: usize,

    /// The most recently freed chunk.
    head: Mutex<Option<Address>, L>,

    /// The number of chunks on the list. Only written with `head` locked, but
    /// readable without the lock for accounting.
    count: AtomicUsize,
}

/// The segregated free lists for every size below the layout's
/// `index_set_size`.
///
/// Chunks are pushed and popped at the head, so both directions are O(1). No
/// coalescing happens here.
pub struct IndexedFreeLists<L> {
    stride: usize,
    /// The smallest legal size class.
    first: usize,
    /// One past the largest legal size class.
    limit: usize,
    /// Indexed by `words / stride`. Entries below `first` are never used.
    buckets: Box<[SizeClassBucket<L>]>,
}

impl<L> IndexedFreeLists<L>
where
    L: Lock + Default,
{
    /// Create empty lists for every size class of `layout`.
    pub fn new(layout: &SpaceLayout) -> Self {
        let stride = layout.index_set_stride();
        let first = layout.min_chunk_words().max(layout.index_set_start());
        let limit = layout.index_set_size;
        let buckets = (0..limit.div_ceil(stride))
            .map(|index| SizeClassBucket {
                nominal_words: index * stride,
                head: Mutex::new(None, L::default()),
                count: AtomicUsize::new(0),
            })
            .collect();
        IndexedFreeLists {
            stride,
            first,
            limit,
            buckets,
        }
    }
}

impl<L> IndexedFreeLists<L>
where
    L: Lock,
{
    /// Is `words` served by these lists rather than by the dictionary?
    #[inline]
    pub fn is_small(&self, words: usize) -> bool {
        words < self.limit
    }

    /// The size class holding `words`, ignoring whether `words` is a stride
    /// multiple.
    fn class_of(&self, words: usize) -> Result<&SizeClassBucket<L>> {
        if words < self.first || words >= self.limit {
            return Err(SpaceError::InvalidSizeClass { words });
        }
        Ok(&self.buckets[words / self.stride])
    }

    fn bucket(&self, words: usize) -> Result<&SizeClassBucket<L>> {
        if words % self.stride != 0 {
            return Err(SpaceError::InvalidSizeClass { words });
        }
        self.class_of(words)
    }

    /// Pop a chunk of exactly `words` words.
    pub fn allocate<M>(&self, memory: &M, layout: &SpaceLayout, words: usize) -> Result<Option<Chunk>>
    where
        M: HeapMemoryMut + ?Sized,
    {
        let bucket = self.bucket(words)?;
        let mut head = bucket.head.lock();
        let Some(start) = *head else {
            return Ok(None);
        };

        let chunk = Chunk::read(memory, layout, start)?;
        if chunk.words != bucket.nominal_words {
            return Err(SpaceError::CorruptChunk {
                addr: start,
                words: chunk.words,
            });
        }
        let count = bucket.count.load(Ordering::Relaxed);
        let count = count
            .checked_sub(1)
            .ok_or(SpaceError::AccountingUnderflow {
                total: count,
                removed: 1,
            })?;

        *head = chunk.next(memory, layout)?;
        bucket.count.store(count, Ordering::Relaxed);
        log::trace!("size class {words}: popped {start}, {count} left");
        Ok(Some(chunk))
    }

    /// Push `chunk` onto its size class. Its header must already be written.
    pub fn free<M>(&self, memory: &M, layout: &SpaceLayout, chunk: Chunk) -> Result<()>
    where
        M: HeapMemoryMut + ?Sized,
    {
        let bucket = self.class_of(chunk.words)?;
        if chunk.words != bucket.nominal_words {
            return Err(SpaceError::SizeClassMismatch {
                nominal: bucket.nominal_words,
                actual: chunk.words,
            });
        }

        let mut head = bucket.head.lock();
        chunk.set_next(memory, layout, *head)?;
        *head = Some(chunk.start);
        bucket.count.fetch_add(1, Ordering::Release);
        log::trace!("size class {}: pushed {}", chunk.words, chunk.start);
        Ok(())
    }

    /// Find a chunk in a larger size class that can be split to satisfy a
    /// request of `words` words, leaving at least a minimum chunk behind.
    pub fn best_fit<M>(&self, memory: &M, layout: &SpaceLayout, words: usize) -> Result<Option<Chunk>>
    where
        M: HeapMemoryMut + ?Sized,
    {
        let mut size = words + layout.min_chunk_words();
        while size < self.limit {
            if self.bucket(size)?.count.load(Ordering::Relaxed) > 0 {
                // Another thread may have emptied it since we looked.
                if let Some(chunk) = self.allocate(memory, layout, size)? {
                    return Ok(Some(chunk));
                }
            }
            size += self.stride;
        }
        Ok(None)
    }

    /// The number of free chunks in the size class for `words`.
    pub fn count(&self, words: usize) -> Result<usize> {
        Ok(self.bucket(words)?.count.load(Ordering::Relaxed))
    }

    /// The total number of free words across all size classes, read from the
    /// smallest class up.
    pub fn free_words(&self) -> usize {
        self.buckets
            .iter()
            .map(|b| b.count.load(Ordering::Acquire) * b.nominal_words)
            .sum()
    }

    /// Forget every chunk on every list.
    pub fn clear(&mut self) {
        for bucket in self.buckets.iter_mut() {
            *bucket.head.get_mut() = None;
            *bucket.count.get_mut() = 0;
        }
    }

    /// Walk every list, checking each chunk's tag against its size class and
    /// each list's length against its count, and hand each chunk to `check`.
    ///
    /// Every list is locked, in size order, for the duration of the walk.
    pub fn verify<M>(
        &self,
        memory: &M,
        layout: &SpaceLayout,
        mut check: impl FnMut(Chunk) -> Result<()>,
    ) -> Result<()>
    where
        M: HeapMemoryMut + ?Sized,
    {
        let locked: Vec<_> = self
            .buckets
            .iter()
            .skip(self.first / self.stride)
            .map(|bucket| (bucket, bucket.head.lock()))
            .collect();

        for (bucket, head) in &locked {
            let count = bucket.count.load(Ordering::Relaxed);
            let mut seen = 0;
            let mut cursor = **head;
            while let Some(start) = cursor {
                let chunk = Chunk::read(memory, layout, start)?;
                seen += 1;
                if chunk.words != bucket.nominal_words || seen > count {
                    return Err(SpaceError::CorruptChunk {
                        addr: start,
                        words: chunk.words,
                    });
                }
                check(chunk)?;
                cursor = chunk.next(memory, layout)?;
            }
            if seen != count {
                return Err(SpaceError::AccountingMismatch {
                    tracked: count * bucket.nominal_words,
                    found: seen * bucket.nominal_words,
                });
            }
        }
        Ok(())
    }
}
