//! Boundary reconstruction: partitioning a heap range into live and free
//! extents by walking it from bottom to top.
//!
//! At each position the walker asks, in order:
//!
//! 1. Is there a free-chunk tag here? Then the chunk's size says where the
//!    next block starts.
//!
//! 2. Does the object model recognize a live object here? Then its size,
//!    adjusted the way the allocator adjusts requests, says where the next
//!    block starts.
//!
//! 3. Otherwise the position belongs to a block whose header cannot be
//!    trusted yet, typically one allocated while a concurrent collector was
//!    marking. The collector's boundary recovery (for example a
//!    [`LivenessBitmap`](crate::LivenessBitmap)) may still know the block's
//!    size. If it doesn't, the walk stops: reporting nothing about the rest of
//!    the range is better than misclassifying it.
//!
//! The walker takes no locks, never writes, and never retries. It may run
//! concurrently with mutators and collectors, or against memory belonging to
//! another process, and reports what it could see.

use core::fmt;

use crate::{Address, HeapMemory, MemoryError, Result, SpaceError, SpaceLayout};

/// The answer to "how big is the block here?".
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockSize {
    /// The block is this many words long.
    Known(usize),
    /// The size cannot be determined.
    Unknown,
}

/// Recognizes live objects from their in-place headers.
pub trait ObjectModel {
    /// The size in words of the object starting at `addr`, or
    /// [`BlockSize::Unknown`] if no initialized object header is there.
    ///
    /// Must never recognize a word carrying a free-chunk tag.
    fn object_size_at(
        &self,
        memory: &dyn HeapMemory,
        addr: Address,
    ) -> Result<BlockSize, MemoryError>;
}

/// Recovers block boundaries that in-place headers cannot yet describe.
///
/// Implementations must never over-report: a known size must not extend past
/// the true end of the block.
pub trait BoundaryRecovery {
    /// The size in words of the block starting at `addr`, if known.
    fn recover_block_size_at(&self, addr: Address) -> BlockSize;
}

/// Boundary recovery for when no concurrent collector is running.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoRecovery;

impl BoundaryRecovery for NoRecovery {
    #[inline]
    fn recover_block_size_at(&self, _addr: Address) -> BlockSize {
        BlockSize::Unknown
    }
}

impl<T> BoundaryRecovery for &T
where
    T: BoundaryRecovery + ?Sized,
{
    #[inline]
    fn recover_block_size_at(&self, addr: Address) -> BlockSize {
        (**self).recover_block_size_at(addr)
    }
}

/// A half-open range of heap addresses, `[start, end)`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MemRegion {
    /// The first address in the region.
    pub start: Address,
    /// One past the last address in the region.
    pub end: Address,
}

impl MemRegion {
    /// Create the region `[start, end)`.
    pub fn new(start: Address, end: Address) -> Self {
        debug_assert!(start <= end);
        MemRegion { start, end }
    }

    /// Is the region empty?
    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    /// The region's size in bytes.
    pub fn byte_size(&self) -> usize {
        self.end.bytes_since(self.start)
    }

    /// The region's size in words.
    pub fn word_size(&self, layout: &SpaceLayout) -> usize {
        self.byte_size() / layout.heap_word_bytes
    }

    /// Does the region contain `addr`?
    pub fn contains(&self, addr: Address) -> bool {
        self.start <= addr && addr < self.end
    }

    /// Do the two regions share any address?
    pub fn overlaps(&self, other: &MemRegion) -> bool {
        self.start < other.end && other.start < self.end
    }
}

impl fmt::Display for MemRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

impl fmt::Debug for MemRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// What an extent of a scanned range holds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExtentKind {
    /// One or more adjacent blocks that are not free chunks.
    Live,
    /// A single free chunk.
    Free,
}

/// A classified piece of a scanned range.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Extent {
    /// The addresses covered.
    pub region: MemRegion,
    /// Whether they are live or free.
    pub kind: ExtentKind,
}

/// The result of scanning `[bottom, limit)`.
///
/// The extents are ordered, disjoint and gap-free, and cover `[bottom, end)`
/// where `end` is `limit` for a complete scan, or the position the scan stopped
/// at otherwise.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ScanReport {
    /// The classified extents, in address order.
    pub extents: Vec<Extent>,
    /// Where the scan gave up, if it could not classify the whole range.
    pub stopped_at: Option<Address>,
}

impl ScanReport {
    /// Did the scan classify the whole range?
    pub fn is_complete(&self) -> bool {
        self.stopped_at.is_none()
    }

    /// The live extents, in address order.
    pub fn live_regions(&self) -> impl Iterator<Item = MemRegion> + '_ {
        self.extents
            .iter()
            .filter(|e| e.kind == ExtentKind::Live)
            .map(|e| e.region)
    }

    /// The total size of the live extents, in words.
    pub fn live_words(&self, layout: &SpaceLayout) -> usize {
        self.live_regions().map(|r| r.word_size(layout)).sum()
    }

    /// The total size of the free extents, in words.
    pub fn free_words(&self, layout: &SpaceLayout) -> usize {
        self.extents
            .iter()
            .filter(|e| e.kind == ExtentKind::Free)
            .map(|e| e.region.word_size(layout))
            .sum()
    }
}

/// Walks heap ranges, classifying blocks. See the module docs.
pub struct BoundaryScanner<'a, M, O: ?Sized, R> {
    memory: M,
    layout: &'a SpaceLayout,
    objects: &'a O,
    recovery: R,
}

impl<'a, M, O, R> BoundaryScanner<'a, M, O, R>
where
    M: HeapMemory,
    O: ObjectModel + ?Sized,
    R: BoundaryRecovery,
{
    /// Create a scanner reading `memory`.
    pub fn new(memory: M, layout: &'a SpaceLayout, objects: &'a O, recovery: R) -> Self {
        BoundaryScanner {
            memory,
            layout,
            objects,
            recovery,
        }
    }

    /// The live regions of `[bottom, limit)`, in address order.
    pub fn scan(&self, bottom: Address, limit: Address) -> Result<Vec<MemRegion>> {
        Ok(self.scan_extents(bottom, limit)?.live_regions().collect())
    }

    /// Classify `[bottom, limit)` into live and free extents.
    ///
    /// Stopping on an unresolvable block is not an error. Only
    /// self-contradictory heap data (a zero-sized chunk or block) or a failed
    /// memory read is.
    pub fn scan_extents(&self, bottom: Address, limit: Address) -> Result<ScanReport> {
        let mut report = ScanReport::default();
        let mut push = |start: Address, end: Address, kind| {
            if start < end {
                report.extents.push(Extent {
                    region: MemRegion::new(start, end),
                    kind,
                });
            }
        };

        let mut cur = bottom;
        let mut region_start = bottom;
        let mut stopped_at = None;

        while cur < limit {
            if let Some(tag) = self.memory.read_tag_at(cur)? {
                if tag.words == 0 {
                    return Err(SpaceError::CorruptChunk {
                        addr: cur,
                        words: 0,
                    });
                }
                push(region_start, cur, ExtentKind::Live);
                let next = self.advance(cur, limit, tag.words);
                push(cur, next.min(limit), ExtentKind::Free);
                cur = next;
                region_start = cur;
                continue;
            }

            let size = match self.objects.object_size_at(&self.memory, cur)? {
                BlockSize::Known(words) => words,
                BlockSize::Unknown => match self.recovery.recover_block_size_at(cur) {
                    BlockSize::Known(words) => words,
                    BlockSize::Unknown => {
                        log::debug!("scan of [{bottom}, {limit}) stopped at unresolvable {cur}");
                        stopped_at = Some(cur);
                        break;
                    }
                },
            };
            if size == 0 {
                return Err(SpaceError::CorruptBlock { addr: cur });
            }
            cur = self.advance(cur, limit, self.layout.adjust_object_words(size));
        }

        push(region_start, cur.min(limit), ExtentKind::Live);
        report.stopped_at = stopped_at;
        Ok(report)
    }

    /// Step `words` words past `cur`, without stepping past the word
    /// containing `limit`. Garbage sizes cannot overflow.
    fn advance(&self, cur: Address, limit: Address, words: usize) -> Address {
        let remaining = limit.bytes_since(cur).div_ceil(self.layout.heap_word_bytes);
        cur.add_bytes(self.layout.words_to_bytes(words.min(remaining)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::encode_tag;
    use crate::{HeapMemoryMut, LivenessBitmap, WordBuffer};

    /// Objects start with `words << 2 | 0b01`. Anything else is unknown.
    struct TaggedObjects;

    impl ObjectModel for TaggedObjects {
        fn object_size_at(
            &self,
            memory: &dyn HeapMemory,
            addr: Address,
        ) -> Result<BlockSize, MemoryError> {
            let word = memory.read_word(addr)?;
            Ok(if word & 0b11 == 0b01 && word >> 2 > 0 {
                BlockSize::Known(word >> 2)
            } else {
                BlockSize::Unknown
            })
        }
    }

    const BASE: usize = 0x4000;

    fn at(word: usize) -> Address {
        Address::new(BASE + word * 8)
    }

    fn object(mem: &WordBuffer, word: usize, words: usize) {
        mem.write_word(at(word), (words << 2) | 0b01).unwrap();
    }

    fn chunk(mem: &WordBuffer, word: usize, words: usize) {
        mem.write_word(at(word), encode_tag(words)).unwrap();
    }

    fn region(start: usize, end: usize) -> MemRegion {
        MemRegion::new(at(start), at(end))
    }

    fn setup(words: usize) -> (SpaceLayout, WordBuffer) {
        (
            SpaceLayout::lp64(),
            WordBuffer::new(Address::new(BASE), 8, words),
        )
    }

    #[test]
    fn live_object_followed_by_free_space() {
        let (layout, mem) = setup(1000);
        object(&mem, 0, 40);
        chunk(&mem, 40, 960);
        let scanner = BoundaryScanner::new(&mem, &layout, &TaggedObjects, NoRecovery);
        assert_eq!(scanner.scan(at(0), at(1000)), Ok(vec![region(0, 40)]));
    }

    #[test]
    fn partitions_the_range() {
        let (layout, mem) = setup(100);
        chunk(&mem, 0, 10);
        object(&mem, 10, 5);
        object(&mem, 15, 1); // Occupies a minimum block of 3 words.
        chunk(&mem, 18, 12);
        object(&mem, 30, 70);

        let scanner = BoundaryScanner::new(&mem, &layout, &TaggedObjects, NoRecovery);
        let report = scanner.scan_extents(at(0), at(100)).unwrap();
        assert!(report.is_complete());
        assert_eq!(
            report.extents,
            [
                Extent {
                    region: region(0, 10),
                    kind: ExtentKind::Free
                },
                Extent {
                    region: region(10, 18),
                    kind: ExtentKind::Live
                },
                Extent {
                    region: region(18, 30),
                    kind: ExtentKind::Free
                },
                Extent {
                    region: region(30, 100),
                    kind: ExtentKind::Live
                },
            ]
        );
        assert_eq!(report.live_words(&layout), 78);
        assert_eq!(report.free_words(&layout), 22);

        let mut prev_end = at(0);
        for e in &report.extents {
            assert_eq!(e.region.start, prev_end);
            prev_end = e.region.end;
        }
        assert_eq!(prev_end, at(100));
    }

    #[test]
    fn stops_normally_on_an_unresolvable_word() {
        let (layout, mem) = setup(64);
        object(&mem, 0, 8);
        chunk(&mem, 8, 8);
        // Words 16.. hold an object whose header has not been written yet,
        // followed by more objects and free space that must not be reported.
        object(&mem, 24, 8);
        chunk(&mem, 32, 32);

        let scanner = BoundaryScanner::new(&mem, &layout, &TaggedObjects, NoRecovery);
        let report = scanner.scan_extents(at(0), at(64)).unwrap();
        assert_eq!(report.stopped_at, Some(at(16)));
        assert!(report.extents.iter().all(|e| e.region.end <= at(16)));
        assert_eq!(scanner.scan(at(0), at(64)), Ok(vec![region(0, 8)]));
    }

    #[test]
    fn recovers_sizes_from_the_liveness_bitmap() {
        let (layout, mem) = setup(64);
        object(&mem, 0, 8);
        chunk(&mem, 8, 8);
        object(&mem, 24, 8);
        chunk(&mem, 32, 32);

        let bitmap = LivenessBitmap::new(at(0), at(64), 8);
        bitmap.mark_block(at(16), 8).unwrap();

        let scanner = BoundaryScanner::new(&mem, &layout, &TaggedObjects, &bitmap);
        let report = scanner.scan_extents(at(0), at(64)).unwrap();
        assert!(report.is_complete());
        assert_eq!(
            report.live_regions().collect::<Vec<_>>(),
            [region(0, 8), region(16, 32)]
        );
    }

    #[test]
    fn zero_sized_chunk_is_fatal() {
        let (layout, mem) = setup(16);
        object(&mem, 0, 4);
        chunk(&mem, 4, 0);
        let scanner = BoundaryScanner::new(&mem, &layout, &TaggedObjects, NoRecovery);
        assert_eq!(
            scanner.scan(at(0), at(16)),
            Err(SpaceError::CorruptChunk {
                addr: at(4),
                words: 0
            })
        );
    }

    #[test]
    fn zero_sized_recovery_is_fatal() {
        struct Zero;
        impl BoundaryRecovery for Zero {
            fn recover_block_size_at(&self, _: Address) -> BlockSize {
                BlockSize::Known(0)
            }
        }

        let (layout, mem) = setup(16);
        let scanner = BoundaryScanner::new(&mem, &layout, &TaggedObjects, Zero);
        assert_eq!(
            scanner.scan(at(0), at(16)),
            Err(SpaceError::CorruptBlock { addr: at(0) })
        );
    }

    #[test]
    fn regions_are_clipped_to_the_limit() {
        let (layout, mem) = setup(64);
        object(&mem, 0, 20);
        chunk(&mem, 20, 44);
        let scanner = BoundaryScanner::new(&mem, &layout, &TaggedObjects, NoRecovery);

        assert_eq!(scanner.scan(at(0), at(10)), Ok(vec![region(0, 10)]));
        let report = scanner.scan_extents(at(0), at(30)).unwrap();
        assert_eq!(report.extents.last().unwrap().region, region(20, 30));
        assert_eq!(scanner.scan(at(20), at(64)), Ok(vec![]));
        assert_eq!(scanner.scan(at(5), at(5)), Ok(vec![]));
    }

    #[test]
    fn huge_sizes_do_not_overflow() {
        let (layout, mem) = setup(8);
        mem.write_word(at(0), encode_tag(usize::MAX >> 2)).unwrap();
        let scanner = BoundaryScanner::new(&mem, &layout, &TaggedObjects, NoRecovery);
        let report = scanner.scan_extents(at(0), at(8)).unwrap();
        assert_eq!(
            report.extents,
            [Extent {
                region: region(0, 8),
                kind: ExtentKind::Free
            }]
        );
    }

    #[test]
    fn region_helpers() {
        let layout = SpaceLayout::lp64();
        let r = region(2, 6);
        assert_eq!(r.byte_size(), 32);
        assert_eq!(r.word_size(&layout), 4);
        assert!(r.contains(at(2)));
        assert!(!r.contains(at(6)));
        assert!(r.overlaps(&region(5, 9)));
        assert!(!r.overlaps(&region(6, 9)));
        assert_eq!(r.to_string(), "[0x4010, 0x4030)");
    }
}
