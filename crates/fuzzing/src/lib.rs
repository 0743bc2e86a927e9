//! Shared fuzzing and testing infrastructure for `freelist_space`.

use freelist_space::{
    configure, Address, BlockSize, ChunkOrder, Chunk, ExtentKind, FreeListSpace, HeapBlock,
    HeapMemory, HeapMemoryMut, LivenessBitmap, Lock, MemoryError, NoRecovery, ObjectModel,
    ScanReport, SingleThreadedLock, SpaceConfig, SpaceError, SpaceLayout, TreeDictionary,
    WordBuffer,
};
use mutatis::{mutators as m, DefaultMutate, Generate, Mutate};
use std::collections::{BTreeMap, VecDeque};

/// Where simulated heaps start.
pub const HEAP_BASE: Address = Address::new(0x10_0000);

/// A simulated object model: every object starts with a header word of
/// `size_in_words << 2 | 0b01`. Any other first word is not an object.
#[derive(Clone, Copy, Debug, Default)]
pub struct SimObjects;

impl SimObjects {
    /// Write the header for an object filling `block`.
    pub fn initialize<M>(memory: &M, block: HeapBlock) -> Result<(), MemoryError>
    where
        M: HeapMemoryMut + ?Sized,
    {
        memory.write_word(block.start, (block.words << 2) | 0b01)
    }
}

impl ObjectModel for SimObjects {
    fn object_size_at(
        &self,
        memory: &dyn HeapMemory,
        addr: Address,
    ) -> Result<BlockSize, MemoryError> {
        let header = memory.read_word(addr)?;
        Ok(if header & 0b11 == 0b01 && header >> 2 != 0 {
            BlockSize::Known(header >> 2)
        } else {
            BlockSize::Unknown
        })
    }
}

/// Configure the common 64-bit heap layout for tests.
pub fn configure_lp64() -> Result<&'static SpaceLayout, String> {
    configure(SpaceLayout::lp64()).map_err(|e| e.to_string())
}

/// A requested size, in words.
//
// Note: we define our own type rather than using a bare `usize` so that we can
// give it a default mutator biased towards the sizes the space treats
// specially.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct Words(pub usize);

impl DefaultMutate for Words {
    type DefaultMutate = WordsMutator;
}

/// The default mutator for [`Words`].
#[derive(Debug)]
pub struct WordsMutator {
    /// Sizes are usually below this, which is the size-class limit of the
    /// common layout.
    pub small_words: usize,
    /// Sizes are never above this.
    pub max_words: usize,
}

impl Default for WordsMutator {
    fn default() -> Self {
        Self {
            small_words: 257,
            max_words: 4096,
        }
    }
}

impl Mutate<Words> for WordsMutator {
    fn mutate(&mut self, c: &mut mutatis::Candidates<'_>, words: &mut Words) -> mutatis::Result<()> {
        c.mutation(|ctx| {
            let max = if ctx.shrink() { words.0 } else { self.max_words };
            words.0 = ctx.rng().gen_index(max.saturating_add(1)).unwrap();
            Ok(())
        })?;

        // Nudge the size across a boundary: the minimum chunk size, or the
        // size-class limit.
        if !c.shrink() {
            c.mutation(|ctx| {
                let boundary = if ctx.rng().gen_bool() { 3 } else { self.small_words };
                words.0 = boundary - 1 + ctx.rng().gen_index(3).unwrap();
                Ok(())
            })?;
        }

        Ok(())
    }
}

impl Generate<Words> for WordsMutator {
    fn generate(&mut self, ctx: &mut mutatis::Context) -> mutatis::Result<Words> {
        let max = if ctx.rng().gen_index(4) == Some(0) {
            self.max_words
        } else {
            self.small_words
        };
        Ok(Words(m::range(0..=max).generate(ctx)?))
    }
}

/// A test operation.
#[derive(Clone, Debug, Mutate, bincode::Encode, bincode::Decode)]
pub enum Op {
    /// Allocate a block, replacing any block with the same id.
    Alloc { id: u32, words: Words },
    /// Free a block.
    Free { id: u32 },
    /// Write an object header into a block, making it walkable.
    Init { id: u32 },
    /// Walk the space, recovering uninitialized blocks from a liveness bitmap
    /// or not.
    Scan { recover: bool },
    /// Give the LAB's tail back to the free lists.
    RetireLab,
    /// Free everything at once.
    Reset,
}

impl Op {
    fn id_mut(&mut self) -> Option<&mut u32> {
        match self {
            Op::Alloc { id, .. } | Op::Free { id } | Op::Init { id } => Some(id),
            Op::Scan { .. } | Op::RetireLab | Op::Reset => None,
        }
    }
}

impl Generate<Op> for OpMutator {
    fn generate(&mut self, ctx: &mut mutatis::Context) -> mutatis::Result<Op> {
        let choices: &[fn(&mut mutatis::Context) -> mutatis::Result<Op>] = &[
            |ctx| {
                Ok(Op::Alloc {
                    id: ctx.rng().gen_u32(),
                    words: m::default::<Words>().generate(ctx)?,
                })
            },
            |ctx| {
                Ok(Op::Alloc {
                    id: ctx.rng().gen_u32(),
                    words: m::default::<Words>().generate(ctx)?,
                })
            },
            |ctx| {
                Ok(Op::Free {
                    id: ctx.rng().gen_u32(),
                })
            },
            |ctx| {
                Ok(Op::Init {
                    id: ctx.rng().gen_u32(),
                })
            },
            |ctx| {
                Ok(Op::Scan {
                    recover: ctx.rng().gen_bool(),
                })
            },
            |_| Ok(Op::RetireLab),
            |_| Ok(Op::Reset),
        ];

        let f = ctx.rng().choose(choices).unwrap();
        f(ctx)
    }
}

/// A sequence of test operations to perform.
#[derive(Clone, Debug, Default, bincode::Encode, bincode::Decode)]
pub struct Ops {
    ops: Vec<Op>,
}

impl DefaultMutate for Ops {
    type DefaultMutate = OpsMutator;
}

/// The default mutator for [`Ops`].
#[derive(Default)]
pub struct OpsMutator;

impl Mutate<Ops> for OpsMutator {
    fn mutate(&mut self, c: &mut mutatis::Candidates<'_>, ops: &mut Ops) -> mutatis::Result<()> {
        // Completely random mutations on a single-element basis.
        m::default::<Vec<Op>>().mutate(c, &mut ops.ops)?;

        fn alloc_positions_and_ids(ops: &Ops) -> impl Iterator<Item = (usize, u32)> + '_ {
            ops.ops.iter().enumerate().filter_map(|(i, op)| match op {
                Op::Alloc { id, .. } => Some((i, *id)),
                _ => None,
            })
        }

        // Retarget an operation to an existing `id`.
        c.mutation(|ctx| {
            let num_allocs = alloc_positions_and_ids(ops).count();
            if let Some(alloc_index) = ctx.rng().gen_index(num_allocs) {
                let (_, new_id) = alloc_positions_and_ids(ops).nth(alloc_index).unwrap();
                let op_index = ctx.rng().gen_index(ops.ops.len()).unwrap();
                if let Some(id) = ops.ops[op_index].id_mut() {
                    *id = new_id;
                }
            }
            Ok(())
        })?;

        // Initialize or free an existing allocation at some later point.
        if !c.shrink() {
            c.mutation(|ctx| {
                let num_allocs = alloc_positions_and_ids(ops).count();
                if let Some(alloc_index) = ctx.rng().gen_index(num_allocs) {
                    let (op_index, id) = alloc_positions_and_ids(ops).nth(alloc_index).unwrap();
                    let op = if ctx.rng().gen_bool() {
                        Op::Init { id }
                    } else {
                        Op::Free { id }
                    };
                    let insert_index =
                        op_index + 1 + ctx.rng().gen_index(ops.ops.len() - op_index).unwrap();
                    ops.ops.insert(insert_index, op);
                }
                Ok(())
            })?;
        }

        Ok(())
    }
}

macro_rules! ensure {
    ( $cond:expr , $msg:expr $( , $args:expr )* $(,)? ) => {{
        let cond = $cond;
        if !cond {
            let msg = format!($msg $( , $args )* );
            let str_cond = stringify!($cond);
            return Err(format!("check failed: `{str_cond}`: {msg}"));
        }
    }};
}

/// A currently-live block.
#[derive(Clone, Copy, Debug)]
struct LiveBlock {
    block: HeapBlock,
    /// Has its object header been written?
    initialized: bool,
}

impl Ops {
    /// Create a new `Ops` from the given test operations.
    pub fn new(ops: impl IntoIterator<Item = Op>) -> Self {
        let ops = ops.into_iter().collect();
        Ops { ops }
    }

    /// Remove the last operation, returning whether there was one.
    pub fn pop(&mut self) -> bool {
        self.ops.pop().is_some()
    }

    /// Run these test operations against a fresh space of `capacity_words`
    /// words.
    pub fn run(&self, capacity_words: usize) -> Result<(), String> {
        configure_lp64()?;
        let memory = WordBuffer::new(HEAP_BASE, 8, capacity_words);
        let end = memory.end();
        let mut space =
            FreeListSpace::<_, SingleThreadedLock>::new(memory, HEAP_BASE, end, SpaceConfig::default())
                .map_err(|e| e.to_string())?;
        self.run_with_space(&mut space)
    }

    /// Run these test operations against the given space, which must be
    /// entirely free.
    pub fn run_with_space<L>(&self, space: &mut FreeListSpace<WordBuffer, L>) -> Result<(), String>
    where
        L: Lock,
    {
        log::debug!("========== Running test operations ==========");
        ensure!(
            space.free_words() == space.capacity_words(),
            "the space should start out empty",
        );

        let layout = space.layout();
        let mut live: BTreeMap<u32, LiveBlock> = BTreeMap::new();
        let fatal = |e: SpaceError| format!("unexpected error: {e}");

        // Free the block with the given id, checking the accounting.
        let free = |space: &FreeListSpace<WordBuffer, L>, id: u32, live: LiveBlock| {
            log::debug!("freeing id{id} -> {live:?}");
            let before = space.free_words();
            space.free(live.block).map_err(fatal)?;
            ensure!(
                space.free_words() == before + live.block.words,
                "freeing {} words should free exactly that many",
                live.block.words,
            );
            Ok::<(), String>(())
        };

        for op in &self.ops {
            log::debug!("Running {op:?}");

            match *op {
                Op::Alloc { id, words } => {
                    if let Some(old) = live.remove(&id) {
                        free(space, id, old)?;
                    }

                    let before = space.free_words();
                    let block = match space.allocate(words.0) {
                        Ok(block) => block,
                        Err(SpaceError::Exhausted { .. }) => continue,
                        Err(e) => return Err(fatal(e)),
                    };
                    log::debug!("allocated id{id} -> {block:?}");

                    let expected = layout.adjust_object_words(words.0);
                    ensure!(
                        block.words == expected,
                        "a request for {} words should get exactly {expected} words, got {}",
                        words.0,
                        block.words,
                    );
                    ensure!(
                        space.free_words() == before - block.words,
                        "allocating {} words should use up exactly that many",
                        block.words,
                    );
                    ensure!(
                        space.contains(block.start)
                            && block.end(layout) <= space.end()
                            && block.start.is_aligned(layout.min_object_alignment_bytes),
                        "allocated block {block:?} should be an aligned part of the space",
                    );
                    ensure!(
                        !space.is_free_chunk(block.start).map_err(fatal)?,
                        "an allocated block should not look like a free chunk",
                    );
                    for other in live.values() {
                        ensure!(
                            block.end(layout) <= other.block.start
                                || other.block.end(layout) <= block.start,
                            "{block:?} overlaps live block {:?}",
                            other.block,
                        );
                    }

                    live.insert(
                        id,
                        LiveBlock {
                            block,
                            initialized: false,
                        },
                    );
                }

                Op::Free { id } => {
                    if let Some(old) = live.remove(&id) {
                        free(space, id, old)?;
                    }
                }

                Op::Init { id } => {
                    if let Some(l) = live.get_mut(&id) {
                        SimObjects::initialize(space.memory(), l.block)
                            .map_err(|e| fatal(e.into()))?;
                        l.initialized = true;
                    }
                }

                Op::Scan { recover } => {
                    let report = if recover {
                        let bitmap = LivenessBitmap::new(space.bottom(), space.end(), 8);
                        for l in live.values().filter(|l| !l.initialized) {
                            bitmap
                                .mark_block(l.block.start, l.block.words)
                                .map_err(fatal)?;
                        }
                        space.scan_extents(&SimObjects, &bitmap)
                    } else {
                        space.scan_extents(&SimObjects, NoRecovery)
                    }
                    .map_err(fatal)?;

                    let first_uninitialized = live
                        .values()
                        .filter(|l| !l.initialized)
                        .map(|l| l.block.start)
                        .min();
                    check_report(space, &report, if recover { None } else { first_uninitialized })?;
                    if report.is_complete() {
                        ensure!(
                            Ok(report.live_words(layout)) == space.used_words(),
                            "a complete scan should find every used word",
                        );
                    }
                    for l in live.values() {
                        let covered = report
                            .live_regions()
                            .any(|r| r.contains(l.block.start) && l.block.end(layout) <= r.end);
                        let reached = report.stopped_at.map_or(true, |at| l.block.start < at);
                        ensure!(
                            covered == reached,
                            "live block {:?} should be inside a live region exactly when the scan reached it",
                            l.block,
                        );
                    }
                }

                Op::RetireLab => {
                    let before = space.free_words();
                    space.retire_lab().map_err(fatal)?;
                    ensure!(
                        space.free_words() == before,
                        "retiring the LAB should not change the free total",
                    );
                }

                Op::Reset => {
                    space.reset().map_err(fatal)?;
                    live.clear();
                    ensure!(
                        space.free_words() == space.capacity_words(),
                        "a reset space should be entirely free",
                    );
                }
            }

            ensure!(
                space.used_words().map_err(fatal)? + space.free_words() == space.capacity_words(),
                "free and used words should add up to the capacity",
            );
        }

        space.verify().map_err(fatal)?;

        // Finally, free any remaining live blocks.
        for (id, block) in std::mem::take(&mut live) {
            free(space, id, block)?;
        }
        space.retire_lab().map_err(fatal)?;
        ensure!(
            space.free_words() == space.capacity_words(),
            "everything should be free again",
        );
        space.verify().map_err(fatal)?;

        Ok(())
    }
}

/// Check that a scan report partitions the space from its bottom up to where
/// it stopped, and that it stopped where expected.
pub fn check_report<M, L>(
    space: &FreeListSpace<M, L>,
    report: &ScanReport,
    expected_stop: Option<Address>,
) -> Result<(), String>
where
    M: HeapMemoryMut,
    L: Lock,
{
    ensure!(
        report.stopped_at == expected_stop,
        "scan stopped at {:?}, expected {expected_stop:?}",
        report.stopped_at,
    );

    let end = report.stopped_at.unwrap_or(space.end());
    let mut cursor = space.bottom();
    let mut last_kind = None;
    for extent in &report.extents {
        ensure!(
            extent.region.start == cursor,
            "extents should be gap-free and ordered: expected {cursor}, got {:?}",
            extent.region,
        );
        ensure!(!extent.region.is_empty(), "extents should not be empty");
        ensure!(
            !(extent.kind == ExtentKind::Live && last_kind == Some(ExtentKind::Live)),
            "adjacent live extents should have been merged",
        );
        cursor = extent.region.end;
        last_kind = Some(extent.kind);
    }
    ensure!(
        cursor == end,
        "extents should cover the space up to {end}, but stop at {cursor}",
    );
    Ok(())
}

/// A test operation against a lone dictionary.
#[derive(Clone, Debug, Mutate)]
pub enum DictOp {
    /// Add a free chunk of this size.
    Insert { words: Words },
    /// Take the best-fitting chunk for this size.
    Take { words: Words },
}

impl Generate<DictOp> for DictOpMutator {
    fn generate(&mut self, ctx: &mut mutatis::Context) -> mutatis::Result<DictOp> {
        let words = m::default::<Words>().generate(ctx)?;
        Ok(if ctx.rng().gen_bool() {
            DictOp::Insert { words }
        } else {
            DictOp::Take { words }
        })
    }
}

/// Run dictionary operations, checking every answer against a simple model:
/// a sorted map from size to the addresses of the free chunks of that size.
pub fn run_dictionary_ops(ops: &[DictOp], order: ChunkOrder) -> Result<(), String> {
    let layout = SpaceLayout::lp64();
    let min_chunk = layout.min_chunk_words();
    let fatal = |e: SpaceError| format!("unexpected error: {e}");

    let inserted: usize = ops
        .iter()
        .map(|op| match op {
            DictOp::Insert { words } => words.0.max(min_chunk),
            DictOp::Take { .. } => 0,
        })
        .sum();
    let memory = WordBuffer::new(HEAP_BASE, 8, inserted);
    let mut next = HEAP_BASE;

    let mut dictionary = TreeDictionary::new(order);
    let mut model: BTreeMap<usize, VecDeque<Address>> = BTreeMap::new();

    for op in ops {
        log::debug!("Running {op:?}");
        match *op {
            DictOp::Insert { words } => {
                let chunk = Chunk::new(next, words.0.max(min_chunk));
                next = chunk.end(&layout);
                chunk
                    .write_header(&memory, &layout)
                    .map_err(|e| fatal(e.into()))?;
                dictionary.free(&memory, &layout, chunk).map_err(fatal)?;
                let list = model.entry(chunk.words).or_default();
                match order {
                    ChunkOrder::Lifo => list.push_front(chunk.start),
                    ChunkOrder::Fifo => list.push_back(chunk.start),
                }
            }

            DictOp::Take { words } => {
                let actual = dictionary.allocate(&memory, &layout, words.0).map_err(fatal)?;
                let expected = match model.range_mut(words.0..).next() {
                    Some((&size, list)) => {
                        let start = list.pop_front().ok_or("empty model list")?;
                        if list.is_empty() {
                            model.remove(&size);
                        }
                        Some(Chunk::new(start, size))
                    }
                    None => None,
                };
                ensure!(
                    actual == expected,
                    "best fit for {} words: expected {expected:?}, got {actual:?}",
                    words.0,
                );
            }
        }

        let total: usize = model.iter().map(|(size, list)| size * list.len()).sum();
        let chunks: usize = model.values().map(VecDeque::len).sum();
        ensure!(
            dictionary.total_free_words() == total,
            "running total {} should be {total}",
            dictionary.total_free_words(),
        );
        ensure!(dictionary.chunk_count() == chunks, "wrong chunk count");
        ensure!(dictionary.node_count() == model.len(), "wrong node count");
    }

    dictionary
        .verify(&memory, &layout, |_| Ok(()))
        .map_err(fatal)?;
    Ok(())
}
