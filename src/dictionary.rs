//! The large-block dictionary.
//!
//! Free chunks too large for the segregated lists are kept in a splay tree
//! keyed by size in words. There is exactly one tree node per distinct size,
//! and each node owns a list of every free chunk of that size, threaded
//! through the chunks' own link words.
//!
//! Allocation is best-fit: we look for the smallest node whose size is at
//! least the requested size. The splay tree only answers "is there a node in
//! this range of sizes", so best-fit is a short loop that narrows the range
//! to sizes strictly smaller than the last node found until nothing is left.
//! Every node found this way was splayed to the root by the previous search,
//! so the loop usually terminates after a step or two.
//!
//! Because the tree splays, no sequence of sizes can degrade it into a list
//! for long: every operation is amortized O(log n) in the number of distinct
//! free sizes.

use super::*;
use metadata::{SizeNode, SizeRange, SizeTree};

/// Which chunk of a size to hand out first when several are free.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ChunkOrder {
    /// The most recently freed chunk. Reuses memory that is likely still in
    /// cache.
    #[default]
    Lifo,
    /// The least recently freed chunk.
    Fifo,
}

/// A size-keyed dictionary of free chunks.
#[derive(Default)]
pub struct TreeDictionary {
    tree: SizeTree,
    order: ChunkOrder,
    total_words: usize,
    chunks: usize,
    nodes: usize,
}

// Safety: every node reachable from `tree` was leaked by this dictionary and is
// only ever reachable through it, so moving the dictionary to another thread
// moves sole access to the nodes with it.
unsafe impl Send for TreeDictionary {}

impl TreeDictionary {
    /// Create an empty dictionary.
    pub fn new(order: ChunkOrder) -> Self {
        TreeDictionary {
            tree: SizeTree::new(),
            order,
            total_words: 0,
            chunks: 0,
            nodes: 0,
        }
    }

    /// The total size of every chunk in the dictionary, in words. Maintained
    /// incrementally.
    #[inline]
    pub fn total_free_words(&self) -> usize {
        self.total_words
    }

    /// The number of free chunks in the dictionary.
    #[inline]
    pub fn chunk_count(&self) -> usize {
        self.chunks
    }

    /// The number of distinct free chunk sizes in the dictionary.
    #[inline]
    pub fn node_count(&self) -> usize {
        self.nodes
    }

    /// The size of the largest free chunk, if any.
    pub fn largest_words(&mut self) -> Option<usize> {
        let mut largest = self.tree.find(&SizeRange::at_least(0))?.words();
        while let Some(larger) = self.tree.find(&SizeRange::at_least(largest + 1)) {
            largest = larger.words();
        }
        Some(largest)
    }

    /// The smallest node whose chunks are at least `min_words` long.
    fn best_fit(&mut self, min_words: usize) -> Option<&'static SizeNode<'static>> {
        let mut best = self.tree.find(&SizeRange::at_least(min_words))?;
        while let Some(smaller) = self.tree.find(&SizeRange {
            min: min_words,
            max: best.words() - 1,
        }) {
            best = smaller;
        }
        Some(best)
    }

    /// Take a chunk from the smallest size that is at least `min_words`.
    ///
    /// The chunk is returned whole; splitting off any excess is the caller's
    /// business.
    pub fn allocate<M>(
        &mut self,
        memory: &M,
        layout: &SpaceLayout,
        min_words: usize,
    ) -> Result<Option<Chunk>>
    where
        M: HeapMemoryMut + ?Sized,
    {
        let Some(node) = self.best_fit(min_words) else {
            return Ok(None);
        };

        let start = node.head().ok_or(SpaceError::AccountingMismatch {
            tracked: node.words() * node.len(),
            found: 0,
        })?;
        let chunk = Chunk::read(memory, layout, start)?;
        if chunk.words != node.words() {
            return Err(SpaceError::CorruptChunk {
                addr: start,
                words: chunk.words,
            });
        }
        let next = chunk.next(memory, layout)?;
        let total_words =
            self.total_words
                .checked_sub(chunk.words)
                .ok_or(SpaceError::AccountingUnderflow {
                    total: self.total_words,
                    removed: chunk.words,
                })?;

        node.pop_head(next);
        if node.len() == 0 {
            let removed = self.tree.remove(&node.words());
            debug_assert!(removed.is_some_and(|r| core::ptr::eq(r, node)));
            // Safety: the node was leaked by `free`, has just been removed from
            // the tree, and nothing else references it.
            unsafe { SizeNode::deallocate(node) };
            self.nodes -= 1;
        }

        self.total_words = total_words;
        self.chunks -= 1;
        log::trace!(
            "dictionary: took {} words at {start} for a request of {min_words}",
            chunk.words
        );
        Ok(Some(chunk))
    }

    /// Add a free chunk to the dictionary. Its header must already be written.
    pub fn free<M>(&mut self, memory: &M, layout: &SpaceLayout, chunk: Chunk) -> Result<()>
    where
        M: HeapMemoryMut + ?Sized,
    {
        debug_assert!(chunk.words >= layout.min_chunk_words());

        let existing = self.tree.find(&chunk.words);
        let (head, tail) = existing.map_or((None, None), |n| (n.head(), n.tail()));

        // Link the chunk into the list in the heap first, so that a failed
        // write leaves the dictionary untouched.
        let (head, tail) = match self.order {
            ChunkOrder::Lifo => {
                chunk.set_next(memory, layout, head)?;
                (Some(chunk.start), tail.or(Some(chunk.start)))
            }
            ChunkOrder::Fifo => {
                chunk.set_next(memory, layout, None)?;
                if let Some(tail) = tail {
                    Chunk::new(tail, chunk.words).set_next(memory, layout, Some(chunk.start))?;
                }
                (head.or(Some(chunk.start)), Some(chunk.start))
            }
        };

        let node = match existing {
            Some(node) => node,
            None => {
                let node = SizeNode::allocate(chunk.words);
                let inserted = self.tree.insert(node);
                debug_assert!(inserted);
                self.nodes += 1;
                node
            }
        };
        node.push(head, tail);

        self.total_words += chunk.words;
        self.chunks += 1;
        log::trace!("dictionary: added {} words at {}", chunk.words, chunk.start);
        Ok(())
    }

    /// Forget every chunk.
    pub fn clear(&mut self) {
        while let Some(node) = self.tree.pop_root() {
            // Safety: the node is out of the tree and only the tree referenced
            // it.
            unsafe { SizeNode::deallocate(node) };
        }
        self.total_words = 0;
        self.chunks = 0;
        self.nodes = 0;
    }

    /// Every `(size, number of chunks)` pair in the dictionary, in increasing
    /// size order.
    pub fn sizes(&mut self) -> Vec<(usize, usize)> {
        let mut sizes: Vec<_> = self
            .nodes()
            .into_iter()
            .map(|n| (n.words(), n.len()))
            .collect();
        sizes.sort_unstable();
        sizes
    }

    /// Take every node out of the tree and put it back, returning them.
    fn nodes(&mut self) -> Vec<&'static SizeNode<'static>> {
        let mut nodes = Vec::with_capacity(self.nodes);
        while let Some(node) = self.tree.pop_root() {
            nodes.push(node);
        }
        for &node in &nodes {
            self.tree.insert(node);
        }
        nodes
    }

    /// Walk every chunk list, checking tags, list lengths and the running
    /// totals, and hand each chunk to `check`.
    pub fn verify<M>(
        &mut self,
        memory: &M,
        layout: &SpaceLayout,
        mut check: impl FnMut(Chunk) -> Result<()>,
    ) -> Result<()>
    where
        M: HeapMemoryMut + ?Sized,
    {
        let nodes = self.nodes();
        let mut words = 0;
        let mut chunks = 0;
        for node in &nodes {
            let mut seen = 0;
            let mut last = None;
            let mut cursor = node.head();
            while let Some(start) = cursor {
                let chunk = Chunk::read(memory, layout, start)?;
                seen += 1;
                if chunk.words != node.words() || seen > node.len() {
                    return Err(SpaceError::CorruptChunk {
                        addr: start,
                        words: chunk.words,
                    });
                }
                check(chunk)?;
                last = Some(start);
                cursor = chunk.next(memory, layout)?;
            }
            if seen == 0 || seen != node.len() || last != node.tail() {
                return Err(SpaceError::AccountingMismatch {
                    tracked: node.len() * node.words(),
                    found: seen * node.words(),
                });
            }
            words += seen * node.words();
            chunks += seen;
        }
        if words != self.total_words || chunks != self.chunks || nodes.len() != self.nodes {
            return Err(SpaceError::AccountingMismatch {
                tracked: self.total_words,
                found: words,
            });
        }
        Ok(())
    }
}

impl Drop for TreeDictionary {
    fn drop(&mut self) {
        self.clear();
    }
}

mod metadata {
    use super::*;
    use core::cell::Cell;
    use core::cmp::Ordering;
    use intrusive_splay_tree::{Node, SplayTree, TreeOrd};

    /// A dictionary node: the list of free chunks of one size.
    ///
    /// Note: the `'a` lifetime is used internally to this module as much as
    /// possible to keep things free of `unsafe` when possible, but outside this
    /// module is always erased to `'static` and the lifetimes are manually
    /// managed.
    #[derive(Debug)]
    pub(super) struct SizeNode<'a> {
        words: usize,
        head: Cell<Option<Address>>,
        tail: Cell<Option<Address>>,
        len: Cell<usize>,
        node: Node<'a>,
    }

    impl SizeNode<'static> {
        /// Allocate an empty node for chunks of `words` words.
        pub(super) fn allocate(words: usize) -> &'static SizeNode<'static> {
            Box::leak(Box::new(SizeNode {
                words,
                head: Cell::new(None),
                tail: Cell::new(None),
                len: Cell::new(0),
                node: Node::default(),
            }))
        }

        /// Free a node created by `SizeNode::allocate`.
        ///
        /// ### Safety
        ///
        /// The node must not be in a tree or otherwise referenced by anything
        /// else.
        pub(super) unsafe fn deallocate(node: &'static SizeNode<'static>) {
            drop(Box::from_raw(node as *const SizeNode<'static> as *mut SizeNode<'static>));
        }
    }

    impl<'a> SizeNode<'a> {
        pub(super) fn words(&self) -> usize {
            self.words
        }

        pub(super) fn head(&self) -> Option<Address> {
            self.head.get()
        }

        pub(super) fn tail(&self) -> Option<Address> {
            self.tail.get()
        }

        pub(super) fn len(&self) -> usize {
            self.len.get()
        }

        /// Record a chunk that has already been linked into the list in the
        /// heap, leaving the list at `head..=tail`.
        pub(super) fn push(&self, head: Option<Address>, tail: Option<Address>) {
            self.head.set(head);
            self.tail.set(tail);
            self.len.set(self.len.get() + 1);
        }

        /// Drop the head chunk, whose successor is `next`.
        pub(super) fn pop_head(&self, next: Option<Address>) {
            debug_assert!(self.len.get() > 0);
            self.head.set(next);
            if next.is_none() {
                self.tail.set(None);
            }
            self.len.set(self.len.get() - 1);
        }
    }

    pub(super) struct BySize;
    pub(super) type SizeTree = SplayTree<'static, BySize>;

    /// Comparison between two nodes. There is never more than one node per
    /// size, so this is a total order.
    impl<'a> TreeOrd<'a, BySize> for SizeNode<'a> {
        fn tree_cmp(&self, other: &'a SizeNode<'a>) -> Ordering {
            self.words.cmp(&other.words)
        }
    }

    /// Comparison between an exact size and a node.
    impl<'a> TreeOrd<'a, BySize> for usize {
        fn tree_cmp(&self, node: &'a SizeNode<'a>) -> Ordering {
            self.cmp(&node.words)
        }
    }

    /// An inclusive range of sizes. Every node inside the range compares
    /// equal, so a search finds some node in the range if there is one.
    pub(super) struct SizeRange {
        pub(super) min: usize,
        pub(super) max: usize,
    }

    impl SizeRange {
        pub(super) fn at_least(min: usize) -> Self {
            SizeRange {
                min,
                max: usize::MAX,
            }
        }
    }

    impl<'a> TreeOrd<'a, BySize> for SizeRange {
        fn tree_cmp(&self, node: &'a SizeNode<'a>) -> Ordering {
            if node.words < self.min {
                Ordering::Greater
            } else if node.words > self.max {
                Ordering::Less
            } else {
                Ordering::Equal
            }
        }
    }

    intrusive_splay_tree::impl_intrusive_node! {
        impl<'a> IntrusiveNode<'a> for BySize
        where
            type Elem = SizeNode<'a>,
            node = node;
    }
}
