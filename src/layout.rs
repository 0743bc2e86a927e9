//! Layout constants shared by every space in the process.
//!
//! The constants describe the heap being managed (which may belong to another
//! process) rather than this process. They are passed in explicitly, once,
//! with [`configure`] before any space is created, and are immutable
//! afterwards.

use std::sync::OnceLock;

use crate::{Result, SpaceError};

static LAYOUT: OnceLock<SpaceLayout> = OnceLock::new();

/// The layout of the target heap.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SpaceLayout {
    /// Size of a heap word in bytes.
    pub heap_word_bytes: usize,

    /// Every object and chunk starts on, and is sized in multiples of, this
    /// many bytes.
    pub min_object_alignment_bytes: usize,

    /// The footprint of a free chunk's header in bytes. The minimum chunk size
    /// is this rounded up to the object alignment.
    pub free_chunk_bytes: usize,

    /// Sizes (in words) strictly below this are served by the segregated
    /// free lists; sizes at or above it go to the dictionary.
    pub index_set_size: usize,
}

impl SpaceLayout {
    /// The usual constants of a 64-bit heap.
    pub const fn lp64() -> Self {
        SpaceLayout {
            heap_word_bytes: 8,
            min_object_alignment_bytes: 8,
            free_chunk_bytes: 24,
            index_set_size: 257,
        }
    }

    /// Check that these constants describe a heap we can manage.
    pub fn validate(&self) -> Result<()> {
        if !self.heap_word_bytes.is_power_of_two() {
            return Err(SpaceError::InvalidLayout(
                "heap word size must be a power of two",
            ));
        }
        if !self.min_object_alignment_bytes.is_power_of_two()
            || self.min_object_alignment_bytes < self.heap_word_bytes
        {
            return Err(SpaceError::InvalidLayout(
                "object alignment must be a power-of-two multiple of the word size",
            ));
        }
        if self.free_chunk_bytes < crate::chunk::HEADER_WORDS * self.heap_word_bytes {
            return Err(SpaceError::InvalidLayout(
                "a free chunk must have room for its tag and link words",
            ));
        }
        if self.index_set_size <= self.index_set_start() {
            return Err(SpaceError::InvalidLayout(
                "the indexed set must contain at least one size class",
            ));
        }
        Ok(())
    }

    /// The smallest block, in bytes, that can be turned into a free chunk.
    pub fn min_chunk_bytes(&self) -> usize {
        num_quanta(self.free_chunk_bytes, self.min_object_alignment_bytes)
            * self.min_object_alignment_bytes
    }

    /// The smallest block, in words, that can be turned into a free chunk.
    pub fn min_chunk_words(&self) -> usize {
        self.min_chunk_bytes() / self.heap_word_bytes
    }

    /// The first size (in words) of the indexed set.
    pub fn index_set_start(&self) -> usize {
        self.min_object_alignment_bytes / self.heap_word_bytes
    }

    /// The distance (in words) between two consecutive size classes.
    pub fn index_set_stride(&self) -> usize {
        self.index_set_start()
    }

    /// Convert words to bytes.
    #[inline]
    pub fn words_to_bytes(&self, words: usize) -> usize {
        words * self.heap_word_bytes
    }

    /// Round an object size up to the space a block of that size occupies.
    pub fn adjust_object_words(&self, words: usize) -> usize {
        let stride = self.index_set_stride();
        num_quanta(words.max(self.min_chunk_words()), stride) * stride
    }

    /// Like [`SpaceLayout::adjust_object_words`], in bytes.
    pub fn adjust_object_bytes(&self, bytes: usize) -> usize {
        let align = self.min_object_alignment_bytes;
        num_quanta(bytes.max(self.min_chunk_bytes()), align) * align
    }
}

impl Default for SpaceLayout {
    fn default() -> Self {
        Self::lp64()
    }
}

/// The number of `quantum`-sized pieces needed to hold `x`.
#[inline]
fn num_quanta(x: usize, quantum: usize) -> usize {
    debug_assert!(quantum > 0);
    x.div_ceil(quantum)
}

/// Install the process-wide heap layout.
///
/// Must be called before creating any space. Calling it again with identical
/// constants is harmless and returns the installed layout; calling it with
/// different constants fails with [`SpaceError::AlreadyConfigured`].
pub fn configure(layout: SpaceLayout) -> Result<&'static SpaceLayout> {
    layout.validate()?;
    let installed = LAYOUT.get_or_init(|| {
        log::debug!("configuring heap layout: {layout:?}");
        layout
    });
    if *installed == layout {
        Ok(installed)
    } else {
        Err(SpaceError::AlreadyConfigured)
    }
}

/// Get the process-wide heap layout installed by [`configure`].
pub fn layout() -> Result<&'static SpaceLayout> {
    LAYOUT.get().ok_or(SpaceError::NotConfigured)
}
