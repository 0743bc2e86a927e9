//! A one-bit-per-heap-word liveness bitmap, as kept by a concurrent marking
//! collector.
//!
//! Ordinary marks set the bit of an object's first word. A block whose
//! header is not yet initialized can additionally be described with
//! *Printezis marks*: bits at its first and second words, plus one at its
//! last word. Because every block is at least three words long, the pair of
//! adjacent bits cannot be confused with two ordinary marks, and the next set
//! bit after them gives the block's end.

use core::sync::atomic::{AtomicUsize, Ordering};

use crate::scan::{BlockSize, BoundaryRecovery};
use crate::{Address, MemoryError, Result, SpaceError};

const BITS: usize = usize::BITS as usize;

/// A liveness bitmap covering `[bottom, end)`.
pub struct LivenessBitmap {
    bottom: Address,
    end: Address,
    word_bytes: usize,
    bits: Box<[AtomicUsize]>,
}

impl LivenessBitmap {
    /// A cleared bitmap covering `[bottom, end)` in words of `word_bytes`
    /// bytes.
    pub fn new(bottom: Address, end: Address, word_bytes: usize) -> Self {
        assert!(word_bytes.is_power_of_two());
        assert!(bottom.is_aligned(word_bytes) && end.is_aligned(word_bytes));
        assert!(bottom <= end);
        let words = end.bytes_since(bottom) / word_bytes;
        let bits = (0..words.div_ceil(BITS)).map(|_| AtomicUsize::new(0)).collect();
        LivenessBitmap {
            bottom,
            end,
            word_bytes,
            bits,
        }
    }

    /// The number of heap words covered.
    fn len(&self) -> usize {
        self.end.bytes_since(self.bottom) / self.word_bytes
    }

    fn index(&self, addr: Address) -> Result<usize, MemoryError> {
        if addr < self.bottom || addr >= self.end || !addr.is_aligned(self.word_bytes) {
            return Err(MemoryError { addr });
        }
        Ok(addr.bytes_since(self.bottom) / self.word_bytes)
    }

    fn address(&self, index: usize) -> Address {
        self.bottom.add_bytes(index * self.word_bytes)
    }

    fn set(&self, index: usize) {
        self.bits[index / BITS].fetch_or(1 << (index % BITS), Ordering::Release);
    }

    fn get(&self, index: usize) -> bool {
        self.bits[index / BITS].load(Ordering::Acquire) & (1 << (index % BITS)) != 0
    }

    /// Mark the word at `addr`.
    pub fn mark(&self, addr: Address) -> Result<(), MemoryError> {
        let index = self.index(addr)?;
        self.set(index);
        Ok(())
    }

    /// Is the word at `addr` marked? Addresses outside the bitmap never are.
    pub fn is_marked(&self, addr: Address) -> bool {
        self.index(addr).is_ok_and(|index| self.get(index))
    }

    /// Record the extent of an uninitialized block of `words` words at
    /// `start` with Printezis marks.
    ///
    /// Blocks shorter than three words cannot be described this way and are
    /// rejected with [`SpaceError::InvalidBlock`]. A block running past the
    /// end of the bitmap is a [`MemoryError`] at its last word.
    pub fn mark_block(&self, start: Address, words: usize) -> Result<()> {
        if words < 3 {
            return Err(SpaceError::InvalidBlock { start, words });
        }
        let first = self.index(start)?;
        let last = first + words - 1;
        if last >= self.len() {
            return Err(MemoryError {
                addr: self.address(last),
            }
            .into());
        }
        self.set(first);
        self.set(first + 1);
        self.set(last);
        Ok(())
    }

    /// The first marked address in `[from, limit)`, if any.
    pub fn next_marked(&self, from: Address, limit: Address) -> Option<Address> {
        let from = self.index(from).ok()?;
        let limit = if limit >= self.end {
            self.len()
        } else {
            limit.bytes_since(self.bottom).div_ceil(self.word_bytes)
        };

        let mut index = from;
        while index < limit {
            let word = self.bits[index / BITS].load(Ordering::Acquire) >> (index % BITS);
            if word != 0 {
                let found = index + word.trailing_zeros() as usize;
                return (found < limit).then(|| self.address(found));
            }
            index = (index / BITS + 1) * BITS;
        }
        None
    }

    /// Clear every mark.
    pub fn clear(&mut self) {
        for bits in self.bits.iter_mut() {
            *bits.get_mut() = 0;
        }
    }
}

impl BoundaryRecovery for LivenessBitmap {
    fn recover_block_size_at(&self, addr: Address) -> BlockSize {
        let Ok(first) = self.index(addr) else {
            return BlockSize::Unknown;
        };
        if first + 2 >= self.len() || !self.get(first) || !self.get(first + 1) {
            return BlockSize::Unknown;
        }
        match self.next_marked(self.address(first + 2), self.end) {
            Some(last) => BlockSize::Known(last.bytes_since(addr) / self.word_bytes + 1),
            None => BlockSize::Unknown,
        }
    }
}
