#![doc = include_str!("../README.md")]
#![deny(missing_docs)]

mod bitmap;
mod chunk;
mod dictionary;
mod error;
mod indexed;
mod lab;
mod layout;
mod lock;
mod memory;
mod scan;
mod space;

pub use bitmap::LivenessBitmap;
pub use chunk::{Chunk, ChunkTag, HEADER_WORDS};
pub use dictionary::{ChunkOrder, TreeDictionary};
pub use error::{MemoryError, Result, SpaceError};
pub use indexed::IndexedFreeLists;
pub use lab::LinearAllocBlock;
pub use layout::{configure, layout, SpaceLayout};
pub use lock::{Lock, SingleThreadedLock, SpinLock};
pub use memory::{Address, HeapMemory, HeapMemoryMut, WordBuffer};
pub use scan::{
    BlockSize, BoundaryRecovery, BoundaryScanner, Extent, ExtentKind, MemRegion, NoRecovery,
    ObjectModel, ScanReport,
};
pub use space::{FreeListSpace, HeapBlock, SpaceConfig};
