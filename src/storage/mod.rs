//! Block Storage Module
//!
//! Persists arbitrary-length byte records as chains of fixed-size blocks
//! inside a single file, with a singly linked free list for reuse.
//!
//! ## File Format
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ Header page (16 KiB)                                          │
//! │   [0 .. 16320)      head area, owned by the layer above       │
//! │   [16320 .. 16384)  common header (magic, free head, count)   │
//! ├──────────────────────────────────────────────────────────────┤
//! │ Block 0  [status:u8][mark:u8][chunk:i16][total:i32][next:i64] │
//! │          [payload: block_capacity bytes]                      │
//! ├──────────────────────────────────────────────────────────────┤
//! │ Block 1 ...                                                   │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! A block index is the record handle (`BlockId`). Records longer than one
//! block's capacity continue in blocks linked through `next`; empty blocks
//! use the same field as the free-list link.
//!
//! ## Backends
//!
//! The block/free-list logic lives in [`BlockFile`] and is shared by all
//! backends. A backend is a [`BlockDevice`] that reads and writes bytes at
//! absolute file positions:
//! - [`MmapDevice`]: memory-mapped file (default)
//! - [`MemoryDevice`]: heap buffers, nothing persisted
//! - [`DirectDevice`]: O_DIRECT with its own write-back page cache
//!
//! Storage instances are not internally synchronized; callers serialize
//! access (the table lock does this for every storage a table owns).

mod aligned;
mod block;
mod device;
mod direct;
mod file;
mod header;
mod memory;
mod mmap;
pub(crate) mod pio;

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::{StorageBackend, StorageOptions};
use crate::error::Result;

pub use aligned::AlignedBuf;
pub use block::{BlockHeader, Mark, Status, BLOCK_HEADER_BYTES};
pub use device::BlockDevice;
pub use direct::DirectDevice;
pub use file::BlockFile;
pub use header::{StorageHeader, COMMON_HEADER_BYTES, HEADER_BYTES, HEAD_BYTES};
pub use memory::MemoryDevice;
pub use mmap::MmapDevice;

/// Memory-mapped block storage
pub type MmapStorage = BlockFile<MmapDevice>;

/// In-process block storage
pub type MemoryStorage = BlockFile<MemoryDevice>;

/// Direct I/O block storage
pub type DirectStorage = BlockFile<DirectDevice>;

// =============================================================================
// Block Handle
// =============================================================================

/// Index of a block inside a storage file
///
/// `BlockId::NONE` is the reserved "no block" sentinel; on disk it is
/// encoded as `-1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockId(u64);

impl BlockId {
    /// The "no block" sentinel
    pub const NONE: BlockId = BlockId(u64::MAX);

    pub const fn new(index: u64) -> Self {
        BlockId(index)
    }

    /// Raw block index
    pub const fn get(self) -> u64 {
        self.0
    }

    pub const fn is_none(self) -> bool {
        self.0 == u64::MAX
    }

    /// On-disk encoding (`-1` for NONE)
    pub(crate) fn to_disk(self) -> i64 {
        if self.is_none() {
            -1
        } else {
            self.0 as i64
        }
    }

    /// Decode an on-disk pointer; any negative value is NONE
    pub(crate) fn from_disk(raw: i64) -> Self {
        if raw < 0 {
            BlockId::NONE
        } else {
            BlockId(raw as u64)
        }
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "none")
        } else {
            write!(f, "#{}", self.0)
        }
    }
}

// =============================================================================
// Storage Interface
// =============================================================================

/// Record-level interface of a block storage file
pub trait BlockStorage: Send {
    /// Store a new record, returning its first block
    fn write(&mut self, payload: &[u8]) -> Result<BlockId>;

    /// Overwrite the record starting at `id`, keeping `id` as its first block.
    ///
    /// An empty block is claimed in place.
    fn write_at(&mut self, id: BlockId, payload: &[u8]) -> Result<()>;

    /// Read the record starting at `id`
    fn read(&mut self, id: BlockId) -> Result<Vec<u8>>;

    /// Free the record starting at `id` and its continuation chain.
    ///
    /// Returns `false` if the block was already empty.
    fn delete(&mut self, id: BlockId) -> Result<bool>;

    /// Read from the head area of the header page
    fn read_head(&mut self, offset: usize, len: usize) -> Result<Vec<u8>>;

    /// Write into the head area of the header page
    fn write_head(&mut self, offset: usize, data: &[u8]) -> Result<()>;

    /// Number of live blocks (continuation blocks included)
    fn count(&self) -> u64;

    /// Bytes occupied by the file
    fn bytes(&self) -> u64;

    /// Payload capacity of one block
    fn block_capacity(&self) -> usize;

    /// Write back process-level caches to the file
    fn flush(&mut self) -> Result<()>;

    /// Flush and make the file durable
    fn sync(&mut self) -> Result<()>;
}

/// Open a block storage with the backend named in `options`.
///
/// `path` is ignored by the memory backend.
pub fn open_storage(path: &Path, options: &StorageOptions) -> Result<Box<dyn BlockStorage>> {
    options.validate()?;
    let storage: Box<dyn BlockStorage> = match options.backend {
        StorageBackend::Mmap => Box::new(MmapStorage::open(path, options)?),
        StorageBackend::Memory => Box::new(MemoryStorage::open_in_memory(options)?),
        StorageBackend::Direct => Box::new(DirectStorage::open(path, options)?),
    };
    Ok(storage)
}
