//! Configuration for AtlasDB
//!
//! Centralized configuration with sensible defaults. Each layer has its own
//! option struct and builder; the table layer combines them in its `Meta`.

use crate::error::{AtlasError, Result};
use crate::storage::BLOCK_HEADER_BYTES;

// =============================================================================
// Storage Configuration
// =============================================================================

/// I/O strategy of a block storage file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    /// Memory-mapped file (OS page cache)
    Mmap,

    /// Heap buffers only, nothing is persisted
    Memory,

    /// O_DIRECT file I/O with an internal write-back page cache
    Direct,
}

/// Options for opening a block storage file
#[derive(Debug, Clone)]
pub struct StorageOptions {
    /// Which I/O backend to use
    pub backend: StorageBackend,

    /// Payload bytes per block (the 16-byte block header comes on top)
    pub block_capacity: usize,

    /// File growth step in bytes
    pub increment: usize,

    /// Page cache size of the direct I/O backend (4 KiB pages)
    pub page_cache_pages: usize,
}

impl Default for StorageOptions {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Mmap,
            block_capacity: 512,
            increment: 16 * 1024 * 1024, // 16 MB
            page_cache_pages: 4096,
        }
    }
}

impl StorageOptions {
    /// Create a new options builder
    pub fn builder() -> StorageOptionsBuilder {
        StorageOptionsBuilder::default()
    }

    /// Check option invariants
    pub fn validate(&self) -> Result<()> {
        if self.block_capacity == 0 || self.block_capacity > i16::MAX as usize {
            return Err(AtlasError::Config(format!(
                "block capacity must be within 1..={}, got {}",
                i16::MAX,
                self.block_capacity
            )));
        }
        if self.increment == 0 || self.increment > i32::MAX as usize {
            return Err(AtlasError::Config(format!(
                "increment must be within 1..={}, got {}",
                i32::MAX,
                self.increment
            )));
        }
        if self.increment < self.block_capacity + BLOCK_HEADER_BYTES {
            return Err(AtlasError::Config(format!(
                "increment of {} bytes is smaller than one block",
                self.increment
            )));
        }
        if self.page_cache_pages == 0 {
            return Err(AtlasError::Config("page cache must hold at least one page".into()));
        }
        Ok(())
    }
}

/// Builder for StorageOptions
#[derive(Default)]
pub struct StorageOptionsBuilder {
    options: StorageOptions,
}

impl StorageOptionsBuilder {
    /// Set the I/O backend
    pub fn backend(mut self, backend: StorageBackend) -> Self {
        self.options.backend = backend;
        self
    }

    /// Set the payload capacity of one block
    pub fn block_capacity(mut self, bytes: usize) -> Self {
        self.options.block_capacity = bytes;
        self
    }

    /// Set the file growth increment (in bytes)
    pub fn increment(mut self, bytes: usize) -> Self {
        self.options.increment = bytes;
        self
    }

    /// Set the direct I/O page cache size (in pages)
    pub fn page_cache_pages(mut self, pages: usize) -> Self {
        self.options.page_cache_pages = pages;
        self
    }

    pub fn build(self) -> StorageOptions {
        self.options
    }
}

// =============================================================================
// WAL Configuration
// =============================================================================

/// How the log file is maintained after checkpoints
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalMode {
    /// Truncate the log back to its header once a checkpoint reaches its end
    Truncate,

    /// Keep every record (append-only audit log)
    Log,

    /// No logging at all; transactions are bookkeeping only
    Disabled,
}

/// WAL sync strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalSyncStrategy {
    /// fsync the log on every commit (safest, slowest)
    EveryCommit,

    /// fsync only when a full batch is written out
    OnBatch,
}

/// Tuning knobs of the write-ahead log
#[derive(Debug, Clone)]
pub struct WalOptions {
    pub mode: WalMode,

    /// Commits between automatic checkpoints (truncating mode only)
    pub checkpoint_interval: u64,

    /// Records buffered in memory before a forced write
    pub batch_size: usize,

    /// Bytes buffered in memory before a forced write
    pub buffer_size: usize,

    /// Payloads at least this large are offered to the compressor
    pub compression_threshold: usize,

    /// Records at least this large bypass the batch buffer
    pub direct_write_threshold: usize,

    pub sync: WalSyncStrategy,

    /// Log full page images for updates instead of metadata only
    pub log_page_images: bool,
}

impl Default for WalOptions {
    fn default() -> Self {
        Self {
            mode: WalMode::Truncate,
            checkpoint_interval: 10_000,
            batch_size: 10_000,
            buffer_size: 4 * 1024 * 1024, // 4 MB
            compression_threshold: 8 * 1024,
            direct_write_threshold: 64 * 1024,
            sync: WalSyncStrategy::EveryCommit,
            log_page_images: false,
        }
    }
}

impl WalOptions {
    /// Create a new options builder
    pub fn builder() -> WalOptionsBuilder {
        WalOptionsBuilder::default()
    }

    /// Check option invariants
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(AtlasError::Config("WAL batch size must be positive".into()));
        }
        if self.buffer_size < 4096 {
            return Err(AtlasError::Config(format!(
                "WAL buffer must be at least 4096 bytes, got {}",
                self.buffer_size
            )));
        }
        if self.checkpoint_interval == 0 {
            return Err(AtlasError::Config("WAL checkpoint interval must be positive".into()));
        }
        Ok(())
    }
}

/// Builder for WalOptions
#[derive(Default)]
pub struct WalOptionsBuilder {
    options: WalOptions,
}

impl WalOptionsBuilder {
    /// Set the log maintenance mode
    pub fn mode(mut self, mode: WalMode) -> Self {
        self.options.mode = mode;
        self
    }

    /// Set the number of commits between automatic checkpoints
    pub fn checkpoint_interval(mut self, commits: u64) -> Self {
        self.options.checkpoint_interval = commits;
        self
    }

    /// Set the batch size (in records)
    pub fn batch_size(mut self, records: usize) -> Self {
        self.options.batch_size = records;
        self
    }

    /// Set the batch buffer size (in bytes)
    pub fn buffer_size(mut self, bytes: usize) -> Self {
        self.options.buffer_size = bytes;
        self
    }

    /// Set the compression threshold (in bytes)
    pub fn compression_threshold(mut self, bytes: usize) -> Self {
        self.options.compression_threshold = bytes;
        self
    }

    /// Set the direct write threshold (in bytes)
    pub fn direct_write_threshold(mut self, bytes: usize) -> Self {
        self.options.direct_write_threshold = bytes;
        self
    }

    /// Set the sync strategy
    pub fn sync(mut self, sync: WalSyncStrategy) -> Self {
        self.options.sync = sync;
        self
    }

    /// Enable or disable logging of full page images
    pub fn log_page_images(mut self, enabled: bool) -> Self {
        self.options.log_page_images = enabled;
        self
    }

    pub fn build(self) -> WalOptions {
        self.options
    }
}

// =============================================================================
// B+Tree Configuration
// =============================================================================

/// Options for a B+Tree index file
#[derive(Debug, Clone)]
pub struct TreeOptions {
    /// Physical block size of a node, header included
    pub node_bytes: usize,

    /// Node cache size (in nodes)
    pub cache_nodes: usize,

    /// Backend of the node file
    pub backend: StorageBackend,

    /// Growth increment of the node file
    pub increment: usize,
}

impl TreeOptions {
    /// Smallest node cache the tree will run with
    pub const MIN_CACHE_NODES: usize = 64;

    /// Create a new options builder
    pub fn builder() -> TreeOptionsBuilder {
        TreeOptionsBuilder::default()
    }

    /// Check option invariants
    pub fn validate(&self) -> Result<()> {
        // header + at least two keys per leaf and one separator per internal node
        if self.node_bytes < 16 + 48 || self.node_bytes > i16::MAX as usize {
            return Err(AtlasError::Config(format!(
                "node size must be within 64..={}, got {}",
                i16::MAX,
                self.node_bytes
            )));
        }
        Ok(())
    }
}

impl Default for TreeOptions {
    fn default() -> Self {
        Self {
            node_bytes: 1024,
            cache_nodes: 16 * 1024,
            backend: StorageBackend::Mmap,
            increment: 16 * 1024 * 1024, // 16 MB
        }
    }
}

/// Builder for TreeOptions
#[derive(Default)]
pub struct TreeOptionsBuilder {
    options: TreeOptions,
}

impl TreeOptionsBuilder {
    /// Set the physical node size (in bytes, header included)
    pub fn node_bytes(mut self, bytes: usize) -> Self {
        self.options.node_bytes = bytes;
        self
    }

    /// Set the node cache size (in nodes)
    pub fn cache_nodes(mut self, nodes: usize) -> Self {
        self.options.cache_nodes = nodes;
        self
    }

    /// Set the backend of the node file
    pub fn backend(mut self, backend: StorageBackend) -> Self {
        self.options.backend = backend;
        self
    }

    /// Set the growth increment of the node file (in bytes)
    pub fn increment(mut self, bytes: usize) -> Self {
        self.options.increment = bytes;
        self
    }

    pub fn build(self) -> TreeOptions {
        self.options
    }
}
