//! # AtlasDB
//!
//! An embedded storage engine with:
//! - Block storage files with free-list reuse and three I/O backends
//! - A write-ahead log with immediate writes, backup/restore rollback and
//!   crash recovery
//! - B+Tree indexes over row offsets, ordered by caller comparators
//! - Transactional tables tying the three together
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          Table                               │
//! │        (one lock: single writer, serialized readers)         │
//! └───────┬──────────────────────┬──────────────────────────────┘
//!         │ rows                 │ one B+Tree per index
//!         ▼                      ▼
//!   ┌─────────────┐      ┌───────────────┐
//!   │ Row cache   │      │  Node caches  │
//!   └──────┬──────┘      └───────┬───────┘
//!          │                     │
//! ┌────────▼─────────────────────▼──────────────────────────────┐
//! │                 Write-Ahead Log (wrapping)                   │
//! │        pre-images for rollback, records for recovery         │
//! └────────┬─────────────────────┬──────────────────────────────┘
//!          ▼                     ▼
//!   ┌─────────────┐      ┌───────────────┐
//!   │ Row storage │      │ Index storage │   mmap | memory | direct
//!   └─────────────┘      └───────────────┘
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;

pub mod storage;
pub mod wal;
pub mod btree;
pub mod table;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use btree::{BTree, Order};
pub use config::{StorageBackend, StorageOptions, TreeOptions, WalMode, WalOptions, WalSyncStrategy};
pub use error::{AtlasError, Result};
pub use storage::{open_storage, BlockId, BlockStorage};
pub use table::{ColumnType, Filter, Limit, Meta, Row, Table, Transaction, Value};
pub use wal::{open_wal, Wal, WriteAheadLog};

// =============================================================================
// Version Info
// =============================================================================

/// Current version of AtlasDB
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
