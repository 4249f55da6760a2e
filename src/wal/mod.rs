//! Write-Ahead Log (WAL) Module
//!
//! Transaction boundaries and crash recovery for block storages.
//!
//! ## Model
//! Mutations go straight to the wrapped storage ("immediate writes"). While
//! a transaction is active each wrapped storage remembers the pre-image of
//! every record it overwrites or deletes, and the ids it allocates, so a
//! rollback can put the file back. The log itself records what happened
//! (metadata only, or full record images when enabled) and where each
//! transaction ended, which is what recovery classifies and replays.
//!
//! ## File Format
//! ```text
//! ┌─────────────────────────────────────────┐
//! │ Header page (4 KiB)                     │
//! │   magic, version, size, timestamp,      │
//! │   last txn, committed/checkpoint offset │
//! │   total/processed record counts         │
//! ├─────────────────────────────────────────┤
//! │ Record 1                                │
//! │ ┌────┬─────┬─────┬──────┬────────┬────┐ │
//! │ │ op │ txn │ crc │ file │ offset │ .. │ │
//! │ └────┴─────┴─────┴──────┴────────┴────┘ │
//! ├─────────────────────────────────────────┤
//! │ Record 2 ...                            │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Transaction States
//! `NONE → BEGUN → (COMMITTED | ROLLED_BACK)`; finishing an id that is not
//! the active transaction is a no-op.

mod header;
mod log;
mod reader;
mod record;
mod recovery;
mod storage;
mod writer;

use std::path::Path;
use std::sync::Arc;

use crate::config::{WalMode, WalOptions};
use crate::error::Result;
use crate::storage::{BlockId, BlockStorage};

pub use header::{WalHeader, WAL_HEADER_BYTES};
pub use log::WriteAheadLog;
pub use reader::WalReader;
pub use record::{EncodedRecord, Op, WalRecord, FLAG_COMPRESSED, FLAG_METADATA_ONLY, RECORD_HEADER_BYTES};
pub use recovery::RecoveryReport;
pub use writer::WalWriter;

/// Transaction identifier (monotonically increasing, starts at 1)
pub type TxnId = u64;

/// Identifier of a wrapped storage inside one log
pub type FileId = u32;

/// Cache-invalidation callback, called with every block a delete or
/// rollback touched
pub type RefreshHook = Arc<dyn Fn(BlockId) + Send + Sync>;

/// Blocks undone by a rollback
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RollbackStats {
    /// Records allocated inside the transaction and deleted again
    pub removed: u64,

    /// Records put back to their pre-transaction image
    pub restored: u64,
}

/// Transaction coordinator over a set of wrapped storages
pub trait Wal: Send + Sync {
    /// Start a transaction on every wrapped storage
    fn begin(&self) -> Result<TxnId>;

    /// Make the transaction's writes permanent
    fn commit(&self, txn: TxnId) -> Result<()>;

    /// Undo every write the transaction made
    fn rollback(&self, txn: TxnId) -> Result<RollbackStats>;

    /// Sync wrapped storages and mark the log up to here as applied
    fn checkpoint(&self) -> Result<()>;

    /// Replay committed records after a crash
    fn recover(&self) -> Result<RecoveryReport>;

    /// Route a storage through the log.
    ///
    /// `refresh` is called for every block a delete or rollback touches.
    fn wrap(
        &self,
        origin: Box<dyn BlockStorage>,
        refresh: Option<RefreshHook>,
    ) -> Result<Box<dyn BlockStorage>>;

    /// Flush (and, in truncating mode, checkpoint) before shutdown
    fn close(&self) -> Result<()>;
}

/// WAL that does nothing: transactions are bookkeeping only and storages
/// are returned unwrapped
#[derive(Debug, Default)]
pub struct NoWal;

impl Wal for NoWal {
    fn begin(&self) -> Result<TxnId> {
        Ok(1)
    }

    fn commit(&self, _txn: TxnId) -> Result<()> {
        Ok(())
    }

    fn rollback(&self, _txn: TxnId) -> Result<RollbackStats> {
        Ok(RollbackStats::default())
    }

    fn checkpoint(&self) -> Result<()> {
        Ok(())
    }

    fn recover(&self) -> Result<RecoveryReport> {
        Ok(RecoveryReport::default())
    }

    fn wrap(
        &self,
        origin: Box<dyn BlockStorage>,
        _refresh: Option<RefreshHook>,
    ) -> Result<Box<dyn BlockStorage>> {
        Ok(origin)
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Open the log at `path`, or a [`NoWal`] when logging is disabled
pub fn open_wal(path: &Path, options: &WalOptions) -> Result<Arc<dyn Wal>> {
    if options.mode == WalMode::Disabled {
        tracing::debug!("WAL disabled for {}", path.display());
        return Ok(Arc::new(NoWal));
    }
    Ok(Arc::new(WriteAheadLog::open(path, options)?))
}
