//! Explicit transactions
//!
//! ```text
//!   begin ──► OPEN ──┬── commit ─────────► COMMITTED
//!                    ├── rollback ───────► ROLLED_BACK
//!                    ├── failed op ──────► ROLLED_BACK
//!                    └── dropped ────────► ROLLED_BACK
//! ```
//!
//! A transaction holds the table lock from `begin` until it finishes, so
//! every other table call blocks in the meantime.

use parking_lot::MutexGuard;

use super::cursor::{RowCursor, StateRef};
use super::filter::{Filter, Limit};
use super::row::{Row, Value};
use super::state::State;
use super::Table;
use crate::btree::Order;
use crate::error::{AtlasError, Result};
use crate::storage::BlockId;
use crate::wal::{RollbackStats, TxnId};

/// An open transaction on a [`Table`]
pub struct Transaction<'a> {
    table: &'a Table,
    state: MutexGuard<'a, State>,
    txn: TxnId,
    snapshot: Vec<u64>,
    done: bool,
}

impl<'a> Transaction<'a> {
    pub(crate) fn begin(table: &'a Table, state: MutexGuard<'a, State>) -> Result<Self> {
        let txn = table.wal.begin()?;
        let snapshot = state.snapshot();
        tracing::debug!("Transaction {} started on {}", txn, table.path.display());
        Ok(Self {
            table,
            state,
            txn,
            snapshot,
            done: false,
        })
    }

    pub fn id(&self) -> TxnId {
        self.txn
    }

    fn check(&self) -> Result<()> {
        if self.done {
            return Err(AtlasError::Transaction(format!(
                "transaction {} is already finished",
                self.txn
            )));
        }
        Ok(())
    }

    /// Run a mutation; a failure rolls the whole transaction back
    fn mutate<T>(&mut self, op: impl FnOnce(&mut State, &Table) -> Result<T>) -> Result<T> {
        self.check()?;
        match op(&mut *self.state, self.table) {
            Ok(value) => Ok(value),
            Err(e) => {
                tracing::debug!("Transaction {} failed: {}", self.txn, e);
                if let Err(undo) = self.undo() {
                    tracing::warn!("Rollback of transaction {} failed: {}", self.txn, undo);
                }
                Err(e)
            }
        }
    }

    fn undo(&mut self) -> Result<RollbackStats> {
        self.done = true;
        self.state.undo(self.table.wal.as_ref(), self.txn, &self.snapshot)
    }

    // =========================================================================
    // Mutations
    // =========================================================================

    /// Insert a row, or with `upsert` overwrite the row with the same
    /// primary key
    pub fn apply(&mut self, row: Row, upsert: bool) -> Result<BlockId> {
        self.mutate(|state, table| state.apply(&table.meta, row, upsert))
    }

    /// Store `row` at a known rowid
    pub fn apply_at(&mut self, rowid: BlockId, row: Row) -> Result<BlockId> {
        self.mutate(|state, table| state.apply_at(&table.meta, rowid, row))
    }

    pub fn delete_at(&mut self, rowid: BlockId) -> Result<()> {
        self.mutate(|state, table| state.delete_at(&table.meta, rowid))
    }

    // =========================================================================
    // Reads (see the transaction's own writes)
    // =========================================================================

    pub fn read(&mut self, rowid: BlockId) -> Result<Row> {
        self.check()?;
        self.state.read(&self.table.meta, rowid)
    }

    pub fn one(&mut self, index: &str, key: &[Value]) -> Result<Option<Row>> {
        self.check()?;
        self.state.one(&self.table.meta, index, key)
    }

    pub fn find(&mut self, index: &str, order: Order, limit: Limit, filter: Filter) -> Result<RowCursor<'_>> {
        self.check()?;
        let i = self.state.index_of(&self.table.meta, index)?;
        RowCursor::open(
            StateRef::Borrowed(&mut *self.state),
            &self.table.meta,
            i,
            order,
            filter,
            limit,
        )
    }

    /// Live rows, this transaction's changes included
    pub fn rows(&self) -> u64 {
        self.state.indexes.first().map_or(0, |primary| primary.tree.len())
    }

    // =========================================================================
    // Completion
    // =========================================================================

    /// Flush index metadata and commit
    pub fn commit(mut self) -> Result<()> {
        self.check()?;
        let result = self
            .state
            .flush_meta()
            .and_then(|()| self.table.wal.commit(self.txn));
        match result {
            Ok(()) => {
                self.done = true;
                tracing::debug!("Transaction {} committed", self.txn);
                Ok(())
            }
            Err(e) => {
                if let Err(undo) = self.undo() {
                    tracing::warn!("Rollback of transaction {} failed: {}", self.txn, undo);
                }
                Err(e)
            }
        }
    }

    /// Undo every change made by this transaction
    pub fn rollback(mut self) -> Result<RollbackStats> {
        self.check()?;
        self.undo()
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.done {
            tracing::debug!("Transaction {} dropped without commit", self.txn);
            if let Err(e) = self.undo() {
                tracing::warn!("Rollback of transaction {} failed: {}", self.txn, e);
            }
        }
    }
}
