//! Table Module
//!
//! Rows in a block storage, one B+Tree per index, all behind one WAL.
//!
//! ## Files
//! ```text
//! <path>            rows (one record per row, rowid = first block)
//! <path>.desc       schema (columns, indexes, row block size)
//! <path>.wal        write-ahead log
//! <path>.i.<index>  B+Tree of rowids, ordered by the index key columns
//! ```
//!
//! ## Concurrency Model
//! One mutex guards the row storage, the row cache and every index. Reads,
//! single mutations and whole explicit transactions each hold it from start
//! to finish: a single writer, with readers serialized behind it.
//!
//! ## Mutations
//! Every mutation runs in a WAL transaction. A single `apply`/`delete_at`
//! on the table is its own transaction; a failure anywhere inside it rolls
//! back the row file and every index file before the error is returned.

mod cursor;
mod filter;
mod meta;
mod row;
mod state;
mod transaction;

use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::btree::{BTree, NodeCache, Order};
use crate::config::{StorageBackend, StorageOptions, TreeOptions, WalMode};
use crate::error::{AtlasError, Result};
use crate::storage::{open_storage, BlockId, BlockStorage};
use crate::wal::{open_wal, RecoveryReport, Wal, WriteAheadLog};

pub use cursor::RowCursor;
pub use filter::{Filter, Limit};
pub use meta::{Column, ColumnType, IndexDef, Meta, MetaBuilder, PRIMARY};
pub use row::{BincodeCodec, Row, RowCodec, Value};
pub use transaction::Transaction;

use row::RowCache;
use state::{Index, State};

const TABLE_SIGNATURE: &[u8; 4] = b"ITBL";
const TABLE_VERSION: u32 = 1;
const HEAD_BYTES: usize = 8;

/// A table of rows with a primary and any number of secondary indexes
pub struct Table {
    path: PathBuf,
    meta: Meta,
    wal: Arc<dyn Wal>,
    state: Mutex<State>,
}

impl Table {
    // =========================================================================
    // Internal Path Suffixes
    // =========================================================================
    const DESC_SUFFIX: &'static str = ".desc";
    const WAL_SUFFIX: &'static str = ".wal";
    const INDEX_INFIX: &'static str = ".i.";

    /// Open or create the table at `path` with the default row codec
    pub fn open(path: impl AsRef<Path>, meta: Meta) -> Result<Self> {
        Self::open_with_codec(path, meta, Box::new(BincodeCodec))
    }

    /// Open or create the table at `path`
    ///
    /// On open:
    /// 1. Validate the schema and check it against `<path>.desc`
    /// 2. Open the WAL
    /// 3. Open the row file and every index file through the WAL
    /// 4. Replay committed transactions from the WAL
    /// 5. Load the index trees
    pub fn open_with_codec(path: impl AsRef<Path>, meta: Meta, codec: Box<dyn RowCodec>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        meta.validate()?;
        let key_columns = meta.key_columns()?;
        let in_memory = meta.backend == StorageBackend::Memory;

        // Step 1: schema
        if !in_memory {
            meta.persist_or_check(&Self::sibling(&path, Self::DESC_SUFFIX))?;
        }

        // Step 2: WAL
        let wal: Arc<dyn Wal> = if in_memory && meta.wal.mode != WalMode::Disabled {
            Arc::new(WriteAheadLog::unlogged(&meta.wal))
        } else {
            open_wal(&Self::sibling(&path, Self::WAL_SUFFIX), &meta.wal)?
        };

        // Step 3: row file and index files
        let cache = RowCache::new(meta.cache_rows);
        let rows = open_rows(&path, &meta)?;
        let rows = wal.wrap(rows, Some(cache.refresh_hook()))?;

        let tree_options = TreeOptions {
            backend: meta.backend,
            ..meta.tree.clone()
        };
        let mut index_storages = Vec::with_capacity(meta.indexes.len());
        for def in &meta.indexes {
            let index_path = Self::sibling(&path, &format!("{}{}", Self::INDEX_INFIX, def.name));
            let storage = open_storage(&index_path, &BTree::storage_options(&tree_options))?;
            let nodes = NodeCache::new(tree_options.cache_nodes);
            let storage = wal.wrap(storage, Some(nodes.refresh_hook()))?;
            index_storages.push((storage, nodes));
        }

        // Step 4: recovery
        let report = wal.recover()?;
        if report.records_replayed > 0 {
            tracing::info!(
                "Table {}: replayed {} WAL records",
                path.display(),
                report.records_replayed
            );
        }

        // Step 5: trees
        let mut indexes = Vec::with_capacity(meta.indexes.len());
        for (i, ((storage, nodes), keys)) in index_storages.into_iter().zip(key_columns).enumerate() {
            indexes.push(Index {
                name: meta.indexes[i].name.clone(),
                keys,
                unique: i == 0,
                tree: BTree::with_storage(storage, nodes)?,
            });
        }

        tracing::debug!(
            "Opened table {} ({} columns, {} indexes, {} rows)",
            path.display(),
            meta.columns.len(),
            indexes.len(),
            indexes.first().map_or(0, |primary| primary.tree.len())
        );

        Ok(Self {
            path,
            meta,
            wal,
            state: Mutex::new(State {
                rows,
                cache,
                codec,
                indexes,
            }),
        })
    }

    /// `<path><suffix>`
    fn sibling(path: &Path, suffix: &str) -> PathBuf {
        let mut name = OsString::from(path.as_os_str());
        name.push(suffix);
        PathBuf::from(name)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn meta(&self) -> &Meta {
        &self.meta
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Read the row stored at `rowid`
    pub fn read(&self, rowid: BlockId) -> Result<Row> {
        self.state.lock().read(&self.meta, rowid)
    }

    /// Any row of `index` whose key starts with `key`
    pub fn one(&self, index: &str, key: &[Value]) -> Result<Option<Row>> {
        self.state.lock().one(&self.meta, index, key)
    }

    /// Scan `index` in `order`.
    ///
    /// The filter's range part bounds the scan; its residual predicate and
    /// the limit are applied to the rows inside the range. The cursor holds
    /// the table lock until it is dropped.
    pub fn find(&self, index: &str, order: Order, limit: Limit, filter: Filter) -> Result<RowCursor<'_>> {
        let state = self.state.lock();
        let i = state.index_of(&self.meta, index)?;
        RowCursor::open(cursor::StateRef::Locked(state), &self.meta, i, order, filter, limit)
    }

    /// Number of live rows
    pub fn rows(&self) -> u64 {
        let state = self.state.lock();
        state.indexes.first().map_or(0, |primary| primary.tree.len())
    }

    /// Bytes occupied by the row file
    pub fn bytes(&self) -> u64 {
        self.state.lock().rows.bytes()
    }

    // =========================================================================
    // Mutations
    // =========================================================================

    /// Insert a row, or with `upsert` overwrite the row with the same
    /// primary key in place. Returns the rowid.
    pub fn apply(&self, row: Row, upsert: bool) -> Result<BlockId> {
        self.atomically(|state| state.apply(&self.meta, row, upsert))
    }

    /// Store `row` at a known rowid, re-indexing it
    pub fn apply_at(&self, rowid: BlockId, row: Row) -> Result<BlockId> {
        self.atomically(|state| state.apply_at(&self.meta, rowid, row))
    }

    /// Delete the row at `rowid` and its index entries
    pub fn delete_at(&self, rowid: BlockId) -> Result<()> {
        self.atomically(|state| state.delete_at(&self.meta, rowid))
    }

    /// Start an explicit transaction; holds the table lock until it ends
    pub fn begin(&self) -> Result<Transaction<'_>> {
        Transaction::begin(self, self.state.lock())
    }

    /// Run `op` as one WAL transaction
    fn atomically<T>(&self, op: impl FnOnce(&mut State) -> Result<T>) -> Result<T> {
        let mut state = self.state.lock();
        let snapshot = state.snapshot();
        let txn = self.wal.begin()?;

        let result = op(&mut *state)
            .and_then(|value| state.flush_meta().map(|()| value))
            .and_then(|value| self.wal.commit(txn).map(|()| value));
        if let Err(e) = &result {
            tracing::debug!("Transaction {} failed: {}", txn, e);
            if let Err(undo) = state.undo(self.wal.as_ref(), txn, &snapshot) {
                tracing::warn!("Rollback of transaction {} failed: {}", txn, undo);
            }
        }
        result
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Sync every file and mark the WAL as applied
    pub fn checkpoint(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.flush_meta()?;
        self.wal.checkpoint()
    }

    /// Replay the WAL again and reload the in-memory state
    pub fn recover(&self) -> Result<RecoveryReport> {
        let mut state = self.state.lock();
        let report = self.wal.recover()?;
        state.cache.clear();
        for index in &mut state.indexes {
            index.tree.reload()?;
        }
        Ok(report)
    }

    /// Flush, sync and close every file
    pub fn close(self) -> Result<()> {
        let mut state = self.state.lock();
        for index in &mut state.indexes {
            index.tree.sync()?;
        }
        state.rows.sync()?;
        self.wal.close()?;
        tracing::debug!("Closed table {}", self.path.display());
        Ok(())
    }

    /// Remove every file belonging to the table at `path`
    pub fn drop_files(path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let mut victims = vec![
            path.to_path_buf(),
            Self::sibling(path, Self::DESC_SUFFIX),
            Self::sibling(path, Self::WAL_SUFFIX),
        ];

        let parent = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        if let Some(name) = path.file_name() {
            let mut prefix = name.to_os_string();
            prefix.push(Self::INDEX_INFIX);
            let prefix = prefix.to_string_lossy().into_owned();
            match fs::read_dir(&parent) {
                Ok(entries) => {
                    for entry in entries {
                        let entry = entry?;
                        if entry.file_name().to_string_lossy().starts_with(&prefix) {
                            victims.push(entry.path());
                        }
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        for victim in victims {
            match fs::remove_file(&victim) {
                Ok(()) => tracing::debug!("Removed {}", victim.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

/// Open the row file and stamp or check its signature
fn open_rows(path: &Path, meta: &Meta) -> Result<Box<dyn BlockStorage>> {
    let options = StorageOptions {
        backend: meta.backend,
        block_capacity: meta.row_bytes,
        increment: meta.increment,
        ..StorageOptions::default()
    };
    let mut rows = open_storage(path, &options)?;

    let head = rows.read_head(0, HEAD_BYTES)?;
    if &head[..4] == TABLE_SIGNATURE {
        let version = u32::from_le_bytes([head[4], head[5], head[6], head[7]]);
        if version != TABLE_VERSION {
            return Err(AtlasError::Format(format!(
                "unsupported table version {} in {}",
                version,
                path.display()
            )));
        }
    } else if rows.count() == 0 {
        let mut head = Vec::with_capacity(HEAD_BYTES);
        head.extend_from_slice(TABLE_SIGNATURE);
        head.extend_from_slice(&TABLE_VERSION.to_le_bytes());
        rows.write_head(0, &head)?;
    } else {
        return Err(AtlasError::Format(format!(
            "{} is not a table file",
            path.display()
        )));
    }
    Ok(rows)
}
