//! Lock-protected table state and the row/index mutations on it
//!
//! Every function here runs with the table lock held and inside a WAL
//! transaction; the callers in `mod.rs` and `transaction.rs` take care of
//! both.

use std::cmp::Ordering;
use std::sync::Arc;

use super::filter::Filter;
use super::meta::Meta;
use super::row::{Row, RowCache, RowCodec, Value};
use crate::btree::{BTree, KeyOrder, KeyProbe};
use crate::error::{AtlasError, Result};
use crate::storage::{BlockId, BlockStorage};
use crate::wal::{RollbackStats, TxnId, Wal};

/// One index of a table
pub(crate) struct Index {
    pub name: String,
    /// Column ordinals of the key, most significant first
    pub keys: Vec<usize>,
    /// Primary index: no rowid tie-break, duplicates rejected
    pub unique: bool,
    pub tree: BTree,
}

impl Index {
    /// Add `rowid` under its current row values
    fn insert(&mut self, rowid: BlockId, source: &mut RowSource<'_>) -> Result<()> {
        let mut order = IndexOrder {
            source,
            keys: &self.keys,
            tie_break: !self.unique,
        };
        if !self.tree.put(rowid.get(), &mut order)? {
            return Err(AtlasError::DuplicateKey(rowid.get()));
        }
        Ok(())
    }

    /// Remove `rowid`; the row storage must still hold the indexed values
    fn remove(&mut self, rowid: BlockId, source: &mut RowSource<'_>) -> Result<()> {
        let mut order = IndexOrder {
            source,
            keys: &self.keys,
            tie_break: !self.unique,
        };
        if !self.tree.delete(rowid.get(), &mut order)? {
            tracing::warn!("Index {} has no entry for row {}", self.name, rowid);
        }
        Ok(())
    }

    /// Any row whose key starts with `prefix`
    fn lookup(&mut self, prefix: &[Value], source: &mut RowSource<'_>) -> Result<Option<BlockId>> {
        let mut probe = PrefixProbe {
            source,
            keys: &self.keys,
            prefix,
        };
        Ok(self.tree.compare_get(&mut probe)?.map(BlockId::new))
    }
}

// =============================================================================
// Row access for comparators
// =============================================================================

/// Decoded-row access through the row cache
pub(crate) struct RowSource<'a> {
    pub rows: &'a mut dyn BlockStorage,
    pub cache: &'a RowCache,
    pub codec: &'a dyn RowCodec,
    pub meta: &'a Meta,
}

impl RowSource<'_> {
    pub(crate) fn row(&mut self, rowid: BlockId) -> Result<Arc<Row>> {
        if let Some(row) = self.cache.get(rowid) {
            return Ok(row);
        }
        let bytes = self.rows.read(rowid)?;
        let row = Arc::new(self.codec.decode(self.meta, rowid, &bytes)?);
        self.cache.put(rowid, Arc::clone(&row));
        Ok(row)
    }
}

/// Orders rowids by the key columns of their rows, then (for non-unique
/// indexes) by rowid
struct IndexOrder<'s, 'a> {
    source: &'s mut RowSource<'a>,
    keys: &'s [usize],
    tie_break: bool,
}

impl KeyOrder for IndexOrder<'_, '_> {
    fn compare(&mut self, a: u64, b: u64) -> Result<Ordering> {
        if a == b {
            return Ok(Ordering::Equal);
        }
        let left = self.source.row(BlockId::new(a))?;
        let right = self.source.row(BlockId::new(b))?;
        Ok(match left.compare_columns(&right, self.keys) {
            Ordering::Equal if self.tie_break => a.cmp(&b),
            order => order,
        })
    }
}

/// Locates a key prefix that is not stored anywhere yet
struct PrefixProbe<'s, 'a> {
    source: &'s mut RowSource<'a>,
    keys: &'s [usize],
    prefix: &'s [Value],
}

impl KeyProbe for PrefixProbe<'_, '_> {
    fn probe(&mut self, key: u64) -> Result<Ordering> {
        let stored = self.source.row(BlockId::new(key))?;
        Ok(stored.compare_prefix(self.keys, self.prefix).reverse())
    }
}

/// Drives a scan with a filter's index range
pub(crate) struct FilterProbe<'s, 'a> {
    pub source: RowSource<'a>,
    pub keys: &'s [usize],
    pub filter: &'s Filter,
}

impl KeyProbe for FilterProbe<'_, '_> {
    fn probe(&mut self, key: u64) -> Result<Ordering> {
        if !self.filter.has_range() {
            return Ok(Ordering::Equal);
        }
        let row = self.source.row(BlockId::new(key))?;
        Ok(self.filter.locate(&row, self.keys))
    }
}

// =============================================================================
// State
// =============================================================================

/// Everything the table lock protects
pub(crate) struct State {
    pub rows: Box<dyn BlockStorage>,
    pub cache: RowCache,
    pub codec: Box<dyn RowCodec>,
    pub indexes: Vec<Index>,
}

impl State {
    /// Split into row access and the index list
    pub(crate) fn split<'a>(&'a mut self, meta: &'a Meta) -> (RowSource<'a>, &'a mut [Index]) {
        let State {
            rows,
            cache,
            codec,
            indexes,
        } = self;
        let source = RowSource {
            rows: rows.as_mut(),
            cache,
            codec: &**codec,
            meta,
        };
        (source, indexes.as_mut_slice())
    }

    pub(crate) fn index_of(&self, meta: &Meta, name: &str) -> Result<usize> {
        meta.index(name)
            .filter(|&i| i < self.indexes.len())
            .ok_or_else(|| AtlasError::NotFound(format!("index {}", name)))
    }

    /// Live-key count of every index
    pub(crate) fn snapshot(&self) -> Vec<u64> {
        self.indexes.iter().map(|index| index.tree.len()).collect()
    }

    pub(crate) fn flush_meta(&mut self) -> Result<()> {
        for index in &mut self.indexes {
            index.tree.flush_meta()?;
        }
        Ok(())
    }

    /// Roll back `txn` and resynchronize the in-memory state with the files
    pub(crate) fn undo(&mut self, wal: &dyn Wal, txn: TxnId, snapshot: &[u64]) -> Result<RollbackStats> {
        let stats = wal.rollback(txn)?;
        self.cache.clear();
        for (index, &len) in self.indexes.iter_mut().zip(snapshot) {
            index.tree.reload()?;
            index.tree.restore_len(len);
        }
        Ok(stats)
    }

    fn encode(&self, meta: &Meta, row: &Row) -> Result<Vec<u8>> {
        for (column, value) in meta.columns.iter().zip(&row.values) {
            if !column.kind.accepts(value) {
                return Err(AtlasError::Serialization(format!(
                    "column {} ({:?}) cannot hold {:?}",
                    column.name, column.kind, value
                )));
            }
        }
        self.codec.encode(meta, row)
    }

    // =========================================================================
    // Reads
    // =========================================================================

    pub(crate) fn read(&mut self, meta: &Meta, rowid: BlockId) -> Result<Row> {
        let (mut source, _) = self.split(meta);
        Ok(source.row(rowid)?.as_ref().clone())
    }

    pub(crate) fn one(&mut self, meta: &Meta, index: &str, prefix: &[Value]) -> Result<Option<Row>> {
        let i = self.index_of(meta, index)?;
        let (mut source, indexes) = self.split(meta);
        match indexes[i].lookup(prefix, &mut source)? {
            Some(rowid) => Ok(Some(source.row(rowid)?.as_ref().clone())),
            None => Ok(None),
        }
    }

    // =========================================================================
    // Mutations
    // =========================================================================

    pub(crate) fn apply(&mut self, meta: &Meta, mut row: Row, upsert: bool) -> Result<BlockId> {
        if let Some(rowid) = row.rowid {
            return self.apply_at(meta, rowid, row);
        }
        let payload = self.encode(meta, &row)?;
        let (mut source, indexes) = self.split(meta);
        let Some((primary, secondaries)) = indexes.split_first_mut() else {
            return Err(AtlasError::Config("table has no primary index".into()));
        };

        let key = row.project(&primary.keys);
        match primary.lookup(&key, &mut source)? {
            None => {
                let rowid = source.rows.write(&payload)?;
                row.rowid = Some(rowid);
                source.cache.put(rowid, Arc::new(row));
                primary.insert(rowid, &mut source)?;
                for index in secondaries.iter_mut() {
                    index.insert(rowid, &mut source)?;
                }
                tracing::trace!("Inserted row {}", rowid);
                Ok(rowid)
            }
            Some(rowid) if !upsert => Err(AtlasError::DuplicateKey(rowid.get())),
            Some(rowid) => {
                // Step 1: unlink the old values while they are still readable
                for index in secondaries.iter_mut() {
                    index.remove(rowid, &mut source)?;
                }

                // Step 2: overwrite in place
                source.cache.remove(rowid);
                source.rows.write_at(rowid, &payload)?;
                row.rowid = Some(rowid);
                source.cache.put(rowid, Arc::new(row));

                // Step 3: relink under the new values
                for index in secondaries.iter_mut() {
                    index.insert(rowid, &mut source)?;
                }
                tracing::trace!("Updated row {}", rowid);
                Ok(rowid)
            }
        }
    }

    pub(crate) fn apply_at(&mut self, meta: &Meta, rowid: BlockId, mut row: Row) -> Result<BlockId> {
        let payload = self.encode(meta, &row)?;
        let (mut source, indexes) = self.split(meta);
        if indexes.is_empty() {
            return Err(AtlasError::Config("table has no primary index".into()));
        }

        let present = match source.row(rowid) {
            Ok(_) => true,
            Err(e) if e.is_not_found() => false,
            Err(e) => return Err(e),
        };

        let key = row.project(&indexes[0].keys);
        if let Some(other) = indexes[0].lookup(&key, &mut source)? {
            if other != rowid {
                return Err(AtlasError::DuplicateKey(other.get()));
            }
        }

        if present {
            for index in indexes.iter_mut() {
                index.remove(rowid, &mut source)?;
            }
        }
        source.cache.remove(rowid);
        source.rows.write_at(rowid, &payload)?;
        row.rowid = Some(rowid);
        source.cache.put(rowid, Arc::new(row));
        for index in indexes.iter_mut() {
            index.insert(rowid, &mut source)?;
        }
        tracing::trace!("Applied row at {}", rowid);
        Ok(rowid)
    }

    pub(crate) fn delete_at(&mut self, meta: &Meta, rowid: BlockId) -> Result<()> {
        let (mut source, indexes) = self.split(meta);
        source.row(rowid)?;
        let Some((primary, secondaries)) = indexes.split_first_mut() else {
            return Err(AtlasError::Config("table has no primary index".into()));
        };
        for index in secondaries.iter_mut() {
            index.remove(rowid, &mut source)?;
        }
        primary.remove(rowid, &mut source)?;
        source.cache.remove(rowid);
        source.rows.delete(rowid)?;
        tracing::trace!("Deleted row {}", rowid);
        Ok(())
    }
}
