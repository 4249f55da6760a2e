//! Storage wrapper that logs mutations and keeps rollback state

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use parking_lot::Mutex;

use super::log::WalInner;
use super::record::{Op, WalRecord};
use super::{FileId, RefreshHook, RollbackStats, TxnId};
use crate::error::Result;
use crate::storage::{BlockId, BlockStorage};

/// Pre-image of a record touched inside the active transaction
#[derive(Debug, Clone)]
pub(crate) enum Backup {
    /// Overwritten in place; holds the old bytes
    Updated(Vec<u8>),

    /// Deleted; holds the bytes it had
    Deleted(Vec<u8>),
}

impl Backup {
    fn image(&self) -> &[u8] {
        match self {
            Backup::Updated(image) | Backup::Deleted(image) => image,
        }
    }
}

/// Per-storage transaction state
pub(crate) struct WalFile {
    pub(crate) id: FileId,
    pub(crate) origin: Box<dyn BlockStorage>,
    pub(crate) txn: Option<TxnId>,
    backups: BTreeMap<BlockId, Backup>,
    allocated: BTreeSet<BlockId>,
    /// Head-area pre-images in write order
    head_backups: Vec<(usize, Vec<u8>)>,
    refresh: Option<RefreshHook>,
}

impl WalFile {
    pub(crate) fn new(id: FileId, origin: Box<dyn BlockStorage>, refresh: Option<RefreshHook>) -> Self {
        Self {
            id,
            origin,
            txn: None,
            backups: BTreeMap::new(),
            allocated: BTreeSet::new(),
            head_backups: Vec::new(),
            refresh,
        }
    }

    fn notify(&self, id: BlockId) {
        if let Some(refresh) = &self.refresh {
            refresh(id);
        }
    }

    /// Remember the current image of `id` unless already known
    fn back_up(&mut self, id: BlockId, deleted: bool) -> Result<()> {
        if self.allocated.contains(&id) || self.backups.contains_key(&id) {
            return Ok(());
        }
        match self.origin.read(id) {
            Ok(image) => {
                let backup = if deleted {
                    Backup::Deleted(image)
                } else {
                    Backup::Updated(image)
                };
                self.backups.insert(id, backup);
                Ok(())
            }
            // nothing live there yet: undo means deleting it again
            Err(e) if e.is_not_found() => {
                if !deleted {
                    self.allocated.insert(id);
                }
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Forget the transaction's undo state; only once its commit is logged
    pub(crate) fn finish(&mut self) {
        self.backups.clear();
        self.allocated.clear();
        self.head_backups.clear();
        self.txn = None;
    }

    /// Put the file back to its state at `begin`.
    ///
    /// Phases: delete records allocated in the transaction, delete the
    /// current version of every backed-up record, claim every backed-up
    /// first block, then write the old images. Claiming all first blocks
    /// before writing any image keeps a restored chain from taking another
    /// record's first block as a continuation.
    pub(crate) fn rollback(&mut self) -> Result<RollbackStats> {
        let mut stats = RollbackStats::default();
        let mut touched: Vec<BlockId> = Vec::new();

        let allocated = std::mem::take(&mut self.allocated);
        for &id in &allocated {
            match self.origin.delete(id) {
                Ok(_) => stats.removed += 1,
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
            touched.push(id);
        }

        let backups = std::mem::take(&mut self.backups);
        for &id in backups.keys() {
            match self.origin.delete(id) {
                Ok(_) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        for &id in backups.keys() {
            self.origin.write_at(id, &[])?;
        }
        for (&id, backup) in &backups {
            self.origin.write_at(id, backup.image())?;
            stats.restored += 1;
            touched.push(id);
        }

        for (offset, image) in std::mem::take(&mut self.head_backups).into_iter().rev() {
            self.origin.write_head(offset, &image)?;
        }

        self.txn = None;
        self.origin.flush()?;
        for id in touched {
            self.notify(id);
        }
        Ok(stats)
    }
}

/// A block storage routed through a [`WriteAheadLog`](super::WriteAheadLog)
pub(crate) struct WalStorage {
    file: Arc<Mutex<WalFile>>,
    inner: Arc<WalInner>,
}

impl WalStorage {
    pub(crate) fn new(file: Arc<Mutex<WalFile>>, inner: Arc<WalInner>) -> Self {
        Self { file, inner }
    }
}

impl BlockStorage for WalStorage {
    fn write(&mut self, payload: &[u8]) -> Result<BlockId> {
        let mut file = self.file.lock();
        let id = file.origin.write(payload)?;
        if let Some(txn) = file.txn {
            file.allocated.insert(id);
            let record = WalRecord::data(Op::Write, txn, file.id, id, self.inner.image(payload));
            self.inner.append(&record)?;
        }
        Ok(id)
    }

    fn write_at(&mut self, id: BlockId, payload: &[u8]) -> Result<()> {
        let mut file = self.file.lock();
        if let Some(txn) = file.txn {
            file.back_up(id, false)?;
            file.origin.write_at(id, payload)?;
            let record = WalRecord::data(Op::Update, txn, file.id, id, self.inner.image(payload));
            self.inner.append(&record)?;
            return Ok(());
        }
        file.origin.write_at(id, payload)
    }

    fn read(&mut self, id: BlockId) -> Result<Vec<u8>> {
        self.file.lock().origin.read(id)
    }

    fn delete(&mut self, id: BlockId) -> Result<bool> {
        let mut file = self.file.lock();
        let deleted = match file.txn {
            Some(txn) => {
                if !file.allocated.remove(&id) {
                    file.back_up(id, true)?;
                }
                let deleted = file.origin.delete(id)?;
                // an empty payload marks the delete as replayable
                let payload = self.inner.image(&[]);
                let record = WalRecord::data(Op::Delete, txn, file.id, id, payload);
                self.inner.append(&record)?;
                deleted
            }
            None => file.origin.delete(id)?,
        };
        file.notify(id);
        Ok(deleted)
    }

    fn read_head(&mut self, offset: usize, len: usize) -> Result<Vec<u8>> {
        self.file.lock().origin.read_head(offset, len)
    }

    fn write_head(&mut self, offset: usize, data: &[u8]) -> Result<()> {
        let mut file = self.file.lock();
        if file.txn.is_some() {
            let image = file.origin.read_head(offset, data.len())?;
            file.head_backups.push((offset, image));
        }
        file.origin.write_head(offset, data)
    }

    fn count(&self) -> u64 {
        self.file.lock().origin.count()
    }

    fn bytes(&self) -> u64 {
        self.file.lock().origin.bytes()
    }

    fn block_capacity(&self) -> usize {
        self.file.lock().origin.block_capacity()
    }

    fn flush(&mut self) -> Result<()> {
        self.file.lock().origin.flush()
    }

    fn sync(&mut self) -> Result<()> {
        self.file.lock().origin.sync()
    }
}
