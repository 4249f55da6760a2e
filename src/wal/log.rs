//! The write-ahead log coordinator

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use super::header::{WalHeader, WAL_HEADER_BYTES};
use super::record::{Op, WalRecord};
use super::recovery::{self, RecoveryReport, Replay};
use super::storage::{WalFile, WalStorage};
use super::writer::WalWriter;
use super::{RefreshHook, RollbackStats, TxnId, Wal};
use crate::config::{WalMode, WalOptions};
use crate::error::{AtlasError, Result};
use crate::storage::BlockStorage;

struct TxnState {
    active: Option<TxnId>,
    next_id: TxnId,
    commits_since_checkpoint: u64,
}

/// State shared between the log and every storage it wraps.
///
/// Lock order: `state`, then `files`, then a single file, then `writer`.
pub(crate) struct WalInner {
    /// `None` for an unlogged coordinator (undo state only)
    writer: Mutex<Option<WalWriter>>,
    files: Mutex<Vec<Arc<Mutex<WalFile>>>>,
    state: Mutex<TxnState>,
    options: WalOptions,
}

impl WalInner {
    pub(crate) fn append(&self, record: &WalRecord) -> Result<u64> {
        match self.writer.lock().as_mut() {
            Some(writer) => writer.append(record),
            None => Ok(0),
        }
    }

    /// Payload to log for a data record
    pub(crate) fn image(&self, payload: &[u8]) -> Option<Vec<u8>> {
        self.options.log_page_images.then(|| payload.to_vec())
    }

    fn files(&self) -> Vec<Arc<Mutex<WalFile>>> {
        self.files.lock().clone()
    }

    fn sync_files(&self) -> Result<()> {
        for file in self.files() {
            file.lock().origin.sync()?;
        }
        Ok(())
    }

    fn checkpoint_locked(&self) -> Result<bool> {
        self.sync_files()?;
        match self.writer.lock().as_mut() {
            Some(writer) => writer.checkpoint(),
            None => Ok(false),
        }
    }
}

/// Write-ahead log backed by a file next to the storages it protects
pub struct WriteAheadLog {
    path: Option<PathBuf>,
    inner: Arc<WalInner>,
}

impl WriteAheadLog {
    /// Open or create the log file at `path`
    pub fn open(path: &Path, options: &WalOptions) -> Result<Self> {
        let writer = WalWriter::open(path, options)?;
        let next_id = writer.header().txn + 1;
        Ok(Self::build(Some(path.to_path_buf()), Some(writer), next_id, options))
    }

    /// A coordinator without a log file: transactions can be rolled back,
    /// but nothing survives a crash. Used for in-memory storages.
    pub fn unlogged(options: &WalOptions) -> Self {
        Self::build(None, None, 1, options)
    }

    fn build(path: Option<PathBuf>, writer: Option<WalWriter>, next_id: TxnId, options: &WalOptions) -> Self {
        Self {
            path,
            inner: Arc::new(WalInner {
                writer: Mutex::new(writer),
                files: Mutex::new(Vec::new()),
                state: Mutex::new(TxnState {
                    active: None,
                    next_id,
                    commits_since_checkpoint: 0,
                }),
                options: options.clone(),
            }),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// The transaction currently in progress
    pub fn active(&self) -> Option<TxnId> {
        self.inner.state.lock().active
    }

    /// Logical end of the log (buffered records included)
    pub fn position(&self) -> u64 {
        self.inner
            .writer
            .lock()
            .as_ref()
            .map(|w| w.position())
            .unwrap_or(0)
    }

    /// Current header fields
    pub fn header(&self) -> Option<WalHeader> {
        self.inner.writer.lock().as_ref().map(|w| w.header().clone())
    }

    fn name(&self) -> String {
        match &self.path {
            Some(path) => path.display().to_string(),
            None => "<unlogged>".to_string(),
        }
    }
}

impl Wal for WriteAheadLog {
    fn begin(&self) -> Result<TxnId> {
        let mut state = self.inner.state.lock();
        if let Some(active) = state.active {
            return Err(AtlasError::Transaction(format!(
                "transaction {} is still active",
                active
            )));
        }
        let txn = state.next_id;
        for file in self.inner.files() {
            file.lock().txn = Some(txn);
        }
        self.inner.append(&WalRecord::marker(Op::Begin, txn))?;
        state.next_id += 1;
        state.active = Some(txn);
        tracing::trace!("Began transaction {}", txn);
        Ok(txn)
    }

    fn commit(&self, txn: TxnId) -> Result<()> {
        let mut state = self.inner.state.lock();
        if state.active != Some(txn) {
            return Ok(());
        }
        // write back process caches before the commit record goes out
        let files = self.inner.files();
        for file in &files {
            file.lock().origin.flush()?;
        }
        // on failure the undo state stays, so the caller can still roll back
        if let Some(writer) = self.inner.writer.lock().as_mut() {
            writer.commit(txn)?;
        }
        for file in &files {
            file.lock().finish();
        }
        state.active = None;
        state.commits_since_checkpoint += 1;
        tracing::trace!("Committed transaction {}", txn);

        if self.inner.options.mode == WalMode::Truncate
            && state.commits_since_checkpoint >= self.inner.options.checkpoint_interval
        {
            self.inner.checkpoint_locked()?;
            state.commits_since_checkpoint = 0;
        }
        Ok(())
    }

    fn rollback(&self, txn: TxnId) -> Result<RollbackStats> {
        let mut state = self.inner.state.lock();
        if state.active != Some(txn) {
            return Ok(RollbackStats::default());
        }
        let mut stats = RollbackStats::default();
        for file in self.inner.files() {
            let file_stats = file.lock().rollback()?;
            stats.removed += file_stats.removed;
            stats.restored += file_stats.restored;
        }
        if let Some(writer) = self.inner.writer.lock().as_mut() {
            writer.rollback(txn)?;
        }
        state.active = None;
        tracing::debug!(
            "Rolled back transaction {} ({} records removed, {} restored)",
            txn,
            stats.removed,
            stats.restored
        );
        Ok(stats)
    }

    fn checkpoint(&self) -> Result<()> {
        let mut state = self.inner.state.lock();
        if let Some(active) = state.active {
            return Err(AtlasError::Transaction(format!(
                "cannot checkpoint while transaction {} is active",
                active
            )));
        }
        self.inner.checkpoint_locked()?;
        state.commits_since_checkpoint = 0;
        Ok(())
    }

    fn recover(&self) -> Result<RecoveryReport> {
        let mut state = self.inner.state.lock();
        if let Some(active) = state.active {
            return Err(AtlasError::Transaction(format!(
                "cannot recover while transaction {} is active",
                active
            )));
        }

        // Step 1: work out the scan range from the header
        let (file, start, end) = {
            let mut guard = self.inner.writer.lock();
            let Some(writer) = guard.as_mut() else {
                return Ok(RecoveryReport::default());
            };
            writer.flush_batch()?;
            let header = writer.header();
            let file_end = writer.file_len();
            let start = header.checkpoint_offset.max(WAL_HEADER_BYTES);
            let end = if header.committed_offset > 0 {
                header.committed_offset.min(file_end)
            } else {
                file_end
            };
            (writer.file().try_clone()?, start, end.max(start))
        };

        // Step 2: classify and replay against the wrapped storages
        let targets: HashMap<_, _> = self
            .inner
            .files()
            .into_iter()
            .map(|file| {
                let id = file.lock().id;
                (id, file)
            })
            .collect();
        let mut report = recovery::scan(&file, start, end, |record| {
            let Some(target) = targets.get(&record.file_id) else {
                tracing::warn!("WAL record for unknown file {} skipped", record.file_id);
                return Ok(Replay::Skipped);
            };
            let mut target = target.lock();
            match (record.op, &record.payload) {
                (Op::Write | Op::Update, Some(image)) => {
                    match target.origin.write_at(record.offset, image) {
                        Ok(()) => Ok(Replay::Applied),
                        Err(e) if e.is_not_found() => {
                            tracing::warn!("Cannot replay {:?} at {}: {}", record.op, record.offset, e);
                            Ok(Replay::Skipped)
                        }
                        Err(e) => Err(e),
                    }
                }
                (Op::Delete, Some(_)) => match target.origin.delete(record.offset) {
                    Ok(_) => Ok(Replay::Applied),
                    Err(e) if e.is_not_found() => Ok(Replay::Skipped),
                    Err(e) => Err(e),
                },
                _ => Ok(Replay::Confirmed),
            }
        })?;

        // Step 3: make the replayed state durable
        self.inner.sync_files()?;

        // Step 4: cut off the torn or uncommitted tail and persist counters
        if let Some(writer) = self.inner.writer.lock().as_mut() {
            if report.valid_end < writer.file_len() {
                writer.truncate_to(report.valid_end)?;
                report.was_truncated = true;
            }
            writer.mark_processed()?;
        }
        state.next_id = state.next_id.max(report.last_txn + 1);

        if self.inner.options.mode == WalMode::Truncate {
            self.inner.checkpoint_locked()?;
            state.commits_since_checkpoint = 0;
        }

        tracing::info!(
            "Recovered WAL {}: {} records scanned, {} committed txns, {} replayed, {} confirmed, {} superseded, {} skipped{}",
            self.name(),
            report.records_scanned,
            report.transactions_committed,
            report.records_replayed,
            report.records_confirmed,
            report.records_superseded,
            report.records_skipped,
            if report.was_truncated { ", tail truncated" } else { "" }
        );
        Ok(report)
    }

    fn wrap(
        &self,
        origin: Box<dyn BlockStorage>,
        refresh: Option<RefreshHook>,
    ) -> Result<Box<dyn BlockStorage>> {
        let state = self.inner.state.lock();
        let mut files = self.inner.files.lock();
        let id = files.len() as u32 + 1;
        let mut file = WalFile::new(id, origin, refresh);
        file.txn = state.active;
        let file = Arc::new(Mutex::new(file));
        files.push(Arc::clone(&file));
        tracing::debug!("Wrapped storage as file {} of WAL {}", id, self.name());
        Ok(Box::new(WalStorage::new(file, Arc::clone(&self.inner))))
    }

    fn close(&self) -> Result<()> {
        let state = self.inner.state.lock();
        if self.inner.options.mode == WalMode::Truncate && state.active.is_none() {
            self.inner.checkpoint_locked()?;
        } else {
            self.inner.sync_files()?;
            if let Some(writer) = self.inner.writer.lock().as_mut() {
                writer.sync()?;
            }
        }
        tracing::debug!("Closed WAL {}", self.name());
        Ok(())
    }
}
