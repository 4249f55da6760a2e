//! WAL Writer
//!
//! Appends records to the log file through an in-memory batch buffer.
//!
//! ## Batching
//! - Records accumulate in the buffer until it holds `batch_size` records or
//!   `buffer_size` bytes, or until a commit/checkpoint forces it out.
//! - Records of at least `direct_write_threshold` bytes skip the buffer:
//!   the buffer is written first, then the record header and payload go out
//!   in one vectored write at the log end.
//!
//! `position()` is the logical end of the log (file end plus buffered bytes).

use std::fs::{File, OpenOptions};
use std::io::{IoSlice, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use super::header::{WalHeader, WAL_HEADER_BYTES, WAL_HEADER_FIELDS};
use super::record::{Op, WalRecord};
use super::TxnId;
use crate::config::{WalMode, WalOptions, WalSyncStrategy};
use crate::error::{AtlasError, Result};
use crate::storage::pio;

/// A checkpoint this close to the log end still truncates the log
const TRUNCATE_TOLERANCE: u64 = 64;

/// Writes records to the WAL file
pub struct WalWriter {
    path: PathBuf,
    file: File,
    header: WalHeader,
    buffer: Vec<u8>,
    batched: usize,
    /// File offset where the buffer will land
    flushed: u64,
    options: WalOptions,
}

impl WalWriter {
    /// Open or create a WAL file
    pub fn open(path: &Path, options: &WalOptions) -> Result<Self> {
        options.validate()?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let len = file.metadata()?.len();

        let mut buffer = Vec::new();
        buffer.try_reserve_exact(options.buffer_size).map_err(|e| {
            AtlasError::OutOfMemory(format!("WAL batch buffer of {} bytes: {}", options.buffer_size, e))
        })?;

        let mut writer = Self {
            path: path.to_path_buf(),
            file,
            header: WalHeader::default(),
            buffer,
            batched: 0,
            flushed: len.max(WAL_HEADER_BYTES),
            options: options.clone(),
        };

        if len < WAL_HEADER_BYTES {
            writer.file.set_len(WAL_HEADER_BYTES)?;
            writer.write_header()?;
            writer.file.sync_all()?;
            tracing::debug!("Created WAL {}", path.display());
        } else {
            let mut buf = [0u8; WAL_HEADER_FIELDS];
            pio::read_at(&writer.file, 0, &mut buf)?;
            writer.header = WalHeader::decode(&buf)?;
            tracing::debug!(
                "Opened WAL {} ({} bytes, last txn {}, committed at {}, checkpoint at {})",
                path.display(),
                len,
                writer.header.txn,
                writer.header.committed_offset,
                writer.header.checkpoint_offset
            );
        }
        Ok(writer)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> &WalHeader {
        &self.header
    }

    pub fn file(&self) -> &File {
        &self.file
    }

    /// Logical end of the log
    pub fn position(&self) -> u64 {
        self.flushed + self.buffer.len() as u64
    }

    /// Bytes of the log file on disk
    pub fn file_len(&self) -> u64 {
        self.flushed
    }

    /// Append a record, returning the log offset it was written at
    pub fn append(&mut self, record: &WalRecord) -> Result<u64> {
        let encoded = record.encode(self.options.compression_threshold);
        let len = encoded.len();

        if len >= self.options.direct_write_threshold {
            self.flush_batch()?;
            let at = self.flushed;
            self.write_vectored_at(at, &[&encoded.header, &encoded.body])?;
            self.flushed += len as u64;
            self.header.total_count = self.header.total_count.wrapping_add(1);
            tracing::trace!("Direct WAL write of {} bytes at {}", len, at);
            return Ok(at);
        }

        if self.batched >= self.options.batch_size
            || self.buffer.len() + len > self.options.buffer_size
        {
            self.flush_batch()?;
        }
        let at = self.position();
        self.buffer.extend_from_slice(&encoded.header);
        self.buffer.extend_from_slice(&encoded.body);
        self.batched += 1;
        self.header.total_count = self.header.total_count.wrapping_add(1);
        Ok(at)
    }

    /// Write buffered records to the file
    pub fn flush_batch(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        pio::write_all_at(&self.file, self.flushed, &self.buffer)?;
        self.flushed += self.buffer.len() as u64;
        self.buffer.clear();
        self.batched = 0;
        if self.options.sync == WalSyncStrategy::OnBatch {
            self.file.sync_data()?;
        }
        Ok(())
    }

    /// Append COMMIT for `txn`, force the batch out and advance the committed offset
    pub fn commit(&mut self, txn: TxnId) -> Result<()> {
        let at = self.append(&WalRecord::marker(Op::Commit, txn))?;
        if let Err(e) = self.flush_batch() {
            // a marker that never reached the file is dropped, so the
            // transaction can still be rolled back
            if at >= self.flushed {
                self.buffer.truncate((at - self.flushed) as usize);
                self.batched = self.batched.saturating_sub(1);
                self.header.total_count = self.header.total_count.wrapping_sub(1);
            }
            return Err(e);
        }
        self.header.txn = txn;
        self.header.committed_offset = self.flushed;
        self.write_header()?;
        if self.options.sync == WalSyncStrategy::EveryCommit {
            self.file.sync_data()?;
        }
        Ok(())
    }

    /// Append ROLLBACK for `txn`
    pub fn rollback(&mut self, txn: TxnId) -> Result<()> {
        self.append(&WalRecord::marker(Op::Rollback, txn))?;
        self.flush_batch()
    }

    /// Record a checkpoint; in truncating mode the log is cut back to its header.
    ///
    /// Returns whether the log was truncated.
    pub fn checkpoint(&mut self) -> Result<bool> {
        self.flush_batch()?;
        self.append(&WalRecord::marker(Op::Checkpoint, self.header.txn))?;
        self.flush_batch()?;
        self.header.checkpoint_offset = self.flushed;
        self.header.committed_offset = self.flushed;
        self.write_header()?;
        self.file.sync_data()?;

        let end = self.position();
        if self.options.mode == WalMode::Truncate
            && self.header.checkpoint_offset + TRUNCATE_TOLERANCE >= end
        {
            self.truncate_to(WAL_HEADER_BYTES)?;
            self.header.committed_offset = 0;
            self.header.checkpoint_offset = 0;
            self.header.total_count = 0;
            self.header.processed_count = 0;
            self.write_header()?;
            self.file.sync_data()?;
            tracing::debug!("Checkpoint truncated WAL {}", self.path.display());
            return Ok(true);
        }
        tracing::debug!(
            "Checkpoint at {} in WAL {}",
            self.header.checkpoint_offset,
            self.path.display()
        );
        Ok(false)
    }

    /// Drop everything past `len` (buffered records included)
    pub fn truncate_to(&mut self, len: u64) -> Result<()> {
        let len = len.max(WAL_HEADER_BYTES);
        self.buffer.clear();
        self.batched = 0;
        self.file.set_len(len)?;
        self.flushed = len;
        if self.header.committed_offset > len {
            self.header.committed_offset = len;
        }
        if self.header.checkpoint_offset > len {
            self.header.checkpoint_offset = len;
        }
        Ok(())
    }

    /// Mark every appended record as processed and persist the header
    pub fn mark_processed(&mut self) -> Result<()> {
        self.header.processed_count = self.header.total_count;
        self.write_header()?;
        self.file.sync_data()?;
        Ok(())
    }

    /// Set the record counters (after a recovery scan)
    pub fn set_total_count(&mut self, total: u32) {
        self.header.total_count = total;
    }

    pub fn sync(&mut self) -> Result<()> {
        self.flush_batch()?;
        self.write_header()?;
        self.file.sync_data()?;
        Ok(())
    }

    /// Swap the file handle for a read-only one, so that every write fails
    #[cfg(test)]
    pub(crate) fn set_read_only(&mut self, read_only: bool) -> Result<()> {
        self.file = OpenOptions::new().read(true).write(!read_only).open(&self.path)?;
        Ok(())
    }

    fn write_header(&mut self) -> Result<()> {
        let bytes = self.header.encode();
        pio::write_all_at(&self.file, 0, &bytes)?;
        Ok(())
    }

    /// Write all slices back to back starting at `pos`
    fn write_vectored_at(&mut self, pos: u64, parts: &[&[u8]]) -> Result<()> {
        self.file.seek(SeekFrom::Start(pos))?;
        let mut slices: Vec<IoSlice<'_>> = parts
            .iter()
            .filter(|p| !p.is_empty())
            .map(|p| IoSlice::new(p))
            .collect();
        let mut bufs = &mut slices[..];
        while !bufs.is_empty() {
            match self.file.write_vectored(bufs) {
                Ok(0) => {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::WriteZero,
                        "failed to write WAL record",
                    )
                    .into())
                }
                Ok(n) => IoSlice::advance_slices(&mut bufs, n),
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

impl Drop for WalWriter {
    fn drop(&mut self) {
        if let Err(e) = self.flush_batch() {
            tracing::warn!("Failed to flush WAL {} on drop: {}", self.path.display(), e);
        }
    }
}
