//! WAL Recovery
//!
//! Two passes over `[start, end)` of the log:
//! 1. classify every transaction as committed or rolled back and find the
//!    last checkpoint marker;
//! 2. from that checkpoint on, hand the last committed data record of
//!    every block to the caller for replay.
//!
//! Replaying only the final record per block keeps recovery a no-op on a
//! storage that already holds the committed state: an older image of a
//! block that was later freed or reused is never written back.
//!
//! Scanning stops at the first torn or corrupt record; everything from
//! there on is reported as the invalid tail.

use std::collections::{HashMap, HashSet};
use std::fs::File;

use super::reader::WalReader;
use super::record::{Op, WalRecord};
use super::{FileId, TxnId};
use crate::storage::BlockId;
use crate::error::{AtlasError, Result};

/// Result of a recovery operation
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Records read in the first pass
    pub records_scanned: u64,

    /// Transactions with a COMMIT marker
    pub transactions_committed: u64,

    /// Transactions with a ROLLBACK marker
    pub transactions_rolled_back: u64,

    /// Data records whose image was written back to the storage
    pub records_replayed: u64,

    /// Committed metadata-only records (their writes already stand)
    pub records_confirmed: u64,

    /// Data records of unfinished or rolled-back transactions
    pub records_skipped: u64,

    /// Committed data records overtaken by a later record for the same block
    pub records_superseded: u64,

    /// Highest transaction id seen
    pub last_txn: TxnId,

    /// End of the last intact record
    pub valid_end: u64,

    /// Whether the log was cut back to `valid_end`
    pub was_truncated: bool,
}

/// What the replay callback did with a record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Replay {
    /// The record's image was applied
    Applied,

    /// Nothing to apply (metadata only)
    Confirmed,

    /// The target is unknown or rejected the image
    Skipped,
}

type BlockKey = (FileId, BlockId);

/// Scan `[start, end)` of `file`, calling `replay` for the last committed
/// data record of every block
pub fn scan<F>(file: &File, start: u64, end: u64, mut replay: F) -> Result<RecoveryReport>
where
    F: FnMut(&WalRecord) -> Result<Replay>,
{
    let mut report = RecoveryReport::default();

    // Pass 1: classification
    let mut committed: HashSet<TxnId> = HashSet::new();
    let mut rolled_back: HashSet<TxnId> = HashSet::new();
    // record positions per transaction since the last checkpoint
    let mut touched: HashMap<TxnId, Vec<(BlockKey, u64)>> = HashMap::new();
    let mut replay_from = start;
    let mut reader = WalReader::new(file, start, end);
    loop {
        match reader.next_record() {
            Ok(Some((at, record))) => {
                report.records_scanned += 1;
                report.last_txn = report.last_txn.max(record.txn);
                match record.op {
                    Op::Commit => {
                        committed.insert(record.txn);
                    }
                    // a rollback logged after a failed commit still undoes it
                    Op::Rollback => {
                        committed.remove(&record.txn);
                        rolled_back.insert(record.txn);
                    }
                    Op::Checkpoint => {
                        replay_from = reader.position();
                        touched.clear();
                    }
                    op if op.is_data() => {
                        let key = (record.file_id, record.offset);
                        touched.entry(record.txn).or_default().push((key, at));
                    }
                    _ => {}
                }
            }
            Ok(None) => break,
            Err(AtlasError::WalCorruption(msg)) => {
                tracing::warn!("WAL scan stopped at {}: {}", reader.position(), msg);
                break;
            }
            Err(e) => return Err(e),
        }
    }
    let stop = reader.position();

    // last committed record of every block; transactions are serial, so
    // applying them in id order keeps the latest position
    let mut order: Vec<TxnId> = touched.keys().copied().filter(|t| committed.contains(t)).collect();
    order.sort_unstable();
    let mut latest: HashMap<BlockKey, u64> = HashMap::new();
    for txn in order {
        if let Some(records) = touched.remove(&txn) {
            latest.extend(records);
        }
    }
    report.valid_end = stop;
    report.transactions_committed = committed.len() as u64;
    report.transactions_rolled_back = rolled_back.len() as u64;

    // Pass 2: replay the final committed record of each block, in log order
    let mut reader = WalReader::new(file, replay_from, stop);
    while let Some((at, record)) = reader.next_record()? {
        if !record.op.is_data() {
            continue;
        }
        if !committed.contains(&record.txn) {
            report.records_skipped += 1;
            continue;
        }
        if latest.get(&(record.file_id, record.offset)) != Some(&at) {
            report.records_superseded += 1;
            continue;
        }
        match replay(&record)? {
            Replay::Applied => report.records_replayed += 1,
            Replay::Confirmed => report.records_confirmed += 1,
            Replay::Skipped => report.records_skipped += 1,
        }
    }

    Ok(report)
}
