//! Tests for WAL Recovery
//!
//! These tests verify:
//! - Committed page images are replayed into the wrapped storage
//! - Metadata-only records are confirmed, not replayed
//! - Uncommitted tails and corrupt records are cut off
//! - Recovering twice gives the same state as recovering once
//! - Truncating mode checkpoints after recovery
//! - Transaction ids continue after the last logged one

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use atlasdb::config::{StorageOptions, WalMode, WalOptions};
use atlasdb::storage::{open_storage, BlockId, BlockStorage};
use atlasdb::wal::{Op, Wal, WalRecord, WalWriter, WriteAheadLog, RECORD_HEADER_BYTES, WAL_HEADER_BYTES};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

struct Paths {
    _temp: TempDir,
    data: PathBuf,
    wal: PathBuf,
}

fn setup_temp_paths() -> Paths {
    let temp = TempDir::new().unwrap();
    let data = temp.path().join("data.dat");
    let wal = temp.path().join("data.wal");
    Paths { _temp: temp, data, wal }
}

fn raw_storage(path: &Path) -> Box<dyn BlockStorage> {
    let options = StorageOptions::builder().block_capacity(64).increment(4096).build();
    open_storage(path, &options).unwrap()
}

fn options(mode: WalMode, images: bool) -> WalOptions {
    WalOptions::builder().mode(mode).log_page_images(images).build()
}

/// Two committed transactions: insert `alpha` and `beta`, then update `alpha`.
/// Everything is dropped without close, as in a crash.
fn committed_history(paths: &Paths, options: &WalOptions) -> (BlockId, BlockId) {
    let wal = WriteAheadLog::open(&paths.wal, options).unwrap();
    let mut storage = wal.wrap(raw_storage(&paths.data), None).unwrap();

    let txn = wal.begin().unwrap();
    let a = storage.write(b"alpha").unwrap();
    let b = storage.write(b"beta").unwrap();
    wal.commit(txn).unwrap();

    let txn = wal.begin().unwrap();
    storage.write_at(a, b"alpha-2").unwrap();
    wal.commit(txn).unwrap();

    storage.sync().unwrap();
    (a, b)
}

/// Committed history in which freed blocks come back as parts of other
/// records: small inserts, deletes, multi-block inserts, in-place growth
/// and shrinking, then small records over freed multi-block chains.
/// Returns the expected content of every live record.
fn churn(wal: &WriteAheadLog, storage: &mut Box<dyn BlockStorage>) -> HashMap<BlockId, Vec<u8>> {
    let mut model = HashMap::new();

    let txn = wal.begin().unwrap();
    let small: Vec<BlockId> = (0..40u8)
        .map(|i| {
            let payload = vec![i; 20 + i as usize];
            let id = storage.write(&payload).unwrap();
            model.insert(id, payload);
            id
        })
        .collect();
    wal.commit(txn).unwrap();

    let txn = wal.begin().unwrap();
    for id in small.iter().step_by(2) {
        storage.delete(*id).unwrap();
        model.remove(id);
    }
    wal.commit(txn).unwrap();

    let txn = wal.begin().unwrap();
    let large: Vec<BlockId> = (0..12u8)
        .map(|i| {
            let payload = vec![100 + i; 150 + 10 * i as usize];
            let id = storage.write(&payload).unwrap();
            model.insert(id, payload);
            id
        })
        .collect();
    wal.commit(txn).unwrap();

    let txn = wal.begin().unwrap();
    for (n, id) in small.iter().skip(1).step_by(2).enumerate() {
        let payload = if n % 2 == 0 { vec![200; 300] } else { vec![201; 5] };
        storage.write_at(*id, &payload).unwrap();
        model.insert(*id, payload);
    }
    wal.commit(txn).unwrap();

    let txn = wal.begin().unwrap();
    for id in large.iter().step_by(2) {
        storage.delete(*id).unwrap();
        model.remove(id);
    }
    for i in 0..20u8 {
        let payload = vec![220 + i % 30; 10];
        let id = storage.write(&payload).unwrap();
        model.insert(id, payload);
    }
    wal.commit(txn).unwrap();

    storage.sync().unwrap();
    model
}

fn assert_holds(storage: &mut Box<dyn BlockStorage>, model: &HashMap<BlockId, Vec<u8>>) {
    for (id, payload) in model {
        assert_eq!(&storage.read(*id).unwrap(), payload, "record at {}", id);
    }
    let blocks: usize = model.values().map(|p| p.len().div_ceil(64).max(1)).sum();
    assert_eq!(storage.count(), blocks as u64);
}

/// Damage the data file behind the log's back
fn clobber(paths: &Paths, a: BlockId, b: BlockId) {
    let mut raw = raw_storage(&paths.data);
    raw.write_at(a, b"stale").unwrap();
    raw.delete(b).unwrap();
    raw.sync().unwrap();
}

// =============================================================================
// Replay Tests
// =============================================================================

#[test]
fn test_recover_replays_committed_images() {
    let paths = setup_temp_paths();
    let options = options(WalMode::Log, true);
    let (a, b) = committed_history(&paths, &options);
    clobber(&paths, a, b);

    let wal = WriteAheadLog::open(&paths.wal, &options).unwrap();
    let mut storage = wal.wrap(raw_storage(&paths.data), None).unwrap();
    let report = wal.recover().unwrap();

    assert_eq!(report.records_scanned, 7);
    assert_eq!(report.transactions_committed, 2);
    // the first image of `alpha` is overtaken by the update
    assert_eq!(report.records_replayed, 2);
    assert_eq!(report.records_superseded, 1);
    assert_eq!(report.last_txn, 2);
    assert!(!report.was_truncated);

    assert_eq!(storage.read(a).unwrap(), b"alpha-2");
    assert_eq!(storage.read(b).unwrap(), b"beta");
}

#[test]
fn test_recover_without_images_confirms_only() {
    let paths = setup_temp_paths();
    let options = options(WalMode::Log, false);
    let (a, b) = committed_history(&paths, &options);

    let wal = WriteAheadLog::open(&paths.wal, &options).unwrap();
    let mut storage = wal.wrap(raw_storage(&paths.data), None).unwrap();
    let report = wal.recover().unwrap();

    assert_eq!(report.records_replayed, 0);
    assert_eq!(report.records_confirmed, 2);
    assert_eq!(report.records_superseded, 1);
    // immediate writes: the data is already in place
    assert_eq!(storage.read(a).unwrap(), b"alpha-2");
    assert_eq!(storage.read(b).unwrap(), b"beta");
}

#[test]
fn test_recover_replays_committed_delete() {
    let paths = setup_temp_paths();
    let options = options(WalMode::Log, true);
    let b = {
        let wal = WriteAheadLog::open(&paths.wal, &options).unwrap();
        let mut storage = wal.wrap(raw_storage(&paths.data), None).unwrap();
        let txn = wal.begin().unwrap();
        storage.write(b"keep").unwrap();
        let b = storage.write(b"drop").unwrap();
        wal.commit(txn).unwrap();

        let txn = wal.begin().unwrap();
        storage.delete(b).unwrap();
        wal.commit(txn).unwrap();
        storage.sync().unwrap();
        b
    };
    {
        let mut raw = raw_storage(&paths.data);
        raw.write_at(b, b"zombie").unwrap();
        raw.sync().unwrap();
    }

    let wal = WriteAheadLog::open(&paths.wal, &options).unwrap();
    let mut storage = wal.wrap(raw_storage(&paths.data), None).unwrap();
    wal.recover().unwrap();

    assert!(storage.read(b).unwrap_err().is_not_found());
    assert_eq!(storage.count(), 1);
}

#[test]
fn test_recover_leaves_intact_storage_alone() {
    let paths = setup_temp_paths();
    let options = options(WalMode::Log, true);
    let wal = WriteAheadLog::open(&paths.wal, &options).unwrap();
    let mut storage = wal.wrap(raw_storage(&paths.data), None).unwrap();
    let model = churn(&wal, &mut storage);
    assert_holds(&mut storage, &model);

    let first = wal.recover().unwrap();
    assert!(first.records_superseded > 0);
    assert_holds(&mut storage, &model);

    let second = wal.recover().unwrap();
    assert_eq!(second.records_replayed, first.records_replayed);
    assert_holds(&mut storage, &model);
}

#[test]
fn test_recover_after_crash_with_reused_blocks() {
    let paths = setup_temp_paths();
    let options = options(WalMode::Log, true);
    let model = {
        let wal = WriteAheadLog::open(&paths.wal, &options).unwrap();
        let mut storage = wal.wrap(raw_storage(&paths.data), None).unwrap();
        churn(&wal, &mut storage)
    };

    let wal = WriteAheadLog::open(&paths.wal, &options).unwrap();
    let mut storage = wal.wrap(raw_storage(&paths.data), None).unwrap();
    let report = wal.recover().unwrap();
    assert_eq!(report.transactions_committed, 5);
    assert_holds(&mut storage, &model);
}

#[test]
fn test_rollback_after_commit_marker_wins() {
    let paths = setup_temp_paths();
    let options = options(WalMode::Log, true);
    {
        // a commit whose header update failed, then rolled back
        let mut writer = WalWriter::open(&paths.wal, &options).unwrap();
        writer.append(&WalRecord::marker(Op::Begin, 1)).unwrap();
        let image = Some(b"undone".to_vec());
        writer.append(&WalRecord::data(Op::Write, 1, 1, BlockId::new(0), image)).unwrap();
        writer.commit(1).unwrap();
        writer.rollback(1).unwrap();
        writer.append(&WalRecord::marker(Op::Begin, 2)).unwrap();
        writer.commit(2).unwrap();
    }

    let wal = WriteAheadLog::open(&paths.wal, &options).unwrap();
    let storage = wal.wrap(raw_storage(&paths.data), None).unwrap();
    let report = wal.recover().unwrap();

    assert_eq!(report.transactions_committed, 1);
    assert_eq!(report.transactions_rolled_back, 1);
    assert_eq!(report.records_replayed, 0);
    assert_eq!(report.records_skipped, 1);
    assert_eq!(storage.count(), 0);
}

#[test]
fn test_unknown_file_records_are_skipped() {
    let paths = setup_temp_paths();
    let options = options(WalMode::Log, true);
    committed_history(&paths, &options);

    // reopen without wrapping any storage
    let wal = WriteAheadLog::open(&paths.wal, &options).unwrap();
    let report = wal.recover().unwrap();
    assert_eq!(report.records_replayed, 0);
    assert_eq!(report.records_skipped, 2);
}

// =============================================================================
// Tail Handling Tests
// =============================================================================

#[test]
fn test_uncommitted_tail_is_truncated() {
    let paths = setup_temp_paths();
    let options = options(WalMode::Log, true);
    let committed = {
        let wal = WriteAheadLog::open(&paths.wal, &options).unwrap();
        let mut storage = wal.wrap(raw_storage(&paths.data), None).unwrap();
        let txn = wal.begin().unwrap();
        storage.write(b"committed").unwrap();
        wal.commit(txn).unwrap();
        let committed = wal.header().unwrap().committed_offset;

        // crash in the middle of the next transaction
        wal.begin().unwrap();
        storage.write(&[3u8; 300]).unwrap();
        storage.sync().unwrap();
        committed
    };
    assert!(std::fs::metadata(&paths.wal).unwrap().len() > committed);

    let wal = WriteAheadLog::open(&paths.wal, &options).unwrap();
    let _storage = wal.wrap(raw_storage(&paths.data), None).unwrap();
    let report = wal.recover().unwrap();

    assert!(report.was_truncated);
    assert_eq!(report.transactions_committed, 1);
    assert_eq!(wal.position(), committed);
    assert_eq!(std::fs::metadata(&paths.wal).unwrap().len(), committed);
}

#[test]
fn test_corrupt_record_stops_replay() {
    let paths = setup_temp_paths();
    let options = options(WalMode::Log, true);
    let (a, b) = committed_history(&paths, &options);
    clobber(&paths, a, b);

    // flip a payload byte of the second record (the first write of txn 1)
    {
        let mut file = OpenOptions::new().write(true).open(&paths.wal).unwrap();
        let at = WAL_HEADER_BYTES + RECORD_HEADER_BYTES as u64 + RECORD_HEADER_BYTES as u64;
        file.seek(SeekFrom::Start(at)).unwrap();
        file.write_all(&[0xff]).unwrap();
        file.sync_all().unwrap();
    }

    let wal = WriteAheadLog::open(&paths.wal, &options).unwrap();
    let mut storage = wal.wrap(raw_storage(&paths.data), None).unwrap();
    let report = wal.recover().unwrap();

    assert_eq!(report.records_scanned, 1);
    assert_eq!(report.transactions_committed, 0);
    assert_eq!(report.records_replayed, 0);
    assert!(report.was_truncated);
    assert_eq!(report.valid_end, WAL_HEADER_BYTES + RECORD_HEADER_BYTES as u64);
    assert_eq!(storage.read(a).unwrap(), b"stale");
}

// =============================================================================
// Idempotence and Mode Tests
// =============================================================================

#[test]
fn test_recover_twice_is_idempotent() {
    let paths = setup_temp_paths();
    let options = options(WalMode::Log, true);
    let (a, b) = committed_history(&paths, &options);
    clobber(&paths, a, b);

    let wal = WriteAheadLog::open(&paths.wal, &options).unwrap();
    let mut storage = wal.wrap(raw_storage(&paths.data), None).unwrap();

    let first = wal.recover().unwrap();
    let state_after_first = (storage.read(a).unwrap(), storage.read(b).unwrap(), storage.count());

    let second = wal.recover().unwrap();
    let state_after_second = (storage.read(a).unwrap(), storage.read(b).unwrap(), storage.count());

    assert_eq!(state_after_first, state_after_second);
    assert_eq!(first.transactions_committed, second.transactions_committed);
    assert_eq!(wal.header().unwrap().processed_count, wal.header().unwrap().total_count);
}

#[test]
fn test_truncate_mode_checkpoints_after_recovery() {
    let paths = setup_temp_paths();
    // large interval: no automatic checkpoint before the crash
    let options = WalOptions::builder()
        .mode(WalMode::Truncate)
        .checkpoint_interval(1000)
        .log_page_images(true)
        .build();
    let (a, b) = committed_history(&paths, &options);
    clobber(&paths, a, b);

    let wal = WriteAheadLog::open(&paths.wal, &options).unwrap();
    let mut storage = wal.wrap(raw_storage(&paths.data), None).unwrap();
    let first = wal.recover().unwrap();
    assert_eq!(first.records_replayed, 2);
    assert_eq!(wal.position(), WAL_HEADER_BYTES);

    let second = wal.recover().unwrap();
    assert_eq!(second.records_scanned, 0);
    assert_eq!(storage.read(a).unwrap(), b"alpha-2");
}

#[test]
fn test_transaction_ids_continue_after_reopen() {
    let paths = setup_temp_paths();
    let options = options(WalMode::Log, false);
    committed_history(&paths, &options);

    let wal = WriteAheadLog::open(&paths.wal, &options).unwrap();
    wal.recover().unwrap();
    assert_eq!(wal.begin().unwrap(), 3);
}

#[test]
fn test_recover_during_transaction_fails() {
    let paths = setup_temp_paths();
    let wal = WriteAheadLog::open(&paths.wal, &options(WalMode::Log, false)).unwrap();
    wal.begin().unwrap();
    assert!(wal.recover().is_err());
}
