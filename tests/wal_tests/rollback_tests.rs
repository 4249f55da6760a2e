//! Tests for transaction rollback
//!
//! These tests verify:
//! - Records allocated inside a transaction are removed again
//! - Overwritten and deleted records get their old image back, at the
//!   same block
//! - A deleted block reused inside the same transaction is restored
//! - Head-area writes are undone
//! - The refresh hook sees every block a rollback touched
//! - Transaction state rules (nested begin, stale ids)
//! - The unlogged and no-op coordinators

use std::path::PathBuf;
use std::sync::Arc;

use atlasdb::config::{StorageBackend, StorageOptions, WalMode, WalOptions};
use atlasdb::storage::{open_storage, BlockId, BlockStorage};
use atlasdb::wal::{open_wal, NoWal, RefreshHook, Wal, WriteAheadLog};
use atlasdb::AtlasError;
use parking_lot::Mutex;
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn setup_temp_wal() -> (TempDir, PathBuf, PathBuf) {
    let temp_dir = TempDir::new().unwrap();
    let data = temp_dir.path().join("data.dat");
    let wal = temp_dir.path().join("data.wal");
    (temp_dir, data, wal)
}

fn storage_options(backend: StorageBackend) -> StorageOptions {
    StorageOptions::builder()
        .backend(backend)
        .block_capacity(64)
        .increment(4096)
        .build()
}

fn logged() -> (TempDir, WriteAheadLog, Box<dyn BlockStorage>) {
    let (temp, data, wal_path) = setup_temp_wal();
    let wal = WriteAheadLog::open(&wal_path, &WalOptions::builder().mode(WalMode::Log).build()).unwrap();
    let storage = open_storage(&data, &storage_options(StorageBackend::Mmap)).unwrap();
    let storage = wal.wrap(storage, None).unwrap();
    (temp, wal, storage)
}

fn recording_hook() -> (RefreshHook, Arc<Mutex<Vec<BlockId>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let hook: RefreshHook = Arc::new(move |id| sink.lock().push(id));
    (hook, seen)
}

// =============================================================================
// Undo Tests
// =============================================================================

#[test]
fn test_rollback_removes_allocated_records() {
    let (_temp, wal, mut storage) = logged();

    let txn = wal.begin().unwrap();
    let id = storage.write(&[1u8; 200]).unwrap();
    assert_eq!(storage.count(), 4);

    let stats = wal.rollback(txn).unwrap();
    assert_eq!(stats.removed, 1);
    assert_eq!(stats.restored, 0);
    assert_eq!(storage.count(), 0);
    assert!(storage.read(id).unwrap_err().is_not_found());
}

#[test]
fn test_rollback_restores_overwritten_record() {
    let (_temp, wal, mut storage) = logged();
    let id = storage.write(b"original").unwrap();

    let txn = wal.begin().unwrap();
    storage.write_at(id, &[9u8; 500]).unwrap();
    storage.write_at(id, b"second overwrite").unwrap();
    let stats = wal.rollback(txn).unwrap();

    assert_eq!(stats.restored, 1);
    assert_eq!(storage.read(id).unwrap(), b"original");
    assert_eq!(storage.count(), 1);
}

#[test]
fn test_rollback_restores_deleted_record_in_place() {
    let (_temp, wal, mut storage) = logged();
    let keep = storage.write(b"keep").unwrap();
    let id = storage.write(&[4u8; 150]).unwrap();

    let txn = wal.begin().unwrap();
    assert!(storage.delete(id).unwrap());
    wal.rollback(txn).unwrap();

    assert_eq!(storage.read(id).unwrap(), vec![4u8; 150]);
    assert_eq!(storage.read(keep).unwrap(), b"keep");
    assert_eq!(storage.count(), 4);
}

#[test]
fn test_rollback_restores_block_reused_in_transaction() {
    let (_temp, wal, mut storage) = logged();
    let id = storage.write(b"victim").unwrap();

    let txn = wal.begin().unwrap();
    storage.delete(id).unwrap();
    // the freed block is the free-list head
    let reused = storage.write(b"intruder").unwrap();
    assert_eq!(reused, id);
    let other = storage.write(b"other").unwrap();
    wal.rollback(txn).unwrap();

    assert_eq!(storage.read(id).unwrap(), b"victim");
    assert!(storage.read(other).unwrap_err().is_not_found());
    assert_eq!(storage.count(), 1);
}

#[test]
fn test_rollback_of_delete_of_allocated_record() {
    let (_temp, wal, mut storage) = logged();

    let txn = wal.begin().unwrap();
    let id = storage.write(b"short lived").unwrap();
    storage.delete(id).unwrap();
    wal.rollback(txn).unwrap();

    assert_eq!(storage.count(), 0);
    assert!(storage.read(id).unwrap_err().is_not_found());
}

#[test]
fn test_rollback_restores_head_area() {
    let (_temp, wal, mut storage) = logged();
    storage.write_head(0, b"OLD!").unwrap();

    let txn = wal.begin().unwrap();
    storage.write_head(0, b"NEW!").unwrap();
    storage.write_head(0, b"NEWER").unwrap();
    wal.rollback(txn).unwrap();

    assert_eq!(storage.read_head(0, 5).unwrap(), b"OLD!\0");
}

#[test]
fn test_commit_keeps_changes() {
    let (_temp, wal, mut storage) = logged();
    let id = storage.write(b"before").unwrap();

    let txn = wal.begin().unwrap();
    storage.write_at(id, b"after").unwrap();
    let added = storage.write(b"added").unwrap();
    wal.commit(txn).unwrap();

    // nothing left to undo
    let stats = wal.rollback(txn).unwrap();
    assert_eq!(stats.removed + stats.restored, 0);
    assert_eq!(storage.read(id).unwrap(), b"after");
    assert_eq!(storage.read(added).unwrap(), b"added");
}

// =============================================================================
// Refresh Hook Tests
// =============================================================================

#[test]
fn test_refresh_hook_sees_touched_blocks() {
    let (_temp, data, wal_path) = setup_temp_wal();
    let wal = WriteAheadLog::open(&wal_path, &WalOptions::builder().mode(WalMode::Log).build()).unwrap();
    let (hook, seen) = recording_hook();
    let storage = open_storage(&data, &storage_options(StorageBackend::Mmap)).unwrap();
    let mut storage = wal.wrap(storage, Some(hook)).unwrap();

    let a = storage.write(b"a").unwrap();
    let b = storage.write(b"b").unwrap();

    let txn = wal.begin().unwrap();
    storage.write_at(a, b"a2").unwrap();
    let c = storage.write(b"c").unwrap();
    assert!(seen.lock().is_empty());

    storage.delete(b).unwrap();
    assert_eq!(seen.lock().as_slice(), &[b]);
    wal.rollback(txn).unwrap();

    let seen = seen.lock();
    assert!(seen.contains(&a));
    assert!(seen.contains(&c));
    assert_eq!(seen.iter().filter(|&&id| id == b).count(), 2);
}

// =============================================================================
// Transaction State Tests
// =============================================================================

#[test]
fn test_nested_begin_fails() {
    let (_temp, wal, _storage) = logged();
    wal.begin().unwrap();
    assert!(matches!(wal.begin(), Err(AtlasError::Transaction(_))));
}

#[test]
fn test_ids_increase() {
    let (_temp, wal, _storage) = logged();
    let first = wal.begin().unwrap();
    wal.commit(first).unwrap();
    let second = wal.begin().unwrap();
    wal.rollback(second).unwrap();
    let third = wal.begin().unwrap();
    assert_eq!((first, second, third), (1, 2, 3));
    assert_eq!(wal.active(), Some(3));
}

#[test]
fn test_finishing_inactive_id_is_noop() {
    let (_temp, wal, mut storage) = logged();
    let txn = wal.begin().unwrap();
    let id = storage.write(b"x").unwrap();

    wal.commit(txn + 10).unwrap();
    assert_eq!(wal.rollback(txn + 10).unwrap().removed, 0);
    assert_eq!(wal.active(), Some(txn));
    assert_eq!(storage.read(id).unwrap(), b"x");
}

#[test]
fn test_checkpoint_during_transaction_fails() {
    let (_temp, wal, _storage) = logged();
    wal.begin().unwrap();
    assert!(matches!(wal.checkpoint(), Err(AtlasError::Transaction(_))));
}

#[test]
fn test_wrap_during_transaction_joins_it() {
    let (temp, wal, _storage) = logged();
    let txn = wal.begin().unwrap();

    let late = open_storage(&temp.path().join("late.dat"), &storage_options(StorageBackend::Mmap)).unwrap();
    let mut late = wal.wrap(late, None).unwrap();
    late.write(b"late").unwrap();
    wal.rollback(txn).unwrap();

    assert_eq!(late.count(), 0);
}

// =============================================================================
// Coordinator Variant Tests
// =============================================================================

#[test]
fn test_unlogged_rollback_on_memory_storage() {
    let wal = WriteAheadLog::unlogged(&WalOptions::default());
    assert!(wal.path().is_none());
    assert!(wal.header().is_none());

    let storage = open_storage(&PathBuf::from("unused"), &storage_options(StorageBackend::Memory)).unwrap();
    let mut storage = wal.wrap(storage, None).unwrap();
    let id = storage.write(b"base").unwrap();

    let txn = wal.begin().unwrap();
    storage.write_at(id, b"changed").unwrap();
    storage.write(b"extra").unwrap();
    wal.rollback(txn).unwrap();

    assert_eq!(storage.read(id).unwrap(), b"base");
    assert_eq!(storage.count(), 1);
    assert_eq!(wal.recover().unwrap().records_scanned, 0);
}

#[test]
fn test_no_wal_is_bookkeeping_only() {
    let wal = NoWal;
    let storage = open_storage(&PathBuf::from("unused"), &storage_options(StorageBackend::Memory)).unwrap();
    let mut storage = wal.wrap(storage, None).unwrap();

    let txn = wal.begin().unwrap();
    assert_eq!(txn, 1);
    storage.write(b"stays").unwrap();
    wal.rollback(txn).unwrap();
    assert_eq!(storage.count(), 1);
}

#[test]
fn test_open_wal_disabled_creates_no_file() {
    let (_temp, _data, wal_path) = setup_temp_wal();
    let options = WalOptions::builder().mode(WalMode::Disabled).build();
    let wal = open_wal(&wal_path, &options).unwrap();

    assert_eq!(wal.begin().unwrap(), 1);
    wal.close().unwrap();
    assert!(!wal_path.exists());
}
