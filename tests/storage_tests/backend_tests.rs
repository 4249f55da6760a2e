//! Tests for the storage backends
//!
//! These tests verify:
//! - The same workload behaves identically on every backend
//! - Mmap and direct files persist across reopen
//! - The direct backend keeps writes in its page cache until flushed

use std::path::Path;

use atlasdb::config::{StorageBackend, StorageOptions};
use atlasdb::storage::{open_storage, BlockId, BlockStorage, DirectStorage};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn setup_temp_dir() -> TempDir {
    TempDir::new().unwrap()
}

fn options(backend: StorageBackend) -> StorageOptions {
    StorageOptions::builder()
        .backend(backend)
        .block_capacity(100)
        .increment(64 * 1024)
        .page_cache_pages(8)
        .build()
}

/// Random writes, overwrites and deletes checked against a shadow copy
fn run_workload(storage: &mut dyn BlockStorage, seed: u64) -> Vec<(BlockId, Vec<u8>)> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut live: Vec<(BlockId, Vec<u8>)> = Vec::new();

    for _ in 0..500 {
        match rng.gen_range(0..10) {
            0..=4 => {
                let len = rng.gen_range(0..700);
                let payload: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
                let id = storage.write(&payload).unwrap();
                live.push((id, payload));
            }
            5..=7 if !live.is_empty() => {
                let i = rng.gen_range(0..live.len());
                let len = rng.gen_range(0..700);
                let payload: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
                storage.write_at(live[i].0, &payload).unwrap();
                live[i].1 = payload;
            }
            _ if !live.is_empty() => {
                let i = rng.gen_range(0..live.len());
                let (id, _) = live.swap_remove(i);
                assert!(storage.delete(id).unwrap());
            }
            _ => {}
        }
    }

    for (id, payload) in &live {
        assert_eq!(&storage.read(*id).unwrap(), payload);
    }
    live
}

fn check_backend(backend: StorageBackend, path: &Path) {
    let mut storage = open_storage(path, &options(backend)).unwrap();
    let live = run_workload(storage.as_mut(), 42);
    let blocks: u64 = live
        .iter()
        .map(|(_, p)| p.len().div_ceil(100).max(1) as u64)
        .sum();
    assert_eq!(storage.count(), blocks);
}

// =============================================================================
// Workload Tests
// =============================================================================

#[test]
fn test_memory_backend_workload() {
    let temp = setup_temp_dir();
    check_backend(StorageBackend::Memory, &temp.path().join("unused"));
}

#[test]
fn test_mmap_backend_workload() {
    let temp = setup_temp_dir();
    check_backend(StorageBackend::Mmap, &temp.path().join("mmap.dat"));
}

#[test]
fn test_direct_backend_workload() {
    let temp = setup_temp_dir();
    check_backend(StorageBackend::Direct, &temp.path().join("direct.dat"));
}

// =============================================================================
// Persistence Tests
// =============================================================================

fn check_persistence(backend: StorageBackend) {
    let temp = setup_temp_dir();
    let path = temp.path().join("persist.dat");

    let live = {
        let mut storage = open_storage(&path, &options(backend)).unwrap();
        let live = run_workload(storage.as_mut(), 7);
        storage.write_head(0, b"HEAD").unwrap();
        storage.sync().unwrap();
        live
    };

    let mut storage = open_storage(&path, &options(backend)).unwrap();
    assert_eq!(storage.read_head(0, 4).unwrap(), b"HEAD");
    for (id, payload) in &live {
        assert_eq!(&storage.read(*id).unwrap(), payload);
    }
}

#[test]
fn test_mmap_persists_across_reopen() {
    check_persistence(StorageBackend::Mmap);
}

#[test]
fn test_direct_persists_across_reopen() {
    check_persistence(StorageBackend::Direct);
}

#[test]
fn test_memory_backend_starts_empty() {
    let temp = setup_temp_dir();
    let path = temp.path().join("mem");
    {
        let mut storage = open_storage(&path, &options(StorageBackend::Memory)).unwrap();
        storage.write(b"lost").unwrap();
    }
    let storage = open_storage(&path, &options(StorageBackend::Memory)).unwrap();
    assert_eq!(storage.count(), 0);
    assert!(!path.exists());
}

// =============================================================================
// Direct I/O Page Cache Tests
// =============================================================================

#[test]
fn test_direct_flush_clears_dirty_pages() {
    let temp = setup_temp_dir();
    let path = temp.path().join("dirty.dat");
    let mut storage = DirectStorage::open(&path, &options(StorageBackend::Direct)).unwrap();

    let id = storage.write(&[5u8; 300]).unwrap();
    assert!(storage.dirty_pages() > 0);

    storage.flush().unwrap();
    assert_eq!(storage.dirty_pages(), 0);
    assert_eq!(storage.read(id).unwrap(), vec![5u8; 300]);
}

#[test]
fn test_direct_cache_eviction_keeps_data() {
    let temp = setup_temp_dir();
    let path = temp.path().join("evict.dat");
    // 8 cached pages, far more data than that
    let mut storage = DirectStorage::open(&path, &options(StorageBackend::Direct)).unwrap();

    let ids: Vec<_> = (0..400u32)
        .map(|i| storage.write(&i.to_le_bytes().repeat(20)).unwrap())
        .collect();
    for (i, id) in ids.iter().enumerate() {
        assert_eq!(storage.read(*id).unwrap(), (i as u32).to_le_bytes().repeat(20));
    }
}
