//! Tests for BlockFile
//!
//! These tests verify:
//! - Round-trips of records smaller and larger than one block
//! - Free-list reuse after delete
//! - In-place overwrite (growing and shrinking chains)
//! - Claiming an empty block with write_at
//! - Damaged continuation links end a read instead of failing it
//! - A failed allocation leaves the free list as it was
//! - Head area and reopen validation

use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use atlasdb::config::StorageOptions;
use atlasdb::storage::{BlockId, BlockStorage, MmapStorage, BLOCK_HEADER_BYTES, HEADER_BYTES, HEAD_BYTES};
use atlasdb::AtlasError;
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn setup_temp_storage() -> (TempDir, PathBuf) {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("blocks.dat");
    (temp_dir, path)
}

fn small_options() -> StorageOptions {
    StorageOptions::builder()
        .block_capacity(64)
        .increment(4096)
        .build()
}

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

/// Overwrite bytes of block `id` in the closed file `path`, starting `at`
/// bytes into the block (64-byte capacity)
fn patch_block(path: &Path, id: u64, at: usize, bytes: &[u8]) {
    let block_bytes = (BLOCK_HEADER_BYTES + 64) as u64;
    let mut file = OpenOptions::new().write(true).open(path).unwrap();
    file.seek(SeekFrom::Start(HEADER_BYTES as u64 + id * block_bytes + at as u64))
        .unwrap();
    file.write_all(bytes).unwrap();
    file.sync_all().unwrap();
}

/// A two-block record at block 0, written and closed
fn two_block_record(path: &Path) -> Vec<u8> {
    let payload = pattern(100, 5);
    let mut storage = MmapStorage::open(path, &small_options()).unwrap();
    assert_eq!(storage.write(&payload).unwrap(), BlockId::new(0));
    storage.sync().unwrap();
    payload
}

// =============================================================================
// Round-trip Tests
// =============================================================================

#[test]
fn test_roundtrip_single_block() {
    let (_temp, path) = setup_temp_storage();
    let mut storage = MmapStorage::open(&path, &small_options()).unwrap();

    let id = storage.write(b"hello").unwrap();
    assert_eq!(storage.read(id).unwrap(), b"hello");
    assert_eq!(storage.count(), 1);
}

#[test]
fn test_roundtrip_multi_block() {
    let (_temp, path) = setup_temp_storage();
    let mut storage = MmapStorage::open(&path, &small_options()).unwrap();

    let payload = pattern(1000, 7);
    let id = storage.write(&payload).unwrap();

    assert_eq!(storage.read(id).unwrap(), payload);
    // 1000 bytes over 64-byte blocks
    assert_eq!(storage.count(), 16);
}

#[test]
fn test_roundtrip_empty_payload() {
    let (_temp, path) = setup_temp_storage();
    let mut storage = MmapStorage::open(&path, &small_options()).unwrap();

    let id = storage.write(&[]).unwrap();
    assert!(storage.read(id).unwrap().is_empty());
    assert_eq!(storage.count(), 1);
}

#[test]
fn test_roundtrip_exact_capacity() {
    let (_temp, path) = setup_temp_storage();
    let mut storage = MmapStorage::open(&path, &small_options()).unwrap();

    let payload = pattern(128, 3);
    let id = storage.write(&payload).unwrap();
    assert_eq!(storage.read(id).unwrap(), payload);
    assert_eq!(storage.count(), 2);
}

#[test]
fn test_many_records_interleaved() {
    let (_temp, path) = setup_temp_storage();
    let mut storage = MmapStorage::open(&path, &small_options()).unwrap();

    let mut records = Vec::new();
    for i in 0..200usize {
        let payload = pattern(i * 5 % 300, i as u8);
        let id = storage.write(&payload).unwrap();
        records.push((id, payload));
    }
    for (id, payload) in &records {
        assert_eq!(&storage.read(*id).unwrap(), payload);
    }
}

// =============================================================================
// Free List Tests
// =============================================================================

#[test]
fn test_delete_then_write_reuses_block() {
    let (_temp, path) = setup_temp_storage();
    let mut storage = MmapStorage::open(&path, &small_options()).unwrap();

    let _a = storage.write(b"a").unwrap();
    let b = storage.write(b"b").unwrap();
    let _c = storage.write(b"c").unwrap();
    let bytes_before = storage.bytes();

    assert!(storage.delete(b).unwrap());
    assert_eq!(storage.count(), 2);

    let d = storage.write(b"d").unwrap();
    assert_eq!(d, b);
    assert_eq!(storage.read(d).unwrap(), b"d");
    assert_eq!(storage.bytes(), bytes_before);
}

#[test]
fn test_delete_chain_frees_all_blocks() {
    let (_temp, path) = setup_temp_storage();
    let mut storage = MmapStorage::open(&path, &small_options()).unwrap();

    let id = storage.write(&pattern(300, 1)).unwrap();
    assert_eq!(storage.count(), 5);

    assert!(storage.delete(id).unwrap());
    assert_eq!(storage.count(), 0);

    // the whole chain is reusable, first block first
    let again = storage.write(&pattern(300, 2)).unwrap();
    assert_eq!(again, id);
    assert_eq!(storage.read(again).unwrap(), pattern(300, 2));
}

#[test]
fn test_delete_twice_returns_false() {
    let (_temp, path) = setup_temp_storage();
    let mut storage = MmapStorage::open(&path, &small_options()).unwrap();

    let id = storage.write(b"once").unwrap();
    assert!(storage.delete(id).unwrap());
    assert!(!storage.delete(id).unwrap());
}

#[test]
fn test_read_deleted_is_not_found() {
    let (_temp, path) = setup_temp_storage();
    let mut storage = MmapStorage::open(&path, &small_options()).unwrap();

    let id = storage.write(b"gone").unwrap();
    storage.delete(id).unwrap();
    assert!(storage.read(id).unwrap_err().is_not_found());
}

#[test]
fn test_continuation_block_is_not_a_record() {
    let (_temp, path) = setup_temp_storage();
    let mut storage = MmapStorage::open(&path, &small_options()).unwrap();

    let id = storage.write(&pattern(200, 9)).unwrap();
    let second = BlockId::new(id.get() + 1);

    assert!(storage.read(second).unwrap_err().is_not_found());
    assert!(storage.delete(second).unwrap_err().is_not_found());
    assert!(storage.write_at(second, b"x").unwrap_err().is_not_found());
}

/// One record at block 0, with free block 2 linked to itself
fn broken_free_list(path: &Path) {
    {
        let mut storage = MmapStorage::open(path, &small_options()).unwrap();
        assert_eq!(storage.write(b"a").unwrap(), BlockId::new(0));
        storage.sync().unwrap();
    }
    let mut header = [0u8; BLOCK_HEADER_BYTES];
    header[0] = b'-';
    header[1] = b'X';
    header[8..].copy_from_slice(&2i64.to_le_bytes());
    patch_block(path, 2, 0, &header);
}

#[test]
fn test_failed_write_keeps_free_list() {
    let (_temp, path) = setup_temp_storage();
    broken_free_list(&path);
    let mut storage = MmapStorage::open(&path, &small_options()).unwrap();

    // needs blocks 1..=4; block 2 cannot be taken
    let err = storage.write(&pattern(200, 1)).unwrap_err();
    assert!(matches!(err, AtlasError::CorruptChain(_)));
    assert_eq!(storage.count(), 1);

    // block 1 went back to the head
    assert_eq!(storage.write(b"x").unwrap(), BlockId::new(1));
    assert_eq!(storage.count(), 2);
}

#[test]
fn test_failed_grow_keeps_record_and_free_list() {
    let (_temp, path) = setup_temp_storage();
    broken_free_list(&path);
    let mut storage = MmapStorage::open(&path, &small_options()).unwrap();

    let err = storage.write_at(BlockId::new(0), &pattern(200, 1)).unwrap_err();
    assert!(matches!(err, AtlasError::CorruptChain(_)));
    assert_eq!(storage.read(BlockId::new(0)).unwrap(), b"a");
    assert_eq!(storage.count(), 1);
    assert_eq!(storage.write(b"x").unwrap(), BlockId::new(1));
}

// =============================================================================
// Damaged Chain Tests
// =============================================================================

#[test]
fn test_garbage_continuation_header_ends_read() {
    let (_temp, path) = setup_temp_storage();
    let payload = two_block_record(&path);
    patch_block(&path, 1, 0, &[0xff; BLOCK_HEADER_BYTES]);

    let mut storage = MmapStorage::open(&path, &small_options()).unwrap();
    assert_eq!(storage.read(BlockId::new(0)).unwrap(), &payload[..64]);
}

#[test]
fn test_link_past_end_of_file_ends_read() {
    let (_temp, path) = setup_temp_storage();
    let payload = two_block_record(&path);
    // `next` sits at byte 8 of the block header
    patch_block(&path, 0, 8, &(1i64 << 40).to_le_bytes());

    let mut storage = MmapStorage::open(&path, &small_options()).unwrap();
    assert_eq!(storage.read(BlockId::new(0)).unwrap(), &payload[..64]);
}

#[test]
fn test_self_link_is_corrupt_chain() {
    let (_temp, path) = setup_temp_storage();
    two_block_record(&path);
    patch_block(&path, 0, 8, &0i64.to_le_bytes());

    let mut storage = MmapStorage::open(&path, &small_options()).unwrap();
    assert!(matches!(storage.read(BlockId::new(0)), Err(AtlasError::CorruptChain(_))));
    assert!(matches!(storage.delete(BlockId::new(0)), Err(AtlasError::CorruptChain(_))));
}

// =============================================================================
// Overwrite Tests
// =============================================================================

#[test]
fn test_write_at_grow_and_shrink() {
    let (_temp, path) = setup_temp_storage();
    let mut storage = MmapStorage::open(&path, &small_options()).unwrap();

    let id = storage.write(b"short").unwrap();
    let neighbour = storage.write(b"neighbour").unwrap();

    storage.write_at(id, &pattern(500, 4)).unwrap();
    assert_eq!(storage.read(id).unwrap(), pattern(500, 4));
    assert_eq!(storage.read(neighbour).unwrap(), b"neighbour");
    assert_eq!(storage.count(), 8 + 1);

    storage.write_at(id, b"tiny").unwrap();
    assert_eq!(storage.read(id).unwrap(), b"tiny");
    assert_eq!(storage.count(), 2);
}

#[test]
fn test_write_at_claims_empty_block() {
    let (_temp, path) = setup_temp_storage();
    let mut storage = MmapStorage::open(&path, &small_options()).unwrap();

    let a = storage.write(b"a").unwrap();
    let b = storage.write(b"b").unwrap();
    storage.delete(a).unwrap();
    storage.delete(b).unwrap();

    // `a` sits behind `b` on the free list
    storage.write_at(a, b"claimed").unwrap();
    assert_eq!(storage.read(a).unwrap(), b"claimed");
    assert_eq!(storage.count(), 1);

    // the free list still yields `b`, never `a`
    let next = storage.write(b"next").unwrap();
    assert_eq!(next, b);
    assert_eq!(storage.read(a).unwrap(), b"claimed");
}

#[test]
fn test_write_at_past_end_is_not_found() {
    let (_temp, path) = setup_temp_storage();
    let mut storage = MmapStorage::open(&path, &small_options()).unwrap();

    let err = storage.write_at(BlockId::new(1_000_000), b"far").unwrap_err();
    assert!(err.is_not_found());
}

#[test]
fn test_none_id_is_not_found() {
    let (_temp, path) = setup_temp_storage();
    let mut storage = MmapStorage::open(&path, &small_options()).unwrap();

    assert!(storage.read(BlockId::NONE).unwrap_err().is_not_found());
    assert!(storage.delete(BlockId::NONE).unwrap_err().is_not_found());
}

// =============================================================================
// Header and Reopen Tests
// =============================================================================

#[test]
fn test_head_area_roundtrip() {
    let (_temp, path) = setup_temp_storage();
    {
        let mut storage = MmapStorage::open(&path, &small_options()).unwrap();
        storage.write_head(0, b"SIGN").unwrap();
        storage.write_head(100, &42u64.to_le_bytes()).unwrap();
        storage.sync().unwrap();
    }
    let mut storage = MmapStorage::open(&path, &small_options()).unwrap();
    assert_eq!(storage.read_head(0, 4).unwrap(), b"SIGN");
    assert_eq!(storage.read_head(100, 8).unwrap(), 42u64.to_le_bytes());
}

#[test]
fn test_head_area_bounds() {
    let (_temp, path) = setup_temp_storage();
    let mut storage = MmapStorage::open(&path, &small_options()).unwrap();

    assert!(matches!(
        storage.write_head(HEAD_BYTES - 2, b"four"),
        Err(AtlasError::Format(_))
    ));
    assert!(storage.read_head(HEAD_BYTES - 4, 4).is_ok());
}

#[test]
fn test_reopen_preserves_records() {
    let (_temp, path) = setup_temp_storage();
    let (a, b) = {
        let mut storage = MmapStorage::open(&path, &small_options()).unwrap();
        let a = storage.write(&pattern(150, 1)).unwrap();
        let b = storage.write(b"second").unwrap();
        storage.sync().unwrap();
        (a, b)
    };

    let mut storage = MmapStorage::open(&path, &small_options()).unwrap();
    assert_eq!(storage.count(), 4);
    assert_eq!(storage.read(a).unwrap(), pattern(150, 1));
    assert_eq!(storage.read(b).unwrap(), b"second");
}

#[test]
fn test_reopen_with_other_capacity_fails() {
    let (_temp, path) = setup_temp_storage();
    {
        let mut storage = MmapStorage::open(&path, &small_options()).unwrap();
        storage.write(b"x").unwrap();
        storage.sync().unwrap();
    }
    let other = StorageOptions::builder().block_capacity(128).increment(4096).build();
    assert!(matches!(MmapStorage::open(&path, &other), Err(AtlasError::Format(_))));
}

#[test]
fn test_invalid_options_rejected() {
    let (_temp, path) = setup_temp_storage();
    let zero = StorageOptions::builder().block_capacity(0).build();
    assert!(matches!(MmapStorage::open(&path, &zero), Err(AtlasError::Config(_))));

    let tiny_increment = StorageOptions::builder().block_capacity(512).increment(16).build();
    assert!(matches!(
        MmapStorage::open(&path, &tiny_increment),
        Err(AtlasError::Config(_))
    ));
}
