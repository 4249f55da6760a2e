//! Storage header page
//!
//! The first `HEADER_BYTES` of the file. The owning layer gets the leading
//! `HEAD_BYTES` for its own metadata; the common header sits at the end:
//!
//! ```text
//! offset  field            type
//! ──────  ───────────────  ─────
//!   +0    magic            u64    "ATLASBLK"
//!   +8    free-list head   i64
//!  +16    legacy tail      i64    always 0
//!  +24    version          i16
//!  +26    increment        i32
//!  +30    reserved         24 bytes
//!  +54    block capacity   i16
//!  +56    live count       i64
//! ```

use bytes::{Buf, BufMut};

use super::BlockId;
use crate::error::{AtlasError, Result};

/// Size of the header page
pub const HEADER_BYTES: usize = 16 * 1024;

/// Size of the common header at the end of the header page
pub const COMMON_HEADER_BYTES: usize = 64;

/// Bytes of the header page available to the owning layer
pub const HEAD_BYTES: usize = HEADER_BYTES - COMMON_HEADER_BYTES;

const MAGIC: u64 = u64::from_le_bytes(*b"ATLASBLK");
const VERSION: i16 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageHeader {
    pub free_head: BlockId,
    pub increment: u32,
    pub block_capacity: u16,
    pub count: u64,
}

impl StorageHeader {
    /// Header of a fresh file: the free list starts at block 0
    pub fn new(block_capacity: u16, increment: u32) -> Self {
        Self {
            free_head: BlockId::new(0),
            increment,
            block_capacity,
            count: 0,
        }
    }

    /// File position of the common header
    pub const fn position() -> u64 {
        HEAD_BYTES as u64
    }

    pub fn encode(&self) -> [u8; COMMON_HEADER_BYTES] {
        let mut buf = [0u8; COMMON_HEADER_BYTES];
        let mut out = &mut buf[..];
        out.put_u64_le(MAGIC);
        out.put_i64_le(self.free_head.to_disk());
        out.put_i64_le(0);
        out.put_i16_le(VERSION);
        out.put_i32_le(self.increment as i32);
        out.put_bytes(0, 24);
        out.put_i16_le(self.block_capacity as i16);
        out.put_i64_le(self.count as i64);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < COMMON_HEADER_BYTES {
            return Err(AtlasError::Format(format!(
                "storage header too short: {} bytes",
                buf.len()
            )));
        }
        let mut src = &buf[..COMMON_HEADER_BYTES];
        let magic = src.get_u64_le();
        if magic != MAGIC {
            return Err(AtlasError::Format(format!("bad storage magic {:#018x}", magic)));
        }
        let free_head = BlockId::from_disk(src.get_i64_le());
        let _legacy_tail = src.get_i64_le();
        let version = src.get_i16_le();
        if version != VERSION {
            return Err(AtlasError::Format(format!(
                "unsupported storage version {} (expected {})",
                version, VERSION
            )));
        }
        let increment = src.get_i32_le();
        src.advance(24);
        let block_capacity = src.get_i16_le();
        let count = src.get_i64_le();
        if increment <= 0 || block_capacity <= 0 || count < 0 || free_head.is_none() {
            return Err(AtlasError::Format(format!(
                "corrupt storage header (increment {}, capacity {}, count {})",
                increment, block_capacity, count
            )));
        }
        Ok(Self {
            free_head,
            increment: increment as u32,
            block_capacity: block_capacity as u16,
            count: count as u64,
        })
    }
}
