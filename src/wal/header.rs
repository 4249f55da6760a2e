//! WAL header page
//!
//! ```text
//! offset  field               type
//! ──────  ──────────────────  ────
//!    0    magic               i32   0x57414C21 ("WAL!")
//!    4    version             i16
//!    6    header size         i16   4096
//!    8    timestamp           i64   unix millis of last header write
//!   16    transaction id      i64   last committed transaction
//!   24    committed offset    i64   log end after the last COMMIT
//!   32    checkpoint offset   i64   log end after the last CHECKPOINT
//!   40    total count         i32   records appended
//!   44    processed count     i32   records confirmed by recovery
//! ```

use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{Buf, BufMut};

use super::TxnId;
use crate::error::{AtlasError, Result};

/// Size of the header page; records start here
pub const WAL_HEADER_BYTES: u64 = 4096;

/// Bytes of the header page actually carrying fields
pub const WAL_HEADER_FIELDS: usize = 48;

const MAGIC: i32 = 0x5741_4C21;
const VERSION: i16 = 1;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WalHeader {
    pub timestamp: i64,
    pub txn: TxnId,
    pub committed_offset: u64,
    pub checkpoint_offset: u64,
    pub total_count: u32,
    pub processed_count: u32,
}

impl WalHeader {
    pub fn encode(&mut self) -> [u8; WAL_HEADER_FIELDS] {
        self.timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        let mut buf = [0u8; WAL_HEADER_FIELDS];
        let mut out = &mut buf[..];
        out.put_i32_le(MAGIC);
        out.put_i16_le(VERSION);
        out.put_i16_le(WAL_HEADER_BYTES as i16);
        out.put_i64_le(self.timestamp);
        out.put_i64_le(self.txn as i64);
        out.put_i64_le(self.committed_offset as i64);
        out.put_i64_le(self.checkpoint_offset as i64);
        out.put_i32_le(self.total_count as i32);
        out.put_i32_le(self.processed_count as i32);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < WAL_HEADER_FIELDS {
            return Err(AtlasError::Format(format!("WAL header too short: {} bytes", buf.len())));
        }
        let mut src = &buf[..WAL_HEADER_FIELDS];
        let magic = src.get_i32_le();
        if magic != MAGIC {
            return Err(AtlasError::Format(format!("bad WAL magic {:#010x}", magic)));
        }
        let version = src.get_i16_le();
        if version != VERSION {
            return Err(AtlasError::Format(format!("unsupported WAL version {}", version)));
        }
        let size = src.get_i16_le();
        if size as u64 != WAL_HEADER_BYTES {
            return Err(AtlasError::Format(format!("unexpected WAL header size {}", size)));
        }
        let timestamp = src.get_i64_le();
        let txn = src.get_i64_le().max(0) as u64;
        let committed_offset = src.get_i64_le().max(0) as u64;
        let checkpoint_offset = src.get_i64_le().max(0) as u64;
        let total_count = src.get_i32_le().max(0) as u32;
        let processed_count = src.get_i32_le().max(0) as u32;
        Ok(Self {
            timestamp,
            txn,
            committed_offset,
            checkpoint_offset,
            total_count,
            processed_count,
        })
    }
}
