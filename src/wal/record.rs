//! WAL record definitions
//!
//! ## Wire Format
//!
//! ```text
//! ┌───────┬──────────┬───────────────┬──────────────┬─────────────┬──────────┬───────────────────┐
//! │ op:u8 │ txn: i64 │ checksum: i16 │ file_id: i32 │ offset: i64 │ flags:u8 │ original_size:i32 │
//! └───────┴──────────┴───────────────┴──────────────┴─────────────┴──────────┴───────────────────┘
//!   [compressed_size: i32]   only if FLAG_COMPRESSED
//!   [payload bytes]          absent if FLAG_METADATA_ONLY
//! ```
//!
//! All integers are little-endian. The checksum is the low 16 bits of the
//! CRC32 over every other field and the stored payload bytes.

use std::borrow::Cow;

use bytes::{Buf, BufMut};

use super::{FileId, TxnId};
use crate::error::{AtlasError, Result};
use crate::storage::BlockId;

/// Fixed part of a record
pub const RECORD_HEADER_BYTES: usize = 28;

/// Payload is LZ4 compressed; `compressed_size` follows the fixed header
pub const FLAG_COMPRESSED: u8 = 0x01;

/// No payload bytes follow
pub const FLAG_METADATA_ONLY: u8 = 0x02;

/// Operations that can be logged
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Begin,
    Write,
    Delete,
    Update,
    Commit,
    Rollback,
    Checkpoint,
}

impl Op {
    pub fn code(self) -> u8 {
        match self {
            Op::Begin => 0x00,
            Op::Write => 0x01,
            Op::Delete => 0x02,
            Op::Update => 0x03,
            Op::Commit => 0x10,
            Op::Rollback => 0x11,
            Op::Checkpoint => 0x20,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0x00 => Some(Op::Begin),
            0x01 => Some(Op::Write),
            0x02 => Some(Op::Delete),
            0x03 => Some(Op::Update),
            0x10 => Some(Op::Commit),
            0x11 => Some(Op::Rollback),
            0x20 => Some(Op::Checkpoint),
            _ => None,
        }
    }

    /// Data operations, as opposed to transaction markers
    pub fn is_data(self) -> bool {
        matches!(self, Op::Write | Op::Delete | Op::Update)
    }
}

/// A single entry in the WAL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalRecord {
    pub op: Op,
    pub txn: TxnId,
    pub file_id: FileId,
    pub offset: BlockId,
    /// Page image, `None` for metadata-only records
    pub payload: Option<Vec<u8>>,
}

/// A record serialized into its fixed header and its stored payload
pub struct EncodedRecord<'a> {
    pub header: Vec<u8>,
    pub body: Cow<'a, [u8]>,
}

impl EncodedRecord<'_> {
    pub fn len(&self) -> usize {
        self.header.len() + self.body.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl WalRecord {
    /// Transaction marker or metadata-only data record
    pub fn marker(op: Op, txn: TxnId) -> Self {
        Self {
            op,
            txn,
            file_id: 0,
            offset: BlockId::NONE,
            payload: None,
        }
    }

    pub fn data(op: Op, txn: TxnId, file_id: FileId, offset: BlockId, payload: Option<Vec<u8>>) -> Self {
        Self {
            op,
            txn,
            file_id,
            offset,
            payload,
        }
    }

    /// Serialize, compressing payloads of at least `compression_threshold`
    /// bytes when LZ4 saves more than 10%.
    pub fn encode(&self, compression_threshold: usize) -> EncodedRecord<'_> {
        let (flags, original_size, compressed, body): (u8, usize, Option<usize>, Cow<'_, [u8]>) =
            match &self.payload {
                None => (FLAG_METADATA_ONLY, 0, None, Cow::Borrowed(&[][..])),
                Some(data) if data.len() >= compression_threshold && !data.is_empty() => {
                    let packed = lz4_flex::compress(data);
                    if packed.len() * 10 < data.len() * 9 {
                        (FLAG_COMPRESSED, data.len(), Some(packed.len()), Cow::Owned(packed))
                    } else {
                        (0, data.len(), None, Cow::Borrowed(data.as_slice()))
                    }
                }
                Some(data) => (0, data.len(), None, Cow::Borrowed(data.as_slice())),
            };

        let checksum = checksum(
            self.op.code(),
            self.txn,
            self.file_id,
            self.offset,
            flags,
            original_size as i32,
            compressed.map(|c| c as i32),
            &body,
        );

        let mut header = Vec::with_capacity(RECORD_HEADER_BYTES + 4);
        header.put_u8(self.op.code());
        header.put_i64_le(self.txn as i64);
        header.put_u16_le(checksum);
        header.put_i32_le(self.file_id as i32);
        header.put_i64_le(self.offset.to_disk());
        header.put_u8(flags);
        header.put_i32_le(original_size as i32);
        if let Some(size) = compressed {
            header.put_i32_le(size as i32);
        }
        EncodedRecord { header, body }
    }

    /// Total encoded length of the record whose header starts `buf`.
    ///
    /// Returns `Ok(None)` if `buf` does not yet cover the header.
    pub fn peek_len(buf: &[u8]) -> Result<Option<usize>> {
        if buf.len() < RECORD_HEADER_BYTES {
            return Ok(None);
        }
        let flags = buf[23];
        let original_size = (&buf[24..28]).get_i32_le();
        if original_size < 0 {
            return Err(AtlasError::WalCorruption(format!("bad record size {}", original_size)));
        }
        if flags & FLAG_METADATA_ONLY != 0 {
            return Ok(Some(RECORD_HEADER_BYTES + if flags & FLAG_COMPRESSED != 0 { 4 } else { 0 }));
        }
        if flags & FLAG_COMPRESSED == 0 {
            return Ok(Some(RECORD_HEADER_BYTES + original_size as usize));
        }
        if buf.len() < RECORD_HEADER_BYTES + 4 {
            return Ok(None);
        }
        let compressed = (&buf[28..32]).get_i32_le();
        if compressed < 0 {
            return Err(AtlasError::WalCorruption(format!("bad compressed size {}", compressed)));
        }
        Ok(Some(RECORD_HEADER_BYTES + 4 + compressed as usize))
    }

    /// Decode one record from the front of `buf`.
    ///
    /// Returns `Ok(None)` when `buf` ends before the record does (torn
    /// tail), otherwise the record and the number of bytes it occupies.
    pub fn decode(buf: &[u8]) -> Result<Option<(Self, usize)>> {
        if buf.len() < RECORD_HEADER_BYTES {
            return Ok(None);
        }
        let mut src = buf;
        let code = src.get_u8();
        let txn = src.get_i64_le();
        let stored_checksum = src.get_u16_le();
        let file_id = src.get_i32_le();
        let offset = BlockId::from_disk(src.get_i64_le());
        let flags = src.get_u8();
        let original_size = src.get_i32_le();

        let op = Op::from_code(code)
            .ok_or_else(|| AtlasError::WalCorruption(format!("unknown WAL op {:#04x}", code)))?;
        if txn < 0 || original_size < 0 {
            return Err(AtlasError::WalCorruption(format!(
                "bad WAL record fields (txn {}, size {})",
                txn, original_size
            )));
        }

        let mut used = RECORD_HEADER_BYTES;
        let compressed = if flags & FLAG_COMPRESSED != 0 {
            if src.remaining() < 4 {
                return Ok(None);
            }
            used += 4;
            let size = src.get_i32_le();
            if size < 0 {
                return Err(AtlasError::WalCorruption(format!("bad compressed size {}", size)));
            }
            Some(size)
        } else {
            None
        };

        let stored = if flags & FLAG_METADATA_ONLY != 0 {
            0
        } else {
            compressed.unwrap_or(original_size) as usize
        };
        if src.remaining() < stored {
            return Ok(None);
        }
        let body = &src[..stored];
        used += stored;

        let expected = checksum(code, txn as u64, file_id as u32, offset, flags, original_size, compressed, body);
        if expected != stored_checksum {
            return Err(AtlasError::WalCorruption(format!(
                "checksum mismatch for {:?} record of txn {}",
                op, txn
            )));
        }

        let payload = if flags & FLAG_METADATA_ONLY != 0 {
            None
        } else if compressed.is_some() {
            let data = lz4_flex::decompress(body, original_size as usize)
                .map_err(|e| AtlasError::WalCorruption(format!("LZ4 payload: {}", e)))?;
            Some(data)
        } else {
            Some(body.to_vec())
        };

        Ok(Some((
            Self {
                op,
                txn: txn as u64,
                file_id: file_id as u32,
                offset,
                payload,
            },
            used,
        )))
    }
}

#[allow(clippy::too_many_arguments)]
fn checksum(
    op: u8,
    txn: TxnId,
    file_id: FileId,
    offset: BlockId,
    flags: u8,
    original_size: i32,
    compressed_size: Option<i32>,
    body: &[u8],
) -> u16 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&[op, flags]);
    hasher.update(&(txn as i64).to_le_bytes());
    hasher.update(&(file_id as i32).to_le_bytes());
    hasher.update(&offset.to_disk().to_le_bytes());
    hasher.update(&original_size.to_le_bytes());
    if let Some(size) = compressed_size {
        hasher.update(&size.to_le_bytes());
    }
    hasher.update(body);
    (hasher.finalize() & 0xFFFF) as u16
}
