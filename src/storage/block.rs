//! Block header codec
//!
//! ```text
//! ┌────────────┬──────────┬───────────────┬───────────────┬───────────┐
//! │ status: u8 │ mark: u8 │ chunk: i16 LE │ total: i32 LE │ next: i64 │
//! └────────────┴──────────┴───────────────┴───────────────┴───────────┘
//! ```
//!
//! `total` is the number of record bytes stored in this block and every
//! block after it in the chain.

use bytes::{Buf, BufMut};

use super::BlockId;

/// Size of the per-block header
pub const BLOCK_HEADER_BYTES: usize = 16;

const STATUS_SET: u8 = b'+';
const STATUS_EMPTY: u8 = b'-';

const MARK_DATA: u8 = b'D';
const MARK_CONTINUATION: u8 = b'N';
const MARK_UNUSED: u8 = b'X';

/// Allocation state of a block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Set,
    Empty,
}

/// Role of a block inside a record chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mark {
    /// First block of a record
    Data,
    /// Follow-up block of a multi-block record
    Continuation,
    Unused,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    pub status: Status,
    pub mark: Mark,
    pub chunk_len: u16,
    pub total_len: u32,
    pub next: BlockId,
}

impl BlockHeader {
    /// Header of a free block linked to `next`
    pub fn empty(next: BlockId) -> Self {
        Self {
            status: Status::Empty,
            mark: Mark::Unused,
            chunk_len: 0,
            total_len: 0,
            next,
        }
    }

    pub fn is_data(&self) -> bool {
        self.status == Status::Set && self.mark == Mark::Data
    }

    pub fn is_continuation(&self) -> bool {
        self.status == Status::Set && self.mark == Mark::Continuation
    }

    pub fn encode(&self, buf: &mut [u8]) {
        let mut out = &mut buf[..BLOCK_HEADER_BYTES];
        out.put_u8(match self.status {
            Status::Set => STATUS_SET,
            Status::Empty => STATUS_EMPTY,
        });
        out.put_u8(match self.mark {
            Mark::Data => MARK_DATA,
            Mark::Continuation => MARK_CONTINUATION,
            Mark::Unused => MARK_UNUSED,
        });
        out.put_i16_le(self.chunk_len as i16);
        out.put_i32_le(self.total_len as i32);
        out.put_i64_le(self.next.to_disk());
    }

    /// Decode the header of block `id`.
    ///
    /// Bytes that do not form a valid header (never-written file regions)
    /// decode as an empty block whose free-list link is `id + 1`.
    pub fn decode(buf: &[u8], id: BlockId) -> Self {
        let mut src = &buf[..BLOCK_HEADER_BYTES];
        let status = src.get_u8();
        let mark = src.get_u8();
        let chunk = src.get_i16_le();
        let total = src.get_i32_le();
        let next = BlockId::from_disk(src.get_i64_le());

        let mark = match mark {
            MARK_DATA => Mark::Data,
            MARK_CONTINUATION => Mark::Continuation,
            _ => Mark::Unused,
        };
        match status {
            STATUS_SET if chunk >= 0 && total >= 0 && mark != Mark::Unused => Self {
                status: Status::Set,
                mark,
                chunk_len: chunk as u16,
                total_len: total as u32,
                next,
            },
            STATUS_EMPTY => Self::empty(next),
            _ => Self::empty(BlockId::new(id.get() + 1)),
        }
    }
}
