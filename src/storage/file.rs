//! Block file: free list and record chaining over a [`BlockDevice`]

use std::collections::HashSet;
use std::path::Path;

use super::block::{BlockHeader, Mark, Status, BLOCK_HEADER_BYTES};
use super::device::BlockDevice;
use super::direct::DirectDevice;
use super::header::{StorageHeader, COMMON_HEADER_BYTES, HEADER_BYTES, HEAD_BYTES};
use super::memory::MemoryDevice;
use super::mmap::MmapDevice;
use super::{BlockId, BlockStorage};
use crate::config::StorageOptions;
use crate::error::{AtlasError, Result};

/// Block storage over any backend
///
/// ## Allocation
/// - The free list is threaded through the `next` field of empty blocks,
///   starting at `header.free_head`.
/// - A fresh file has `free_head = 0`; never-written blocks decode as
///   "empty, next = self + 1", so the list continues implicitly past the
///   last block ever written and allocation appends at the end.
/// - Deleted blocks are pushed onto the head and reused first.
pub struct BlockFile<D: BlockDevice> {
    device: D,
    header: StorageHeader,
    capacity: usize,
    block_bytes: usize,
}

impl BlockFile<MmapDevice> {
    /// Open or create a memory-mapped storage file
    pub fn open(path: &Path, options: &StorageOptions) -> Result<Self> {
        options.validate()?;
        let device = MmapDevice::open(path, growth_step(options))?;
        Self::with_device(device, options)
    }
}

impl BlockFile<MemoryDevice> {
    /// Create an in-process storage
    pub fn open_in_memory(options: &StorageOptions) -> Result<Self> {
        options.validate()?;
        Self::with_device(MemoryDevice::new(growth_step(options)), options)
    }
}

impl BlockFile<DirectDevice> {
    /// Open or create a direct I/O storage file
    pub fn open(path: &Path, options: &StorageOptions) -> Result<Self> {
        options.validate()?;
        let device = DirectDevice::open(path, growth_step(options), options.page_cache_pages)?;
        Self::with_device(device, options)
    }

    /// Pages of the write-back cache not yet flushed
    pub fn dirty_pages(&self) -> usize {
        self.device.dirty_pages()
    }
}

/// Growth step: the largest whole number of blocks within the increment
fn growth_step(options: &StorageOptions) -> u64 {
    let block_bytes = BLOCK_HEADER_BYTES + options.block_capacity;
    let blocks = (options.increment / block_bytes).max(1);
    (blocks * block_bytes) as u64
}

impl<D: BlockDevice> BlockFile<D> {
    /// Create or validate the header on `device`
    pub fn with_device(mut device: D, options: &StorageOptions) -> Result<Self> {
        let capacity = options.block_capacity;
        let header = if device.is_empty() {
            let header = StorageHeader::new(capacity as u16, options.increment as u32);
            device.ensure_len(HEADER_BYTES as u64)?;
            device.write_at(StorageHeader::position(), &header.encode())?;
            tracing::debug!(
                "Created block storage (capacity {}, increment {})",
                capacity,
                options.increment
            );
            header
        } else {
            let mut buf = [0u8; COMMON_HEADER_BYTES];
            device.read_at(StorageHeader::position(), &mut buf)?;
            let header = StorageHeader::decode(&buf)?;
            if header.block_capacity as usize != capacity {
                return Err(AtlasError::Format(format!(
                    "block capacity mismatch: file has {}, requested {}",
                    header.block_capacity, capacity
                )));
            }
            tracing::debug!(
                "Opened block storage ({} live blocks, free head {})",
                header.count,
                header.free_head
            );
            header
        };

        Ok(Self {
            device,
            header,
            capacity,
            block_bytes: BLOCK_HEADER_BYTES + capacity,
        })
    }

    /// Snapshot of the common header
    pub fn header(&self) -> &StorageHeader {
        &self.header
    }

    // =========================================================================
    // Block-level helpers
    // =========================================================================

    fn position(&self, id: BlockId) -> u64 {
        HEADER_BYTES as u64 + id.get() * self.block_bytes as u64
    }

    /// Blocks covered by the current device length
    fn physical_blocks(&self) -> u64 {
        self.device.len().saturating_sub(HEADER_BYTES as u64) / self.block_bytes as u64
    }

    fn blocks_for(&self, len: usize) -> usize {
        len.div_ceil(self.capacity).max(1)
    }

    fn check_id(&self, id: BlockId) -> Result<()> {
        if id.is_none() {
            return Err(AtlasError::NotFound("block none".into()));
        }
        Ok(())
    }

    fn read_header(&mut self, id: BlockId) -> Result<BlockHeader> {
        let mut buf = [0u8; BLOCK_HEADER_BYTES];
        let pos = self.position(id);
        self.device.read_at(pos, &mut buf)?;
        Ok(BlockHeader::decode(&buf, id))
    }

    fn write_header(&mut self, id: BlockId, header: &BlockHeader) -> Result<()> {
        let mut buf = [0u8; BLOCK_HEADER_BYTES];
        header.encode(&mut buf);
        let pos = self.position(id);
        self.device.write_at(pos, &buf)
    }

    /// Write a full block: header plus zero-padded payload
    fn write_block(&mut self, id: BlockId, header: &BlockHeader, chunk: &[u8]) -> Result<()> {
        let mut buf = vec![0u8; self.block_bytes];
        header.encode(&mut buf);
        buf[BLOCK_HEADER_BYTES..BLOCK_HEADER_BYTES + chunk.len()].copy_from_slice(chunk);
        let pos = self.position(id);
        self.device.write_at(pos, &buf)
    }

    fn commit_header(&mut self) -> Result<()> {
        let bytes = self.header.encode();
        self.device.write_at(StorageHeader::position(), &bytes)
    }

    // =========================================================================
    // Free list
    // =========================================================================

    /// Take the block at the free-list head
    fn pop_free(&mut self) -> Result<BlockId> {
        let id = self.header.free_head;
        let header = self.read_header(id)?;
        if header.status == Status::Set {
            return Err(AtlasError::CorruptChain(format!(
                "free-list head {} is a live block",
                id
            )));
        }
        if header.next == id || header.next.is_none() {
            return Err(AtlasError::CorruptChain(format!(
                "free block {} has invalid link {}",
                id, header.next
            )));
        }
        self.header.free_head = header.next;
        Ok(id)
    }

    /// Take `n` blocks off the free list, or none of them
    fn pop_many(&mut self, n: usize) -> Result<Vec<BlockId>> {
        let mut blocks = Vec::with_capacity(n);
        for _ in 0..n {
            match self.pop_free() {
                Ok(id) => blocks.push(id),
                Err(e) => {
                    // popped blocks still carry their links; relink in reverse
                    for &id in blocks.iter().rev() {
                        self.push_free(id)?;
                    }
                    return Err(e);
                }
            }
        }
        Ok(blocks)
    }

    fn push_free(&mut self, id: BlockId) -> Result<()> {
        let next = self.header.free_head;
        self.write_block(id, &BlockHeader::empty(next), &[])?;
        self.header.free_head = id;
        Ok(())
    }

    /// Remove the empty block `id` from the free list, wherever it is linked.
    ///
    /// Blocks not reachable before the end of the physical file are left
    /// alone: nothing links to them explicitly.
    fn unlink_free(&mut self, id: BlockId) -> Result<()> {
        if self.header.free_head == id {
            self.pop_free()?;
            return Ok(());
        }
        let limit = self.physical_blocks();
        let mut prev = self.header.free_head;
        let mut steps = 0u64;
        while !prev.is_none() && prev.get() < limit && steps <= limit {
            let header = self.read_header(prev)?;
            if header.status == Status::Set {
                return Err(AtlasError::CorruptChain(format!(
                    "free list reaches live block {}",
                    prev
                )));
            }
            if header.next == id {
                let target = self.read_header(id)?;
                self.write_header(prev, &BlockHeader::empty(target.next))?;
                return Ok(());
            }
            if header.next == prev {
                return Err(AtlasError::CorruptChain(format!(
                    "free block {} links to itself",
                    prev
                )));
            }
            prev = header.next;
            steps += 1;
        }
        Ok(())
    }

    // =========================================================================
    // Chains
    // =========================================================================

    /// Blocks of the record starting at `first` (whose header is `header`)
    fn chain(&mut self, first: BlockId, header: &BlockHeader) -> Result<Vec<BlockId>> {
        let expected = self.blocks_for(header.total_len as usize);
        let limit = self.physical_blocks();
        let mut chain = vec![first];
        let mut seen = HashSet::from([first]);
        let mut next = header.next;
        while !next.is_none() && chain.len() < expected {
            if !seen.insert(next) {
                return Err(AtlasError::CorruptChain(format!(
                    "continuation of {} loops back to {}",
                    first, next
                )));
            }
            if next.get() >= limit {
                break;
            }
            let h = self.read_header(next)?;
            if !h.is_continuation() {
                break;
            }
            chain.push(next);
            next = h.next;
        }
        Ok(chain)
    }

    /// Encode `payload` over the given blocks, in order
    fn write_chain(&mut self, blocks: &[BlockId], payload: &[u8]) -> Result<()> {
        let mut remaining = payload.len();
        for (i, &id) in blocks.iter().enumerate() {
            let start = i * self.capacity;
            let len = remaining.min(self.capacity);
            let header = BlockHeader {
                status: Status::Set,
                mark: if i == 0 { Mark::Data } else { Mark::Continuation },
                chunk_len: len as u16,
                total_len: remaining as u32,
                next: blocks.get(i + 1).copied().unwrap_or(BlockId::NONE),
            };
            self.write_block(id, &header, &payload[start..start + len])?;
            remaining -= len;
        }
        Ok(())
    }

    fn check_payload(&self, payload: &[u8]) -> Result<()> {
        if payload.len() > i32::MAX as usize {
            return Err(AtlasError::OutOfMemory(format!(
                "record of {} bytes exceeds the maximum record size",
                payload.len()
            )));
        }
        Ok(())
    }
}

impl<D: BlockDevice> BlockStorage for BlockFile<D> {
    fn write(&mut self, payload: &[u8]) -> Result<BlockId> {
        self.check_payload(payload)?;
        let needed = self.blocks_for(payload.len());
        let blocks = self.pop_many(needed)?;
        self.write_chain(&blocks, payload)?;
        self.header.count += needed as u64;
        self.commit_header()?;
        Ok(blocks[0])
    }

    fn write_at(&mut self, id: BlockId, payload: &[u8]) -> Result<()> {
        self.check_id(id)?;
        self.check_payload(payload)?;
        if id.get() >= self.physical_blocks() {
            return Err(AtlasError::NotFound(format!("block {} is past the end of file", id)));
        }
        let header = self.read_header(id)?;
        let claimed = header.status == Status::Empty;
        let mut blocks = match header.status {
            Status::Set if header.mark == Mark::Data => self.chain(id, &header)?,
            Status::Set => {
                return Err(AtlasError::NotFound(format!(
                    "block {} is a continuation block",
                    id
                )))
            }
            Status::Empty => {
                self.unlink_free(id)?;
                self.header.count += 1;
                vec![id]
            }
        };

        let needed = self.blocks_for(payload.len());
        if blocks.len() > needed {
            for surplus in blocks.split_off(needed).into_iter().rev() {
                self.push_free(surplus)?;
                self.header.count -= 1;
            }
        }
        if blocks.len() < needed {
            match self.pop_many(needed - blocks.len()) {
                Ok(extra) => {
                    self.header.count += extra.len() as u64;
                    blocks.extend(extra);
                }
                Err(e) => {
                    if claimed {
                        self.push_free(id)?;
                        self.header.count -= 1;
                    }
                    return Err(e);
                }
            }
        }
        self.write_chain(&blocks, payload)?;
        self.commit_header()
    }

    fn read(&mut self, id: BlockId) -> Result<Vec<u8>> {
        self.check_id(id)?;
        let mut block = vec![0u8; self.block_bytes];
        let pos = self.position(id);
        self.device.read_at(pos, &mut block)?;
        let header = BlockHeader::decode(&block, id);
        if !header.is_data() {
            return Err(AtlasError::NotFound(format!("no record at block {}", id)));
        }

        let total = header.total_len as usize;
        let mut out = Vec::with_capacity(total.min(self.capacity * 64));
        let len = (header.chunk_len as usize).min(self.capacity).min(total);
        out.extend_from_slice(&block[BLOCK_HEADER_BYTES..BLOCK_HEADER_BYTES + len]);

        let limit = self.physical_blocks();
        let mut prev = id;
        let mut next = header.next;
        let mut hops = 0usize;
        let max_hops = self.blocks_for(total);
        while out.len() < total && !next.is_none() {
            if next == prev {
                return Err(AtlasError::CorruptChain(format!(
                    "block {} continues into itself",
                    next
                )));
            }
            hops += 1;
            if next.get() >= limit || hops >= max_hops {
                break;
            }
            let pos = self.position(next);
            self.device.read_at(pos, &mut block)?;
            let h = BlockHeader::decode(&block, next);
            if !h.is_continuation() {
                break;
            }
            let len = (h.chunk_len as usize)
                .min(self.capacity)
                .min(total - out.len());
            out.extend_from_slice(&block[BLOCK_HEADER_BYTES..BLOCK_HEADER_BYTES + len]);
            prev = next;
            next = h.next;
        }
        Ok(out)
    }

    fn delete(&mut self, id: BlockId) -> Result<bool> {
        self.check_id(id)?;
        let header = self.read_header(id)?;
        if header.status != Status::Set {
            return Ok(false);
        }
        if header.mark != Mark::Data {
            return Err(AtlasError::NotFound(format!(
                "block {} is a continuation block",
                id
            )));
        }
        let chain = self.chain(id, &header)?;
        // reversed so the first block ends up at the head and is reused first
        for &block in chain.iter().rev() {
            self.push_free(block)?;
        }
        self.header.count = self.header.count.saturating_sub(chain.len() as u64);
        self.commit_header()?;
        Ok(true)
    }

    fn read_head(&mut self, offset: usize, len: usize) -> Result<Vec<u8>> {
        if offset + len > HEAD_BYTES {
            return Err(AtlasError::Format(format!(
                "head range {}..{} exceeds {} bytes",
                offset,
                offset + len,
                HEAD_BYTES
            )));
        }
        let mut buf = vec![0u8; len];
        self.device.read_at(offset as u64, &mut buf)?;
        Ok(buf)
    }

    fn write_head(&mut self, offset: usize, data: &[u8]) -> Result<()> {
        if offset + data.len() > HEAD_BYTES {
            return Err(AtlasError::Format(format!(
                "head range {}..{} exceeds {} bytes",
                offset,
                offset + data.len(),
                HEAD_BYTES
            )));
        }
        self.device.write_at(offset as u64, data)
    }

    fn count(&self) -> u64 {
        self.header.count
    }

    fn bytes(&self) -> u64 {
        self.device.len()
    }

    fn block_capacity(&self) -> usize {
        self.capacity
    }

    fn flush(&mut self) -> Result<()> {
        self.device.flush()
    }

    fn sync(&mut self) -> Result<()> {
        self.device.sync()
    }
}
