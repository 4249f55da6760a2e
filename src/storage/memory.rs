//! In-process backend
//!
//! Same layout as a file, held in a heap buffer. Used for ephemeral tables
//! and tests; nothing survives the instance.

use super::device::{grown_len, BlockDevice};
use super::header::HEADER_BYTES;
use crate::error::{AtlasError, Result};

pub struct MemoryDevice {
    data: Vec<u8>,
    step: u64,
}

impl MemoryDevice {
    pub fn new(step: u64) -> Self {
        Self {
            data: Vec::new(),
            step: step.max(1),
        }
    }
}

impl BlockDevice for MemoryDevice {
    fn read_at(&mut self, pos: u64, buf: &mut [u8]) -> Result<()> {
        buf.fill(0);
        let len = self.data.len() as u64;
        if pos < len {
            let start = pos as usize;
            let end = (pos + buf.len() as u64).min(len) as usize;
            buf[..end - start].copy_from_slice(&self.data[start..end]);
        }
        Ok(())
    }

    fn write_at(&mut self, pos: u64, data: &[u8]) -> Result<()> {
        self.ensure_len(pos + data.len() as u64)?;
        let start = pos as usize;
        self.data[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn ensure_len(&mut self, end: u64) -> Result<()> {
        if end <= self.data.len() as u64 {
            return Ok(());
        }
        let new_len = grown_len(HEADER_BYTES as u64, self.step, end) as usize;
        self.data
            .try_reserve_exact(new_len - self.data.len())
            .map_err(|e| AtlasError::OutOfMemory(format!("growing to {} bytes: {}", new_len, e)))?;
        self.data.resize(new_len, 0);
        Ok(())
    }

    fn len(&self) -> u64 {
        self.data.len() as u64
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        Ok(())
    }
}
