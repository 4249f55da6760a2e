//! Memory-mapped backend
//!
//! The whole file is mapped read-write. Growth extends the file by whole
//! increments and remaps it; data is copied in and out of the mapping so
//! no reference into the map outlives a remap.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use memmap2::MmapMut;

use super::device::{grown_len, BlockDevice};
use super::header::HEADER_BYTES;
use crate::error::Result;

pub struct MmapDevice {
    path: PathBuf,
    file: File,
    map: Option<MmapMut>,
    len: u64,
    step: u64,
}

impl MmapDevice {
    /// Open or create the file at `path`; it grows in steps of `step` bytes
    pub fn open(path: &Path, step: u64) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let len = file.metadata()?.len();
        let map = if len > 0 {
            // SAFETY: the file is owned by this device for its lifetime and
            // the storage layer is the only writer.
            Some(unsafe { MmapMut::map_mut(&file)? })
        } else {
            None
        };

        Ok(Self {
            path: path.to_path_buf(),
            file,
            map,
            len,
            step: step.max(1),
        })
    }
}

impl BlockDevice for MmapDevice {
    fn read_at(&mut self, pos: u64, buf: &mut [u8]) -> Result<()> {
        buf.fill(0);
        if let Some(map) = &self.map {
            if pos < self.len {
                let start = pos as usize;
                let end = (pos + buf.len() as u64).min(self.len) as usize;
                buf[..end - start].copy_from_slice(&map[start..end]);
            }
        }
        Ok(())
    }

    fn write_at(&mut self, pos: u64, data: &[u8]) -> Result<()> {
        self.ensure_len(pos + data.len() as u64)?;
        if let Some(map) = &mut self.map {
            let start = pos as usize;
            map[start..start + data.len()].copy_from_slice(data);
        }
        Ok(())
    }

    fn ensure_len(&mut self, end: u64) -> Result<()> {
        if end <= self.len {
            return Ok(());
        }
        let new_len = grown_len(HEADER_BYTES as u64, self.step, end);
        if let Some(map) = self.map.take() {
            map.flush_async()?;
        }
        self.file.set_len(new_len)?;
        // SAFETY: see `open`
        self.map = Some(unsafe { MmapMut::map_mut(&self.file)? });
        tracing::debug!(
            "Grew {} from {} to {} bytes",
            self.path.display(),
            self.len,
            new_len
        );
        self.len = new_len;
        Ok(())
    }

    fn len(&self) -> u64 {
        self.len
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        if let Some(map) = &self.map {
            map.flush()?;
        }
        Ok(())
    }
}
