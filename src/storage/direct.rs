//! Direct I/O backend
//!
//! Bypasses the OS page cache (O_DIRECT on Linux, F_NOCACHE on macOS) and
//! keeps its own write-back cache of 4 KiB pages instead. Every transfer is
//! page-aligned and uses [`AlignedBuf`] scratch memory.
//!
//! Writes only touch cached pages. [`BlockDevice::flush`] writes dirty pages
//! back in file order, coalescing adjacent pages into one sequential write;
//! the file is not durable until it has been called.
//!
//! The page cache is plain mutable state: one instance must not be used from
//! several threads without external locking.

use std::collections::{BTreeSet, HashMap};
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use super::aligned::{AlignedBuf, IO_ALIGNMENT};
use super::device::{grown_len, BlockDevice};
use super::header::HEADER_BYTES;
use super::pio;
use crate::error::Result;

const PAGE: u64 = IO_ALIGNMENT as u64;

/// Upper bound of one coalesced write-back (in pages)
const MAX_RUN_PAGES: usize = 256;

pub struct DirectDevice {
    path: PathBuf,
    file: File,
    direct: bool,
    pages: HashMap<u64, AlignedBuf>,
    dirty: BTreeSet<u64>,
    capacity: usize,
    len: u64,
    step: u64,
}

impl DirectDevice {
    /// Open or create `path` with a cache of `capacity` pages
    pub fn open(path: &Path, step: u64, capacity: usize) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let (file, direct) = match Self::open_file(path, true) {
            Ok(file) => (file, true),
            Err(e) if e.raw_os_error() == Some(libc::EINVAL) => {
                tracing::warn!(
                    "Direct I/O not supported for {}, falling back to buffered I/O",
                    path.display()
                );
                (Self::open_file(path, false)?, false)
            }
            Err(e) => return Err(e.into()),
        };
        let len = file.metadata()?.len();

        Ok(Self {
            path: path.to_path_buf(),
            file,
            direct,
            pages: HashMap::new(),
            dirty: BTreeSet::new(),
            capacity: capacity.max(1),
            len,
            step: step.max(1),
        })
    }

    /// Whether the file is actually open with direct I/O
    pub fn is_direct(&self) -> bool {
        self.direct
    }

    /// Number of pages waiting for write-back
    pub fn dirty_pages(&self) -> usize {
        self.dirty.len()
    }

    fn open_file(path: &Path, direct: bool) -> io::Result<File> {
        let mut options = OpenOptions::new();
        options.read(true).write(true).create(true).truncate(false);

        #[cfg(target_os = "linux")]
        if direct {
            use std::os::unix::fs::OpenOptionsExt;
            options.custom_flags(libc::O_DIRECT);
        }

        let file = options.open(path)?;

        #[cfg(target_os = "macos")]
        if direct {
            use std::os::unix::io::AsRawFd;
            // SAFETY: valid descriptor owned by `file`
            if unsafe { libc::fcntl(file.as_raw_fd(), libc::F_NOCACHE, 1) } == -1 {
                tracing::warn!("F_NOCACHE failed for {}", path.display());
            }
        }
        #[cfg(not(any(target_os = "linux", target_os = "macos")))]
        let _ = direct;

        Ok(file)
    }

    /// Load page `index` into the cache and return it
    fn page(&mut self, index: u64) -> Result<&mut AlignedBuf> {
        if !self.pages.contains_key(&index) {
            if self.pages.len() >= self.capacity {
                self.evict()?;
            }
            let mut buf = AlignedBuf::pages(1)?;
            self.read_pages(index * PAGE, &mut buf)?;
            self.pages.insert(index, buf);
        }
        // present: inserted above or already cached
        self.pages
            .get_mut(&index)
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "page cache miss").into())
    }

    fn read_pages(&mut self, pos: u64, buf: &mut AlignedBuf) -> Result<()> {
        match pio::read_at(&self.file, pos, buf) {
            Ok(_) => Ok(()),
            Err(e) if self.direct && e.raw_os_error() == Some(libc::EINVAL) => {
                self.fall_back()?;
                pio::read_at(&self.file, pos, buf)?;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn write_pages(&mut self, pos: u64, buf: &AlignedBuf) -> Result<()> {
        match pio::write_all_at(&self.file, pos, buf) {
            Ok(()) => Ok(()),
            Err(e) if self.direct && e.raw_os_error() == Some(libc::EINVAL) => {
                self.fall_back()?;
                pio::write_all_at(&self.file, pos, buf)?;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Reopen without O_DIRECT after the file system rejected an aligned transfer
    fn fall_back(&mut self) -> Result<()> {
        tracing::warn!(
            "Direct I/O rejected for {}, reopening with buffered I/O",
            self.path.display()
        );
        self.file = Self::open_file(&self.path, false)?;
        self.direct = false;
        Ok(())
    }

    /// Write back everything, then drop all (now clean) pages
    fn evict(&mut self) -> Result<()> {
        self.write_back()?;
        tracing::trace!("Evicting {} cached pages of {}", self.pages.len(), self.path.display());
        self.pages.clear();
        Ok(())
    }

    fn write_back(&mut self) -> Result<()> {
        if self.dirty.is_empty() {
            return Ok(());
        }
        let dirty: Vec<u64> = self.dirty.iter().copied().collect();
        let mut runs = 0usize;
        let mut start = 0;
        while start < dirty.len() {
            let mut end = start + 1;
            while end < dirty.len()
                && dirty[end] == dirty[end - 1] + 1
                && end - start < MAX_RUN_PAGES
            {
                end += 1;
            }
            let run = &dirty[start..end];
            let mut buf = AlignedBuf::pages(run.len())?;
            for (i, index) in run.iter().enumerate() {
                if let Some(page) = self.pages.get(index) {
                    let at = i * IO_ALIGNMENT;
                    buf[at..at + IO_ALIGNMENT].copy_from_slice(page);
                }
            }
            self.write_pages(run[0] * PAGE, &buf)?;
            runs += 1;
            start = end;
        }
        self.dirty.clear();
        tracing::trace!(
            "Wrote back {} pages in {} runs to {}",
            dirty.len(),
            runs,
            self.path.display()
        );
        Ok(())
    }
}

impl BlockDevice for DirectDevice {
    fn read_at(&mut self, pos: u64, buf: &mut [u8]) -> Result<()> {
        let mut done = 0usize;
        while done < buf.len() {
            let at = pos + done as u64;
            let offset = (at % PAGE) as usize;
            let n = (IO_ALIGNMENT - offset).min(buf.len() - done);
            let page = self.page(at / PAGE)?;
            buf[done..done + n].copy_from_slice(&page[offset..offset + n]);
            done += n;
        }
        Ok(())
    }

    fn write_at(&mut self, pos: u64, data: &[u8]) -> Result<()> {
        self.ensure_len(pos + data.len() as u64)?;
        let mut done = 0usize;
        while done < data.len() {
            let at = pos + done as u64;
            let index = at / PAGE;
            let offset = (at % PAGE) as usize;
            let n = (IO_ALIGNMENT - offset).min(data.len() - done);
            let page = self.page(index)?;
            page[offset..offset + n].copy_from_slice(&data[done..done + n]);
            self.dirty.insert(index);
            done += n;
        }
        Ok(())
    }

    fn ensure_len(&mut self, end: u64) -> Result<()> {
        if end > self.len {
            self.len = grown_len(HEADER_BYTES as u64, self.step, end);
        }
        Ok(())
    }

    fn len(&self) -> u64 {
        self.len
    }

    fn flush(&mut self) -> Result<()> {
        self.write_back()
    }

    fn sync(&mut self) -> Result<()> {
        self.write_back()?;
        self.file.sync_data()?;
        Ok(())
    }
}

impl Drop for DirectDevice {
    fn drop(&mut self) {
        if let Err(e) = self.write_back() {
            tracing::warn!("Failed to write back {} on drop: {}", self.path.display(), e);
        }
    }
}
