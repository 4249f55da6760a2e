//! Page-aligned scratch buffers for direct I/O
//!
//! O_DIRECT requires the user buffer, the file offset and the transfer
//! length to be multiples of the logical block size. Every buffer here is
//! aligned to [`IO_ALIGNMENT`] and sized in whole pages.

use std::alloc::{self, Layout};
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;
use std::slice;

use crate::error::{AtlasError, Result};

/// Alignment and page size of direct I/O transfers
pub const IO_ALIGNMENT: usize = 4096;

/// Zero-initialized heap buffer with a guaranteed alignment
pub struct AlignedBuf {
    ptr: NonNull<u8>,
    layout: Layout,
}

// SAFETY: AlignedBuf owns its allocation exclusively
unsafe impl Send for AlignedBuf {}
unsafe impl Sync for AlignedBuf {}

impl AlignedBuf {
    /// Allocate `pages` zeroed pages
    pub fn pages(pages: usize) -> Result<Self> {
        Self::new(pages.max(1) * IO_ALIGNMENT, IO_ALIGNMENT)
    }

    pub fn new(size: usize, alignment: usize) -> Result<Self> {
        let layout = Layout::from_size_align(size.max(1), alignment).map_err(|e| {
            AtlasError::OutOfMemory(format!("invalid layout {}@{}: {}", size, alignment, e))
        })?;
        // SAFETY: layout has a non-zero size
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).ok_or_else(|| {
            AtlasError::OutOfMemory(format!("aligned allocation of {} bytes failed", size))
        })?;
        Ok(Self { ptr, layout })
    }

    pub fn len(&self) -> usize {
        self.layout.size()
    }

    pub fn is_empty(&self) -> bool {
        self.layout.size() == 0
    }
}

impl Deref for AlignedBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // SAFETY: ptr is valid for layout.size() initialized bytes
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.layout.size()) }
    }
}

impl DerefMut for AlignedBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        // SAFETY: ptr is valid and uniquely owned
        unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr(), self.layout.size()) }
    }
}

impl Drop for AlignedBuf {
    fn drop(&mut self) {
        // SAFETY: allocated in `new` with this exact layout
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) }
    }
}
