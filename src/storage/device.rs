//! Byte-addressed backend interface used by [`BlockFile`](super::BlockFile)

use crate::error::Result;

/// Raw byte access to a storage file at absolute positions.
///
/// Reads past the end of the device yield zeros; writes past the end grow it.
pub trait BlockDevice: Send {
    fn read_at(&mut self, pos: u64, buf: &mut [u8]) -> Result<()>;

    fn write_at(&mut self, pos: u64, data: &[u8]) -> Result<()>;

    /// Grow the device so `[0, end)` is addressable
    fn ensure_len(&mut self, end: u64) -> Result<()>;

    /// Current size in bytes
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Write back cached pages, if the backend keeps any
    fn flush(&mut self) -> Result<()>;

    /// Flush and persist to stable storage
    fn sync(&mut self) -> Result<()>;
}

/// Round `len` up to the next growth step after `base`
pub(crate) fn grown_len(base: u64, step: u64, end: u64) -> u64 {
    if end <= base {
        return base + step;
    }
    let steps = (end - base).div_ceil(step);
    base + steps * step
}
