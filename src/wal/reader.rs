//! WAL Reader
//!
//! Sequential scan over a byte range of the log file.

use std::fs::File;

use super::record::{WalRecord, RECORD_HEADER_BYTES};
use crate::error::Result;
use crate::storage::pio;

/// Reads records from `[position, end)` of a WAL file
pub struct WalReader<'a> {
    file: &'a File,
    position: u64,
    end: u64,
    buf: Vec<u8>,
}

impl<'a> WalReader<'a> {
    pub fn new(file: &'a File, start: u64, end: u64) -> Self {
        Self {
            file,
            position: start,
            end: end.max(start),
            buf: Vec::new(),
        }
    }

    /// Offset of the next unread record
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Read the next record and the offset it starts at.
    ///
    /// Returns `Ok(None)` at the end of the range or at a torn record; a
    /// record with a bad checksum or opcode is an error. In both cases
    /// `position()` stays at the start of the offending record.
    pub fn next_record(&mut self) -> Result<Option<(u64, WalRecord)>> {
        let remaining = self.end - self.position;
        if remaining < RECORD_HEADER_BYTES as u64 {
            return Ok(None);
        }

        let peek = (RECORD_HEADER_BYTES as u64 + 4).min(remaining) as usize;
        self.buf.resize(peek, 0);
        pio::read_at(self.file, self.position, &mut self.buf)?;
        let len = match WalRecord::peek_len(&self.buf)? {
            Some(len) if len as u64 <= remaining => len,
            _ => return Ok(None),
        };

        self.buf.resize(len, 0);
        pio::read_at(self.file, self.position, &mut self.buf)?;
        match WalRecord::decode(&self.buf)? {
            Some((record, used)) => {
                let at = self.position;
                self.position += used as u64;
                Ok(Some((at, record)))
            }
            None => Ok(None),
        }
    }
}
