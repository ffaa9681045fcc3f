//! Streaming WAL record iterator.
//!
//! Records are read one at a time through a bounded buffer, so replaying a
//! large log does not load it into memory.

use crate::codec::compute_crc32;
use crate::error::{TabletError, TabletResult};
use crate::wal::record::{
    WalBatch, WalRecordType, CRC_SIZE, HEADER_SIZE, WAL_MAGIC, WAL_VERSION,
};
use tablet_storage::StorageBackend;

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// A streaming iterator over WAL records.
///
/// Yields `(offset, batch)` pairs. A truncated header or payload ends the
/// iteration cleanly; bad magic, an unknown type, a future version or a
/// checksum mismatch yields one error and then ends it.
pub struct WalIterator<'a> {
    backend: &'a dyn StorageBackend,
    total_size: u64,
    current_offset: u64,
    buffer: Vec<u8>,
    buffer_pos: usize,
    buffer_len: usize,
    finished: bool,
}

impl<'a> WalIterator<'a> {
    /// Creates an iterator starting at `start_offset`.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend size cannot be read.
    pub fn new(backend: &'a dyn StorageBackend, start_offset: u64) -> TabletResult<Self> {
        let total_size = backend.size()?;
        Ok(Self {
            backend,
            total_size,
            current_offset: start_offset,
            buffer: vec![0u8; READ_BUFFER_SIZE],
            buffer_pos: 0,
            buffer_len: 0,
            finished: false,
        })
    }

    /// Returns the offset just past the last complete record read.
    #[must_use]
    pub fn valid_end(&self) -> u64 {
        self.current_offset
    }

    /// Makes at least `min_bytes` available from the current position.
    ///
    /// Returns `false` if the log ends first.
    fn ensure_buffered(&mut self, min_bytes: usize) -> TabletResult<bool> {
        let available = self.buffer_len - self.buffer_pos;
        if available >= min_bytes {
            return Ok(true);
        }
        let unread = self.total_size.saturating_sub(self.current_offset) as usize;
        if unread < min_bytes {
            return Ok(false);
        }

        if self.buffer_pos > 0 {
            self.buffer.copy_within(self.buffer_pos..self.buffer_len, 0);
        }
        self.buffer_len = available;
        self.buffer_pos = 0;
        if min_bytes > self.buffer.len() {
            self.buffer.resize(min_bytes.next_power_of_two(), 0);
        }

        let to_read = (self.buffer.len() - self.buffer_len).min(unread - available);
        if to_read > 0 {
            let offset = self.current_offset + self.buffer_len as u64;
            let data = self.backend.read_at(offset, to_read)?;
            self.buffer[self.buffer_len..self.buffer_len + data.len()].copy_from_slice(&data);
            self.buffer_len += data.len();
        }
        Ok(self.buffer_len - self.buffer_pos >= min_bytes)
    }

    fn read_next(&mut self) -> TabletResult<Option<(u64, WalBatch)>> {
        let start = self.current_offset;
        if !self.ensure_buffered(HEADER_SIZE)? {
            return Ok(None);
        }

        let header = &self.buffer[self.buffer_pos..self.buffer_pos + HEADER_SIZE];
        if header[0..4] != WAL_MAGIC {
            return Err(TabletError::wal_corruption(format!(
                "invalid magic at offset {start}"
            )));
        }
        let version = u16::from_le_bytes([header[4], header[5]]);
        if version > WAL_VERSION {
            return Err(TabletError::wal_corruption(format!(
                "unsupported version {version} at offset {start}"
            )));
        }
        let type_byte = header[6];
        let record_type = WalRecordType::from_byte(type_byte).ok_or_else(|| {
            TabletError::wal_corruption(format!(
                "unknown record type {type_byte} at offset {start}"
            ))
        })?;
        let payload_len =
            u32::from_le_bytes([header[7], header[8], header[9], header[10]]) as usize;

        let total_len = HEADER_SIZE + payload_len + CRC_SIZE;
        if !self.ensure_buffered(total_len)? {
            return Ok(None);
        }

        let payload_start = self.buffer_pos + HEADER_SIZE;
        let payload_end = payload_start + payload_len;
        let stored = u32::from_le_bytes([
            self.buffer[payload_end],
            self.buffer[payload_end + 1],
            self.buffer[payload_end + 2],
            self.buffer[payload_end + 3],
        ]);
        let computed = compute_crc32(&self.buffer[self.buffer_pos..payload_end]);
        if stored != computed {
            return Err(TabletError::ChecksumMismatch {
                expected: stored,
                actual: computed,
            });
        }

        let payload = &self.buffer[payload_start..payload_end];
        let batch = WalBatch::decode_payload(record_type, payload)?;
        self.buffer_pos += total_len;
        self.current_offset += total_len as u64;
        Ok(Some((start, batch)))
    }
}

impl Iterator for WalIterator<'_> {
    type Item = TabletResult<(u64, WalBatch)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.read_next() {
            Ok(Some(item)) => Some(Ok(item)),
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}
