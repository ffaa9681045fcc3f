//! On-disk framing shared by data files, the WAL and the manifest.
//!
//! ## Data file layout
//!
//! ```text
//! | magic (4) | version (2) | kind (1) | count (8) | header crc32 (4) |
//! | len (4) | CBOR body (len) | body crc32 (4) |   x count
//! ```
//!
//! Data files are written in one piece and synced before anything refers
//! to them, so a short or damaged file is corruption, never a torn tail.

use crate::error::{TabletError, TabletResult};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;
use tablet_storage::{FileBackend, StorageBackend};

/// Current data file format version.
pub const DATA_FILE_VERSION: u16 = 1;

/// Size of an encoded [`FileHeader`].
pub const FILE_HEADER_SIZE: usize = 19;

/// Computes a CRC32 checksum (IEEE polynomial).
#[must_use]
pub fn compute_crc32(data: &[u8]) -> u32 {
    const CRC32_TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = i as u32;
            let mut bit = 0;
            while bit < 8 {
                crc = if crc & 1 != 0 {
                    (crc >> 1) ^ 0xEDB8_8320
                } else {
                    crc >> 1
                };
                bit += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    };

    let mut crc = 0xFFFF_FFFF_u32;
    for &byte in data {
        crc = (crc >> 8) ^ CRC32_TABLE[((crc ^ u32::from(byte)) & 0xFF) as usize];
    }
    !crc
}

/// Encodes a value as a CBOR body.
///
/// # Errors
///
/// Returns a codec error if serialization fails.
pub fn encode_body<T: Serialize>(value: &T) -> TabletResult<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf)?;
    Ok(buf)
}

/// Decodes a CBOR body.
///
/// # Errors
///
/// Returns a codec error if the bytes are not a valid encoding of `T`.
pub fn decode_body<T: DeserializeOwned>(bytes: &[u8]) -> TabletResult<T> {
    Ok(ciborium::from_reader(bytes)?)
}

/// Header at the start of every data file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHeader {
    /// File type magic.
    pub magic: [u8; 4],
    /// Format version.
    pub version: u16,
    /// Type-specific discriminator (delta direction for delta files).
    pub kind: u8,
    /// Number of frames following the header.
    pub count: u64,
}

impl FileHeader {
    /// Encodes the header with its checksum.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(FILE_HEADER_SIZE);
        buf.extend_from_slice(&self.magic);
        buf.extend_from_slice(&self.version.to_le_bytes());
        buf.push(self.kind);
        buf.extend_from_slice(&self.count.to_le_bytes());
        let crc = compute_crc32(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        buf
    }

    /// Decodes and checks a header.
    ///
    /// # Errors
    ///
    /// Returns a corruption error on a short header, wrong magic or
    /// unsupported version, and `ChecksumMismatch` on a bad checksum.
    pub fn decode(data: &[u8], magic: [u8; 4]) -> TabletResult<Self> {
        if data.len() < FILE_HEADER_SIZE {
            return Err(TabletError::corruption("data file shorter than its header"));
        }
        if data[0..4] != magic {
            return Err(TabletError::corruption(format!(
                "bad data file magic {:?}, expected {:?}",
                &data[0..4],
                magic
            )));
        }
        let expected = read_u32(&data[15..19]);
        let actual = compute_crc32(&data[0..15]);
        if expected != actual {
            return Err(TabletError::ChecksumMismatch { expected, actual });
        }
        let version = u16::from_le_bytes([data[4], data[5]]);
        if version > DATA_FILE_VERSION {
            return Err(TabletError::corruption(format!(
                "unsupported data file version {version}"
            )));
        }
        let mut count = [0u8; 8];
        count.copy_from_slice(&data[7..15]);
        Ok(Self {
            magic,
            version,
            kind: data[6],
            count: u64::from_le_bytes(count),
        })
    }
}

fn read_u32(bytes: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[..4]);
    u32::from_le_bytes(buf)
}

/// Appends a `len | body | crc` frame.
///
/// # Errors
///
/// Returns a codec error if the body exceeds 4 GiB.
pub fn append_frame(buf: &mut Vec<u8>, body: &[u8]) -> TabletResult<()> {
    let len = u32::try_from(body.len())
        .map_err(|_| TabletError::codec(format!("frame of {} bytes too large", body.len())))?;
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(body);
    buf.extend_from_slice(&compute_crc32(body).to_le_bytes());
    Ok(())
}

/// Reads consecutive frames out of a fully loaded data file.
#[derive(Debug)]
pub struct FrameReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> FrameReader<'a> {
    /// Starts reading at `pos`.
    #[must_use]
    pub fn new(data: &'a [u8], pos: usize) -> Self {
        Self { data, pos }
    }

    /// Returns the next frame body, or `None` at the end of the data.
    ///
    /// # Errors
    ///
    /// Returns a corruption error for a truncated frame and
    /// `ChecksumMismatch` for a damaged one.
    pub fn next_frame(&mut self) -> TabletResult<Option<&'a [u8]>> {
        if self.pos == self.data.len() {
            return Ok(None);
        }
        let rest = &self.data[self.pos..];
        if rest.len() < 4 {
            return Err(TabletError::corruption("truncated frame length"));
        }
        let len = read_u32(rest) as usize;
        if rest.len() < 4 + len + 4 {
            return Err(TabletError::corruption(format!(
                "truncated frame at offset {}",
                self.pos
            )));
        }
        let body = &rest[4..4 + len];
        let expected = read_u32(&rest[4 + len..]);
        let actual = compute_crc32(body);
        if expected != actual {
            return Err(TabletError::ChecksumMismatch { expected, actual });
        }
        self.pos += 4 + len + 4;
        Ok(Some(body))
    }
}

/// Writes a complete data file and syncs it.
///
/// A failed write removes the partial file so no half-written container is
/// left behind.
///
/// # Errors
///
/// Returns an error if the file exists already, or encoding or I/O fails.
pub fn write_data_file<T: Serialize>(
    path: &Path,
    magic: [u8; 4],
    kind: u8,
    items: &[T],
) -> TabletResult<u64> {
    let header = FileHeader {
        magic,
        version: DATA_FILE_VERSION,
        kind,
        count: items.len() as u64,
    };
    let mut buf = header.encode();
    for item in items {
        append_frame(&mut buf, &encode_body(item)?)?;
    }

    let mut backend = FileBackend::create_new(path)?;
    let written = backend
        .append(&buf)
        .and_then(|_| backend.sync())
        .map(|()| buf.len() as u64);
    match written {
        Ok(bytes) => Ok(bytes),
        Err(e) => {
            drop(backend);
            let _ = std::fs::remove_file(path);
            Err(e.into())
        }
    }
}

/// Reads and verifies a complete data file.
///
/// # Errors
///
/// Returns an error if the file is missing, damaged, or holds a different
/// number of frames than its header declares.
pub fn read_data_file<T: DeserializeOwned>(
    path: &Path,
    magic: [u8; 4],
) -> TabletResult<(FileHeader, Vec<T>)> {
    let backend = FileBackend::open_existing(path)?;
    let data = backend.read_all()?;
    let header = FileHeader::decode(&data, magic)?;

    let mut reader = FrameReader::new(&data, FILE_HEADER_SIZE);
    let mut items = Vec::new();
    while let Some(body) = reader.next_frame()? {
        items.push(decode_body(body)?);
    }
    if items.len() as u64 != header.count {
        return Err(TabletError::corruption(format!(
            "{} declares {} frames but holds {}",
            path.display(),
            header.count,
            items.len()
        )));
    }
    Ok((header, items))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn crc32_known_value() {
        assert_eq!(compute_crc32(b"123456789"), 0xCBF4_3926);
        assert_eq!(compute_crc32(b""), 0);
    }

    #[test]
    fn header_checks_magic_and_crc() {
        let header = FileHeader {
            magic: *b"TDLT",
            version: DATA_FILE_VERSION,
            kind: 2,
            count: 7,
        };
        let mut bytes = header.encode();
        assert_eq!(bytes.len(), FILE_HEADER_SIZE);
        assert_eq!(FileHeader::decode(&bytes, *b"TDLT").unwrap(), header);
        assert!(FileHeader::decode(&bytes, *b"TBAS").is_err());

        bytes[8] ^= 0xFF;
        assert!(matches!(
            FileHeader::decode(&bytes, *b"TDLT"),
            Err(TabletError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn data_file_roundtrip_and_damage() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("items.dat");
        let items = vec!["a".to_string(), "bc".to_string()];
        write_data_file(&path, *b"TTST", 0, &items).unwrap();

        let (header, read): (_, Vec<String>) = read_data_file(&path, *b"TTST").unwrap();
        assert_eq!(header.count, 2);
        assert_eq!(read, items);

        assert!(write_data_file(&path, *b"TTST", 0, &items).is_err());

        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 6;
        bytes[last] ^= 0x01;
        std::fs::write(&path, &bytes).unwrap();
        assert!(read_data_file::<String>(&path, *b"TTST").is_err());

        bytes.truncate(bytes.len() - 3);
        std::fs::write(&path, &bytes).unwrap();
        assert!(matches!(
            read_data_file::<String>(&path, *b"TTST"),
            Err(TabletError::Corruption { .. })
        ));
    }
}
