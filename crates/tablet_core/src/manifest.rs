//! Tablet manifest: the durable description of the row-set collection.
//!
//! ## Format
//!
//! ```text
//! | magic "TMFT" (4) | version (2) | len (4) | CBOR body (len) | crc32 (4) |
//! ```
//!
//! The checksum covers everything before it. The manifest is replaced
//! atomically (`MANIFEST.tmp` + rename), so a reader sees either the old
//! or the new description, and committing a new manifest is the single
//! step that makes a flush or compaction durable.

use crate::codec::{compute_crc32, decode_body, encode_body};
use crate::error::{TabletError, TabletResult};
use crate::row::{RowKey, Schema};
use crate::types::{DmsId, FileId, MrsId, RowSetId, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Magic bytes for the manifest file.
pub const MANIFEST_MAGIC: [u8; 4] = *b"TMFT";

/// Current manifest version.
pub const MANIFEST_VERSION: u16 = 1;

const HEADER_SIZE: usize = 10;

/// Durable description of one disk row set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowSetMeta {
    /// Row set id.
    pub id: RowSetId,
    /// Timestamp the row set was built at.
    pub created_ts: Timestamp,
    /// Smallest base key.
    pub min_key: RowKey,
    /// Largest base key.
    pub max_key: RowKey,
    /// Base image file.
    pub base_file: FileId,
    /// UNDO delta file.
    pub undo_file: FileId,
    /// REDO delta files, oldest first.
    pub redo_files: Vec<FileId>,
    /// Every DMS generation below this one has been flushed to a REDO file.
    pub durable_dms_below: DmsId,
}

impl RowSetMeta {
    /// Returns every file the row set refers to.
    #[must_use]
    pub fn files(&self) -> BTreeSet<FileId> {
        let mut files: BTreeSet<FileId> = self.redo_files.iter().copied().collect();
        files.insert(self.base_file);
        files.insert(self.undo_file);
        files
    }
}

/// The most recent mutable store flush.
///
/// Log records written to that store after `flush_ts` were moved into the
/// new row set's first DMS, so recovery treats them as targeting
/// `(rowset, DmsId(0))`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlushedMrs {
    /// The flushed store.
    pub mrs_id: MrsId,
    /// The flush snapshot timestamp.
    pub flush_ts: Timestamp,
    /// The row set the store became.
    pub rowset: RowSetId,
}

/// Tablet manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Manifest format version.
    pub format_version: u16,
    /// Column layout.
    pub schema: Schema,
    /// Live row sets, by id.
    pub rowsets: Vec<RowSetMeta>,
    /// Next row set id to hand out.
    pub next_rowset_id: u64,
    /// Next data file id to hand out.
    pub next_file_id: u64,
    /// Every mutable store below this id has been flushed.
    pub next_mrs_id: MrsId,
    /// The latest flush, until the log has been rewritten past it.
    pub last_flush: Option<FlushedMrs>,
    /// Highest timestamp applied when the manifest was written.
    pub last_timestamp: Timestamp,
    /// Snapshots below this timestamp may have lost history to compaction.
    #[serde(default)]
    pub ancient_history_mark: Timestamp,
}

impl Manifest {
    /// Creates the manifest of an empty tablet.
    #[must_use]
    pub fn new(schema: Schema) -> Self {
        Self {
            format_version: MANIFEST_VERSION,
            schema,
            rowsets: Vec::new(),
            next_rowset_id: 1,
            next_file_id: 1,
            next_mrs_id: MrsId(1),
            last_flush: None,
            last_timestamp: Timestamp::ZERO,
            ancient_history_mark: Timestamp::ZERO,
        }
    }

    /// Hands out a row set id.
    pub fn allocate_rowset_id(&mut self) -> RowSetId {
        let id = RowSetId(self.next_rowset_id);
        self.next_rowset_id += 1;
        id
    }

    /// Hands out a data file id.
    pub fn allocate_file_id(&mut self) -> FileId {
        let id = FileId(self.next_file_id);
        self.next_file_id += 1;
        id
    }

    /// Looks up a row set.
    #[must_use]
    pub fn rowset(&self, id: RowSetId) -> Option<&RowSetMeta> {
        self.rowsets.iter().find(|r| r.id == id)
    }

    /// Returns true if `id` was handed out and has since been compacted away.
    #[must_use]
    pub fn is_retired(&self, id: RowSetId) -> bool {
        id.as_u64() < self.next_rowset_id && self.rowset(id).is_none()
    }

    /// Replaces, adds or removes row set entries, keeping them sorted by id.
    pub fn apply_rowset_edit(&mut self, removed: &[RowSetId], added: Vec<RowSetMeta>) {
        self.rowsets.retain(|r| !removed.contains(&r.id));
        for meta in added {
            self.rowsets.retain(|r| r.id != meta.id);
            self.rowsets.push(meta);
        }
        self.rowsets.sort_by_key(|r| r.id);
    }

    /// Encodes the manifest with its envelope.
    ///
    /// # Errors
    ///
    /// Returns a codec error if the body cannot be encoded.
    pub fn encode(&self) -> TabletResult<Vec<u8>> {
        let body = encode_body(self)?;
        let len = u32::try_from(body.len())
            .map_err(|_| TabletError::codec("manifest body too large"))?;
        let mut buf = Vec::with_capacity(HEADER_SIZE + body.len() + 4);
        buf.extend_from_slice(&MANIFEST_MAGIC);
        buf.extend_from_slice(&MANIFEST_VERSION.to_le_bytes());
        buf.extend_from_slice(&len.to_le_bytes());
        buf.extend_from_slice(&body);
        let crc = compute_crc32(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        Ok(buf)
    }

    /// Decodes and verifies a manifest.
    ///
    /// # Errors
    ///
    /// Returns a corruption error for a malformed envelope and
    /// `ChecksumMismatch` for damaged bytes.
    pub fn decode(data: &[u8]) -> TabletResult<Self> {
        if data.len() < HEADER_SIZE + 4 || data[0..4] != MANIFEST_MAGIC {
            return Err(TabletError::corruption("invalid manifest header"));
        }
        let version = u16::from_le_bytes([data[4], data[5]]);
        if version > MANIFEST_VERSION {
            return Err(TabletError::corruption(format!(
                "unsupported manifest version {version}"
            )));
        }
        let len = u32::from_le_bytes([data[6], data[7], data[8], data[9]]) as usize;
        if data.len() != HEADER_SIZE + len + 4 {
            return Err(TabletError::corruption(format!(
                "manifest length {} does not match declared body of {len} bytes",
                data.len()
            )));
        }
        let crc_offset = HEADER_SIZE + len;
        let expected = u32::from_le_bytes([
            data[crc_offset],
            data[crc_offset + 1],
            data[crc_offset + 2],
            data[crc_offset + 3],
        ]);
        let actual = compute_crc32(&data[..crc_offset]);
        if expected != actual {
            return Err(TabletError::ChecksumMismatch { expected, actual });
        }
        decode_body(&data[HEADER_SIZE..crc_offset])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(id: u64, lo: i64, hi: i64) -> RowSetMeta {
        RowSetMeta {
            id: RowSetId(id),
            created_ts: Timestamp(id),
            min_key: RowKey::int(lo),
            max_key: RowKey::int(hi),
            base_file: FileId(id * 10),
            undo_file: FileId(id * 10 + 1),
            redo_files: vec![FileId(id * 10 + 2)],
            durable_dms_below: DmsId(1),
        }
    }

    fn schema() -> Schema {
        Schema::new(["key"], ["val"]).unwrap()
    }

    #[test]
    fn encode_decode_roundtrip() {
        let mut manifest = Manifest::new(schema());
        let id = manifest.allocate_rowset_id();
        manifest.apply_rowset_edit(&[], vec![meta(id.as_u64(), 1, 9)]);
        manifest.last_flush = Some(FlushedMrs {
            mrs_id: MrsId(1),
            flush_ts: Timestamp(4),
            rowset: id,
        });
        manifest.ancient_history_mark = Timestamp(3);

        let decoded = Manifest::decode(&manifest.encode().unwrap()).unwrap();
        assert_eq!(decoded, manifest);
        assert_eq!(decoded.ancient_history_mark, Timestamp(3));
    }

    #[test]
    fn damaged_manifest_is_rejected() {
        let mut bytes = Manifest::new(schema()).encode().unwrap();
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0x40;
        assert!(matches!(
            Manifest::decode(&bytes),
            Err(TabletError::ChecksumMismatch { .. })
        ));
        assert!(Manifest::decode(&bytes[..8]).is_err());
    }

    #[test]
    fn rowset_edits_and_retirement() {
        let mut manifest = Manifest::new(schema());
        for _ in 0..3 {
            let id = manifest.allocate_rowset_id();
            manifest.apply_rowset_edit(&[], vec![meta(id.as_u64(), 0, 5)]);
        }
        manifest.apply_rowset_edit(&[RowSetId(1), RowSetId(2)], vec![meta(4, 0, 5)]);
        manifest.next_rowset_id = 5;

        let ids: Vec<u64> = manifest.rowsets.iter().map(|r| r.id.as_u64()).collect();
        assert_eq!(ids, vec![3, 4]);
        assert!(manifest.is_retired(RowSetId(1)));
        assert!(!manifest.is_retired(RowSetId(3)));
        assert!(!manifest.is_retired(RowSetId(9)));
        assert_eq!(manifest.rowset(RowSetId(3)).unwrap().files().len(), 3);
    }
}
