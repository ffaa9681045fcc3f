//! Immutable, sorted delta stores and their files.

use crate::codec::{read_data_file, write_data_file};
use crate::delta::record::{DeltaDirection, DeltaRecord, OrderingChecker};
use crate::error::{TabletError, TabletResult};
use crate::row::RowKey;
use crate::types::{FileId, Timestamp};
use std::path::Path;

/// Magic bytes identifying a delta file.
pub const DELTA_MAGIC: [u8; 4] = *b"TDLT";

/// An immutable delta store.
///
/// Records sit contiguously in one sorted vector. Lookups return a slice of
/// that vector, so readers hold stable index ranges and never copy history.
///
/// # Invariants
///
/// - the record order satisfies [`OrderingChecker`] for `direction`; the
///   check runs in every constructor, so an unsorted store cannot exist
/// - once built, the records never change
#[derive(Debug)]
pub struct DeltaStore {
    file_id: FileId,
    direction: DeltaDirection,
    records: Vec<DeltaRecord>,
}

impl DeltaStore {
    /// Builds a store from records already in delta order.
    ///
    /// # Errors
    ///
    /// Returns an `OrderingViolation` if the records are out of order.
    pub fn new(
        file_id: FileId,
        direction: DeltaDirection,
        records: Vec<DeltaRecord>,
    ) -> TabletResult<Self> {
        let mut checker = OrderingChecker::new(direction);
        for record in &records {
            checker.check_record(record)?;
        }
        Ok(Self {
            file_id,
            direction,
            records,
        })
    }

    /// Returns the id of the backing file.
    #[must_use]
    pub fn file_id(&self) -> FileId {
        self.file_id
    }

    /// Returns the store direction.
    #[must_use]
    pub fn direction(&self) -> DeltaDirection {
        self.direction
    }

    /// Returns all records in order.
    #[must_use]
    pub fn records(&self) -> &[DeltaRecord] {
        &self.records
    }

    /// Returns the records for `key`, in store order.
    #[must_use]
    pub fn records_for(&self, key: &RowKey) -> &[DeltaRecord] {
        let start = self.records.partition_point(|r| r.key < *key);
        let end = start + self.records[start..].partition_point(|r| r.key == *key);
        &self.records[start..end]
    }

    /// Returns the number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns true if the store holds no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Returns the highest timestamp in the store.
    #[must_use]
    pub fn max_timestamp(&self) -> Option<Timestamp> {
        self.records.iter().map(|r| r.ts).max()
    }

    /// Writes the store to a new file at `path` and syncs it.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists or the write fails.
    pub fn write_to(&self, path: &Path) -> TabletResult<u64> {
        write_data_file(path, DELTA_MAGIC, self.direction.as_byte(), &self.records)
    }

    /// Loads a store, verifying checksums, direction and ordering.
    ///
    /// # Errors
    ///
    /// Returns a corruption error for a damaged file or wrong direction and
    /// an `OrderingViolation` for unsorted content.
    pub fn open(path: &Path, file_id: FileId, direction: DeltaDirection) -> TabletResult<Self> {
        let (header, records) = read_data_file::<DeltaRecord>(path, DELTA_MAGIC)?;
        match DeltaDirection::from_byte(header.kind) {
            Some(found) if found == direction => Self::new(file_id, direction, records),
            found => Err(TabletError::corruption(format!(
                "{} holds {found:?} deltas, expected {direction}",
                path.display()
            ))),
        }
    }
}
