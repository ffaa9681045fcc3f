//! The row-set collection and its shared read capability.
//!
//! A tablet's data is the active mutable store plus a list of row sets.
//! Both kinds answer the same questions (is this key live, what did it
//! look like at `ts`, which rows are visible in a range) through
//! [`RowSet`], so reads never care which kind they are looking at.

use crate::diskrowset::DiskRowSet;
use crate::error::TabletResult;
use crate::memrowset::{range_is_empty, MemRowSet};
use crate::row::{Row, RowKey, Values};
use crate::types::{RowSetId, Timestamp};
use std::collections::VecDeque;
use std::fmt;
use std::ops::Bound;
use std::sync::Arc;

/// A readable row container.
#[derive(Debug, Clone)]
pub enum RowSet {
    /// A mutable store; inside the collection, one frozen by a running flush.
    Memory(Arc<MemRowSet>),
    /// A flushed or compacted container.
    Disk(Arc<DiskRowSet>),
}

impl RowSet {
    /// Materializes `key` as of `ts`.
    ///
    /// # Errors
    ///
    /// Returns a corruption error if the key's history does not replay.
    pub fn state_at(&self, key: &RowKey, ts: Timestamp) -> TabletResult<Option<Values>> {
        match self {
            Self::Memory(mrs) => mrs.state_at(key, ts),
            Self::Disk(drs) => drs.state_at(key, ts),
        }
    }

    /// Returns true if `key` is live after every applied mutation.
    ///
    /// # Errors
    ///
    /// Returns a corruption error if the key's history does not replay.
    pub fn is_live(&self, key: &RowKey) -> TabletResult<bool> {
        match self {
            Self::Memory(mrs) => mrs.is_live(key),
            Self::Disk(drs) => drs.is_live(key),
        }
    }

    /// Opens a lazy, key-ordered source of the rows visible at `ts` inside
    /// the bounds.
    #[must_use]
    pub fn source(
        &self,
        lower: Bound<RowKey>,
        upper: Bound<RowKey>,
        ts: Timestamp,
        batch_size: usize,
    ) -> RowSource {
        match self {
            Self::Memory(mrs) => RowSource::Memory(MemSource {
                mrs: Arc::clone(mrs),
                lower,
                upper,
                ts,
                batch_size,
                after: None,
                buffer: VecDeque::new(),
                exhausted: false,
            }),
            Self::Disk(drs) => {
                let index = drs.base().lower_index(lower.as_ref());
                RowSource::Disk(DiskSource {
                    drs: Arc::clone(drs),
                    index,
                    upper,
                    ts,
                })
            }
        }
    }
}

impl fmt::Display for RowSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Memory(mrs) => write!(f, "{}", mrs.id()),
            Self::Disk(drs) => write!(f, "{}", drs.id()),
        }
    }
}

/// An immutable snapshot of the tablet's stores.
///
/// Installing a flush or compaction builds a new `Components` and swaps the
/// pointer; readers keep whichever snapshot they started with.
#[derive(Debug, Clone)]
pub struct Components {
    /// The store receiving new rows.
    pub mrs: Arc<MemRowSet>,
    /// Frozen mutable stores first, then disk row sets by id.
    pub rowsets: Vec<RowSet>,
}

impl Components {
    /// Creates the snapshot of a tablet with only a mutable store.
    #[must_use]
    pub fn new(mrs: Arc<MemRowSet>, rowsets: Vec<RowSet>) -> Self {
        Self { mrs, rowsets }
    }

    /// Returns every store, active mutable store first.
    pub fn all(&self) -> impl Iterator<Item = RowSet> + '_ {
        std::iter::once(RowSet::Memory(Arc::clone(&self.mrs))).chain(self.rowsets.iter().cloned())
    }

    /// Returns the disk row sets.
    pub fn disk_rowsets(&self) -> impl Iterator<Item = &Arc<DiskRowSet>> {
        self.rowsets.iter().filter_map(|r| match r {
            RowSet::Disk(drs) => Some(drs),
            RowSet::Memory(_) => None,
        })
    }

    /// Finds a disk row set by id.
    #[must_use]
    pub fn disk_rowset(&self, id: RowSetId) -> Option<&Arc<DiskRowSet>> {
        self.disk_rowsets().find(|drs| drs.id() == id)
    }

    /// Returns a copy where every disk row set with a matching id is
    /// replaced and `added` ones are appended, keeping id order.
    #[must_use]
    pub fn with_disk_rowsets(
        &self,
        removed: &[RowSetId],
        added: Vec<Arc<DiskRowSet>>,
    ) -> Self {
        let mut rowsets: Vec<RowSet> = self
            .rowsets
            .iter()
            .filter(|r| match r {
                RowSet::Disk(drs) => {
                    !removed.contains(&drs.id()) && !added.iter().any(|a| a.id() == drs.id())
                }
                RowSet::Memory(_) => true,
            })
            .cloned()
            .collect();
        rowsets.extend(added.into_iter().map(RowSet::Disk));
        sort_rowsets(&mut rowsets);
        Self {
            mrs: Arc::clone(&self.mrs),
            rowsets,
        }
    }
}

/// Orders a row set list: frozen stores first, then disk row sets by id.
pub(crate) fn sort_rowsets(rowsets: &mut [RowSet]) {
    rowsets.sort_by_key(|r| match r {
        RowSet::Memory(mrs) => (0, mrs.id().0),
        RowSet::Disk(drs) => (1, drs.id().as_u64()),
    });
}

/// A lazy producer of visible rows from one store, in key order.
#[derive(Debug)]
pub enum RowSource {
    /// Pages through a mutable store.
    Memory(MemSource),
    /// Walks a disk row set's base image.
    Disk(DiskSource),
}

impl RowSource {
    /// Returns the next visible row, or `None` when the range is done.
    ///
    /// # Errors
    ///
    /// Returns a corruption error if a row's history does not replay.
    pub fn next_row(&mut self) -> TabletResult<Option<Row>> {
        match self {
            Self::Memory(source) => source.next_row(),
            Self::Disk(source) => source.next_row(),
        }
    }
}

/// Row source over a mutable store.
///
/// Rows are fetched a page at a time so the store's lock is never held
/// across calls.
#[derive(Debug)]
pub struct MemSource {
    mrs: Arc<MemRowSet>,
    lower: Bound<RowKey>,
    upper: Bound<RowKey>,
    ts: Timestamp,
    batch_size: usize,
    after: Option<RowKey>,
    buffer: VecDeque<Row>,
    exhausted: bool,
}

impl MemSource {
    fn next_row(&mut self) -> TabletResult<Option<Row>> {
        loop {
            if let Some(row) = self.buffer.pop_front() {
                return Ok(Some(row));
            }
            if self.exhausted {
                return Ok(None);
            }
            let chunk = self.mrs.visible_chunk(
                self.after.as_ref(),
                self.lower.as_ref(),
                self.upper.as_ref(),
                self.ts,
                self.batch_size,
            )?;
            self.buffer.extend(chunk.rows);
            self.exhausted = chunk.exhausted;
            if chunk.resume_after.is_some() {
                self.after = chunk.resume_after;
            }
        }
    }
}

/// Row source over a disk row set.
#[derive(Debug)]
pub struct DiskSource {
    drs: Arc<DiskRowSet>,
    index: usize,
    upper: Bound<RowKey>,
    ts: Timestamp,
}

impl DiskSource {
    fn next_row(&mut self) -> TabletResult<Option<Row>> {
        let rows = self.drs.base().rows();
        while self.index < rows.len() {
            let key = &rows[self.index].key;
            if range_is_empty(Bound::Included(key), self.upper.as_ref()) {
                self.index = rows.len();
                break;
            }
            let index = self.index;
            self.index += 1;
            if let Some(values) = self.drs.state_at_index(index, self.ts)? {
                return Ok(Some(Row::new(key.clone(), values)));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delta::{DeltaDirection, DeltaMemStore, DeltaRecord, DeltaStore};
    use crate::diskrowset::{BaseData, BaseRow};
    use crate::row::{RowChange, Value};
    use crate::types::{DmsId, FileId, MrsId, RowSetId};

    fn vals(v: i64) -> Values {
        [("val".to_string(), Value::Int(v))].into_iter().collect()
    }

    fn disk(id: u64, keys: &[i64]) -> Arc<DiskRowSet> {
        let base = BaseData::new(
            FileId(id * 10),
            keys.iter()
                .map(|k| BaseRow {
                    key: RowKey::int(*k),
                    values: Some(vals(*k)),
                })
                .collect(),
        )
        .unwrap();
        let undo = DeltaStore::new(
            FileId(id * 10 + 1),
            DeltaDirection::Undo,
            keys.iter()
                .map(|k| DeltaRecord::new(RowKey::int(*k), Timestamp(1), RowChange::Delete))
                .collect(),
        )
        .unwrap();
        Arc::new(
            DiskRowSet::new(
                RowSetId(id),
                Timestamp(1),
                Arc::new(base),
                Arc::new(undo),
                Vec::new(),
                Arc::new(DeltaMemStore::new(DmsId(0))),
            )
            .unwrap(),
        )
    }

    fn drain(mut source: RowSource) -> Vec<i64> {
        let mut keys = Vec::new();
        while let Some(row) = source.next_row().unwrap() {
            keys.push(row.key.0[0].as_int().unwrap());
        }
        keys
    }

    #[test]
    fn disk_source_honours_bounds_and_deletes() {
        let drs = disk(1, &[1, 3, 5, 7, 9]);
        drs.dms().append(RowKey::int(5), Timestamp(4), RowChange::Delete);
        let set = RowSet::Disk(drs);

        let all = set.source(Bound::Unbounded, Bound::Unbounded, Timestamp(9), 4);
        assert_eq!(drain(all), vec![1, 3, 7, 9]);

        let old = set.source(
            Bound::Excluded(RowKey::int(1)),
            Bound::Included(RowKey::int(7)),
            Timestamp(3),
            4,
        );
        assert_eq!(drain(old), vec![3, 5, 7]);

        let before = set.source(Bound::Unbounded, Bound::Unbounded, Timestamp::ZERO, 4);
        assert!(drain(before).is_empty());
    }

    #[test]
    fn memory_source_pages() {
        let mrs = Arc::new(MemRowSet::new(MrsId(1)));
        for k in 0..10 {
            mrs.insert(RowKey::int(k), Timestamp(1), vals(k)).unwrap();
        }
        mrs.mutate(&RowKey::int(4), Timestamp(2), RowChange::Delete)
            .unwrap();
        let set = RowSet::Memory(mrs);
        let source = set.source(
            Bound::Included(RowKey::int(2)),
            Bound::Excluded(RowKey::int(8)),
            Timestamp(2),
            3,
        );
        assert_eq!(drain(source), vec![2, 3, 5, 6, 7]);
    }

    #[test]
    fn components_edit_keeps_order() {
        let mrs = Arc::new(MemRowSet::new(MrsId(3)));
        let frozen = RowSet::Memory(Arc::new(MemRowSet::new(MrsId(2))));
        let components = Components::new(mrs, vec![frozen, RowSet::Disk(disk(2, &[1]))]);

        let edited =
            components.with_disk_rowsets(&[RowSetId(2)], vec![disk(4, &[2]), disk(3, &[3])]);
        let names: Vec<String> = edited.rowsets.iter().map(ToString::to_string).collect();
        assert_eq!(names, vec!["mrs:2", "rs:3", "rs:4"]);
        assert!(edited.disk_rowset(RowSetId(3)).is_some());
        assert_eq!(edited.all().count(), 4);
    }
}
