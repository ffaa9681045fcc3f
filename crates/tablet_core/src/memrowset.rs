//! The mutable store: rows written since the last flush.
//!
//! Rows are kept in primary-key order. A row remembers the values it was
//! inserted with and the batch timestamp of that insert; later mutations
//! are appended to the row's change list instead of rewriting it, so any
//! snapshot since the insert can still be materialized.
//!
//! ## Invariants
//!
//! - a row's change list is in non-decreasing timestamp order
//! - a row's first change is never older than its insert
//! - reading at `ts` ignores every change newer than `ts` and every row
//!   inserted after `ts`

use crate::error::{TabletError, TabletResult};
use crate::row::{Row, RowChange, RowKey, Values};
use crate::types::{MrsId, Timestamp};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::ops::Bound;

/// One row of the mutable store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MrsRow {
    /// Timestamp of the batch that inserted the row.
    pub insert_ts: Timestamp,
    /// Values at insert time.
    pub values: Values,
    /// Later changes, oldest first.
    pub changes: Vec<(Timestamp, RowChange)>,
}

impl MrsRow {
    /// Materializes the row as of `ts`.
    ///
    /// # Errors
    ///
    /// Returns a corruption error if the change list does not replay.
    pub fn state_at(&self, key: &RowKey, ts: Timestamp) -> TabletResult<Option<Values>> {
        if self.insert_ts > ts {
            return Ok(None);
        }
        let mut state = Some(self.values.clone());
        for (_, change) in self.changes.iter().take_while(|(t, _)| *t <= ts) {
            change.apply(&mut state, key)?;
        }
        Ok(state)
    }
}

/// A page of visible rows produced for a scan.
#[derive(Debug, Default)]
pub struct MemChunk {
    /// Rows visible at the scan timestamp, in key order.
    pub rows: Vec<Row>,
    /// Last key examined; the next page starts after it.
    pub resume_after: Option<RowKey>,
    /// True once the requested range has been fully examined.
    pub exhausted: bool,
}

/// The tablet's mutable, key-ordered row store.
#[derive(Debug)]
pub struct MemRowSet {
    id: MrsId,
    rows: RwLock<BTreeMap<RowKey, MrsRow>>,
}

impl MemRowSet {
    /// Creates an empty store.
    #[must_use]
    pub fn new(id: MrsId) -> Self {
        Self {
            id,
            rows: RwLock::new(BTreeMap::new()),
        }
    }

    /// Returns the store id.
    #[must_use]
    pub fn id(&self) -> MrsId {
        self.id
    }

    /// Inserts a fresh row.
    ///
    /// # Errors
    ///
    /// Returns an invalid-operation error if the key already has a row here;
    /// callers must append a reinsert instead.
    pub fn insert(&self, key: RowKey, ts: Timestamp, values: Values) -> TabletResult<()> {
        let mut rows = self.rows.write();
        if rows.contains_key(&key) {
            return Err(TabletError::invalid_operation(format!(
                "{} already holds a row for {key}",
                self.id
            )));
        }
        rows.insert(
            key,
            MrsRow {
                insert_ts: ts,
                values,
                changes: Vec::new(),
            },
        );
        Ok(())
    }

    /// Appends a change to an existing row.
    ///
    /// # Errors
    ///
    /// Returns an invalid-operation error if the key has no row here.
    pub fn mutate(&self, key: &RowKey, ts: Timestamp, change: RowChange) -> TabletResult<()> {
        let mut rows = self.rows.write();
        let row = rows.get_mut(key).ok_or_else(|| {
            TabletError::invalid_operation(format!("{} holds no row for {key}", self.id))
        })?;
        debug_assert!(row.insert_ts <= ts);
        debug_assert!(row.changes.last().map_or(true, |(t, _)| *t <= ts));
        row.changes.push((ts, change));
        Ok(())
    }

    /// Returns true if the key has a row here, live or deleted.
    #[must_use]
    pub fn contains(&self, key: &RowKey) -> bool {
        self.rows.read().contains_key(key)
    }

    /// Materializes `key` as of `ts`.
    ///
    /// # Errors
    ///
    /// Returns a corruption error if the row's change list does not replay.
    pub fn state_at(&self, key: &RowKey, ts: Timestamp) -> TabletResult<Option<Values>> {
        match self.rows.read().get(key) {
            Some(row) => row.state_at(key, ts),
            None => Ok(None),
        }
    }

    /// Returns true if `key` has a live version after every applied change.
    ///
    /// # Errors
    ///
    /// Returns a corruption error if the row's change list does not replay.
    pub fn is_live(&self, key: &RowKey) -> TabletResult<bool> {
        Ok(self.state_at(key, Timestamp::MAX)?.is_some())
    }

    /// Returns the number of rows, live or deleted.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.read().len()
    }

    /// Returns true if the store has no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.read().is_empty()
    }

    /// Returns the number of appended changes across all rows.
    #[must_use]
    pub fn change_count(&self) -> usize {
        self.rows.read().values().map(|r| r.changes.len()).sum()
    }

    /// Returns a copy of every row in key order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<(RowKey, MrsRow)> {
        self.rows
            .read()
            .iter()
            .map(|(k, r)| (k.clone(), r.clone()))
            .collect()
    }

    /// Returns every change newer than `ts`, in key order.
    #[must_use]
    pub fn changes_after(&self, ts: Timestamp) -> Vec<(RowKey, Timestamp, RowChange)> {
        let rows = self.rows.read();
        let mut out = Vec::new();
        for (key, row) in rows.iter() {
            for (change_ts, change) in row.changes.iter().filter(|(t, _)| *t > ts) {
                out.push((key.clone(), *change_ts, change.clone()));
            }
        }
        out
    }

    /// Examines up to `limit` rows of `[lower, upper]` that come after
    /// `after`, returning those visible at `ts`.
    ///
    /// The read lock is held for one page only, so writers interleave with
    /// long scans.
    ///
    /// # Errors
    ///
    /// Returns a corruption error if a change list does not replay.
    pub fn visible_chunk(
        &self,
        after: Option<&RowKey>,
        lower: Bound<&RowKey>,
        upper: Bound<&RowKey>,
        ts: Timestamp,
        limit: usize,
    ) -> TabletResult<MemChunk> {
        let start = match after {
            Some(key) => Bound::Excluded(key),
            None => lower,
        };
        if range_is_empty(start, upper) {
            return Ok(MemChunk {
                exhausted: true,
                ..MemChunk::default()
            });
        }

        let rows = self.rows.read();
        let mut chunk = MemChunk::default();
        let mut examined = 0;
        for (key, row) in rows.range::<RowKey, _>((start, upper)) {
            if examined == limit.max(1) {
                return Ok(chunk);
            }
            examined += 1;
            if let Some(values) = row.state_at(key, ts)? {
                chunk.rows.push(Row::new(key.clone(), values));
            }
            chunk.resume_after = Some(key.clone());
        }
        chunk.exhausted = true;
        Ok(chunk)
    }
}

/// Returns true if no key can fall between the two bounds.
///
/// `BTreeMap::range` panics on inverted bounds, so callers check first.
#[must_use]
pub fn range_is_empty(lower: Bound<&RowKey>, upper: Bound<&RowKey>) -> bool {
    match (lower, upper) {
        (Bound::Included(l), Bound::Included(u)) => l > u,
        (Bound::Included(l) | Bound::Excluded(l), Bound::Excluded(u))
        | (Bound::Excluded(l), Bound::Included(u)) => l >= u,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row::Value;

    fn vals(v: i64) -> Values {
        [("val".to_string(), Value::Int(v))].into_iter().collect()
    }

    fn set(v: i64) -> RowChange {
        RowChange::Update(vec![("val".into(), Value::Int(v))])
    }

    #[test]
    fn insert_then_mutate_keeps_history() {
        let mrs = MemRowSet::new(MrsId(1));
        let key = RowKey::int(1);
        mrs.insert(key.clone(), Timestamp(2), vals(5)).unwrap();
        mrs.mutate(&key, Timestamp(4), set(6)).unwrap();
        mrs.mutate(&key, Timestamp(6), RowChange::Delete).unwrap();

        assert_eq!(mrs.state_at(&key, Timestamp(1)).unwrap(), None);
        assert_eq!(mrs.state_at(&key, Timestamp(3)).unwrap(), Some(vals(5)));
        assert_eq!(mrs.state_at(&key, Timestamp(5)).unwrap(), Some(vals(6)));
        assert_eq!(mrs.state_at(&key, Timestamp(6)).unwrap(), None);
        assert!(!mrs.is_live(&key).unwrap());
        assert!(mrs.contains(&key));
        assert_eq!(mrs.change_count(), 2);

        let late = mrs.changes_after(Timestamp(4));
        assert_eq!(late, vec![(key, Timestamp(6), RowChange::Delete)]);
    }

    #[test]
    fn reinsert_after_delete() {
        let mrs = MemRowSet::new(MrsId(1));
        let key = RowKey::int(1);
        mrs.insert(key.clone(), Timestamp(1), vals(1)).unwrap();
        mrs.mutate(&key, Timestamp(2), RowChange::Delete).unwrap();
        mrs.mutate(&key, Timestamp(3), RowChange::Reinsert(vals(7)))
            .unwrap();

        assert_eq!(mrs.state_at(&key, Timestamp(2)).unwrap(), None);
        assert_eq!(mrs.state_at(&key, Timestamp(3)).unwrap(), Some(vals(7)));
        assert!(mrs.insert(key, Timestamp(4), vals(8)).is_err());
    }

    #[test]
    fn mutate_missing_row_fails() {
        let mrs = MemRowSet::new(MrsId(1));
        assert!(mrs
            .mutate(&RowKey::int(3), Timestamp(1), RowChange::Delete)
            .is_err());
    }

    #[test]
    fn chunks_page_through_range() {
        let mrs = MemRowSet::new(MrsId(1));
        for k in 0..10 {
            mrs.insert(RowKey::int(k), Timestamp(k as u64 + 1), vals(k))
                .unwrap();
        }
        let lower = RowKey::int(2);
        let upper = RowKey::int(8);

        let mut seen = Vec::new();
        let mut after: Option<RowKey> = None;
        loop {
            let chunk = mrs
                .visible_chunk(
                    after.as_ref(),
                    Bound::Included(&lower),
                    Bound::Excluded(&upper),
                    Timestamp(6),
                    2,
                )
                .unwrap();
            seen.extend(chunk.rows.iter().map(|r| r.key.clone()));
            if chunk.exhausted {
                break;
            }
            after = chunk.resume_after;
        }
        // keys 2..8 exist, but only keys inserted at ts <= 6 (k <= 5) are visible
        assert_eq!(seen, (2..6).map(RowKey::int).collect::<Vec<_>>());
    }

    #[test]
    fn inverted_range_is_empty() {
        let a = RowKey::int(5);
        let b = RowKey::int(2);
        assert!(range_is_empty(Bound::Included(&a), Bound::Included(&b)));
        assert!(range_is_empty(Bound::Excluded(&a), Bound::Included(&a)));
        assert!(!range_is_empty(Bound::Included(&a), Bound::Included(&a)));
        assert!(!range_is_empty(Bound::Unbounded, Bound::Excluded(&b)));

        let mrs = MemRowSet::new(MrsId(1));
        let chunk = mrs
            .visible_chunk(
                None,
                Bound::Included(&a),
                Bound::Excluded(&b),
                Timestamp(1),
                10,
            )
            .unwrap();
        assert!(chunk.exhausted && chunk.rows.is_empty());
    }
}
