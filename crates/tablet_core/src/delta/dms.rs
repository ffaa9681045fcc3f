//! In-memory REDO accumulator of a disk row set.

use crate::delta::record::DeltaRecord;
use crate::error::TabletResult;
use crate::row::{RowChange, RowKey, Values};
use crate::types::{DmsId, Timestamp};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Collects mutations to rows of a disk row set until the next delta flush.
///
/// Writers append under the tablet writer lock, so per-key change lists are
/// already in timestamp order. Readers take the read lock only while they
/// apply a single key's changes.
#[derive(Debug)]
pub struct DeltaMemStore {
    id: DmsId,
    changes: RwLock<BTreeMap<RowKey, Vec<(Timestamp, RowChange)>>>,
    count: AtomicUsize,
}

impl DeltaMemStore {
    /// Creates an empty store of generation `id`.
    #[must_use]
    pub fn new(id: DmsId) -> Self {
        Self {
            id,
            changes: RwLock::new(BTreeMap::new()),
            count: AtomicUsize::new(0),
        }
    }

    /// Returns the store generation.
    #[must_use]
    pub fn id(&self) -> DmsId {
        self.id
    }

    /// Appends a mutation.
    pub fn append(&self, key: RowKey, ts: Timestamp, change: RowChange) {
        let mut changes = self.changes.write();
        let list = changes.entry(key).or_default();
        debug_assert!(list.last().map_or(true, |(last, _)| *last <= ts));
        list.push((ts, change));
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    /// Applies this key's mutations with timestamp `<= ts` to `state`.
    ///
    /// # Errors
    ///
    /// Returns a corruption error if a change does not fit the state.
    pub fn apply_up_to(
        &self,
        key: &RowKey,
        ts: Timestamp,
        state: &mut Option<Values>,
    ) -> TabletResult<()> {
        let changes = self.changes.read();
        if let Some(list) = changes.get(key) {
            for (_, change) in list.iter().take_while(|(t, _)| *t <= ts) {
                change.apply(state, key)?;
            }
        }
        Ok(())
    }

    /// Returns a copy of this key's mutations.
    #[must_use]
    pub fn changes_for(&self, key: &RowKey) -> Vec<(Timestamp, RowChange)> {
        self.changes.read().get(key).cloned().unwrap_or_default()
    }

    /// Returns true if `key` has mutations here.
    #[must_use]
    pub fn contains(&self, key: &RowKey) -> bool {
        self.changes.read().contains_key(key)
    }

    /// Returns the number of mutations held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    /// Returns true if no mutation is held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns all mutations as REDO records in delta order.
    #[must_use]
    pub fn to_records(&self) -> Vec<DeltaRecord> {
        let changes = self.changes.read();
        let mut records = Vec::with_capacity(self.len());
        for (key, list) in changes.iter() {
            for (ts, change) in list {
                records.push(DeltaRecord::new(key.clone(), *ts, change.clone()));
            }
        }
        records
    }
}
