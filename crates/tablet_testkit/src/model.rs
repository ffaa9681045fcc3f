//! Reference model of a key/value tablet.
//!
//! The model tracks what every committed batch left behind, keyed by the
//! batch timestamp, so a snapshot scan at any timestamp can be checked
//! against the last batch committed at or before it.

use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use tablet_core::Timestamp;

/// The expected contents of one row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ExpectedRow {
    /// Key column.
    pub key: i64,
    /// Value column; `None` is NULL.
    pub val: Option<i64>,
}

impl ExpectedRow {
    /// Creates a row.
    #[must_use]
    pub fn new(key: i64, val: Option<i64>) -> Self {
        Self { key, val }
    }
}

impl fmt::Display for ExpectedRow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.val {
            Some(v) => write!(f, "(key={}, val={v})", self.key),
            None => write!(f, "(key={}, val=NULL)", self.key),
        }
    }
}

/// Expected tablet contents, in key order.
pub type ExpectedState = BTreeMap<i64, ExpectedRow>;

/// Committed and pending tablet contents.
#[derive(Debug, Default, Clone)]
pub struct TabletModel {
    current: ExpectedState,
    pending: ExpectedState,
    saved: BTreeMap<Timestamp, ExpectedState>,
}

impl TabletModel {
    /// Creates an empty model.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an insert or full-row upsert in the pending batch.
    pub fn put(&mut self, key: i64, val: Option<i64>) {
        self.pending.insert(key, ExpectedRow::new(key, val));
    }

    /// Records a key-only upsert: a live row keeps its value, an absent
    /// one becomes NULL.
    pub fn put_pk_only(&mut self, key: i64) {
        let val = self.pending.get(&key).and_then(|row| row.val);
        self.put(key, val);
    }

    /// Records a delete in the pending batch.
    pub fn delete(&mut self, key: i64) {
        self.pending.remove(&key);
    }

    /// Commits the pending batch as applied at `ts`.
    pub fn commit(&mut self, ts: Timestamp) {
        self.current = self.pending.clone();
        self.saved.insert(ts, self.current.clone());
    }

    /// Returns the committed value of `key`.
    #[must_use]
    pub fn current(&self, key: i64) -> Option<ExpectedRow> {
        self.current.get(&key).copied()
    }

    /// Returns what a snapshot scan at `ts` must return.
    #[must_use]
    pub fn expected_at(&self, ts: Timestamp) -> Vec<ExpectedRow> {
        self.saved
            .range(..=ts)
            .next_back()
            .map(|(_, state)| state.values().copied().collect())
            .unwrap_or_default()
    }

    /// Returns the timestamps of every committed batch.
    pub fn saved_timestamps(&self) -> impl Iterator<Item = Timestamp> + '_ {
        self.saved.keys().copied()
    }
}

/// Describes how `found` differs from `expected`; `None` if they match.
#[must_use]
pub fn diff_rows(expected: &[ExpectedRow], found: &[ExpectedRow]) -> Option<String> {
    if expected == found {
        return None;
    }
    let mut errors = Vec::new();
    for (e, f) in expected.iter().zip(found) {
        if e.key != f.key {
            errors.push(format!("mismatched key: expected {e}, found {f}"));
        } else if e.val != f.val {
            errors.push(format!("mismatched value: expected {e}, found {f}"));
        }
    }
    for e in expected.iter().skip(found.len()) {
        errors.push(format!("missing row {e}"));
    }
    for f in found.iter().skip(expected.len()) {
        errors.push(format!("unexpected row {f}"));
    }
    Some(format!(
        "expected {} rows, found {}: {}",
        expected.len(),
        found.len(),
        errors.join("; ")
    ))
}
