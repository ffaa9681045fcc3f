//! Snapshot scans.
//!
//! A scan fixes a timestamp, pins it with the clock and takes the component
//! snapshot current at creation. It then pulls rows lazily from one source
//! per store. In ordered mode the sources are merged by key with a binary
//! heap; in unordered mode they are drained one after another.
//!
//! ## Invariants
//!
//! - rows come out in strictly ascending key order (ordered mode)
//! - every row is the key's state as of the scan timestamp; deleted keys
//!   are skipped
//! - two sources producing the same key means two live versions at one
//!   timestamp, which is corruption and ends the scan

use crate::clock::SnapshotPin;
use crate::error::{TabletError, TabletResult};
use crate::row::{Row, RowKey, Schema, Value};
use crate::rowset::{Components, RowSource};
use crate::types::Timestamp;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::ops::Bound;
use std::sync::Arc;

/// A column condition evaluated against materialized rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Predicate {
    /// The column equals a value.
    Equals {
        /// Column name (key or value column).
        column: String,
        /// Value to compare with.
        value: Value,
    },
    /// The column is NULL.
    IsNull(String),
    /// The column is not NULL.
    IsNotNull(String),
    /// Every inner predicate holds.
    And(Vec<Predicate>),
}

impl Predicate {
    /// Creates an equality predicate.
    pub fn equals(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Equals {
            column: column.into(),
            value: value.into(),
        }
    }

    /// Creates an IS NULL predicate.
    pub fn is_null(column: impl Into<String>) -> Self {
        Self::IsNull(column.into())
    }

    /// Creates an IS NOT NULL predicate.
    pub fn is_not_null(column: impl Into<String>) -> Self {
        Self::IsNotNull(column.into())
    }

    /// Checks that every referenced column exists.
    ///
    /// # Errors
    ///
    /// Returns a validation error naming the first unknown column.
    pub fn validate(&self, schema: &Schema) -> TabletResult<()> {
        match self {
            Self::Equals { column, .. } | Self::IsNull(column) | Self::IsNotNull(column) => {
                if schema.key_columns().contains(column) || schema.value_columns().contains(column)
                {
                    Ok(())
                } else {
                    Err(TabletError::validation(format!(
                        "predicate on unknown column {column:?}"
                    )))
                }
            }
            Self::And(inner) => inner.iter().try_for_each(|p| p.validate(schema)),
        }
    }

    /// Evaluates the predicate on a row.
    #[must_use]
    pub fn matches(&self, schema: &Schema, row: &Row) -> bool {
        match self {
            Self::Equals { column, value } => column_value(schema, row, column) == Some(value),
            Self::IsNull(column) => column_value(schema, row, column).map_or(true, Value::is_null),
            Self::IsNotNull(column) => {
                column_value(schema, row, column).is_some_and(|v| !v.is_null())
            }
            Self::And(inner) => inner.iter().all(|p| p.matches(schema, row)),
        }
    }
}

fn column_value<'a>(schema: &Schema, row: &'a Row, column: &str) -> Option<&'a Value> {
    match schema.key_columns().iter().position(|c| c == column) {
        Some(index) => row.key.columns().get(index),
        None => row.get(column),
    }
}

/// What to read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanSpec {
    /// Snapshot timestamp; `None` reads at the current time.
    pub timestamp: Option<Timestamp>,
    /// Lower key bound.
    pub lower: Bound<RowKey>,
    /// Upper key bound.
    pub upper: Bound<RowKey>,
    /// Optional column filter.
    pub predicate: Option<Predicate>,
    /// Merge sources into key order (the default).
    pub ordered: bool,
}

impl Default for ScanSpec {
    fn default() -> Self {
        Self {
            timestamp: None,
            lower: Bound::Unbounded,
            upper: Bound::Unbounded,
            predicate: None,
            ordered: true,
        }
    }
}

impl ScanSpec {
    /// Creates a full, ordered scan at the current time.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads at `ts` instead of the current time.
    #[must_use]
    pub fn at(mut self, ts: Timestamp) -> Self {
        self.timestamp = Some(ts);
        self
    }

    /// Restricts the key range.
    #[must_use]
    pub fn range(mut self, lower: Bound<RowKey>, upper: Bound<RowKey>) -> Self {
        self.lower = lower;
        self.upper = upper;
        self
    }

    /// Adds a column filter.
    #[must_use]
    pub fn filter(mut self, predicate: Predicate) -> Self {
        self.predicate = Some(predicate);
        self
    }

    /// Skips the key-order merge.
    #[must_use]
    pub fn unordered(mut self) -> Self {
        self.ordered = false;
        self
    }
}

/// A lazy, finite, non-restartable row iterator at one timestamp.
pub struct Scanner {
    sources: Vec<RowSource>,
    mode: Mode,
    predicate: Option<Predicate>,
    schema: Schema,
    pin: SnapshotPin,
    _components: Arc<Components>,
    finished: bool,
}

enum Mode {
    Ordered {
        primed: bool,
        heads: Vec<Option<Row>>,
        heap: BinaryHeap<Reverse<(RowKey, usize)>>,
    },
    Unordered {
        current: usize,
    },
}

impl std::fmt::Debug for Scanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scanner")
            .field("timestamp", &self.pin.timestamp())
            .field("sources", &self.sources.len())
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

impl Scanner {
    pub(crate) fn new(
        components: Arc<Components>,
        spec: ScanSpec,
        pin: SnapshotPin,
        schema: Schema,
        batch_size: usize,
    ) -> Self {
        let ts = pin.timestamp();
        let sources: Vec<RowSource> = components
            .all()
            .map(|set| set.source(spec.lower.clone(), spec.upper.clone(), ts, batch_size))
            .collect();
        let mode = if spec.ordered {
            Mode::Ordered {
                primed: false,
                heads: (0..sources.len()).map(|_| None).collect(),
                heap: BinaryHeap::new(),
            }
        } else {
            Mode::Unordered { current: 0 }
        };
        Self {
            sources,
            mode,
            predicate: spec.predicate,
            schema,
            pin,
            _components: components,
            finished: false,
        }
    }

    /// Returns the snapshot timestamp.
    #[must_use]
    pub fn timestamp(&self) -> Timestamp {
        self.pin.timestamp()
    }

    fn next_visible(&mut self) -> TabletResult<Option<Row>> {
        match &mut self.mode {
            Mode::Ordered {
                primed,
                heads,
                heap,
            } => {
                if !*primed {
                    for (i, source) in self.sources.iter_mut().enumerate() {
                        if let Some(row) = source.next_row()? {
                            heap.push(Reverse((row.key.clone(), i)));
                            heads[i] = Some(row);
                        }
                    }
                    *primed = true;
                }
                let Some(Reverse((key, i))) = heap.pop() else {
                    return Ok(None);
                };
                let row = heads[i].take();
                if let Some(next) = self.sources[i].next_row()? {
                    debug_assert!(next.key > key);
                    heap.push(Reverse((next.key.clone(), i)));
                    heads[i] = Some(next);
                }
                if let Some(Reverse((other, _))) = heap.peek() {
                    if *other == key {
                        return Err(TabletError::corruption(format!(
                            "two live versions of {key} at {}",
                            self.pin.timestamp()
                        )));
                    }
                }
                Ok(row)
            }
            Mode::Unordered { current } => {
                while *current < self.sources.len() {
                    if let Some(row) = self.sources[*current].next_row()? {
                        return Ok(Some(row));
                    }
                    *current += 1;
                }
                Ok(None)
            }
        }
    }
}

impl Iterator for Scanner {
    type Item = TabletResult<Row>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.finished {
            match self.next_visible() {
                Ok(Some(row)) => {
                    let keep = self
                        .predicate
                        .as_ref()
                        .map_or(true, |p| p.matches(&self.schema, &row));
                    if keep {
                        return Some(Ok(row));
                    }
                }
                Ok(None) => self.finished = true,
                Err(e) => {
                    self.finished = true;
                    return Some(Err(e));
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MvccClock;
    use crate::memrowset::MemRowSet;
    use crate::row::Values;
    use crate::rowset::RowSet;
    use crate::types::MrsId;

    fn vals(v: i64) -> Values {
        [("val".to_string(), Value::Int(v))].into_iter().collect()
    }

    fn schema() -> Schema {
        Schema::new(["key"], ["val"]).unwrap()
    }

    fn mrs(id: u64, keys: &[i64]) -> Arc<MemRowSet> {
        let mrs = Arc::new(MemRowSet::new(MrsId(id)));
        for k in keys {
            mrs.insert(RowKey::int(*k), Timestamp(1), vals(*k * 10))
                .unwrap();
        }
        mrs
    }

    fn scan(components: Components, spec: ScanSpec) -> Vec<TabletResult<Row>> {
        let clock = Arc::new(MvccClock::resume_from(Timestamp(5), Timestamp::ZERO));
        let pin = clock.pin(spec.timestamp.unwrap_or(Timestamp(5)));
        Scanner::new(Arc::new(components), spec, pin, schema(), 2).collect()
    }

    fn keys(rows: Vec<TabletResult<Row>>) -> Vec<i64> {
        rows.into_iter()
            .map(|r| r.unwrap().key.columns()[0].as_int().unwrap())
            .collect()
    }

    #[test]
    fn ordered_scan_merges_sources() {
        let components = Components::new(
            mrs(3, &[2, 9]),
            vec![RowSet::Memory(mrs(2, &[1, 5])), RowSet::Memory(mrs(1, &[3, 4]))],
        );
        assert_eq!(keys(scan(components.clone(), ScanSpec::new())), vec![1, 2, 3, 4, 5, 9]);

        let mut unordered = keys(scan(components, ScanSpec::new().unordered()));
        assert_eq!(unordered, vec![2, 9, 1, 5, 3, 4]);
        unordered.sort_unstable();
        assert_eq!(unordered, vec![1, 2, 3, 4, 5, 9]);
    }

    #[test]
    fn duplicate_live_key_is_corruption() {
        let components = Components::new(mrs(2, &[1, 4]), vec![RowSet::Memory(mrs(1, &[4]))]);
        let rows = scan(components, ScanSpec::new());
        assert!(rows[0].is_ok());
        assert!(matches!(rows[1], Err(TabletError::Corruption { .. })));
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn predicates_filter_rows() {
        let m = mrs(1, &[1, 2, 3]);
        m.mutate(
            &RowKey::int(2),
            Timestamp(2),
            crate::row::RowChange::Update(vec![("val".into(), Value::Null)]),
        )
        .unwrap();
        let components = Components::new(m, Vec::new());

        let eq = ScanSpec::new().filter(Predicate::equals("val", 30_i64));
        assert_eq!(keys(scan(components.clone(), eq)), vec![3]);

        let null = ScanSpec::new().filter(Predicate::is_null("val"));
        assert_eq!(keys(scan(components.clone(), null)), vec![2]);

        let both = ScanSpec::new().filter(Predicate::And(vec![
            Predicate::is_not_null("val"),
            Predicate::equals("key", 1_i64),
        ]));
        assert_eq!(keys(scan(components.clone(), both)), vec![1]);

        let before = ScanSpec::new()
            .at(Timestamp(1))
            .filter(Predicate::is_null("val"));
        assert!(scan(components, before).is_empty());
    }

    #[test]
    fn range_bounds_apply() {
        let components = Components::new(mrs(1, &[1, 2, 3, 4, 5]), Vec::new());
        let spec = ScanSpec::new().range(
            Bound::Excluded(RowKey::int(1)),
            Bound::Included(RowKey::int(4)),
        );
        assert_eq!(keys(scan(components, spec)), vec![2, 3, 4]);
    }

    #[test]
    fn predicate_validation() {
        let s = schema();
        assert!(Predicate::equals("val", 1_i64).validate(&s).is_ok());
        assert!(Predicate::And(vec![Predicate::is_null("zzz")])
            .validate(&s)
            .is_err());
    }
}
