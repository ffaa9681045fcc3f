//! Randomized workload harness.
//!
//! A fuzz case is a sequence of [`TestOp`]s: row mutations that are
//! buffered into a batch, `FlushOps` which writes that batch, and the
//! maintenance and restart operations that reshape the stores underneath.
//! [`FuzzDriver`] runs a case against a real tablet and a [`TabletModel`]
//! side by side and fails on the first difference.
//!
//! Cases come from three places: hand-written regression sequences,
//! [`generate_test_case`] driven by a seeded RNG, and the proptest
//! strategies in [`crate::generators`]. All of them go through
//! [`CaseBuilder`], which only emits sequences that are valid: no insert of
//! a live key, no update or delete of an absent one.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use tablet_testkit::{fuzz::*, fixtures::int_schema};
//! use TestOpKind::*;
//!
//! run_fuzz_case(int_schema(), &[op(Insert, 0), op(FlushOps, 0), op(FlushTablet, 0)], 1)?;
//! ```

use crate::fixtures::{decode_int_row, int_row, int_values, test_config, TestTablet};
use crate::model::{diff_rows, ExpectedRow, TabletModel};
use rand::Rng;
use serde::Serialize;
use std::fmt;
use tablet_core::{
    CompactionKind, Row, RowKey, RowOp, ScanSpec, Schema, TabletConfig, TabletError, Timestamp,
    Values,
};

/// Keys a generated case draws from. Two keys force every operation onto
/// the same few rows.
pub const DEFAULT_KEYSPACE: usize = 2;

/// The operations of a fuzz case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TestOpKind {
    /// Insert a row with a value.
    Insert,
    /// Insert a row with only its key.
    InsertPkOnly,
    /// Upsert a row with a value.
    Upsert,
    /// Upsert a row with only its key.
    UpsertPkOnly,
    /// Update the value of a live row.
    Update,
    /// Delete a live row.
    Delete,
    /// Write the buffered mutations as one batch.
    FlushOps,
    /// Flush the mutable store.
    FlushTablet,
    /// Flush the largest DMS.
    FlushDeltas,
    /// Merge the REDO stores of one row set.
    MinorCompactDeltas,
    /// Fold REDO history into a base image.
    MajorCompactDeltas,
    /// Merge overlapping row sets.
    CompactTablet,
    /// Close and recover the tablet.
    Restart,
    /// Scan at the timestamp in [`TestOp::val`] and check the result.
    ScanAtTimestamp,
}

impl TestOpKind {
    /// Returns true for operations that are buffered into a batch.
    #[must_use]
    pub fn is_mutation(self) -> bool {
        matches!(
            self,
            Self::Insert
                | Self::InsertPkOnly
                | Self::Upsert
                | Self::UpsertPkOnly
                | Self::Update
                | Self::Delete
        )
    }
}

/// Which operations a generated case may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpSet {
    /// Every operation.
    All,
    /// Operations that need no value column.
    PkOnly,
}

impl OpSet {
    /// Returns the operations in the set.
    #[must_use]
    pub fn kinds(self) -> &'static [TestOpKind] {
        use TestOpKind::*;
        match self {
            Self::All => &[
                Insert,
                InsertPkOnly,
                Upsert,
                UpsertPkOnly,
                Update,
                Delete,
                FlushOps,
                FlushTablet,
                FlushDeltas,
                MinorCompactDeltas,
                MajorCompactDeltas,
                CompactTablet,
                Restart,
                ScanAtTimestamp,
            ],
            Self::PkOnly => &[
                InsertPkOnly,
                UpsertPkOnly,
                Delete,
                FlushOps,
                FlushTablet,
                FlushDeltas,
                MinorCompactDeltas,
                MajorCompactDeltas,
                CompactTablet,
                Restart,
                ScanAtTimestamp,
            ],
        }
    }
}

/// One step of a fuzz case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TestOp {
    /// What to do.
    pub kind: TestOpKind,
    /// Row key for mutations, timestamp for scans, otherwise unused.
    pub val: u64,
}

/// Shorthand for building a [`TestOp`].
#[must_use]
pub fn op(kind: TestOpKind, val: u64) -> TestOp {
    TestOp { kind, val }
}

impl fmt::Display for TestOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{:?}, {}}}", self.kind, self.val)
    }
}

/// Formats a case so it can be pasted back into a regression test.
#[must_use]
pub fn dump_test_case(ops: &[TestOp]) -> String {
    ops.iter()
        .map(|op| format!("op({:?}, {})", op.kind, op.val))
        .collect::<Vec<_>>()
        .join(",\n")
}

/// Checks that a case never inserts a live key or touches an absent one.
///
/// # Errors
///
/// Returns a description of the first invalid step.
pub fn validate_test_case(ops: &[TestOp]) -> Result<(), String> {
    let mut live = std::collections::BTreeSet::new();
    for (step, op) in ops.iter().enumerate() {
        let ok = match op.kind {
            TestOpKind::Insert | TestOpKind::InsertPkOnly => live.insert(op.val),
            TestOpKind::Upsert | TestOpKind::UpsertPkOnly => {
                live.insert(op.val);
                true
            }
            TestOpKind::Update => live.contains(&op.val),
            TestOpKind::Delete => live.remove(&op.val),
            _ => true,
        };
        if !ok {
            return Err(format!("invalid case: step {step} {op}"));
        }
    }
    Ok(())
}

/// Assembles a valid case one offered operation at a time.
///
/// Operations that would be invalid or pointless at their position are
/// dropped; maintenance operations are only kept when the store they work
/// on has something in it, and a pending batch is written first.
#[derive(Debug, Clone)]
pub struct CaseBuilder {
    exists: Vec<bool>,
    op_timestamps: u64,
    ops_pending: bool,
    data_in_mrs: bool,
    data_in_dms: bool,
    worth_compacting: bool,
    ops: Vec<TestOp>,
}

impl CaseBuilder {
    /// Creates a builder over keys `0..keyspace`.
    #[must_use]
    pub fn new(keyspace: usize) -> Self {
        Self {
            exists: vec![false; keyspace.max(1)],
            op_timestamps: 0,
            ops_pending: false,
            data_in_mrs: false,
            data_in_dms: false,
            worth_compacting: false,
            ops: Vec::new(),
        }
    }

    /// Returns the number of operations accepted so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Returns true if nothing was accepted yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    fn write_pending(&mut self) {
        if self.ops_pending {
            self.ops.push(op(TestOpKind::FlushOps, 0));
            self.ops_pending = false;
            self.op_timestamps += 1;
        }
    }

    /// Offers an operation on `key`. `pick` chooses the scan timestamp.
    /// Returns true if anything was appended.
    pub fn offer(&mut self, kind: TestOpKind, key: usize, pick: u64) -> bool {
        use TestOpKind::*;
        let key = key % self.exists.len();
        let before = self.ops.len();
        match kind {
            Insert | InsertPkOnly => {
                if !self.exists[key] {
                    self.ops.push(op(kind, key as u64));
                    self.exists[key] = true;
                    self.ops_pending = true;
                    self.data_in_mrs = true;
                }
            }
            Upsert | UpsertPkOnly => {
                self.ops.push(op(kind, key as u64));
                if !self.exists[key] {
                    self.data_in_mrs = true;
                } else if !self.data_in_mrs {
                    self.data_in_dms = true;
                }
                self.exists[key] = true;
                self.ops_pending = true;
            }
            Update | Delete => {
                if self.exists[key] {
                    self.ops.push(op(kind, key as u64));
                    self.ops_pending = true;
                    if kind == Delete {
                        self.exists[key] = false;
                    }
                    if !self.data_in_mrs {
                        self.data_in_dms = true;
                    }
                }
            }
            FlushOps => self.write_pending(),
            FlushTablet => {
                if self.data_in_mrs {
                    self.write_pending();
                    self.ops.push(op(FlushTablet, 0));
                    self.data_in_mrs = false;
                    self.worth_compacting = true;
                }
            }
            CompactTablet => {
                if self.worth_compacting {
                    self.write_pending();
                    self.ops.push(op(CompactTablet, 0));
                    self.worth_compacting = false;
                }
            }
            FlushDeltas => {
                if self.data_in_dms {
                    self.write_pending();
                    self.ops.push(op(FlushDeltas, 0));
                    self.data_in_dms = false;
                }
            }
            MinorCompactDeltas | MajorCompactDeltas | Restart => self.ops.push(op(kind, 0)),
            ScanAtTimestamp => {
                let ts = if self.op_timestamps > 0 {
                    pick % self.op_timestamps + 1
                } else {
                    1
                };
                self.ops.push(op(ScanAtTimestamp, ts));
            }
        }
        self.ops.len() > before
    }

    /// Returns the case, with any buffered mutations written at the end.
    #[must_use]
    pub fn finish(mut self) -> Vec<TestOp> {
        self.write_pending();
        self.ops
    }
}

/// Generates a valid case of at least `len` operations.
pub fn generate_test_case<R: Rng + ?Sized>(
    rng: &mut R,
    len: usize,
    set: OpSet,
    keyspace: usize,
) -> Vec<TestOp> {
    let kinds = set.kinds();
    let mut builder = CaseBuilder::new(keyspace);
    while builder.len() < len {
        let kind = kinds[rng.gen_range(0..kinds.len())];
        let key = rng.gen_range(0..keyspace.max(1));
        builder.offer(kind, key, rng.gen());
    }
    builder.finish()
}

/// A fuzz case failure.
#[derive(Debug, thiserror::Error)]
pub enum FuzzError {
    /// The tablet returned an error.
    #[error("step {step} {op}: {source}")]
    Tablet {
        /// Index of the failing operation.
        step: usize,
        /// The failing operation.
        op: TestOp,
        /// The tablet error.
        source: TabletError,
    },
    /// The tablet disagreed with the model.
    #[error("step {step} {op}: {detail}")]
    Mismatch {
        /// Index of the failing operation.
        step: usize,
        /// The failing operation.
        op: TestOp,
        /// What differed.
        detail: String,
    },
    /// The case itself was invalid.
    #[error("{0}")]
    InvalidCase(String),
}

/// Counts of what a case did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FuzzReport {
    /// Operations run.
    pub steps: usize,
    /// Batches written.
    pub batches: usize,
    /// Flushes and delta flushes that produced something.
    pub flushes: usize,
    /// Delta and row-set compactions that did something.
    pub compactions: usize,
    /// Restarts.
    pub restarts: usize,
    /// Snapshots checked, including the final sweep.
    pub snapshots_checked: usize,
    /// Snapshots correctly refused because they fell below the ancient
    /// history mark.
    pub snapshots_too_old: usize,
}

/// Runs fuzz cases against one tablet and a reference model.
pub struct FuzzDriver {
    tablet: TestTablet,
    model: TabletModel,
    pending: Vec<RowOp>,
    has_values: bool,
    next_value: i64,
    update_multiplier: usize,
    report: FuzzReport,
}

impl FuzzDriver {
    /// Creates a driver over a fresh tablet.
    ///
    /// # Errors
    ///
    /// Returns the tablet creation error.
    pub fn new(schema: Schema, config: TabletConfig) -> Result<Self, TabletError> {
        let has_values = !schema.is_pk_only();
        Ok(Self {
            tablet: TestTablet::create(schema, config)?,
            model: TabletModel::new(),
            pending: Vec::new(),
            has_values,
            next_value: 0,
            update_multiplier: 1,
            report: FuzzReport::default(),
        })
    }

    /// Repeats every update `n` times inside its batch.
    #[must_use]
    pub fn with_update_multiplier(mut self, n: usize) -> Self {
        self.update_multiplier = n.max(1);
        self
    }

    /// Returns the tablet under test.
    #[must_use]
    pub fn tablet(&self) -> &TestTablet {
        &self.tablet
    }

    /// Returns the reference model.
    #[must_use]
    pub fn model(&self) -> &TabletModel {
        &self.model
    }

    /// Runs `ops`, then checks every saved snapshot and the tablet's
    /// internal consistency.
    ///
    /// # Errors
    ///
    /// Returns the first failure.
    pub fn run(&mut self, ops: &[TestOp]) -> Result<FuzzReport, FuzzError> {
        validate_test_case(ops).map_err(FuzzError::InvalidCase)?;
        tracing::debug!(case = %dump_test_case(ops), "running fuzz case");
        for (step, op) in ops.iter().enumerate() {
            self.step(step, *op)?;
        }
        let last = op(TestOpKind::ScanAtTimestamp, 0);
        let timestamps: Vec<Timestamp> = self.model.saved_timestamps().collect();
        for ts in timestamps {
            self.check_scan(ops.len(), last, ts)?;
        }
        self.tablet
            .verify()
            .map_err(|source| FuzzError::Tablet {
                step: ops.len(),
                op: last,
                source,
            })?;
        Ok(self.report.clone())
    }

    fn value(&mut self) -> Option<i64> {
        let v = self.next_value;
        self.next_value += 1;
        (v & 1 == 0).then_some(v)
    }

    fn step(&mut self, step: usize, op: TestOp) -> Result<(), FuzzError> {
        use TestOpKind::*;
        self.report.steps += 1;
        let tablet_err = |source| FuzzError::Tablet { step, op, source };
        let key = op.val as i64;

        if op.kind.is_mutation() {
            let found = self
                .tablet
                .get(&RowKey::int(key), None)
                .map_err(tablet_err)?
                .map(|row| self.expected(&row));
            let expected = self.model.current(key);
            if found != expected {
                return Err(FuzzError::Mismatch {
                    step,
                    op,
                    detail: format!("read {found:?}, expected {expected:?}"),
                });
            }
        }

        match op.kind {
            Insert | Upsert => {
                let (val, row) = if self.has_values {
                    let val = self.value();
                    (val, int_row(key, val))
                } else {
                    (None, Row::new(RowKey::int(key), Values::new()))
                };
                self.model.put(key, val);
                self.pending.push(if op.kind == Insert {
                    RowOp::Insert(row)
                } else {
                    RowOp::Upsert(row)
                });
            }
            InsertPkOnly => {
                self.model.put(key, None);
                self.pending.push(RowOp::InsertPkOnly(RowKey::int(key)));
            }
            UpsertPkOnly => {
                self.model.put_pk_only(key);
                self.pending.push(RowOp::UpsertPkOnly(RowKey::int(key)));
            }
            Update => {
                for _ in 0..self.update_multiplier {
                    let val = self.value();
                    self.model.put(key, val);
                    self.pending.push(RowOp::Update {
                        key: RowKey::int(key),
                        values: int_values(val),
                    });
                }
            }
            Delete => {
                self.model.delete(key);
                self.pending.push(RowOp::Delete(RowKey::int(key)));
            }
            FlushOps => {
                let ops = std::mem::take(&mut self.pending);
                let ts = if ops.is_empty() {
                    self.tablet.now()
                } else {
                    let outcome = self.tablet.write(ops).map_err(tablet_err)?;
                    if let Some(err) = outcome.first_error() {
                        return Err(FuzzError::Mismatch {
                            step,
                            op,
                            detail: format!("batch rejected an operation: {err}"),
                        });
                    }
                    self.report.batches += 1;
                    outcome.timestamp
                };
                self.model.commit(ts);
            }
            FlushTablet => {
                if self.tablet.flush().map_err(tablet_err)?.is_some() {
                    self.report.flushes += 1;
                }
            }
            FlushDeltas => {
                if self.tablet.flush_deltas().map_err(tablet_err)?.is_some() {
                    self.report.flushes += 1;
                }
            }
            MinorCompactDeltas | MajorCompactDeltas => {
                let kind = if op.kind == MinorCompactDeltas {
                    CompactionKind::Minor
                } else {
                    CompactionKind::Major
                };
                if self.tablet.compact_deltas(kind).map_err(tablet_err)?.is_some() {
                    self.report.compactions += 1;
                }
            }
            CompactTablet => {
                if self.tablet.compact().map_err(tablet_err)? > 0 {
                    self.report.compactions += 1;
                }
            }
            Restart => {
                self.tablet.restart().map_err(tablet_err)?;
                self.report.restarts += 1;
            }
            ScanAtTimestamp => {
                let ts = Timestamp(op.val).min(self.tablet.now());
                self.check_scan(step, op, ts)?;
            }
        }
        Ok(())
    }

    fn expected(&self, row: &Row) -> ExpectedRow {
        let (key, val) = decode_int_row(row);
        if self.has_values {
            ExpectedRow::new(key, val)
        } else {
            ExpectedRow::new(key, None)
        }
    }

    /// Scans at `ts` and compares with the model. A snapshot below the
    /// ancient history mark must be refused instead.
    fn check_scan(&mut self, step: usize, op: TestOp, ts: Timestamp) -> Result<(), FuzzError> {
        let tablet_err = |source| FuzzError::Tablet { step, op, source };
        let mark = self.tablet.ancient_history_mark();
        let scanner = self.tablet.scan(ScanSpec::new().at(ts));
        if ts < mark {
            return match scanner {
                Err(TabletError::SnapshotTooOld { .. }) => {
                    self.report.snapshots_too_old += 1;
                    Ok(())
                }
                Err(source) => Err(tablet_err(source)),
                Ok(_) => Err(FuzzError::Mismatch {
                    step,
                    op,
                    detail: format!("scan at {ts} below ancient history mark {mark} succeeded"),
                }),
            };
        }
        let mut found = Vec::new();
        for row in scanner.map_err(tablet_err)? {
            let row = row.map_err(tablet_err)?;
            found.push(self.expected(&row));
        }
        self.report.snapshots_checked += 1;
        match diff_rows(&self.model.expected_at(ts), &found) {
            None => Ok(()),
            Some(detail) => Err(FuzzError::Mismatch {
                step,
                op,
                detail: format!("scan at {ts}: {detail}"),
            }),
        }
    }
}

/// Runs one case against a fresh tablet with `schema`.
///
/// # Errors
///
/// Returns the first failure.
pub fn run_fuzz_case(
    schema: Schema,
    ops: &[TestOp],
    update_multiplier: usize,
) -> Result<FuzzReport, FuzzError> {
    run_fuzz_case_with_config(schema, test_config(), ops, update_multiplier)
}

/// Runs one case against a fresh tablet with `schema` and `config`.
///
/// # Errors
///
/// Returns the first failure.
pub fn run_fuzz_case_with_config(
    schema: Schema,
    config: TabletConfig,
    ops: &[TestOp],
    update_multiplier: usize,
) -> Result<FuzzReport, FuzzError> {
    let mut driver = FuzzDriver::new(schema, config)
        .map_err(|err| FuzzError::InvalidCase(format!("cannot create tablet: {err}")))?
        .with_update_multiplier(update_multiplier);
    driver.run(ops)
}
