//! Crash recovery testing.
//!
//! A crash is simulated by closing a tablet and then damaging its
//! directory the way an interrupted process would leave it: a half-written
//! WAL record, a row set directory that never made it into the manifest,
//! or a temporary file from an interrupted atomic replace.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use tablet_testkit::crash::{run_crash_scenario, CrashPoint};
//!
//! let outcome = run_crash_scenario(&batches, 3, CrashPoint::TornWalTail { bytes: 5 })?;
//! assert!(outcome.batches_lost <= 1);
//! ```

use crate::fixtures::{decode_int_row, int_schema, test_config, TestTablet, VALUE_COLUMN};
use crate::model::{diff_rows, ExpectedRow, TabletModel};
use serde::Serialize;
use std::fs::{self, OpenOptions};
use std::io;
use std::path::Path;
use tablet_core::{RowKey, RowOp, ScanSpec, Timestamp, Value};

/// Ways a process can die and leave its directory behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrashPoint {
    /// Power loss while the last WAL record was being appended.
    TornWalTail {
        /// Bytes cut from the end of the log.
        bytes: u64,
    },
    /// A flush or compaction wrote a row set but never committed it.
    OrphanRowSet,
    /// An atomic manifest or log replace was interrupted before the rename.
    LeftoverTempFiles,
}

/// Cuts `bytes` off the end of the WAL. Returns the new length.
pub fn tear_wal_tail(dir: &Path, bytes: u64) -> io::Result<u64> {
    let file = OpenOptions::new().write(true).open(dir.join("wal.log"))?;
    let len = file.metadata()?.len().saturating_sub(bytes);
    file.set_len(len)?;
    file.sync_all()?;
    Ok(len)
}

/// Flips every bit of the byte at `offset` in `path`.
pub fn flip_byte(path: &Path, offset: usize) -> io::Result<()> {
    let mut data = fs::read(path)?;
    let byte = data.get_mut(offset).ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, "offset past end of file")
    })?;
    *byte ^= 0xFF;
    fs::write(path, data)
}

/// Damages `dir` as `point` describes.
pub fn simulate_crash(dir: &Path, point: CrashPoint) -> io::Result<()> {
    match point {
        CrashPoint::TornWalTail { bytes } => tear_wal_tail(dir, bytes).map(|_| ()),
        CrashPoint::OrphanRowSet => {
            let orphan = dir.join("rowsets").join("rs-999999");
            fs::create_dir_all(&orphan)?;
            fs::write(orphan.join("base-999999.dat"), b"TBAS partial")
        }
        CrashPoint::LeftoverTempFiles => {
            fs::write(dir.join("MANIFEST.tmp"), b"TMFT partial")?;
            fs::write(dir.join("wal.log.tmp"), b"TWAL partial")
        }
    }
}

/// What survived a simulated crash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CrashOutcome {
    /// Batches written before the crash.
    pub batches_written: usize,
    /// Batches whose effects are gone after recovery.
    pub batches_lost: usize,
    /// Entries recovery removed from the directory.
    pub orphans_removed: usize,
    /// Rows visible after recovery.
    pub rows: Vec<ExpectedRow>,
}

/// Writes `batches` into a fresh int tablet, flushing the mutable store
/// after every `flush_every` batches, crashes it at `point` and recovers.
///
/// The recovered tablet must show exactly the state after some prefix of
/// the batches, no older than the last flush, and every snapshot of that
/// prefix must still read back correctly.
///
/// # Errors
///
/// Returns a description of the first inconsistency.
pub fn run_crash_scenario(
    batches: &[Vec<RowOp>],
    flush_every: usize,
    point: CrashPoint,
) -> Result<CrashOutcome, String> {
    let fail = |what: &str, err: &dyn std::fmt::Display| format!("{what}: {err}");
    let mut tablet =
        TestTablet::create(int_schema(), test_config()).map_err(|e| fail("create", &e))?;
    let mut model = TabletModel::new();
    let mut committed = Vec::new();
    let mut durable = 0;

    for (i, batch) in batches.iter().enumerate() {
        let outcome = tablet.write(batch.clone()).map_err(|e| fail("write", &e))?;
        for (op, result) in batch.iter().zip(&outcome.results) {
            if result.is_ok() {
                apply_to_model(&mut model, op);
            }
        }
        model.commit(outcome.timestamp);
        committed.push(outcome.timestamp);
        if flush_every > 0 && (i + 1) % flush_every == 0 {
            tablet.flush().map_err(|e| fail("flush", &e))?;
            durable = committed.len();
        }
    }

    tablet
        .while_closed(|dir| simulate_crash(dir, point))
        .map_err(|e| fail("recover", &e))?;

    let rows = scan_rows(&tablet, None)?;
    let survived = (0..=committed.len())
        .rev()
        .find(|&n| {
            let expected = match n {
                0 => Vec::new(),
                n => model.expected_at(committed[n - 1]),
            };
            expected == rows
        })
        .ok_or_else(|| format!("recovered state matches no committed prefix: {rows:?}"))?;
    if survived < durable {
        return Err(format!("lost flushed batches: {survived} of {durable} survived"));
    }
    for &ts in &committed[..survived] {
        let found = scan_rows(&tablet, Some(ts.min(tablet.now())))?;
        if let Some(diff) = diff_rows(&model.expected_at(ts), &found) {
            return Err(format!("snapshot {ts} after recovery: {diff}"));
        }
    }

    Ok(CrashOutcome {
        batches_written: committed.len(),
        batches_lost: committed.len() - survived,
        orphans_removed: tablet.recovery_report().orphans_removed,
        rows,
    })
}

fn int_key(key: &RowKey) -> i64 {
    key.columns().first().and_then(Value::as_int).unwrap_or_default()
}

fn apply_to_model(model: &mut TabletModel, op: &RowOp) {
    match op {
        RowOp::Insert(row) | RowOp::Upsert(row) => {
            let (k, v) = decode_int_row(row);
            model.put(k, v);
        }
        RowOp::InsertPkOnly(k) => model.put(int_key(k), None),
        RowOp::UpsertPkOnly(k) => model.put_pk_only(int_key(k)),
        RowOp::Update { key: k, values } => {
            let v = values.get(VALUE_COLUMN).and_then(Value::as_int);
            model.put(int_key(k), v);
        }
        RowOp::Delete(k) => model.delete(int_key(k)),
    }
}

fn scan_rows(tablet: &TestTablet, ts: Option<Timestamp>) -> Result<Vec<ExpectedRow>, String> {
    let mut spec = ScanSpec::new();
    if let Some(ts) = ts {
        spec = spec.at(ts);
    }
    let scanner = tablet.scan(spec).map_err(|e| format!("scan: {e}"))?;
    scanner
        .map(|row| {
            row.map(|row| {
                let (key, val) = decode_int_row(&row);
                ExpectedRow::new(key, val)
            })
            .map_err(|e| format!("scan: {e}"))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::int_row;

    fn batches() -> Vec<Vec<RowOp>> {
        (0..6)
            .map(|i| {
                vec![
                    RowOp::Upsert(int_row(i % 3, Some(i))),
                    RowOp::Insert(int_row(10 + i, None)),
                ]
            })
            .collect()
    }

    #[test]
    fn torn_tail_loses_at_most_the_last_batch() {
        let outcome =
            run_crash_scenario(&batches(), 4, CrashPoint::TornWalTail { bytes: 3 }).unwrap();
        assert_eq!(outcome.batches_written, 6);
        assert_eq!(outcome.batches_lost, 1);
    }

    #[test]
    fn orphans_are_removed() {
        let outcome = run_crash_scenario(&batches(), 2, CrashPoint::OrphanRowSet).unwrap();
        assert_eq!(outcome.batches_lost, 0);
        assert_eq!(outcome.orphans_removed, 1);

        let outcome = run_crash_scenario(&batches(), 0, CrashPoint::LeftoverTempFiles).unwrap();
        assert_eq!(outcome.batches_lost, 0);
        assert_eq!(outcome.orphans_removed, 2);
    }
}
