//! Tablet statistics.
//!
//! Two views are provided:
//!
//! - [`TabletMetrics`]: monotonically increasing operation counters,
//!   updated with relaxed atomics while the tablet runs;
//! - [`TabletStats`]: a point-in-time description of the stores, built on
//!   demand from the current component snapshot.
//!
//! ```rust,ignore
//! let stats = tablet.stats()?;
//! println!("{} rows in memory, {} row sets", stats.mrs_rows, stats.rowsets.len());
//! println!("flushes: {}", stats.metrics.flushes);
//! ```

use crate::diskrowset::DiskRowSet;
use crate::row::RowKey;
use crate::types::{MrsId, RowSetId, Timestamp};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Operation counters of a running tablet.
#[derive(Debug, Default)]
pub struct TabletMetrics {
    batches: AtomicU64,
    ops_applied: AtomicU64,
    ops_rejected: AtomicU64,
    scans: AtomicU64,
    flushes: AtomicU64,
    delta_flushes: AtomicU64,
    minor_compactions: AtomicU64,
    major_compactions: AtomicU64,
    rowset_compactions: AtomicU64,
}

impl TabletMetrics {
    /// Creates zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_batch(&self, applied: u64, rejected: u64) {
        self.batches.fetch_add(1, Ordering::Relaxed);
        self.ops_applied.fetch_add(applied, Ordering::Relaxed);
        self.ops_rejected.fetch_add(rejected, Ordering::Relaxed);
    }

    pub(crate) fn record_scan(&self) {
        self.scans.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_flush(&self) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_delta_flush(&self) {
        self.delta_flushes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_minor_compaction(&self) {
        self.minor_compactions.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_major_compaction(&self) {
        self.major_compactions.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rowset_compaction(&self) {
        self.rowset_compactions.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns a copy of every counter.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            batches: self.batches.load(Ordering::Relaxed),
            ops_applied: self.ops_applied.load(Ordering::Relaxed),
            ops_rejected: self.ops_rejected.load(Ordering::Relaxed),
            scans: self.scans.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            delta_flushes: self.delta_flushes.load(Ordering::Relaxed),
            minor_compactions: self.minor_compactions.load(Ordering::Relaxed),
            major_compactions: self.major_compactions.load(Ordering::Relaxed),
            rowset_compactions: self.rowset_compactions.load(Ordering::Relaxed),
        }
    }
}

/// Counter values at one instant. Counters restart at zero on every open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    /// Write batches logged, including those where every operation failed.
    pub batches: u64,
    /// Operations that succeeded.
    pub ops_applied: u64,
    /// Operations rejected with a per-operation error.
    pub ops_rejected: u64,
    /// Scanners opened.
    pub scans: u64,
    /// Mutable store flushes.
    pub flushes: u64,
    /// DMS flushes.
    pub delta_flushes: u64,
    /// Minor delta compactions.
    pub minor_compactions: u64,
    /// Major delta compactions.
    pub major_compactions: u64,
    /// Row-set compactions.
    pub rowset_compactions: u64,
}

/// Shape of one disk row set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RowSetStats {
    /// Row set id.
    pub id: RowSetId,
    /// Timestamp the base image reflects.
    pub created_ts: Timestamp,
    /// Smallest base key.
    pub min_key: Option<RowKey>,
    /// Largest base key.
    pub max_key: Option<RowKey>,
    /// Base image entries, ghosts included.
    pub base_rows: usize,
    /// Base entries absent at base time.
    pub ghost_rows: usize,
    /// UNDO records.
    pub undo_records: usize,
    /// Flushed REDO stores.
    pub redo_stores: usize,
    /// Records across flushed REDO stores.
    pub redo_records: usize,
    /// Mutations held in memory.
    pub dms_records: usize,
}

impl RowSetStats {
    pub(crate) fn of(drs: &DiskRowSet) -> Self {
        let rows = drs.base().rows();
        Self {
            id: drs.id(),
            created_ts: drs.created_ts(),
            min_key: drs.min_key().cloned(),
            max_key: drs.max_key().cloned(),
            base_rows: rows.len(),
            ghost_rows: rows.iter().filter(|r| r.values.is_none()).count(),
            undo_records: drs.undo().len(),
            redo_stores: drs.redos().len(),
            redo_records: drs.redo_record_count(),
            dms_records: drs.memory_delta_count(),
        }
    }
}

/// A point-in-time description of a tablet.
#[derive(Debug, Clone, Serialize)]
pub struct TabletStats {
    /// Newest readable timestamp.
    pub now: Timestamp,
    /// Oldest readable timestamp.
    pub ancient_history_mark: Timestamp,
    /// Id of the active mutable store.
    pub mrs_id: MrsId,
    /// Rows in the active mutable store, deleted ones included.
    pub mrs_rows: usize,
    /// Changes appended to active mutable store rows.
    pub mrs_changes: usize,
    /// Mutable stores frozen by a running flush.
    pub frozen_stores: usize,
    /// Disk row sets in id order.
    pub rowsets: Vec<RowSetStats>,
    /// WAL size in bytes.
    pub wal_bytes: u64,
    /// Whether a fatal error has stopped the tablet.
    pub poisoned: bool,
    /// Operation counters since open.
    pub metrics: MetricsSnapshot,
}

impl TabletStats {
    /// Returns the total number of base entries across disk row sets.
    #[must_use]
    pub fn disk_rows(&self) -> usize {
        self.rowsets.iter().map(|r| r.base_rows).sum()
    }

    /// Returns the total number of in-memory mutations across disk row sets.
    #[must_use]
    pub fn dms_records(&self) -> usize {
        self.rowsets.iter().map(|r| r.dms_records).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let metrics = TabletMetrics::new();
        metrics.record_batch(3, 1);
        metrics.record_batch(0, 2);
        metrics.record_flush();
        metrics.record_scan();

        let snap = metrics.snapshot();
        assert_eq!(snap.batches, 2);
        assert_eq!(snap.ops_applied, 3);
        assert_eq!(snap.ops_rejected, 3);
        assert_eq!(snap.flushes, 1);
        assert_eq!(snap.scans, 1);
        assert_eq!(snap.rowset_compactions, 0);
    }
}
