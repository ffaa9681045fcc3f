//! Background maintenance.
//!
//! A [`MaintenanceManager`] owns one named thread that wakes every
//! interval and runs a [`maintenance pass`](run_pass): flush the mutable
//! store once it holds enough rows, flush the largest DMS once it holds
//! enough records, then the delta and row-set compactions that have
//! anything to do.
//!
//! ## Invariants
//!
//! - every step goes through the same entry points as the public API, so
//!   the maintenance lock keeps at most one of them running
//! - the thread exits on its own once the tablet is poisoned
//! - dropping the manager stops and joins the thread before the tablet's
//!   shared state can be released

use crate::error::TabletResult;
use crate::tablet::TabletShared;
use crate::types::RowSetId;
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// What one maintenance pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MaintenanceReport {
    /// Row set produced by a flush of the mutable store.
    pub flushed: Option<RowSetId>,
    /// Row set whose DMS was flushed.
    pub deltas_flushed: Option<RowSetId>,
    /// Row set whose REDO stores were merged.
    pub minor_compacted: Option<RowSetId>,
    /// Row set whose REDO history was folded into its base.
    pub major_compacted: Option<RowSetId>,
    /// Row sets retired by row-set compaction.
    pub rowsets_compacted: usize,
}

impl MaintenanceReport {
    /// Returns true if the pass changed nothing.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        *self == Self::default()
    }
}

/// Runs every maintenance step whose threshold is crossed.
///
/// # Errors
///
/// Returns the first step error; later steps are skipped.
pub(crate) fn run_pass(shared: &TabletShared) -> TabletResult<MaintenanceReport> {
    let mut report = MaintenanceReport::default();
    let current = shared.current();

    if current.mrs.len() >= shared.config.flush_threshold_rows.max(1) {
        report.flushed = shared.flush()?;
    }
    let threshold = shared.config.delta_flush_threshold.max(1);
    if current.disk_rowsets().any(|drs| drs.dms().len() >= threshold) {
        report.deltas_flushed = shared.flush_deltas()?;
    }
    report.minor_compacted = shared.minor_compact_deltas()?;
    if shared
        .current()
        .disk_rowsets()
        .any(|drs| drs.redo_record_count() > 0)
    {
        report.major_compacted = shared.major_compact_deltas(None)?;
    }
    report.rowsets_compacted = shared.compact_rowsets()?;
    Ok(report)
}

#[derive(Debug, Default)]
struct StopSignal {
    stopped: Mutex<bool>,
    wake: Condvar,
}

/// Periodic maintenance thread of one tablet.
#[derive(Debug)]
pub struct MaintenanceManager {
    signal: Arc<StopSignal>,
    passes: Arc<AtomicU64>,
    handle: Option<JoinHandle<()>>,
}

impl MaintenanceManager {
    /// Spawns the maintenance thread.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the thread cannot be spawned.
    pub(crate) fn start(shared: Arc<TabletShared>, interval: Duration) -> TabletResult<Self> {
        let signal = Arc::new(StopSignal::default());
        let passes = Arc::new(AtomicU64::new(0));
        let handle = {
            let signal = Arc::clone(&signal);
            let passes = Arc::clone(&passes);
            thread::Builder::new()
                .name("tablet-maintenance".to_string())
                .spawn(move || maintenance_loop(&shared, &signal, &passes, interval))?
        };
        tracing::debug!(interval_ms = interval.as_millis() as u64, "maintenance started");
        Ok(Self {
            signal,
            passes,
            handle: Some(handle),
        })
    }

    /// Returns the number of completed passes.
    #[must_use]
    pub fn passes(&self) -> u64 {
        self.passes.load(Ordering::Relaxed)
    }

    fn stop(&mut self) {
        *self.signal.stopped.lock() = true;
        self.signal.wake.notify_all();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("maintenance thread panicked");
            }
        }
    }
}

impl Drop for MaintenanceManager {
    fn drop(&mut self) {
        self.stop();
    }
}

fn maintenance_loop(
    shared: &TabletShared,
    signal: &StopSignal,
    passes: &AtomicU64,
    interval: Duration,
) {
    loop {
        {
            let mut stopped = signal.stopped.lock();
            if !*stopped {
                signal.wake.wait_for(&mut stopped, interval);
            }
            if *stopped {
                return;
            }
        }
        if shared.is_poisoned() {
            tracing::error!("tablet poisoned, maintenance stopped");
            return;
        }
        match run_pass(shared) {
            Ok(report) if !report.is_idle() => {
                tracing::info!(?report, "maintenance pass");
            }
            Ok(_) => {}
            Err(err) => tracing::warn!(error = %err, "maintenance pass failed"),
        }
        passes.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TabletConfig;
    use crate::row::{Row, RowKey, RowOp, Schema, Value};
    use crate::scan::ScanSpec;
    use crate::tablet::Tablet;
    use std::time::Instant;
    use tempfile::tempdir;

    fn schema() -> Schema {
        Schema::new(["key"], ["val"]).unwrap()
    }

    fn insert(k: i64) -> RowOp {
        RowOp::Insert(Row::new(
            RowKey::int(k),
            [("val".to_string(), Value::Int(k))].into_iter().collect(),
        ))
    }

    #[test]
    fn pass_respects_thresholds() {
        let dir = tempdir().unwrap();
        let config = TabletConfig::default()
            .sync_on_commit(false)
            .flush_threshold_rows(3);
        let tablet = Tablet::create(dir.path(), schema(), config).unwrap();
        tablet.apply(insert(1)).unwrap();
        assert!(tablet.run_maintenance().unwrap().is_idle());

        tablet.apply(insert(2)).unwrap();
        tablet.apply(insert(3)).unwrap();
        let report = tablet.run_maintenance().unwrap();
        assert!(report.flushed.is_some());
        assert_eq!(tablet.stats().unwrap().mrs_rows, 0);
        assert!(tablet.run_maintenance().unwrap().is_idle());
    }

    #[test]
    fn background_thread_flushes_and_stops() {
        let dir = tempdir().unwrap();
        let config = TabletConfig::default()
            .sync_on_commit(false)
            .flush_threshold_rows(10)
            .maintenance_interval(Some(Duration::from_millis(5)));
        let tablet = Tablet::create(dir.path(), schema(), config).unwrap();
        let outcome = tablet.write((0..25).map(insert).collect()).unwrap();
        assert!(outcome.is_success());

        let deadline = Instant::now() + Duration::from_secs(10);
        let busy = |t: &Tablet| {
            t.stats().unwrap().mrs_rows > 0 || t.maintenance_passes() == Some(0)
        };
        while busy(&tablet) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(tablet.stats().unwrap().mrs_rows, 0);
        assert!(tablet.maintenance_passes().unwrap() > 0);
        assert_eq!(tablet.scan(ScanSpec::new()).unwrap().count(), 25);

        let tablet = tablet.restart().unwrap();
        assert_eq!(tablet.scan(ScanSpec::new()).unwrap().count(), 25);
    }

    #[test]
    fn no_thread_without_interval() {
        let dir = tempdir().unwrap();
        let config = TabletConfig::default().sync_on_commit(false);
        let tablet = Tablet::create(dir.path(), schema(), config).unwrap();
        assert_eq!(tablet.maintenance_passes(), None);
    }
}
