//! Tablet facade and write path.
//!
//! A [`Tablet`] owns one tablet directory: the active mutable store, the
//! disk row sets, the WAL and the manifest. Writes are applied in batches
//! that each get one timestamp; reads are snapshot scans at any readable
//! timestamp.
//!
//! ## Invariants
//!
//! - batches, maintenance installs and WAL rewrites are serialized by the
//!   writer lock, so timestamp order is application order
//! - a batch becomes visible only after its WAL record is written
//! - at most one maintenance operation runs at a time; its lock is always
//!   taken before the writer lock
//! - component sets are immutable snapshots swapped whole, so a scan never
//!   sees a half-installed flush or compaction
//! - after a fatal error every write and maintenance call fails with
//!   `TabletPoisoned` until the tablet is restarted

use crate::clock::MvccClock;
use crate::config::TabletConfig;
use crate::diskrowset::DiskRowSet;
use crate::dir::TabletDir;
use crate::error::{TabletError, TabletResult};
use crate::maintenance::{run_pass, MaintenanceManager, MaintenanceReport};
use crate::manifest::Manifest;
use crate::memrowset::MemRowSet;
use crate::mutation::{plan, Effect};
use crate::recovery::{recover, retain_non_durable, RecoveredTablet, RecoveryReport};
use crate::row::{Row, RowChange, RowKey, RowOp, Schema, Values};
use crate::rowset::{Components, RowSet};
use crate::scan::{ScanSpec, Scanner};
use crate::stats::{RowSetStats, TabletMetrics, TabletStats};
use crate::types::{RowSetId, Timestamp};
use crate::wal::{LoggedOp, OpTarget, WalBatch, WalWriter};
use parking_lot::{Mutex, RwLock};
use std::ops::Bound;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Which delta compaction to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactionKind {
    /// Merge REDO stores of one row set into one.
    Minor,
    /// Fold REDO history into a rewritten base image.
    Major,
}

/// Result of a write batch.
#[derive(Debug)]
pub struct WriteOutcome {
    /// Timestamp every effect of the batch carries.
    pub timestamp: Timestamp,
    /// One result per submitted operation, in submission order.
    pub results: Vec<TabletResult<()>>,
}

impl WriteOutcome {
    /// Returns true if every operation succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.results.iter().all(Result::is_ok)
    }

    /// Returns the first per-operation error, if any.
    #[must_use]
    pub fn first_error(&self) -> Option<&TabletError> {
        self.results.iter().find_map(|r| r.as_ref().err())
    }
}

/// State guarded by the writer lock.
#[derive(Debug)]
pub(crate) struct WriterState {
    pub(crate) wal: WalWriter,
    pub(crate) manifest: Manifest,
}

/// Everything the facade and the maintenance thread share.
#[derive(Debug)]
pub(crate) struct TabletShared {
    pub(crate) dir: TabletDir,
    pub(crate) config: TabletConfig,
    pub(crate) schema: Schema,
    pub(crate) clock: Arc<MvccClock>,
    pub(crate) components: RwLock<Arc<Components>>,
    pub(crate) writer: Mutex<WriterState>,
    pub(crate) maintenance_lock: Mutex<()>,
    pub(crate) metrics: TabletMetrics,
    poisoned: AtomicBool,
}

/// A single-node MVCC tablet.
///
/// # Opening a Tablet
///
/// ```rust,ignore
/// use tablet_core::{RowOp, Row, RowKey, Schema, Tablet, TabletConfig};
///
/// let schema = Schema::new(["key"], ["val"])?;
/// let tablet = Tablet::open_or_create(path, schema, TabletConfig::default())?;
///
/// let outcome = tablet.write(vec![RowOp::Insert(row)])?;
/// for row in tablet.scan(ScanSpec::new().at(outcome.timestamp))? {
///     println!("{:?}", row?);
/// }
/// ```
#[derive(Debug)]
pub struct Tablet {
    shared: Arc<TabletShared>,
    report: RecoveryReport,
    maintenance: Option<MaintenanceManager>,
}

impl Tablet {
    /// Creates a new tablet at `path`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` if a tablet already exists there,
    /// `TabletLocked` if another process holds the directory, or an I/O
    /// error.
    pub fn create(path: &Path, schema: Schema, config: TabletConfig) -> TabletResult<Self> {
        let dir = TabletDir::open(path, true)?;
        if !dir.is_new_tablet() {
            return Err(TabletError::invalid_operation(format!(
                "a tablet already exists at {}",
                path.display()
            )));
        }
        Self::start(recover(dir, &config, Some(schema))?, config)
    }

    /// Opens an existing tablet and recovers it.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` if no tablet exists at `path`, or any
    /// recovery error.
    pub fn open(path: &Path, config: TabletConfig) -> TabletResult<Self> {
        let dir = TabletDir::open(path, false)?;
        Self::start(recover(dir, &config, None)?, config)
    }

    /// Opens the tablet at `path`, creating it with `schema` if it does not
    /// exist and `create_if_missing` is set.
    ///
    /// # Errors
    ///
    /// Returns `Validation` if an existing tablet has a different schema,
    /// or any recovery error.
    pub fn open_or_create(path: &Path, schema: Schema, config: TabletConfig) -> TabletResult<Self> {
        let dir = TabletDir::open(path, config.create_if_missing)?;
        if dir.is_new_tablet() && !config.create_if_missing {
            return Err(TabletError::invalid_operation(format!(
                "no tablet at {} and create_if_missing is false",
                path.display()
            )));
        }
        Self::start(recover(dir, &config, Some(schema))?, config)
    }

    fn start(recovered: RecoveredTablet, config: TabletConfig) -> TabletResult<Self> {
        let RecoveredTablet {
            dir,
            manifest,
            components,
            wal,
            clock,
            report,
        } = recovered;
        let interval = config.maintenance_interval;
        let shared = Arc::new(TabletShared {
            dir,
            schema: manifest.schema.clone(),
            config,
            clock: Arc::new(clock),
            components: RwLock::new(Arc::new(components)),
            writer: Mutex::new(WriterState { wal, manifest }),
            maintenance_lock: Mutex::new(()),
            metrics: TabletMetrics::new(),
            poisoned: AtomicBool::new(false),
        });
        let maintenance = interval
            .map(|every| MaintenanceManager::start(Arc::clone(&shared), every))
            .transpose()?;
        Ok(Self {
            shared,
            report,
            maintenance,
        })
    }

    /// Applies a batch of row operations under one timestamp.
    ///
    /// Operations are applied in order and see the effects of earlier ones
    /// in the same batch. A rejected operation is reported in
    /// [`WriteOutcome::results`] and does not stop the others.
    ///
    /// # Errors
    ///
    /// Returns an error only when the batch as a whole fails (poisoned
    /// tablet, WAL failure, corruption); nothing of the batch is then
    /// acknowledged.
    pub fn write(&self, ops: Vec<RowOp>) -> TabletResult<WriteOutcome> {
        self.shared.write(ops)
    }

    /// Applies one operation in its own batch and returns its timestamp.
    ///
    /// # Errors
    ///
    /// Returns the operation's own error if it was rejected.
    pub fn apply(&self, op: RowOp) -> TabletResult<Timestamp> {
        let mut outcome = self.write(vec![op])?;
        match outcome.results.pop() {
            Some(Err(err)) => Err(err),
            _ => Ok(outcome.timestamp),
        }
    }

    /// Opens a snapshot scan.
    ///
    /// # Errors
    ///
    /// Returns `SnapshotTooOld` or `InvalidOperation` for an unreadable
    /// timestamp and `Validation` for a malformed predicate or bound.
    pub fn scan(&self, spec: ScanSpec) -> TabletResult<Scanner> {
        self.shared.scan(spec)
    }

    /// Reads one key as of `ts` (default: now).
    ///
    /// # Errors
    ///
    /// Returns the errors of [`scan`](Self::scan).
    pub fn get(&self, key: &RowKey, ts: Option<Timestamp>) -> TabletResult<Option<Row>> {
        let mut spec =
            ScanSpec::new().range(Bound::Included(key.clone()), Bound::Included(key.clone()));
        if let Some(ts) = ts {
            spec = spec.at(ts);
        }
        self.scan(spec)?.next().transpose()
    }

    /// Flushes the active mutable store into a new disk row set.
    ///
    /// Returns the new row set, or `None` if the store was empty.
    ///
    /// # Errors
    ///
    /// Returns an error if the files cannot be written; the tablet is then
    /// poisoned and a restart replays the store from the WAL.
    pub fn flush(&self) -> TabletResult<Option<RowSetId>> {
        self.shared.flush()
    }

    /// Flushes the largest DMS into a REDO delta file.
    ///
    /// # Errors
    ///
    /// Returns the errors of [`flush`](Self::flush).
    pub fn flush_deltas(&self) -> TabletResult<Option<RowSetId>> {
        self.shared.flush_deltas()
    }

    /// Runs a delta compaction on the best candidate row set.
    ///
    /// Returns the compacted row set, or `None` if nothing was eligible.
    ///
    /// # Errors
    ///
    /// Returns an error if the compaction could not be made durable.
    pub fn compact_deltas(&self, kind: CompactionKind) -> TabletResult<Option<RowSetId>> {
        match kind {
            CompactionKind::Minor => self.shared.minor_compact_deltas(),
            CompactionKind::Major => self.shared.major_compact_deltas(None),
        }
    }

    /// Runs a major delta compaction that folds REDO records up to `ts`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` for a future timestamp, or the errors of
    /// [`compact_deltas`](Self::compact_deltas).
    pub fn major_compact_deltas_up_to(&self, ts: Timestamp) -> TabletResult<Option<RowSetId>> {
        self.shared.major_compact_deltas(Some(ts))
    }

    /// Merges every group of overlapping disk row sets.
    ///
    /// Returns the number of input row sets retired.
    ///
    /// # Errors
    ///
    /// Returns an error if the outputs could not be made durable.
    pub fn compact(&self) -> TabletResult<usize> {
        self.shared.compact_rowsets()
    }

    /// Runs one maintenance pass in the calling thread.
    ///
    /// # Errors
    ///
    /// Returns the first failing step's error.
    pub fn run_maintenance(&self) -> TabletResult<MaintenanceReport> {
        run_pass(&self.shared)
    }

    /// Closes the tablet and recovers it from disk.
    ///
    /// # Errors
    ///
    /// Returns any recovery error.
    pub fn restart(self) -> TabletResult<Self> {
        let path = self.shared.dir.path().to_path_buf();
        let config = self.shared.config.clone();
        drop(self);
        Self::open(&path, config)
    }

    /// Replays every stored history and a full scan, checking that the
    /// tablet is internally consistent. Returns the number of live rows.
    ///
    /// # Errors
    ///
    /// Returns a corruption error naming the first inconsistency.
    pub fn verify(&self) -> TabletResult<usize> {
        let components = self.shared.components.read().clone();
        for drs in components.disk_rowsets() {
            for index in 0..drs.base().len() {
                drs.history_at_index(index)?;
            }
        }
        let mut live = 0;
        for row in self.scan(ScanSpec::new())? {
            row?;
            live += 1;
        }
        Ok(live)
    }

    /// Describes the tablet's current stores.
    ///
    /// # Errors
    ///
    /// Returns an error if the WAL size cannot be read.
    pub fn stats(&self) -> TabletResult<TabletStats> {
        let shared = &self.shared;
        let wal_bytes = shared.writer.lock().wal.size()?;
        let components = shared.components.read().clone();
        Ok(TabletStats {
            now: shared.clock.now(),
            ancient_history_mark: shared.clock.ancient_history_mark(),
            mrs_id: components.mrs.id(),
            mrs_rows: components.mrs.len(),
            mrs_changes: components.mrs.change_count(),
            frozen_stores: components
                .rowsets
                .iter()
                .filter(|r| matches!(r, RowSet::Memory(_)))
                .count(),
            rowsets: components
                .disk_rowsets()
                .map(|drs| RowSetStats::of(drs))
                .collect(),
            wal_bytes,
            poisoned: shared.is_poisoned(),
            metrics: shared.metrics.snapshot(),
        })
    }

    /// Returns the newest readable timestamp.
    #[must_use]
    pub fn now(&self) -> Timestamp {
        self.shared.clock.now()
    }

    /// Returns the oldest readable timestamp.
    #[must_use]
    pub fn ancient_history_mark(&self) -> Timestamp {
        self.shared.clock.ancient_history_mark()
    }

    /// Returns the tablet schema.
    #[must_use]
    pub fn schema(&self) -> &Schema {
        &self.shared.schema
    }

    /// Returns the configuration the tablet was opened with.
    #[must_use]
    pub fn config(&self) -> &TabletConfig {
        &self.shared.config
    }

    /// Returns the tablet directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        self.shared.dir.path()
    }

    /// Returns what recovery did when the tablet was opened.
    #[must_use]
    pub fn recovery_report(&self) -> &RecoveryReport {
        &self.report
    }

    /// Returns true if a fatal error has stopped the tablet.
    #[must_use]
    pub fn is_poisoned(&self) -> bool {
        self.shared.is_poisoned()
    }

    /// Returns the number of maintenance passes the background thread has
    /// completed, or `None` when it is disabled.
    #[must_use]
    pub fn maintenance_passes(&self) -> Option<u64> {
        self.maintenance.as_ref().map(MaintenanceManager::passes)
    }
}

/// Where a key's live version is.
enum Live {
    Memory(Arc<MemRowSet>),
    Disk(Arc<DiskRowSet>),
}

impl TabletShared {
    pub(crate) fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::SeqCst)
    }

    pub(crate) fn check_poisoned(&self) -> TabletResult<()> {
        if self.is_poisoned() {
            return Err(TabletError::TabletPoisoned);
        }
        Ok(())
    }

    /// Stops the tablet and hands the error back.
    pub(crate) fn poison(&self, err: TabletError) -> TabletError {
        tracing::error!(error = %err, "tablet poisoned");
        self.poisoned.store(true, Ordering::SeqCst);
        err
    }

    /// Poisons the tablet if `err` is fatal.
    pub(crate) fn fail(&self, err: TabletError) -> TabletError {
        if err.is_fatal() {
            self.poison(err)
        } else {
            err
        }
    }

    /// Installs a new component snapshot.
    pub(crate) fn install(&self, components: Components) {
        *self.components.write() = Arc::new(components);
    }

    pub(crate) fn current(&self) -> Arc<Components> {
        self.components.read().clone()
    }

    fn write(&self, ops: Vec<RowOp>) -> TabletResult<WriteOutcome> {
        let mut writer = self.writer.lock();
        self.check_poisoned()?;
        let components = self.current();
        let ts = self.clock.next();

        let mut results = Vec::with_capacity(ops.len());
        let mut logged = Vec::new();
        for op in ops {
            match apply_op(&self.schema, &components, &op, ts) {
                Ok(target) => {
                    logged.push(LoggedOp { op, target });
                    results.push(Ok(()));
                }
                Err(err) if err.is_rejection() => results.push(Err(err)),
                Err(err) => return Err(self.poison(err)),
            }
        }

        let applied = logged.len() as u64;
        let rejected = results.len() as u64 - applied;
        if let Err(err) = writer.wal.append(&WalBatch { ts, ops: logged }) {
            return Err(self.poison(err));
        }
        self.clock.commit(ts);
        self.metrics.record_batch(applied, rejected);
        Ok(WriteOutcome {
            timestamp: ts,
            results,
        })
    }

    fn scan(&self, spec: ScanSpec) -> TabletResult<Scanner> {
        if let Some(predicate) = &spec.predicate {
            predicate.validate(&self.schema)?;
        }
        for bound in [&spec.lower, &spec.upper] {
            if let Bound::Included(key) | Bound::Excluded(key) = bound {
                self.schema.validate_key(key)?;
            }
        }
        let ts = spec.timestamp.unwrap_or_else(|| self.clock.now());
        let pin = self.clock.pin_readable(ts)?;
        let components = self.current();
        self.metrics.record_scan();
        Ok(Scanner::new(
            components,
            spec,
            pin,
            self.schema.clone(),
            self.config.scan_batch_size,
        ))
    }

    /// Rewrites the WAL so it only holds operations not yet durable in a
    /// flushed file.
    pub(crate) fn rewrite_wal(&self, writer: &mut WriterState) -> TabletResult<()> {
        let WriterState { wal, manifest } = writer;
        let retained = wal.rewrite(|batch| retain_non_durable(manifest, batch))?;
        tracing::debug!(batches = retained, "WAL rewritten");
        Ok(())
    }

    /// Commits `manifest` with the current clock position and ancient
    /// history mark, and adopts it.
    pub(crate) fn commit_manifest(
        &self,
        writer: &mut WriterState,
        mut manifest: Manifest,
    ) -> TabletResult<()> {
        manifest.last_timestamp = self.clock.now();
        manifest.ancient_history_mark = self.clock.ancient_history_mark();
        self.dir.save_manifest(&manifest)?;
        writer.manifest = manifest;
        Ok(())
    }
}

/// Finds the live version of `key`: active store first, then frozen
/// stores, then disk row sets.
fn find_live(components: &Components, key: &RowKey) -> TabletResult<Option<(Live, Values)>> {
    if let Some(values) = components.mrs.state_at(key, Timestamp::MAX)? {
        return Ok(Some((Live::Memory(Arc::clone(&components.mrs)), values)));
    }
    for set in &components.rowsets {
        match set {
            RowSet::Memory(mrs) => {
                if let Some(values) = mrs.state_at(key, Timestamp::MAX)? {
                    return Ok(Some((Live::Memory(Arc::clone(mrs)), values)));
                }
            }
            RowSet::Disk(drs) => {
                if !drs.may_contain(key) {
                    continue;
                }
                if let Some(values) = drs.state_at(key, Timestamp::MAX)? {
                    return Ok(Some((Live::Disk(Arc::clone(drs)), values)));
                }
            }
        }
    }
    Ok(None)
}

/// Applies one operation at `ts` and returns the store it changed.
fn apply_op(
    schema: &Schema,
    components: &Components,
    op: &RowOp,
    ts: Timestamp,
) -> TabletResult<OpTarget> {
    let key = op.key();
    let live = find_live(components, key)?;
    match plan(schema, op, live.as_ref().map(|(_, values)| values))? {
        Effect::Nothing => Ok(OpTarget::NoEffect),
        Effect::Insert(values) => insert_into(&components.mrs, key, ts, values),
        Effect::Mutate(change) => match live {
            Some((Live::Memory(mrs), _)) => {
                mrs.mutate(key, ts, change)?;
                Ok(OpTarget::Mrs(mrs.id()))
            }
            Some((Live::Disk(drs), _)) => {
                let dms = drs.dms();
                dms.append(key.clone(), ts, change);
                Ok(OpTarget::Drs {
                    rowset: drs.id(),
                    dms: dms.id(),
                })
            }
            None => Err(TabletError::corruption(format!(
                "mutation of {key} planned without a live version"
            ))),
        },
    }
}

/// Inserts a new version into the mutable store, as a reinsert if the
/// store still holds a deleted row for the key.
pub(crate) fn insert_into(
    mrs: &MemRowSet,
    key: &RowKey,
    ts: Timestamp,
    values: Values,
) -> TabletResult<OpTarget> {
    if mrs.contains(key) {
        mrs.mutate(key, ts, RowChange::Reinsert(values))?;
    } else {
        mrs.insert(key.clone(), ts, values)?;
    }
    Ok(OpTarget::Mrs(mrs.id()))
}
