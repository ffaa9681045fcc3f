//! MVCC clock.
//!
//! The clock hands out one timestamp per write batch and tracks which
//! timestamps are readable.
//!
//! ## Invariants
//!
//! - `next()` values are strictly increasing and never reused
//! - a batch's timestamp becomes visible to default-timestamp reads only
//!   after [`MvccClock::commit`], so a reader never sees half a batch
//! - the ancient history mark never moves backwards and never passes a
//!   pinned snapshot

use crate::error::{TabletError, TabletResult};
use crate::types::Timestamp;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Issues and tracks logical timestamps for one tablet.
///
/// The clock is an explicit object shared through an `Arc`; writers call
/// [`next`](Self::next) while holding the tablet's writer lock, so the
/// assignment order is the application order.
#[derive(Debug, Default)]
pub struct MvccClock {
    last_issued: AtomicU64,
    committed: AtomicU64,
    ancient_mark: AtomicU64,
    readers: Mutex<BTreeMap<Timestamp, usize>>,
}

impl MvccClock {
    /// Creates a clock for an empty tablet.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a clock that continues after `last`, the highest timestamp
    /// found in persisted state, with history below `ancient_mark` already
    /// unreadable.
    #[must_use]
    pub fn resume_from(last: Timestamp, ancient_mark: Timestamp) -> Self {
        Self {
            last_issued: AtomicU64::new(last.as_u64()),
            committed: AtomicU64::new(last.as_u64()),
            ancient_mark: AtomicU64::new(ancient_mark.min(last).as_u64()),
            ..Self::default()
        }
    }

    /// Issues the next timestamp.
    pub fn next(&self) -> Timestamp {
        Timestamp(self.last_issued.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// Marks every timestamp up to `ts` as fully applied.
    pub fn commit(&self, ts: Timestamp) {
        self.committed.fetch_max(ts.as_u64(), Ordering::SeqCst);
    }

    /// Returns the latest fully applied timestamp.
    #[must_use]
    pub fn now(&self) -> Timestamp {
        Timestamp(self.committed.load(Ordering::SeqCst))
    }

    /// Returns the last issued timestamp, applied or not.
    #[must_use]
    pub fn last_issued(&self) -> Timestamp {
        Timestamp(self.last_issued.load(Ordering::SeqCst))
    }

    /// Registers a reader at `ts`; the registration lasts as long as the pin.
    #[must_use]
    pub fn pin(self: &Arc<Self>, ts: Timestamp) -> SnapshotPin {
        *self.readers.lock().entry(ts).or_insert(0) += 1;
        SnapshotPin {
            clock: Arc::clone(self),
            ts,
        }
    }

    /// Returns the oldest timestamp held by an open reader.
    #[must_use]
    pub fn oldest_pinned(&self) -> Option<Timestamp> {
        self.readers.lock().keys().next().copied()
    }

    /// Returns the oldest timestamp that is still guaranteed readable.
    #[must_use]
    pub fn ancient_history_mark(&self) -> Timestamp {
        Timestamp(self.ancient_mark.load(Ordering::SeqCst))
    }

    /// Computes the history horizon a compaction may collect below.
    ///
    /// Returns `None` when history is kept forever. Otherwise the horizon is
    /// `now - retention`, lowered to the oldest pinned reader, and the
    /// readable mark is raised to it before the caller discards anything.
    pub fn advance_ancient_mark(&self, retention: Option<u64>) -> Option<Timestamp> {
        let window = retention?;
        let readers = self.readers.lock();
        let mut horizon = self.now().as_u64().saturating_sub(window);
        if let Some(oldest) = readers.keys().next() {
            horizon = horizon.min(oldest.as_u64());
        }
        self.ancient_mark.fetch_max(horizon, Ordering::SeqCst);
        Some(Timestamp(horizon))
    }

    /// Checks that `ts` is readable and pins it in one step, so a
    /// concurrent [`advance_ancient_mark`](Self::advance_ancient_mark)
    /// either sees the pin or rejects the read.
    ///
    /// # Errors
    ///
    /// Returns the errors of [`check_readable`](Self::check_readable).
    pub fn pin_readable(self: &Arc<Self>, ts: Timestamp) -> TabletResult<SnapshotPin> {
        let mut readers = self.readers.lock();
        self.check_readable(ts)?;
        *readers.entry(ts).or_insert(0) += 1;
        Ok(SnapshotPin {
            clock: Arc::clone(self),
            ts,
        })
    }

    /// Checks that a snapshot at `ts` can be served.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` for a timestamp that has not been applied
    /// yet and `SnapshotTooOld` below the ancient history mark.
    pub fn check_readable(&self, ts: Timestamp) -> TabletResult<()> {
        let now = self.now();
        if ts > now {
            return Err(TabletError::invalid_operation(format!(
                "snapshot {ts} is in the future (now {now})"
            )));
        }
        let mark = self.ancient_history_mark();
        if ts < mark {
            return Err(TabletError::SnapshotTooOld {
                requested: ts,
                mark,
            });
        }
        Ok(())
    }
}

/// Registration of an open reader. Dropping it releases the snapshot.
#[derive(Debug)]
pub struct SnapshotPin {
    clock: Arc<MvccClock>,
    ts: Timestamp,
}

impl SnapshotPin {
    /// Returns the pinned timestamp.
    #[must_use]
    pub fn timestamp(&self) -> Timestamp {
        self.ts
    }
}

impl Drop for SnapshotPin {
    fn drop(&mut self) {
        let mut readers = self.clock.readers.lock();
        if let Some(count) = readers.get_mut(&self.ts) {
            *count -= 1;
            if *count == 0 {
                readers.remove(&self.ts);
            }
        }
    }
}
