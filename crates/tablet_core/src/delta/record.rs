//! Delta records and the ordering rule every delta sequence obeys.

use crate::error::{TabletError, TabletResult};
use crate::row::{RowChange, RowKey};
use crate::types::Timestamp;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Which way a delta store moves through time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum DeltaDirection {
    /// Walked backwards from the base image to reconstruct older versions.
    Undo = 1,
    /// Walked forwards from the base image to apply newer mutations.
    Redo = 2,
}

impl DeltaDirection {
    /// Converts a byte to a direction.
    #[must_use]
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Undo),
            2 => Some(Self::Redo),
            _ => None,
        }
    }

    /// Converts the direction to a byte.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for DeltaDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Undo => write!(f, "UNDO"),
            Self::Redo => write!(f, "REDO"),
        }
    }
}

/// One change to one key at one timestamp.
///
/// For a REDO record the change is applied when reading at or after `ts`.
/// For an UNDO record the change reverts what happened at `ts` and is
/// applied when reading strictly before `ts`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeltaRecord {
    /// Row key.
    pub key: RowKey,
    /// Timestamp of the batch that made the original change.
    pub ts: Timestamp,
    /// The change to apply.
    pub change: RowChange,
}

impl DeltaRecord {
    /// Creates a record.
    #[must_use]
    pub fn new(key: RowKey, ts: Timestamp, change: RowChange) -> Self {
        Self { key, ts, change }
    }
}

impl fmt::Display for DeltaRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} @{} {}", self.key, self.ts, self.change)
    }
}

/// Enforces the delta ordering rule one record at a time.
///
/// Keys must be non-decreasing. Within a key, REDO timestamps must be
/// non-decreasing and UNDO timestamps non-increasing. Equal timestamps are
/// several mutations from the same batch and keep their relative order.
#[derive(Debug)]
pub struct OrderingChecker {
    direction: DeltaDirection,
    last: Option<(RowKey, Timestamp)>,
    checked: usize,
}

impl OrderingChecker {
    /// Creates a checker for a sequence in `direction`.
    #[must_use]
    pub fn new(direction: DeltaDirection) -> Self {
        Self {
            direction,
            last: None,
            checked: 0,
        }
    }

    /// Checks the next `(key, ts)` of the sequence.
    ///
    /// # Errors
    ///
    /// Returns an `OrderingViolation` naming both positions if the pair
    /// breaks the rule.
    pub fn check(&mut self, key: &RowKey, ts: Timestamp) -> TabletResult<()> {
        if let Some((last_key, last_ts)) = &self.last {
            let in_order = match key.cmp(last_key) {
                Ordering::Less => false,
                Ordering::Greater => true,
                Ordering::Equal => match self.direction {
                    DeltaDirection::Redo => ts >= *last_ts,
                    DeltaDirection::Undo => ts <= *last_ts,
                },
            };
            if !in_order {
                return Err(TabletError::ordering(format!(
                    "{} record #{} {key}@{ts} follows {last_key}@{last_ts}",
                    self.direction, self.checked
                )));
            }
        }
        self.last = Some((key.clone(), ts));
        self.checked += 1;
        Ok(())
    }

    /// Checks a whole record.
    ///
    /// # Errors
    ///
    /// See [`check`](Self::check).
    pub fn check_record(&mut self, record: &DeltaRecord) -> TabletResult<()> {
        self.check(&record.key, record.ts)
    }

    /// Returns the number of records accepted so far.
    #[must_use]
    pub fn checked(&self) -> usize {
        self.checked
    }
}
