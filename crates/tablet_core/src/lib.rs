//! # Tablet Core
//!
//! An MVCC tablet storage engine.
//!
//! A tablet stores rows keyed by a primary key and keeps every version of
//! every row, so a scan can read the tablet as of any timestamp it has
//! applied (down to a configurable retention horizon).
//!
//! This crate provides:
//! - an MVCC clock issuing one timestamp per write batch
//! - a mutable in-memory store for freshly inserted rows
//! - immutable disk row sets: a base image plus UNDO and REDO delta stores
//! - delta memory stores for mutations of rows already on disk
//! - flush, delta flush, minor and major delta compaction, and row-set
//!   compaction
//! - snapshot scans that merge every store in key order
//! - a write-ahead log, a manifest and crash recovery
//! - an optional background maintenance thread
//!
//! ## Example
//!
//! ```rust,no_run
//! use tablet_core::{Row, RowKey, RowOp, ScanSpec, Schema, Tablet, TabletConfig, Value};
//!
//! # fn main() -> tablet_core::TabletResult<()> {
//! let schema = Schema::new(["id"], ["name"])?;
//! let tablet = Tablet::open_or_create("/tmp/users".as_ref(), schema, TabletConfig::default())?;
//!
//! let values = [("name".to_string(), Value::from("ada"))].into_iter().collect();
//! let ts = tablet.apply(RowOp::Insert(Row::new(RowKey::int(1), values)))?;
//! tablet.flush()?;
//!
//! for row in tablet.scan(ScanSpec::new().at(ts))? {
//!     println!("{:?}", row?);
//! }
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod clock;
pub mod codec;
pub mod delta;
pub mod dir;
pub mod diskrowset;
pub mod manifest;
pub mod memrowset;
pub mod recovery;
pub mod rowset;
pub mod wal;

mod compaction;
mod config;
mod error;
mod flush;
mod maintenance;
mod mutation;
mod row;
mod scan;
mod stats;
mod tablet;
mod types;

pub use clock::{MvccClock, SnapshotPin};
pub use compaction::{merge_histories, merge_redo_stores};
pub use config::TabletConfig;
pub use error::{TabletError, TabletResult};
pub use maintenance::{MaintenanceManager, MaintenanceReport};
pub use recovery::{recover, RecoveryReport};
pub use row::{Row, RowChange, RowKey, RowOp, Schema, Value, Values};
pub use scan::{Predicate, ScanSpec, Scanner};
pub use stats::{MetricsSnapshot, RowSetStats, TabletMetrics, TabletStats};
pub use tablet::{CompactionKind, Tablet, WriteOutcome};
pub use types::{DmsId, FileId, MrsId, RowSetId, Timestamp};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
