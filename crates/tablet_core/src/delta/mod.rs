//! Delta stores: the UNDO/REDO history attached to disk row sets.
//!
//! ## Ordering
//!
//! Every delta sequence, in memory or on disk, is sorted by key ascending.
//! Within a key, REDO records ascend by timestamp and UNDO records descend,
//! so both walks start next to the base image and move away from it.
//! Records sharing a timestamp came from one batch and keep application
//! order (REDO) or reverse application order (UNDO).
//!
//! ## Invariants
//!
//! - an out-of-order sequence is rejected before it becomes durable
//! - a store loaded from disk is re-checked; a violation is corruption and
//!   is never repaired by sorting at read time
//! - flushed stores are immutable; compaction replaces whole stores

mod dms;
mod record;
mod store;

pub use dms::DeltaMemStore;
pub use record::{DeltaDirection, DeltaRecord, OrderingChecker};
pub use store::{DeltaStore, DELTA_MAGIC};
