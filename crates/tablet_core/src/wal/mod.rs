//! Write-ahead log.
//!
//! Every applied write batch is logged before its effects become visible.
//! A record carries the batch timestamp and each successful operation
//! together with the store it changed, so recovery can tell which
//! operations are already durable in flushed files.
//!
//! ## WAL Record Format
//!
//! ```text
//! | magic "TWAL" (4) | version (2) | type (1) | length (4) | CBOR payload (N) | crc32 (4) |
//! ```
//!
//! ## Recovery Policy
//!
//! ### Tolerated (clean end of log)
//!
//! - **Truncated header**: fewer than 11 bytes left
//! - **Truncated payload**: the declared length runs past the end
//!
//! Both are writes cut short by a crash before they were acknowledged.
//!
//! ### Fatal (open fails)
//!
//! - **CRC mismatch** → `ChecksumMismatch`
//! - **Invalid magic**, **unknown record type**, **future version** →
//!   `WalCorruption`
//!
//! ## Invariants
//!
//! - records are appended in timestamp order; timestamps never repeat
//! - a batch is acknowledged only after its record is written (and synced
//!   when `sync_on_commit` is set)
//! - the log is only ever shortened by an atomic rewrite that drops
//!   operations whose effects are durable elsewhere

mod iterator;
mod record;
mod writer;

pub use iterator::WalIterator;
pub use record::{LoggedOp, OpTarget, WalBatch, WalRecordType, WAL_MAGIC, WAL_VERSION};
pub use writer::WalWriter;
