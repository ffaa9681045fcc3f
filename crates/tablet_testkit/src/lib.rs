//! # Tablet Testkit
//!
//! Test utilities for the tablet storage engine.
//!
//! This crate provides:
//! - Test fixtures and tablet helpers
//! - A reference model of committed tablet contents
//! - A fuzz driver that checks every snapshot against the model
//! - Property-based test generators using proptest
//! - Crash simulation and recovery checks
//!
//! ## Usage
//!
//! ```rust,ignore
//! use tablet_testkit::prelude::*;
//! use TestOpKind::*;
//!
//! #[test]
//! fn delete_then_reinsert() {
//!     run_fuzz_case(
//!         int_schema(),
//!         &[op(Insert, 0), op(FlushOps, 0), op(FlushTablet, 0),
//!           op(Delete, 0), op(Insert, 0), op(FlushOps, 0)],
//!         1,
//!     )
//!     .unwrap();
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod crash;
pub mod fixtures;
pub mod fuzz;
pub mod generators;
pub mod model;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::crash::*;
    pub use crate::fixtures::*;
    pub use crate::fuzz::*;
    pub use crate::generators::*;
    pub use crate::model::*;
}

pub use crash::*;
pub use fixtures::*;
pub use fuzz::*;
pub use generators::*;
pub use model::*;
