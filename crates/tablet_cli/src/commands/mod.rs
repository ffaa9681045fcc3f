//! CLI command implementations.

pub mod compact;
pub mod dump_wal;
pub mod fuzz;
pub mod inspect;
pub mod scan;
pub mod verify;
pub mod write;

use std::path::Path;
use tablet_core::{Tablet, TabletConfig, TabletResult};

/// Opens an existing tablet. The CLI never starts the maintenance thread.
pub fn open_tablet(path: &Path) -> TabletResult<Tablet> {
    let config = TabletConfig::default()
        .create_if_missing(false)
        .maintenance_interval(None);
    Tablet::open(path, config)
}
