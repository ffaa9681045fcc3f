//! Verify command implementation.

use super::open_tablet;
use std::path::Path;
use tracing::info;

/// Runs the verify command.
///
/// Opening runs recovery; [`tablet_core::Tablet::verify`] then replays
/// every disk row set history and a full scan.
pub fn run(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let tablet = open_tablet(path)?;
    let report = tablet.recovery_report();
    info!(
        rowsets = report.rowsets_opened,
        replayed = report.ops_replayed,
        orphans = report.orphans_removed,
        "recovered"
    );

    let live = tablet.verify()?;
    let stats = tablet.stats()?;
    println!("Tablet Verification");
    println!("===================");
    println!("Row sets:        {}", stats.rowsets.len());
    println!("Live rows:       {live}");
    println!("Ops replayed:    {}", report.ops_replayed);
    println!("Orphans removed: {}", report.orphans_removed);
    println!();
    println!("Status: OK");
    Ok(())
}
