//! Flush and compact command implementations.

use super::open_tablet;
use clap::ValueEnum;
use std::path::Path;
use tablet_core::{CompactionKind, Timestamp};

/// What the compact command works on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CompactTarget {
    /// Merge the REDO stores of one row set.
    Minor,
    /// Fold REDO history into a rewritten base.
    Major,
    /// Merge row sets with overlapping key ranges.
    Rowsets,
    /// Run one scheduled maintenance pass.
    Maintenance,
}

/// Runs the flush command.
pub fn flush(path: &Path, deltas: bool) -> Result<(), Box<dyn std::error::Error>> {
    let tablet = open_tablet(path)?;
    let flushed = if deltas {
        tablet.flush_deltas()?
    } else {
        tablet.flush()?
    };
    match flushed {
        Some(id) => println!("Flushed into row set {id}"),
        None => println!("Nothing to flush"),
    }
    Ok(())
}

/// Runs the compact command.
pub fn run(
    path: &Path,
    target: CompactTarget,
    up_to: Option<u64>,
) -> Result<(), Box<dyn std::error::Error>> {
    if up_to.is_some() && target != CompactTarget::Major {
        return Err("--up-to only applies to major compaction".into());
    }
    let tablet = open_tablet(path)?;
    match target {
        CompactTarget::Minor | CompactTarget::Major => {
            let done = match (target, up_to) {
                (CompactTarget::Major, Some(ts)) => {
                    tablet.major_compact_deltas_up_to(Timestamp(ts))?
                }
                (CompactTarget::Major, None) => tablet.compact_deltas(CompactionKind::Major)?,
                _ => tablet.compact_deltas(CompactionKind::Minor)?,
            };
            match done {
                Some(id) => println!("Compacted deltas of row set {id}"),
                None => println!("No row set needed delta compaction"),
            }
        }
        CompactTarget::Rowsets => {
            let merged = tablet.compact()?;
            println!("Merged {merged} row sets");
        }
        CompactTarget::Maintenance => {
            let report = tablet.run_maintenance()?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }
    Ok(())
}
