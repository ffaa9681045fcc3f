//! Inspect command implementation.

use super::open_tablet;
use serde::Serialize;
use std::path::Path;
use tablet_core::{RecoveryReport, RowSetStats, TabletStats};

/// Tablet inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult<'a> {
    /// Tablet path.
    pub path: String,
    /// Key column names.
    pub key_columns: &'a [String],
    /// Non-key column names.
    pub value_columns: &'a [String],
    /// Store and counter snapshot.
    pub stats: &'a TabletStats,
    /// What recovery did on open.
    pub recovery: &'a RecoveryReport,
}

/// Runs the inspect command.
pub fn run(
    path: &Path,
    show_rowsets: bool,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let tablet = open_tablet(path)?;
    let stats = tablet.stats()?;
    let result = InspectResult {
        path: path.display().to_string(),
        key_columns: tablet.schema().key_columns(),
        value_columns: tablet.schema().value_columns(),
        stats: &stats,
        recovery: tablet.recovery_report(),
    };

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        _ => print_text_output(&result, show_rowsets),
    }
    Ok(())
}

fn print_text_output(result: &InspectResult<'_>, show_rowsets: bool) {
    let stats = result.stats;
    println!("Tablet Inspection");
    println!("=================");
    println!();
    println!("Path:          {}", result.path);
    println!("Keys:          {}", result.key_columns.join(", "));
    println!("Values:        {}", result.value_columns.join(", "));
    println!("Now:           {}", stats.now);
    println!("History mark:  {}", stats.ancient_history_mark);
    println!();
    println!("Memory:");
    println!("  {}: {} rows, {} changes", stats.mrs_id, stats.mrs_rows, stats.mrs_changes);
    println!("  Frozen stores: {}", stats.frozen_stores);
    println!("  WAL size:      {}", format_bytes(stats.wal_bytes));
    println!();
    println!(
        "Disk row sets: {} ({} base rows, {} DMS records)",
        stats.rowsets.len(),
        stats.disk_rows(),
        stats.dms_records()
    );
    if show_rowsets {
        for rs in &stats.rowsets {
            print_rowset(rs);
        }
    }
    println!();
    let m = &stats.metrics;
    println!("Since open:");
    println!("  Batches:     {} ({} ops, {} rejected)", m.batches, m.ops_applied, m.ops_rejected);
    println!("  Flushes:     {} ({} delta)", m.flushes, m.delta_flushes);
    println!(
        "  Compactions: {} minor, {} major, {} row set",
        m.minor_compactions, m.major_compactions, m.rowset_compactions
    );
    if stats.poisoned {
        println!();
        println!("WARNING: tablet is poisoned");
    }
}

fn print_rowset(rs: &RowSetStats) {
    let range = match (&rs.min_key, &rs.max_key) {
        (Some(min), Some(max)) => format!("{min}..={max}"),
        _ => "empty".to_string(),
    };
    println!("  {} created @{} keys {range}", rs.id, rs.created_ts);
    println!(
        "    base {} ({} ghost), undo {}, redo {} in {} stores, dms {}",
        rs.base_rows,
        rs.ghost_rows,
        rs.undo_records,
        rs.redo_records,
        rs.redo_stores,
        rs.dms_records
    );
}

fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;

    if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{bytes} bytes")
    }
}
