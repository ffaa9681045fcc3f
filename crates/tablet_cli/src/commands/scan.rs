//! Scan command implementation.

use super::open_tablet;
use std::path::Path;
use tablet_core::{ScanSpec, Timestamp};

/// Runs the scan command.
pub fn run(
    path: &Path,
    at: Option<u64>,
    limit: Option<usize>,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let tablet = open_tablet(path)?;
    let mut spec = ScanSpec::new();
    if let Some(ts) = at {
        spec = spec.at(Timestamp(ts));
    }

    let mut rows = Vec::new();
    for row in tablet.scan(spec)?.take(limit.unwrap_or(usize::MAX)) {
        rows.push(row?);
    }

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&rows)?);
        }
        _ => {
            for row in &rows {
                println!("{row}");
            }
            println!("({} rows)", rows.len());
        }
    }

    Ok(())
}
