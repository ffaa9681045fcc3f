//! Dump WAL command implementation.

use serde::Serialize;
use std::path::Path;
use tablet_core::wal::{OpTarget, WalIterator};
use tablet_core::RowOp;
use tablet_storage::FileBackend;

/// One logged operation for output.
#[derive(Debug, Serialize)]
pub struct WalOpInfo {
    /// Operation kind.
    pub kind: &'static str,
    /// Primary key.
    pub key: String,
    /// Store that absorbed the operation.
    pub target: String,
}

/// One WAL batch for output.
#[derive(Debug, Serialize)]
pub struct WalBatchInfo {
    /// Offset in the WAL file.
    pub offset: u64,
    /// Batch timestamp.
    pub timestamp: u64,
    /// Logged operations.
    pub ops: Vec<WalOpInfo>,
}

/// Runs the dump-wal command.
///
/// Reads the log directly, without opening or recovering the tablet.
pub fn run(
    path: &Path,
    limit: Option<usize>,
    start_offset: u64,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let wal_path = path.join("wal.log");
    if !wal_path.exists() {
        return Err("WAL file not found".into());
    }

    let backend = FileBackend::open_existing(&wal_path)?;
    let mut batches = Vec::new();
    let mut error = None;
    for item in WalIterator::new(&backend, start_offset)?.take(limit.unwrap_or(usize::MAX)) {
        match item {
            Ok((offset, batch)) => batches.push(WalBatchInfo {
                offset,
                timestamp: batch.ts.as_u64(),
                ops: batch
                    .ops
                    .iter()
                    .map(|logged| WalOpInfo {
                        kind: op_kind(&logged.op),
                        key: logged.op.key().to_string(),
                        target: describe_target(logged.target),
                    })
                    .collect(),
            }),
            Err(err) => error = Some(err),
        }
    }

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&batches)?);
        }
        _ => print_text_output(&batches),
    }
    if let Some(err) = error {
        eprintln!("WAL ends with a damaged record: {err}");
    }
    Ok(())
}

fn op_kind(op: &RowOp) -> &'static str {
    match op {
        RowOp::Insert(_) => "INSERT",
        RowOp::InsertPkOnly(_) => "INSERT_PK_ONLY",
        RowOp::Upsert(_) => "UPSERT",
        RowOp::UpsertPkOnly(_) => "UPSERT_PK_ONLY",
        RowOp::Update { .. } => "UPDATE",
        RowOp::Delete(_) => "DELETE",
    }
}

fn describe_target(target: OpTarget) -> String {
    match target {
        OpTarget::Mrs(id) => format!("{id}"),
        OpTarget::Drs { rowset, dms } => format!("{rowset}/{dms}"),
        OpTarget::NoEffect => "no effect".to_string(),
    }
}

fn print_text_output(batches: &[WalBatchInfo]) {
    println!("WAL Batches");
    println!("===========");
    println!();
    for batch in batches {
        println!("[{:>10}] @{}", batch.offset, batch.timestamp);
        for op in &batch.ops {
            println!("             {:<15} {} -> {}", op.kind, op.key, op.target);
        }
    }
    println!();
    println!("Total: {} batches", batches.len());
}
