//! Inspect command implementation.

use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use tidesync_engine::protocol::RowState;
use tidesync_engine::{BatchInfo, SUMMARY_FILE};

/// Batch inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Batch directory.
    pub path: String,
    /// Timestamp recorded with the batch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
    /// Number of parts.
    pub part_count: usize,
    /// Rows across all parts.
    pub total_rows: usize,
    /// Per-table figures, by table name.
    pub tables: BTreeMap<String, TableSummary>,
}

/// Figures for one table of a batch.
#[derive(Debug, Default, Serialize)]
pub struct TableSummary {
    /// Parts holding rows of the table.
    pub parts: usize,
    /// Rows of the table.
    pub rows: usize,
    /// Upserted rows (if counted).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modified: Option<usize>,
    /// Tombstones (if counted).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted: Option<usize>,
}

/// Runs the inspect command.
pub fn run(path: &Path, count_rows: bool, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let result = inspect(path, count_rows)?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        _ => {
            print_text_output(&result);
        }
    }

    Ok(())
}

/// Reads the batch summary and, if asked, every part.
pub fn inspect(path: &Path, count_rows: bool) -> Result<InspectResult, Box<dyn std::error::Error>> {
    if !path.join(SUMMARY_FILE).exists() {
        return Err(format!("No batch summary found at {:?}", path).into());
    }
    let batch = BatchInfo::open(path)?;

    let mut tables: BTreeMap<String, TableSummary> = BTreeMap::new();
    for info in batch.parts_info() {
        let table = tables.entry(info.table_name.clone()).or_default();
        table.parts += 1;
        table.rows += info.row_count;
    }

    if count_rows {
        for index in 0..batch.part_count() {
            let part = batch.load_part(index)?;
            let deleted = part
                .rows
                .iter()
                .filter(|row| row.state == RowState::Deleted)
                .count();
            let table = tables.entry(part.table.full_name()).or_default();
            *table.deleted.get_or_insert(0) += deleted;
            *table.modified.get_or_insert(0) += part.rows.len() - deleted;
        }
    }

    Ok(InspectResult {
        path: path.display().to_string(),
        timestamp: batch.timestamp().map(|t| t.value()),
        part_count: batch.part_count(),
        total_rows: batch.total_rows(),
        tables,
    })
}

fn print_text_output(result: &InspectResult) {
    println!("TideSync Batch Inspection");
    println!("=========================");
    println!();
    println!("Path: {}", result.path);
    match result.timestamp {
        Some(ts) => println!("Timestamp: {ts}"),
        None => println!("Timestamp: (none)"),
    }
    println!("Parts: {}", result.part_count);
    println!("Rows:  {}", result.total_rows);

    if !result.tables.is_empty() {
        println!();
        println!("Tables:");
        for (name, table) in &result.tables {
            print!("  {name}: {} rows in {} parts", table.rows, table.parts);
            if let (Some(modified), Some(deleted)) = (table.modified, table.deleted) {
                print!(" ({modified} modified, {deleted} deleted)");
            }
            println!();
        }
    }
}
