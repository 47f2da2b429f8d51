//! Batch part format.
//!
//! The same self-describing part is written to batch files, snapshot files
//! and HTTP payloads. A part carries rows of exactly one table.

use crate::changes::ChangesTable;
use crate::row::SyncRow;
use crate::schema::SyncTable;
use crate::serializer::SerializerKind;
use crate::timestamp::Timestamp;
use serde::{Deserialize, Serialize};

/// One chunk of a batch: rows of a single table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchPart {
    /// Position of the part in its batch.
    pub index: usize,
    /// Changes-table schema of the rows.
    pub table: SyncTable,
    /// Rows.
    pub rows: Vec<SyncRow>,
    /// Number of rows, readable without decoding `rows`.
    pub row_count: usize,
}

impl BatchPart {
    /// Creates a part.
    pub fn new(index: usize, table: SyncTable, rows: Vec<SyncRow>) -> Self {
        let row_count = rows.len();
        Self {
            index,
            table,
            rows,
            row_count,
        }
    }

    /// Converts into a changes table.
    pub fn into_changes(self) -> ChangesTable {
        ChangesTable {
            schema: self.table,
            rows: self.rows,
        }
    }

    /// Describes the part for a summary.
    pub fn info(&self, file_name: Option<String>) -> BatchPartInfo {
        BatchPartInfo {
            index: self.index,
            table_name: self.table.full_name(),
            row_count: self.rows.len(),
            file_name,
        }
    }
}

/// Summary entry for one part.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchPartInfo {
    /// Position of the part in its batch.
    pub index: usize,
    /// Fully qualified table name.
    pub table_name: String,
    /// Number of rows in the part.
    pub row_count: usize,
    /// File holding the part, relative to the batch directory.
    pub file_name: Option<String>,
}

/// Summary written next to file-backed batches and snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BatchSummary {
    /// Parts, in order.
    pub parts: Vec<BatchPartInfo>,
    /// Timestamp the batch was read at (snapshots only).
    pub timestamp: Option<Timestamp>,
    /// Serializer of the part files. The summary itself is always JSON.
    #[serde(default)]
    pub serializer: SerializerKind,
}

impl BatchSummary {
    /// Total number of rows across all parts.
    pub fn total_rows(&self) -> usize {
        self.parts.iter().map(|p| p.row_count).sum()
    }
}
