//! Rows moving through the sync pipeline.

use crate::schema::SyncTable;
use crate::timestamp::Timestamp;
use crate::value::SyncValue;
use serde::{Deserialize, Serialize};

/// State of a changed row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RowState {
    /// Inserted or updated.
    #[default]
    Modified,
    /// Deleted (tombstone).
    Deleted,
}

/// One changed row, positional against its changes table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRow {
    /// Values, one per changes-table column.
    pub values: Vec<SyncValue>,
    /// Row state.
    pub state: RowState,
    /// Timestamp of the change in the store it was read from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<Timestamp>,
}

impl SyncRow {
    /// Creates a modified row.
    pub fn modified(values: Vec<SyncValue>) -> Self {
        Self {
            values,
            state: RowState::Modified,
            timestamp: None,
        }
    }

    /// Creates a tombstone.
    pub fn deleted(values: Vec<SyncValue>) -> Self {
        Self {
            values,
            state: RowState::Deleted,
            timestamp: None,
        }
    }

    /// Sets the row timestamp.
    pub fn with_timestamp(mut self, timestamp: Timestamp) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Returns true if the row is a tombstone.
    pub fn is_tombstone(&self) -> bool {
        self.state == RowState::Deleted
    }

    /// Returns the value of a named column of `table`.
    pub fn get<'a>(&'a self, table: &SyncTable, column: &str) -> Option<&'a SyncValue> {
        table.column_index(column).and_then(|i| self.values.get(i))
    }

    /// Renders the primary key of this row as a stable lookup key.
    pub fn key(&self, table: &SyncTable) -> String {
        table
            .primary_key_indexes()
            .into_iter()
            .map(|i| {
                self.values
                    .get(i)
                    .map(SyncValue::key_fragment)
                    .unwrap_or_else(|| "null".to_string())
            })
            .collect::<Vec<_>>()
            .join("|")
    }
}
