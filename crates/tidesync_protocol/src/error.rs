//! Error types for the protocol crate.

use crate::timestamp::TimestampError;
use crate::value::DataType;
use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while building or decoding protocol types.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    /// A table cannot be tracked without a primary key.
    #[error("table {table} has no primary key and cannot be tracked")]
    MissingPrimaryKey {
        /// Fully qualified table name.
        table: String,
    },

    /// A primary key or filter refers to a column the table does not have.
    #[error("table {table} has no column named {column}")]
    UnknownColumn {
        /// Fully qualified table name.
        table: String,
        /// Column name that was not found.
        column: String,
    },

    /// A row does not have one value per changes-table column.
    #[error("row shape mismatch for table {table}: expected {expected} values, got {actual}")]
    RowShape {
        /// Fully qualified table name.
        table: String,
        /// Number of columns in the changes table.
        expected: usize,
        /// Number of values in the row.
        actual: usize,
    },

    /// A value could not be converted to the requested column type.
    #[error("cannot coerce {value} to {to:?}")]
    Coercion {
        /// Rendered source value.
        value: String,
        /// Requested column type.
        to: DataType,
    },

    /// A required filter parameter was not supplied.
    #[error("missing filter parameter {parameter} for table {table}")]
    MissingParameter {
        /// Filtered table.
        table: String,
        /// Parameter name.
        parameter: String,
    },

    /// The setup is not usable.
    #[error("invalid setup: {0}")]
    InvalidSetup(String),

    /// Encoding or decoding a payload failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Timestamp decoding failed.
    #[error(transparent)]
    Timestamp(#[from] TimestampError),
}

impl ProtocolError {
    /// Creates a serialization error.
    pub fn serialization(message: impl std::fmt::Display) -> Self {
        Self::Serialization(message.to_string())
    }
}
