//! The contract a database backend implements.
//!
//! The engine never builds SQL. A provider hands out [`DbCommand`]s for a
//! table and a [`DbCommandType`], prepares and executes them, and reports
//! driver errors as [`ProviderError`]s that it can classify itself.
//!
//! Commands speak a small parameter vocabulary on top of the table columns:
//!
//! | Parameter               | Meaning                                           |
//! |-------------------------|---------------------------------------------------|
//! | `sync_min_timestamp`    | watermark; only rows changed after it qualify      |
//! | `sync_scope_id`         | scope id of the peer (echo exclusion, update stamp)|
//! | `sync_force_write`      | bypass the timestamp check                         |
//! | `sync_row_is_tombstone` | whether the bound row is a deletion                |
//! | `sync_row_count`        | output: rows affected by the command               |
//!
//! Rows read by select commands carry three metadata fields next to the
//! columns: `sync_timestamp`, `sync_row_is_tombstone` and
//! `sync_update_scope_id`.

use std::fmt;
use thiserror::Error;
use tidesync_protocol::{
    DataType, SetupTable, SyncFilter, SyncRelation, SyncTable, SyncValue, Timestamp,
    TimestampEncoding,
};

/// Watermark parameter.
pub const SYNC_MIN_TIMESTAMP: &str = "sync_min_timestamp";
/// Peer scope id parameter.
pub const SYNC_SCOPE_ID: &str = "sync_scope_id";
/// Force-write parameter.
pub const SYNC_FORCE_WRITE: &str = "sync_force_write";
/// Tombstone flag parameter and metadata field.
pub const SYNC_ROW_IS_TOMBSTONE: &str = "sync_row_is_tombstone";
/// Affected-rows output parameter.
pub const SYNC_ROW_COUNT: &str = "sync_row_count";
/// Row timestamp metadata field.
pub const SYNC_TIMESTAMP: &str = "sync_timestamp";
/// Last writer metadata field.
pub const SYNC_UPDATE_SCOPE_ID: &str = "sync_update_scope_id";

/// Result type for provider calls.
pub type ProviderResult<T> = Result<T, ProviderError>;

/// Error reported by a provider, with its native error code.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("[{code}] {message}")]
pub struct ProviderError {
    /// Native error code.
    pub code: i32,
    /// Native message.
    pub message: String,
}

impl ProviderError {
    /// Creates a provider error.
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// State of a provider connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Usable.
    Open,
    /// Closed or broken.
    Closed,
}

/// Kinds of commands an adapter asks a provider for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DbCommandType {
    /// Rows changed since a watermark.
    SelectChanges,
    /// Rows changed since a watermark, restricted by a filter.
    SelectChangesWithFilters,
    /// Every live row, for a peer without a watermark.
    SelectInitializedChanges,
    /// Every live row restricted by a filter.
    SelectInitializedChangesWithFilters,
    /// One row by primary key, tombstones included.
    SelectRow,
    /// Plain insert; fails on an existing key.
    InsertRow,
    /// Upsert guarded by the timestamp check.
    UpdateRow,
    /// Delete guarded by the timestamp check.
    DeleteRow,
    /// Disable constraint checking.
    DisableConstraints,
    /// Re-enable constraint checking.
    EnableConstraints,
    /// Remove every row and its tracking data.
    Reset,
}

/// Which column parameters a command binds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnBinding {
    /// No column parameters.
    None,
    /// Primary key columns only.
    PrimaryKeys,
    /// Every changes-table column.
    All,
}

impl DbCommandType {
    /// Column parameters the command binds.
    pub fn column_binding(&self) -> ColumnBinding {
        match self {
            DbCommandType::SelectRow | DbCommandType::DeleteRow => ColumnBinding::PrimaryKeys,
            DbCommandType::InsertRow | DbCommandType::UpdateRow => ColumnBinding::All,
            _ => ColumnBinding::None,
        }
    }

    /// Scope parameters the command declares.
    pub fn scope_parameters(&self) -> &'static [&'static str] {
        match self {
            DbCommandType::SelectChanges
            | DbCommandType::SelectChangesWithFilters
            | DbCommandType::SelectInitializedChanges
            | DbCommandType::SelectInitializedChangesWithFilters => {
                &[SYNC_MIN_TIMESTAMP, SYNC_SCOPE_ID]
            }
            DbCommandType::InsertRow => &[SYNC_SCOPE_ID, SYNC_ROW_COUNT],
            DbCommandType::UpdateRow | DbCommandType::DeleteRow => &[
                SYNC_MIN_TIMESTAMP,
                SYNC_SCOPE_ID,
                SYNC_FORCE_WRITE,
                SYNC_ROW_IS_TOMBSTONE,
                SYNC_ROW_COUNT,
            ],
            _ => &[],
        }
    }

    /// Returns true for the filtered select variants.
    pub fn is_filtered(&self) -> bool {
        matches!(
            self,
            DbCommandType::SelectChangesWithFilters
                | DbCommandType::SelectInitializedChangesWithFilters
        )
    }
}

impl fmt::Display for DbCommandType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Direction of a command parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParameterDirection {
    /// Bound by the caller.
    Input,
    /// Written by the provider.
    Output,
}

/// A named command parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct DbParameter {
    /// Name, decorated the way the provider expects (`@id`, `:id`, ...).
    pub name: String,
    /// Parameter type.
    pub data_type: DataType,
    /// Direction.
    pub direction: ParameterDirection,
    /// Bound value.
    pub value: SyncValue,
}

impl DbParameter {
    /// Creates an input parameter bound to null.
    pub fn input(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            direction: ParameterDirection::Input,
            value: SyncValue::Null,
        }
    }

    /// Creates an output parameter.
    pub fn output(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            direction: ParameterDirection::Output,
            value: SyncValue::Null,
        }
    }
}

/// Strips the decoration a provider puts on parameter names.
///
/// `@id`, `:id`, `in_id` and `id` all normalize to `id`. Only one
/// decoration is removed, so `@in_stock` stays `in_stock`.
pub fn normalize_parameter_name(name: &str) -> &str {
    let name = name.trim();
    if let Some(bare) = name.strip_prefix('@').or_else(|| name.strip_prefix(':')) {
        return bare;
    }
    match name.get(..3) {
        Some(prefix) if prefix.eq_ignore_ascii_case("in_") && name.len() > 3 => &name[3..],
        _ => name,
    }
}

/// Names a decorated parameter may stand for, exact match first.
///
/// `in_id` may stand for a column `in_id` or, in the `in_` style, for `id`.
pub fn parameter_name_candidates(name: &str) -> [&str; 2] {
    let name = name.trim();
    let marked = name.strip_prefix('@').or_else(|| name.strip_prefix(':'));
    [marked.unwrap_or(name), normalize_parameter_name(name)]
}

/// A command built by a provider for one table.
#[derive(Debug, Clone, PartialEq)]
pub struct DbCommand {
    /// Command type.
    pub command_type: DbCommandType,
    /// Fully qualified target table.
    pub table: String,
    /// Provider-specific command text.
    pub text: String,
    /// Parameters.
    pub parameters: Vec<DbParameter>,
}

impl DbCommand {
    /// Creates a command without parameters.
    pub fn new(command_type: DbCommandType, table: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            command_type,
            table: table.into(),
            text: text.into(),
            parameters: Vec::new(),
        }
    }

    /// Finds a parameter, ignoring case and name decorations.
    pub fn parameter(&self, name: &str) -> Option<&DbParameter> {
        self.position(name).map(|index| &self.parameters[index])
    }

    /// Mutable variant of [`DbCommand::parameter`].
    pub fn parameter_mut(&mut self, name: &str) -> Option<&mut DbParameter> {
        self.position(name).map(move |index| &mut self.parameters[index])
    }

    fn position(&self, name: &str) -> Option<usize> {
        let [wanted, _] = parameter_name_candidates(name);
        let lookup = |candidate: usize| {
            self.parameters.iter().position(|p| {
                parameter_name_candidates(&p.name)[candidate].eq_ignore_ascii_case(wanted)
            })
        };
        lookup(0).or_else(|| lookup(1))
    }

    /// Value of a parameter, null when absent.
    pub fn value(&self, name: &str) -> SyncValue {
        self.parameter(name)
            .map(|p| p.value.clone())
            .unwrap_or_default()
    }
}

/// One record returned by a reader command.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DbRecord {
    fields: Vec<(String, SyncValue)>,
}

impl DbRecord {
    /// Creates an empty record.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a field.
    pub fn with(mut self, name: impl Into<String>, value: SyncValue) -> Self {
        self.fields.push((name.into(), value));
        self
    }

    /// Looks up a field (case-insensitive).
    pub fn get(&self, name: &str) -> Option<&SyncValue> {
        self.fields
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
    }
}

/// A database backend.
///
/// Calls are blocking; the engine runs them on the round's task. A
/// connection is owned by one round at a time.
pub trait SyncProvider: Send + Sync {
    /// Connection handle.
    type Connection: Send + Sync;

    /// Short provider name used in logs.
    fn provider_name(&self) -> &str;

    /// Opens a connection.
    fn open(&self) -> ProviderResult<Self::Connection>;

    /// Closes a connection.
    fn close(&self, connection: &Self::Connection) -> ProviderResult<()>;

    /// Reports the state of a connection.
    fn connection_state(&self, connection: &Self::Connection) -> ConnectionState;

    /// Data source (server, file) the connection points at.
    fn data_source(&self, connection: &Self::Connection) -> String;

    /// Database the connection points at.
    fn database(&self, connection: &Self::Connection) -> String;

    /// Starts a transaction.
    fn begin_transaction(&self, connection: &Self::Connection) -> ProviderResult<()>;

    /// Commits the current transaction.
    fn commit(&self, connection: &Self::Connection) -> ProviderResult<()>;

    /// Rolls back the current transaction.
    fn rollback(&self, connection: &Self::Connection) -> ProviderResult<()>;

    /// Builds a command, or `None` when the provider has no such command.
    fn create_command(
        &self,
        table: &SyncTable,
        command_type: DbCommandType,
        filter: Option<&SyncFilter>,
    ) -> Option<DbCommand>;

    /// Prepares a command on a connection.
    fn prepare(&self, connection: &Self::Connection, command: &mut DbCommand) -> ProviderResult<()>;

    /// Executes a command that returns no rows; output parameters are
    /// written back into `command`.
    fn execute_non_query(
        &self,
        connection: &Self::Connection,
        command: &mut DbCommand,
    ) -> ProviderResult<()>;

    /// Executes a command that returns rows.
    fn execute_reader(
        &self,
        connection: &Self::Connection,
        command: &DbCommand,
    ) -> ProviderResult<Vec<DbRecord>>;

    /// Returns true if the error is a primary-key violation.
    fn is_primary_key_violation(&self, error: &ProviderError) -> bool;

    /// Returns true if the error is a unique-constraint violation.
    fn is_unique_key_violation(&self, error: &ProviderError) -> bool;

    /// Reads the schema of a table, `None` when it does not exist.
    fn get_table_schema(
        &self,
        connection: &Self::Connection,
        table: &SetupTable,
    ) -> ProviderResult<Option<SyncTable>>;

    /// Reads the foreign keys between the given tables.
    fn get_relations(
        &self,
        connection: &Self::Connection,
        tables: &[SyncTable],
    ) -> ProviderResult<Vec<SyncRelation>>;

    /// Creates a table from a schema; no-op when it exists.
    fn create_table(&self, connection: &Self::Connection, table: &SyncTable) -> ProviderResult<()>;

    /// Creates the change-tracking metadata of a table.
    fn provision(&self, connection: &Self::Connection, table: &SyncTable) -> ProviderResult<()>;

    /// Removes the change-tracking metadata of a table.
    fn deprovision(&self, connection: &Self::Connection, table: &SyncTable) -> ProviderResult<()>;

    /// Loads a scope record.
    fn load_scope_blob(
        &self,
        connection: &Self::Connection,
        key: &str,
    ) -> ProviderResult<Option<Vec<u8>>>;

    /// Stores a scope record.
    fn save_scope_blob(
        &self,
        connection: &Self::Connection,
        key: &str,
        blob: Vec<u8>,
    ) -> ProviderResult<()>;

    /// Current change-tracking timestamp of the store, in driver shape.
    fn get_local_timestamp(&self, connection: &Self::Connection) -> ProviderResult<SyncValue>;

    /// Deletes tombstones not newer than `up_to`; returns how many.
    fn delete_metadata(
        &self,
        connection: &Self::Connection,
        table: &SyncTable,
        up_to: Timestamp,
    ) -> ProviderResult<usize>;

    /// Shape in which timestamps are bound to commands.
    fn timestamp_encoding(&self) -> TimestampEncoding {
        TimestampEncoding::Integer
    }

    /// Decorates a bare parameter name for this provider.
    fn parameter_name(&self, name: &str) -> String {
        format!("@{name}")
    }
}
