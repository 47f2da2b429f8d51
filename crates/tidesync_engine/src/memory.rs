//! In-process reference provider.
//!
//! `MemoryProvider` keeps tables in memory and implements the whole
//! provider contract: change tracking with a store-wide logical clock,
//! tombstones, last-writer scope ids, unique and foreign-key constraints,
//! snapshot transactions and scope blobs. Error codes follow SQLite's
//! extended result codes so that classification code paths look the same as
//! against a real driver.
//!
//! Clones share the same store. Transactions snapshot the whole store and do
//! not isolate concurrent connections from each other.

use crate::provider::{
    ColumnBinding, ConnectionState, DbCommand, DbCommandType, DbParameter, DbRecord,
    ProviderError, ProviderResult, SyncProvider, SYNC_FORCE_WRITE, SYNC_MIN_TIMESTAMP,
    SYNC_ROW_COUNT, SYNC_ROW_IS_TOMBSTONE, SYNC_SCOPE_ID, SYNC_TIMESTAMP, SYNC_UPDATE_SCOPE_ID,
};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tidesync_protocol::{
    RawTimestamp, SetupTable, SyncFilter, SyncRelation, SyncTable, SyncValue, Timestamp,
    TimestampEncoding,
};
use tracing::trace;

/// Generic error.
pub const ERROR: i32 = 1;
/// Datatype mismatch.
pub const MISMATCH: i32 = 20;
/// Foreign key constraint failed.
pub const FOREIGN_KEY_VIOLATION: i32 = 787;
/// Primary key constraint failed.
pub const PRIMARY_KEY_VIOLATION: i32 = 1555;
/// Unique constraint failed.
pub const UNIQUE_VIOLATION: i32 = 2067;

/// How the provider decorates parameter names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParameterStyle {
    /// `@name`
    #[default]
    At,
    /// `:name`
    Colon,
    /// `in_name`
    InPrefix,
    /// `name`
    Bare,
}

impl ParameterStyle {
    fn decorate(&self, name: &str) -> String {
        match self {
            ParameterStyle::At => format!("@{name}"),
            ParameterStyle::Colon => format!(":{name}"),
            ParameterStyle::InPrefix => format!("in_{name}"),
            ParameterStyle::Bare => name.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
struct StoredRow {
    values: Vec<SyncValue>,
    timestamp: u64,
    tombstone: bool,
    update_scope_id: Option<String>,
}

#[derive(Debug, Clone)]
struct MemoryTable {
    schema: SyncTable,
    rows: BTreeMap<String, StoredRow>,
    tracked: bool,
}

impl MemoryTable {
    fn key_of(&self, values: &[SyncValue]) -> String {
        self.schema
            .primary_key_indexes()
            .into_iter()
            .map(|i| values.get(i).map(SyncValue::key_fragment).unwrap_or_default())
            .collect::<Vec<_>>()
            .join("|")
    }

    fn live_rows(&self) -> impl Iterator<Item = &StoredRow> {
        self.rows.values().filter(|r| !r.tombstone)
    }
}

#[derive(Debug, Clone)]
struct MemoryStore {
    tables: Vec<MemoryTable>,
    relations: Vec<SyncRelation>,
    unique: Vec<(String, String)>,
    blobs: HashMap<String, Vec<u8>>,
    clock: u64,
    constraints_enabled: bool,
}

impl MemoryStore {
    fn table_index(&self, name: &str) -> Option<usize> {
        self.tables.iter().position(|t| t.schema.matches_name(name))
    }

    fn table(&self, name: &str) -> ProviderResult<&MemoryTable> {
        self.table_index(name)
            .map(|i| &self.tables[i])
            .ok_or_else(|| ProviderError::new(ERROR, format!("no such table: {name}")))
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    /// Checks unique and foreign-key constraints for a row about to be
    /// written under `key`.
    fn check_write(&self, index: usize, key: &str, values: &[SyncValue]) -> ProviderResult<()> {
        if !self.constraints_enabled {
            return Ok(());
        }
        let table = &self.tables[index];
        let name = table.schema.full_name();

        for (unique_table, column) in &self.unique {
            if !table.schema.matches_name(unique_table) {
                continue;
            }
            let Some(i) = table.schema.column_index(column) else {
                continue;
            };
            let value = &values[i];
            if value.is_null() {
                continue;
            }
            let clash = table
                .rows
                .iter()
                .any(|(k, r)| k != key && !r.tombstone && r.values.get(i) == Some(value));
            if clash {
                return Err(ProviderError::new(
                    UNIQUE_VIOLATION,
                    format!("UNIQUE constraint failed: {name}.{column}"),
                ));
            }
        }

        for relation in &self.relations {
            if !table.schema.matches_name(&relation.child_table) {
                continue;
            }
            let child_values: Option<Vec<&SyncValue>> = relation
                .child_columns
                .iter()
                .map(|c| table.schema.column_index(c).map(|i| &values[i]))
                .collect();
            let Some(child_values) = child_values else {
                continue;
            };
            if child_values.iter().any(|v| v.is_null()) {
                continue;
            }
            let parent = self.table(&relation.parent_table)?;
            let parent_indexes: Vec<usize> = relation
                .parent_columns
                .iter()
                .filter_map(|c| parent.schema.column_index(c))
                .collect();
            let found = parent.live_rows().any(|r| {
                parent_indexes
                    .iter()
                    .zip(&child_values)
                    .all(|(i, v)| r.values.get(*i) == Some(*v))
            });
            if !found {
                return Err(ProviderError::new(
                    FOREIGN_KEY_VIOLATION,
                    format!("FOREIGN KEY constraint failed: {}", relation.name),
                ));
            }
        }
        Ok(())
    }

    /// Checks that no live child row references the row about to be deleted.
    fn check_delete(&self, index: usize, values: &[SyncValue]) -> ProviderResult<()> {
        if !self.constraints_enabled {
            return Ok(());
        }
        let table = &self.tables[index];
        for relation in &self.relations {
            if !table.schema.matches_name(&relation.parent_table) {
                continue;
            }
            let parent_values: Vec<&SyncValue> = relation
                .parent_columns
                .iter()
                .filter_map(|c| table.schema.column_index(c).map(|i| &values[i]))
                .collect();
            let child = self.table(&relation.child_table)?;
            let child_indexes: Vec<usize> = relation
                .child_columns
                .iter()
                .filter_map(|c| child.schema.column_index(c))
                .collect();
            let referenced = child.live_rows().any(|r| {
                child_indexes
                    .iter()
                    .zip(&parent_values)
                    .all(|(i, v)| r.values.get(*i) == Some(*v))
            });
            if referenced {
                return Err(ProviderError::new(
                    FOREIGN_KEY_VIOLATION,
                    format!("FOREIGN KEY constraint failed: {}", relation.name),
                ));
            }
        }
        Ok(())
    }
}

/// Connection to a [`MemoryProvider`].
#[derive(Debug)]
pub struct MemoryConnection {
    open: AtomicBool,
    snapshot: Mutex<Option<MemoryStore>>,
}

/// In-process provider.
#[derive(Debug, Clone)]
pub struct MemoryProvider {
    data_source: String,
    database: String,
    style: ParameterStyle,
    encoding: TimestampEncoding,
    unsupported: HashSet<DbCommandType>,
    metadata_locked: bool,
    store: Arc<RwLock<MemoryStore>>,
    prepared: Arc<AtomicUsize>,
}

impl MemoryProvider {
    /// Creates an empty store named `data_source`.
    pub fn new(data_source: impl Into<String>) -> Self {
        Self {
            data_source: data_source.into(),
            database: "main".to_string(),
            style: ParameterStyle::At,
            encoding: TimestampEncoding::Integer,
            unsupported: HashSet::new(),
            metadata_locked: false,
            store: Arc::new(RwLock::new(MemoryStore {
                tables: Vec::new(),
                relations: Vec::new(),
                unique: Vec::new(),
                blobs: HashMap::new(),
                clock: 0,
                constraints_enabled: true,
            })),
            prepared: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Sets the parameter naming style.
    pub fn with_parameter_style(mut self, style: ParameterStyle) -> Self {
        self.style = style;
        self
    }

    /// Sets the shape timestamps are exchanged in.
    pub fn with_timestamp_encoding(mut self, encoding: TimestampEncoding) -> Self {
        self.encoding = encoding;
        self
    }

    /// Makes `create_command` return nothing for a command type.
    pub fn without_command(mut self, command_type: DbCommandType) -> Self {
        self.unsupported.insert(command_type);
        self
    }

    /// Makes every tombstone purge fail.
    pub fn with_locked_metadata(mut self) -> Self {
        self.metadata_locked = true;
        self
    }

    /// Creates a table.
    pub fn with_table(self, table: SyncTable) -> Self {
        {
            let mut store = self.store.write();
            if store.table_index(&table.full_name()).is_none() {
                store.tables.push(MemoryTable {
                    schema: table,
                    rows: BTreeMap::new(),
                    tracked: false,
                });
            }
        }
        self
    }

    /// Adds a single-column unique constraint.
    pub fn with_unique(self, table: impl Into<String>, column: impl Into<String>) -> Self {
        self.store.write().unique.push((table.into(), column.into()));
        self
    }

    /// Adds a foreign key.
    pub fn with_relation(self, relation: SyncRelation) -> Self {
        self.store.write().relations.push(relation);
        self
    }

    /// Inserts a row as a local write. Values follow the table's column
    /// order.
    pub fn insert(&self, table: &str, values: Vec<SyncValue>) -> ProviderResult<()> {
        self.local_write(table, values, true)
    }

    /// Inserts or replaces a row as a local write.
    pub fn upsert(&self, table: &str, values: Vec<SyncValue>) -> ProviderResult<()> {
        self.local_write(table, values, false)
    }

    /// Deletes a row by primary key as a local write.
    pub fn delete(&self, table: &str, key: &[SyncValue]) -> ProviderResult<bool> {
        let mut store = self.store.write();
        let index = store
            .table_index(table)
            .ok_or_else(|| ProviderError::new(ERROR, format!("no such table: {table}")))?;
        let key = key_from_parts(key);
        let Some(values) = store.tables[index]
            .rows
            .get(&key)
            .filter(|r| !r.tombstone)
            .map(|r| r.values.clone())
        else {
            return Ok(false);
        };
        store.check_delete(index, &values)?;
        let timestamp = store.tick();
        if let Some(row) = store.tables[index].rows.get_mut(&key) {
            row.tombstone = true;
            row.timestamp = timestamp;
            row.update_scope_id = None;
        }
        Ok(true)
    }

    /// Live rows of a table in key order.
    pub fn rows(&self, table: &str) -> Vec<Vec<SyncValue>> {
        let store = self.store.read();
        store
            .table(table)
            .map(|t| t.live_rows().map(|r| r.values.clone()).collect())
            .unwrap_or_default()
    }

    /// A live row by primary key.
    pub fn row(&self, table: &str, key: &[SyncValue]) -> Option<Vec<SyncValue>> {
        let store = self.store.read();
        let table = store.table(table).ok()?;
        table
            .rows
            .get(&key_from_parts(key))
            .filter(|r| !r.tombstone)
            .map(|r| r.values.clone())
    }

    /// Number of live rows.
    pub fn row_count(&self, table: &str) -> usize {
        let store = self.store.read();
        store
            .table(table)
            .map(|t| t.live_rows().count())
            .unwrap_or(0)
    }

    /// Number of tombstones.
    pub fn tombstone_count(&self, table: &str) -> usize {
        let store = self.store.read();
        store
            .table(table)
            .map(|t| t.rows.values().filter(|r| r.tombstone).count())
            .unwrap_or(0)
    }

    /// Returns true if the table exists.
    pub fn has_table(&self, table: &str) -> bool {
        self.store.read().table_index(table).is_some()
    }

    /// Returns true if the table's change tracking is provisioned.
    pub fn is_tracked(&self, table: &str) -> bool {
        self.store
            .read()
            .table(table)
            .map(|t| t.tracked)
            .unwrap_or(false)
    }

    /// Number of `prepare` calls served.
    pub fn prepare_count(&self) -> usize {
        self.prepared.load(Ordering::SeqCst)
    }

    /// Current logical clock.
    pub fn clock(&self) -> u64 {
        self.store.read().clock
    }

    fn local_write(&self, table: &str, values: Vec<SyncValue>, insert_only: bool) -> ProviderResult<()> {
        let mut store = self.store.write();
        let index = store
            .table_index(table)
            .ok_or_else(|| ProviderError::new(ERROR, format!("no such table: {table}")))?;
        let schema = &store.tables[index].schema;
        if values.len() != schema.columns.len() {
            return Err(ProviderError::new(
                ERROR,
                format!(
                    "table {} has {} columns but {} values were supplied",
                    schema.full_name(),
                    schema.columns.len(),
                    values.len()
                ),
            ));
        }
        let values = values
            .iter()
            .zip(&schema.columns)
            .map(|(v, c)| {
                v.coerce(c.data_type)
                    .map_err(|e| ProviderError::new(MISMATCH, e.to_string()))
            })
            .collect::<ProviderResult<Vec<_>>>()?;
        let key = store.tables[index].key_of(&values);
        let exists = store.tables[index]
            .rows
            .get(&key)
            .is_some_and(|r| !r.tombstone);
        if insert_only && exists {
            return Err(primary_key_violation(&store.tables[index].schema));
        }
        store.check_write(index, &key, &values)?;
        let timestamp = store.tick();
        store.tables[index].rows.insert(
            key,
            StoredRow {
                values,
                timestamp,
                tombstone: false,
                update_scope_id: None,
            },
        );
        Ok(())
    }

    fn record(&self, schema: &SyncTable, row: &StoredRow) -> ProviderResult<DbRecord> {
        let mut record = DbRecord::new();
        for (column, value) in schema.columns.iter().zip(&row.values) {
            record = record.with(column.name.clone(), value.clone());
        }
        Ok(record
            .with(
                SYNC_TIMESTAMP,
                Timestamp::new(row.timestamp)
                    .encode(self.encoding)
                    .map_err(|e| ProviderError::new(MISMATCH, e.to_string()))?,
            )
            .with(SYNC_ROW_IS_TOMBSTONE, SyncValue::Bool(row.tombstone))
            .with(
                SYNC_UPDATE_SCOPE_ID,
                row.update_scope_id
                    .clone()
                    .map(SyncValue::Text)
                    .unwrap_or_default(),
            ))
    }

    fn check_open(connection: &MemoryConnection) -> ProviderResult<()> {
        if connection.open.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ProviderError::new(ERROR, "connection is closed"))
        }
    }
}

fn key_from_parts(parts: &[SyncValue]) -> String {
    parts
        .iter()
        .map(SyncValue::key_fragment)
        .collect::<Vec<_>>()
        .join("|")
}

fn primary_key_violation(schema: &SyncTable) -> ProviderError {
    ProviderError::new(
        PRIMARY_KEY_VIOLATION,
        format!("UNIQUE constraint failed: {} primary key", schema.full_name()),
    )
}

fn read_timestamp(value: &SyncValue) -> ProviderResult<u64> {
    RawTimestamp::try_from(value)
        .and_then(|raw| Timestamp::parse(&raw))
        .map(Timestamp::value)
        .map_err(|e| ProviderError::new(MISMATCH, e.to_string()))
}

/// Column / parameter pairs of a filtered select, encoded in the command
/// text after ` where `.
fn filter_clause(text: &str) -> Vec<(String, String)> {
    text.split_once(" where ")
        .map(|(_, clause)| {
            clause
                .split(" and ")
                .filter_map(|pair| pair.split_once(" = "))
                .map(|(c, p)| (c.trim().to_string(), p.trim().to_string()))
                .collect()
        })
        .unwrap_or_default()
}

impl SyncProvider for MemoryProvider {
    type Connection = MemoryConnection;

    fn provider_name(&self) -> &str {
        "memory"
    }

    fn open(&self) -> ProviderResult<MemoryConnection> {
        Ok(MemoryConnection {
            open: AtomicBool::new(true),
            snapshot: Mutex::new(None),
        })
    }

    fn close(&self, connection: &MemoryConnection) -> ProviderResult<()> {
        if connection.snapshot.lock().is_some() {
            self.rollback(connection)?;
        }
        connection.open.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn connection_state(&self, connection: &MemoryConnection) -> ConnectionState {
        if connection.open.load(Ordering::SeqCst) {
            ConnectionState::Open
        } else {
            ConnectionState::Closed
        }
    }

    fn data_source(&self, _connection: &MemoryConnection) -> String {
        self.data_source.clone()
    }

    fn database(&self, _connection: &MemoryConnection) -> String {
        self.database.clone()
    }

    fn begin_transaction(&self, connection: &MemoryConnection) -> ProviderResult<()> {
        Self::check_open(connection)?;
        let mut snapshot = connection.snapshot.lock();
        if snapshot.is_some() {
            return Err(ProviderError::new(
                ERROR,
                "cannot start a transaction within a transaction",
            ));
        }
        *snapshot = Some(self.store.read().clone());
        Ok(())
    }

    fn commit(&self, connection: &MemoryConnection) -> ProviderResult<()> {
        match connection.snapshot.lock().take() {
            Some(_) => Ok(()),
            None => Err(ProviderError::new(ERROR, "no transaction is active")),
        }
    }

    fn rollback(&self, connection: &MemoryConnection) -> ProviderResult<()> {
        match connection.snapshot.lock().take() {
            Some(saved) => {
                *self.store.write() = saved;
                Ok(())
            }
            None => Err(ProviderError::new(ERROR, "no transaction is active")),
        }
    }

    fn create_command(
        &self,
        table: &SyncTable,
        command_type: DbCommandType,
        filter: Option<&SyncFilter>,
    ) -> Option<DbCommand> {
        if self.unsupported.contains(&command_type) {
            return None;
        }
        if command_type.is_filtered() && filter.is_none() {
            return None;
        }
        let store = self.store.read();
        let stored = store.table(&table.full_name()).ok()?;
        let name = stored.schema.full_name();

        let mut text = format!("{command_type} {name}");
        if let (true, Some(filter)) = (command_type.is_filtered(), filter) {
            let clause: Vec<String> = filter
                .parameters
                .iter()
                .map(|p| format!("{} = {}", p.column, self.style.decorate(&p.name)))
                .collect();
            if !clause.is_empty() {
                text = format!("{text} where {}", clause.join(" and "));
            }
        }

        let mut command = DbCommand::new(command_type, name, text);
        let columns: Vec<_> = match command_type.column_binding() {
            ColumnBinding::None => Vec::new(),
            ColumnBinding::PrimaryKeys => table
                .primary_keys
                .iter()
                .filter_map(|k| table.column(k))
                .collect(),
            ColumnBinding::All => table.columns.iter().filter(|c| !c.is_read_only).collect(),
        };
        for column in columns {
            command.parameters.push(DbParameter::input(
                self.style.decorate(&column.name),
                column.data_type,
            ));
        }
        Some(command)
    }

    fn prepare(&self, connection: &MemoryConnection, command: &mut DbCommand) -> ProviderResult<()> {
        Self::check_open(connection)?;
        self.store.read().table(&command.table)?;
        self.prepared.fetch_add(1, Ordering::SeqCst);
        trace!(data_source = %self.data_source, command = %command.text, "prepared");
        Ok(())
    }

    fn execute_non_query(
        &self,
        connection: &MemoryConnection,
        command: &mut DbCommand,
    ) -> ProviderResult<()> {
        Self::check_open(connection)?;
        let mut store = self.store.write();
        let index = store
            .table_index(&command.table)
            .ok_or_else(|| ProviderError::new(ERROR, format!("no such table: {}", command.table)))?;

        let affected = match command.command_type {
            DbCommandType::Reset => {
                let count = store.tables[index].rows.len();
                store.tables[index].rows.clear();
                count
            }
            DbCommandType::DisableConstraints => {
                store.constraints_enabled = false;
                0
            }
            DbCommandType::EnableConstraints => {
                store.constraints_enabled = true;
                0
            }
            DbCommandType::InsertRow | DbCommandType::UpdateRow | DbCommandType::DeleteRow => {
                let schema = store.tables[index].schema.clone();
                let key_values: Vec<SyncValue> = schema
                    .primary_keys
                    .iter()
                    .map(|k| command.value(k))
                    .collect();
                let key = key_from_parts(&key_values);
                let scope_id = command.value(SYNC_SCOPE_ID).as_str().map(str::to_string);
                let existing = store.tables[index].rows.get(&key).cloned();

                let writable = |row: &StoredRow| -> ProviderResult<bool> {
                    let force = command.value(SYNC_FORCE_WRITE).as_bool().unwrap_or(false);
                    let min = read_timestamp(&command.value(SYNC_MIN_TIMESTAMP))?;
                    Ok(force
                        || row.timestamp <= min
                        || (scope_id.is_some() && row.update_scope_id == scope_id))
                };

                match command.command_type {
                    DbCommandType::DeleteRow => match existing {
                        None => 1,
                        Some(row) if row.tombstone => 1,
                        Some(row) => {
                            if writable(&row)? {
                                store.check_delete(index, &row.values)?;
                                let timestamp = store.tick();
                                if let Some(stored) = store.tables[index].rows.get_mut(&key) {
                                    stored.tombstone = true;
                                    stored.timestamp = timestamp;
                                    stored.update_scope_id = scope_id;
                                }
                                1
                            } else {
                                0
                            }
                        }
                    },
                    other => {
                        let apply = match &existing {
                            Some(row) if other == DbCommandType::InsertRow && !row.tombstone => {
                                return Err(primary_key_violation(&schema));
                            }
                            None => true,
                            Some(_) if other == DbCommandType::InsertRow => true,
                            Some(row) => writable(row)?,
                        };
                        if apply {
                            let values: Vec<SyncValue> = schema
                                .columns
                                .iter()
                                .enumerate()
                                .map(|(i, c)| match command.parameter(&c.name) {
                                    Some(p) => p.value.clone(),
                                    None => existing
                                        .as_ref()
                                        .and_then(|r| r.values.get(i).cloned())
                                        .unwrap_or_default(),
                                })
                                .collect();
                            store.check_write(index, &key, &values)?;
                            let timestamp = store.tick();
                            store.tables[index].rows.insert(
                                key,
                                StoredRow {
                                    values,
                                    timestamp,
                                    tombstone: false,
                                    update_scope_id: scope_id,
                                },
                            );
                            1
                        } else {
                            0
                        }
                    }
                }
            }
            other => {
                return Err(ProviderError::new(
                    ERROR,
                    format!("{other} does not modify rows"),
                ))
            }
        };

        if let Some(count) = command.parameter_mut(SYNC_ROW_COUNT) {
            count.value = SyncValue::Integer(affected as i64);
        }
        Ok(())
    }

    fn execute_reader(
        &self,
        connection: &MemoryConnection,
        command: &DbCommand,
    ) -> ProviderResult<Vec<DbRecord>> {
        Self::check_open(connection)?;
        let store = self.store.read();
        let table = store.table(&command.table)?;

        match command.command_type {
            DbCommandType::SelectRow => {
                let key: Vec<SyncValue> = table
                    .schema
                    .primary_keys
                    .iter()
                    .map(|k| command.value(k))
                    .collect();
                match table.rows.get(&key_from_parts(&key)) {
                    Some(row) => Ok(vec![self.record(&table.schema, row)?]),
                    None => Ok(Vec::new()),
                }
            }
            DbCommandType::SelectChanges
            | DbCommandType::SelectChangesWithFilters
            | DbCommandType::SelectInitializedChanges
            | DbCommandType::SelectInitializedChangesWithFilters => {
                if !table.tracked {
                    return Err(ProviderError::new(
                        ERROR,
                        format!("no such table: {}_tracking", table.schema.full_name()),
                    ));
                }
                let initialized = matches!(
                    command.command_type,
                    DbCommandType::SelectInitializedChanges
                        | DbCommandType::SelectInitializedChangesWithFilters
                );
                let min = read_timestamp(&command.value(SYNC_MIN_TIMESTAMP))?;
                let exclude = command.value(SYNC_SCOPE_ID).as_str().map(str::to_string);
                let filters: Vec<(usize, SyncValue)> = filter_clause(&command.text)
                    .into_iter()
                    .filter_map(|(column, parameter)| {
                        let value = command.value(&parameter);
                        if value.is_null() {
                            return None;
                        }
                        table.schema.column_index(&column).map(|i| (i, value))
                    })
                    .collect();

                table
                    .rows
                    .values()
                    .filter(|r| {
                        if initialized {
                            !r.tombstone
                        } else {
                            r.timestamp > min
                        }
                    })
                    .filter(|r| exclude.is_none() || r.update_scope_id != exclude)
                    .filter(|r| filters.iter().all(|(i, v)| r.values.get(*i) == Some(v)))
                    .map(|r| self.record(&table.schema, r))
                    .collect()
            }
            other => Err(ProviderError::new(
                ERROR,
                format!("{other} does not return rows"),
            )),
        }
    }

    fn is_primary_key_violation(&self, error: &ProviderError) -> bool {
        error.code == PRIMARY_KEY_VIOLATION
    }

    fn is_unique_key_violation(&self, error: &ProviderError) -> bool {
        error.code == UNIQUE_VIOLATION
    }

    fn get_table_schema(
        &self,
        connection: &MemoryConnection,
        table: &SetupTable,
    ) -> ProviderResult<Option<SyncTable>> {
        Self::check_open(connection)?;
        let store = self.store.read();
        Ok(store.table(&table.full_name()).ok().map(|t| {
            let mut schema = t.schema.clone();
            schema.direction = table.direction;
            schema
        }))
    }

    fn get_relations(
        &self,
        connection: &MemoryConnection,
        tables: &[SyncTable],
    ) -> ProviderResult<Vec<SyncRelation>> {
        Self::check_open(connection)?;
        let store = self.store.read();
        let known = |name: &str| tables.iter().any(|t| t.matches_name(name));
        Ok(store
            .relations
            .iter()
            .filter(|r| known(&r.parent_table) && known(&r.child_table))
            .cloned()
            .collect())
    }

    fn create_table(&self, connection: &MemoryConnection, table: &SyncTable) -> ProviderResult<()> {
        Self::check_open(connection)?;
        let mut store = self.store.write();
        if store.table_index(&table.full_name()).is_none() {
            store.tables.push(MemoryTable {
                schema: table.clone(),
                rows: BTreeMap::new(),
                tracked: false,
            });
        }
        Ok(())
    }

    fn provision(&self, connection: &MemoryConnection, table: &SyncTable) -> ProviderResult<()> {
        Self::check_open(connection)?;
        let mut store = self.store.write();
        let index = store
            .table_index(&table.full_name())
            .ok_or_else(|| ProviderError::new(ERROR, format!("no such table: {}", table.full_name())))?;
        store.tables[index].tracked = true;
        Ok(())
    }

    fn deprovision(&self, connection: &MemoryConnection, table: &SyncTable) -> ProviderResult<()> {
        Self::check_open(connection)?;
        let mut store = self.store.write();
        if let Some(index) = store.table_index(&table.full_name()) {
            store.tables[index].tracked = false;
            store.tables[index].rows.retain(|_, r| !r.tombstone);
        }
        Ok(())
    }

    fn load_scope_blob(
        &self,
        connection: &MemoryConnection,
        key: &str,
    ) -> ProviderResult<Option<Vec<u8>>> {
        Self::check_open(connection)?;
        Ok(self.store.read().blobs.get(key).cloned())
    }

    fn save_scope_blob(
        &self,
        connection: &MemoryConnection,
        key: &str,
        blob: Vec<u8>,
    ) -> ProviderResult<()> {
        Self::check_open(connection)?;
        self.store.write().blobs.insert(key.to_string(), blob);
        Ok(())
    }

    fn get_local_timestamp(&self, connection: &MemoryConnection) -> ProviderResult<SyncValue> {
        Self::check_open(connection)?;
        Timestamp::new(self.store.read().clock)
            .encode(self.encoding)
            .map_err(|e| ProviderError::new(MISMATCH, e.to_string()))
    }

    fn delete_metadata(
        &self,
        connection: &MemoryConnection,
        table: &SyncTable,
        up_to: Timestamp,
    ) -> ProviderResult<usize> {
        Self::check_open(connection)?;
        if self.metadata_locked {
            return Err(ProviderError::new(ERROR, "database is locked"));
        }
        let mut store = self.store.write();
        let Some(index) = store.table_index(&table.full_name()) else {
            return Ok(0);
        };
        let rows = &mut store.tables[index].rows;
        let before = rows.len();
        rows.retain(|_, r| !(r.tombstone && r.timestamp <= up_to.value()));
        Ok(before - rows.len())
    }

    fn timestamp_encoding(&self) -> TimestampEncoding {
        self.encoding
    }

    fn parameter_name(&self, name: &str) -> String {
        self.style.decorate(name)
    }
}
