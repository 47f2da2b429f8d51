//! Per-table command execution.
//!
//! A [`SyncAdapter`] binds one table to a provider. It asks the provider for
//! commands, declares their parameters, prepares each command once per
//! connection target, binds row values and applies rows one at a time,
//! sorting failures into conflicts and constraint violations.

use crate::cache::{CommandCache, CommandCacheKey};
use crate::error::{Result, SyncError};
use crate::provider::{
    parameter_name_candidates, ColumnBinding, ConnectionState, DbCommand, DbCommandType,
    DbParameter, DbRecord, ParameterDirection, ProviderError, SyncProvider, SYNC_FORCE_WRITE,
    SYNC_MIN_TIMESTAMP, SYNC_ROW_COUNT, SYNC_ROW_IS_TOMBSTONE, SYNC_SCOPE_ID, SYNC_TIMESTAMP,
};
use std::sync::Arc;
use tidesync_protocol::{
    ChangesTable, ChangesTableBuilder, DataType, ProtocolError, RawTimestamp, SyncFilter,
    SyncParameters, SyncRow, SyncTable, SyncValue, Timestamp, TimestampEncoding, TimestampError,
};
use tracing::{debug, warn};
use uuid::Uuid;

/// Why a row was not applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    /// The timestamp check refused the row.
    Conflict,
    /// The store already holds the key.
    PrimaryKeyViolation,
    /// Another row holds a unique value.
    UniqueKeyViolation,
}

/// A row that was not applied.
#[derive(Debug, Clone, PartialEq)]
pub struct FailedRow {
    /// The row, in changes-table shape.
    pub row: SyncRow,
    /// Why it failed.
    pub reason: FailureReason,
    /// Provider message for constraint violations.
    pub message: Option<String>,
}

/// Executes sync commands against one table.
pub struct SyncAdapter<P: SyncProvider> {
    provider: Arc<P>,
    table: SyncTable,
    changes_table: SyncTable,
    cache: Arc<CommandCache>,
}

impl<P: SyncProvider> SyncAdapter<P> {
    /// Creates an adapter. Fails if the table has no primary key.
    pub fn new(provider: Arc<P>, table: SyncTable, cache: Arc<CommandCache>) -> Result<Self> {
        let changes_table = ChangesTableBuilder::new(&table).build()?;
        Ok(Self {
            provider,
            table,
            changes_table,
            cache,
        })
    }

    /// Full table schema.
    pub fn table(&self) -> &SyncTable {
        &self.table
    }

    /// Changes projection of the table.
    pub fn changes_table(&self) -> &SyncTable {
        &self.changes_table
    }

    /// Fetches a command from the provider.
    pub fn get_command(
        &self,
        command_type: DbCommandType,
        filter: Option<&SyncFilter>,
    ) -> Result<DbCommand> {
        self.provider
            .create_command(&self.table, command_type, filter)
            .ok_or_else(|| SyncError::MissingCommand {
                table: self.table.full_name(),
                command_type,
            })
    }

    /// Declares the parameters a command needs. Parameters the provider
    /// already declared are left alone.
    pub fn add_command_parameters(
        &self,
        command_type: DbCommandType,
        command: &mut DbCommand,
        filter: Option<&SyncFilter>,
    ) {
        let columns: Vec<_> = match command_type.column_binding() {
            ColumnBinding::None => Vec::new(),
            ColumnBinding::PrimaryKeys => self
                .changes_table
                .columns
                .iter()
                .filter(|c| self.changes_table.is_primary_key(&c.name))
                .collect(),
            ColumnBinding::All => self.changes_table.columns.iter().collect(),
        };
        for column in columns {
            if command.parameter(&column.name).is_none() {
                command.parameters.push(DbParameter::input(
                    self.provider.parameter_name(&column.name),
                    column.data_type,
                ));
            }
        }

        for name in command_type.scope_parameters() {
            if command.parameter(name).is_some() {
                continue;
            }
            let decorated = self.provider.parameter_name(name);
            let parameter = match *name {
                SYNC_ROW_COUNT => DbParameter::output(decorated, DataType::Integer),
                SYNC_MIN_TIMESTAMP => {
                    DbParameter::input(decorated, timestamp_type(self.provider.timestamp_encoding()))
                }
                SYNC_SCOPE_ID => DbParameter::input(decorated, DataType::Text),
                _ => DbParameter::input(decorated, DataType::Boolean),
            };
            command.parameters.push(parameter);
        }

        if let (true, Some(filter)) = (command_type.is_filtered(), filter) {
            for parameter in &filter.parameters {
                if command.parameter(&parameter.name).is_none() {
                    command.parameters.push(DbParameter::input(
                        self.provider.parameter_name(&parameter.name),
                        parameter.data_type,
                    ));
                }
            }
        }
    }

    /// Returns a command ready to execute on `connection`.
    ///
    /// The provider prepares a command once per data source, database, table
    /// and command type; later calls reuse the cached preparation.
    pub fn prepare_command(
        &self,
        command_type: DbCommandType,
        connection: Option<&P::Connection>,
        filter: Option<&SyncFilter>,
    ) -> Result<DbCommand> {
        let connection = connection.ok_or(SyncError::MissingConnection)?;
        if self.provider.connection_state(connection) != ConnectionState::Open {
            return Err(SyncError::ConnectionClosed);
        }

        let mut command = self.get_command(command_type, filter)?;
        self.add_command_parameters(command_type, &mut command, filter);

        let key = CommandCacheKey {
            data_source: self.provider.data_source(connection),
            database: self.provider.database(connection),
            table: self.table.full_name(),
            command_type,
        };
        if self.cache.try_reserve(key.clone()) {
            if let Err(err) = self.provider.prepare(connection, &mut command) {
                self.cache.release(&key);
                return Err(err.into());
            }
            debug!(
                provider = self.provider.provider_name(),
                table = %key.table,
                command = %command_type,
                "prepared command"
            );
        }
        Ok(command)
    }

    /// Looks up a command parameter, ignoring name decorations.
    pub fn get_parameter<'a>(&self, command: &'a DbCommand, name: &str) -> Option<&'a DbParameter> {
        command.parameter(name)
    }

    /// Binds the column values of a row. Row values follow `changes_table`;
    /// columns the row lacks are bound to null. Resets the row count.
    pub fn set_column_parameters_values(
        &self,
        command: &mut DbCommand,
        row: &SyncRow,
        changes_table: &SyncTable,
    ) -> Result<()> {
        for parameter in command.parameters.iter_mut() {
            let [exact, stripped] = parameter_name_candidates(&parameter.name);
            if parameter.direction == ParameterDirection::Output {
                if stripped.eq_ignore_ascii_case(SYNC_ROW_COUNT)
                    || exact.eq_ignore_ascii_case(SYNC_ROW_COUNT)
                {
                    parameter.value = SyncValue::Null;
                }
                continue;
            }
            let column = changes_table
                .column_index(exact)
                .or_else(|| changes_table.column_index(stripped));
            if let Some(index) = column {
                let value = row.values.get(index).cloned().unwrap_or_default();
                parameter.value = value.coerce(parameter.data_type)?;
            }
        }
        Ok(())
    }

    /// Binds the scope parameters a command declared.
    pub fn add_scope_parameters_values(
        &self,
        command: &mut DbCommand,
        scope_id: Option<Uuid>,
        last_timestamp: Option<Timestamp>,
        is_deleted: bool,
        force_write: bool,
    ) -> Result<()> {
        if let Some(p) = command.parameter_mut(SYNC_SCOPE_ID) {
            p.value = scope_id
                .map(|id| SyncValue::Text(id.to_string()))
                .unwrap_or_default();
        }
        if let Some(p) = command.parameter_mut(SYNC_MIN_TIMESTAMP) {
            p.value = last_timestamp
                .map(|t| t.encode(self.provider.timestamp_encoding()))
                .transpose()?
                .unwrap_or_default();
        }
        if let Some(p) = command.parameter_mut(SYNC_FORCE_WRITE) {
            p.value = SyncValue::Bool(force_write);
        }
        if let Some(p) = command.parameter_mut(SYNC_ROW_IS_TOMBSTONE) {
            p.value = SyncValue::Bool(is_deleted);
        }
        Ok(())
    }

    /// Binds filter parameter values. Missing or null values are refused
    /// unless the filter parameter is optional.
    pub fn set_filter_parameters_values(
        &self,
        command: &mut DbCommand,
        filter: &SyncFilter,
        parameters: &SyncParameters,
    ) -> Result<()> {
        for fp in &filter.parameters {
            let value = parameters.get(&fp.name).cloned().unwrap_or_default();
            if value.is_null() && !fp.allow_null {
                return Err(SyncError::MissingParameter {
                    table: self.table.full_name(),
                    parameter: fp.name.clone(),
                });
            }
            let value = value.coerce(fp.data_type)?;
            if let Some(p) = command.parameter_mut(&fp.name) {
                p.value = value;
            }
        }
        Ok(())
    }

    /// Applies rows one at a time with a prepared insert, update or delete
    /// command. Returns the number of rows applied; rows the store refused
    /// are appended to `failed_rows`.
    #[allow(clippy::too_many_arguments)]
    pub fn execute_batch_command(
        &self,
        command: &mut DbCommand,
        sender_scope_id: Option<Uuid>,
        rows: &[SyncRow],
        changes_table: &SyncTable,
        failed_rows: &mut Vec<FailedRow>,
        last_timestamp: Option<Timestamp>,
        force_write: bool,
        connection: &P::Connection,
    ) -> Result<usize> {
        let mut applied = 0;
        for row in rows {
            self.set_column_parameters_values(command, row, changes_table)?;
            self.add_scope_parameters_values(
                command,
                sender_scope_id,
                last_timestamp,
                row.is_tombstone(),
                force_write,
            )?;

            match self.provider.execute_non_query(connection, command) {
                Ok(()) => {
                    let count = command.parameter(SYNC_ROW_COUNT).and_then(|p| p.value.as_i64());
                    if count == Some(0) {
                        failed_rows.push(FailedRow {
                            row: row.clone(),
                            reason: FailureReason::Conflict,
                            message: None,
                        });
                    } else {
                        applied += 1;
                    }
                }
                Err(err) if self.is_primary_key_violation(&err) => {
                    failed_rows.push(constraint_failure(row, FailureReason::PrimaryKeyViolation, err));
                }
                Err(err) if self.is_unique_key_violation(&err) => {
                    warn!(table = %self.table.full_name(), error = %err, "unique constraint refused row");
                    failed_rows.push(constraint_failure(row, FailureReason::UniqueKeyViolation, err));
                }
                Err(err) => return Err(SyncError::Provider(err)),
            }
        }
        Ok(applied)
    }

    /// Returns true if the provider reports a primary-key violation.
    pub fn is_primary_key_violation(&self, error: &ProviderError) -> bool {
        self.provider.is_primary_key_violation(error)
    }

    /// Returns true if the provider reports a unique-constraint violation.
    pub fn is_unique_key_violation(&self, error: &ProviderError) -> bool {
        self.provider.is_unique_key_violation(error)
    }

    /// Decodes a timestamp in any driver shape.
    pub fn parse_timestamp(raw: &RawTimestamp) -> std::result::Result<Timestamp, TimestampError> {
        Timestamp::parse(raw)
    }

    /// Reads changed rows.
    ///
    /// With `initialize`, every live row qualifies; otherwise rows changed
    /// after `since`. Rows last written by `exclude_scope_id` are skipped.
    pub fn select_changes(
        &self,
        connection: &P::Connection,
        filter: Option<&SyncFilter>,
        parameters: &SyncParameters,
        since: Option<Timestamp>,
        exclude_scope_id: Option<Uuid>,
        initialize: bool,
    ) -> Result<ChangesTable> {
        let command_type = match (initialize, filter.is_some()) {
            (true, true) => DbCommandType::SelectInitializedChangesWithFilters,
            (true, false) => DbCommandType::SelectInitializedChanges,
            (false, true) => DbCommandType::SelectChangesWithFilters,
            (false, false) => DbCommandType::SelectChanges,
        };
        let mut command = self.prepare_command(command_type, Some(connection), filter)?;
        self.add_scope_parameters_values(&mut command, exclude_scope_id, since, false, false)?;
        if let Some(filter) = filter {
            self.set_filter_parameters_values(&mut command, filter, parameters)?;
        }

        let records = self.provider.execute_reader(connection, &command)?;
        let mut changes = ChangesTable::new(self.changes_table.clone());
        for record in &records {
            changes.push(self.read_row(record)?)?;
        }
        Ok(changes)
    }

    /// Reads the stored version of a row by primary key, tombstones
    /// included.
    pub fn select_row(&self, connection: &P::Connection, row: &SyncRow) -> Result<Option<SyncRow>> {
        let mut command = self.prepare_command(DbCommandType::SelectRow, Some(connection), None)?;
        self.set_column_parameters_values(&mut command, row, &self.changes_table)?;
        let records = self.provider.execute_reader(connection, &command)?;
        records.first().map(|r| self.read_row(r)).transpose()
    }

    /// Removes every row of the table.
    pub fn reset_table(&self, connection: &P::Connection) -> Result<()> {
        self.execute_simple(DbCommandType::Reset, connection)
    }

    /// Disables constraint checking.
    pub fn disable_constraints(&self, connection: &P::Connection) -> Result<()> {
        self.execute_simple(DbCommandType::DisableConstraints, connection)
    }

    /// Re-enables constraint checking.
    pub fn enable_constraints(&self, connection: &P::Connection) -> Result<()> {
        self.execute_simple(DbCommandType::EnableConstraints, connection)
    }

    fn execute_simple(&self, command_type: DbCommandType, connection: &P::Connection) -> Result<()> {
        let mut command = self.prepare_command(command_type, Some(connection), None)?;
        self.provider.execute_non_query(connection, &mut command)?;
        Ok(())
    }

    fn read_row(&self, record: &DbRecord) -> Result<SyncRow> {
        let values = self
            .changes_table
            .columns
            .iter()
            .map(|c| {
                record
                    .get(&c.name)
                    .cloned()
                    .unwrap_or_default()
                    .coerce(c.data_type)
            })
            .collect::<std::result::Result<Vec<_>, ProtocolError>>()?;

        let tombstone = match record.get(SYNC_ROW_IS_TOMBSTONE) {
            Some(SyncValue::Bool(b)) => *b,
            Some(SyncValue::Integer(i)) => *i != 0,
            _ => false,
        };
        let raw = match record.get(SYNC_TIMESTAMP) {
            Some(value) => RawTimestamp::try_from(value)?,
            None => RawTimestamp::Null,
        };
        let timestamp = Self::parse_timestamp(&raw)?;

        let row = if tombstone {
            SyncRow::deleted(values)
        } else {
            SyncRow::modified(values)
        };
        Ok(row.with_timestamp(timestamp))
    }
}

fn timestamp_type(encoding: TimestampEncoding) -> DataType {
    match encoding {
        TimestampEncoding::Integer => DataType::Integer,
        TimestampEncoding::HexString => DataType::Text,
        TimestampEncoding::Bytes => DataType::Bytes,
    }
}

fn constraint_failure(row: &SyncRow, reason: FailureReason, err: ProviderError) -> FailedRow {
    FailedRow {
        row: row.clone(),
        reason,
        message: Some(err.message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryProvider, ParameterStyle};
    use tidesync_protocol::{FilterParameter, SyncColumn};

    fn product() -> SyncTable {
        SyncTable::new("Product")
            .with_column(SyncColumn::new("id", DataType::Integer))
            .with_column(SyncColumn::new("name", DataType::Text))
            .with_column(SyncColumn::new("total", DataType::Float).read_only().nullable())
            .with_primary_key("id")
    }

    fn setup(style: ParameterStyle) -> (MemoryProvider, SyncAdapter<MemoryProvider>) {
        let provider = MemoryProvider::new("mem")
            .with_parameter_style(style)
            .with_table(product());
        let adapter = SyncAdapter::new(
            Arc::new(provider.clone()),
            product(),
            Arc::new(CommandCache::new()),
        )
        .unwrap();
        (provider, adapter)
    }

    fn tracked(provider: &MemoryProvider) -> <MemoryProvider as SyncProvider>::Connection {
        let conn = provider.open().unwrap();
        provider.provision(&conn, &product()).unwrap();
        conn
    }

    fn row(id: i64, name: &str) -> SyncRow {
        SyncRow::modified(vec![id.into(), name.into()])
    }

    #[test]
    fn changes_table_drops_read_only_columns() {
        let (_, adapter) = setup(ParameterStyle::At);
        let names: Vec<_> = adapter
            .changes_table()
            .columns
            .iter()
            .map(|c| c.name.as_str())
            .collect();
        assert_eq!(names, vec!["id", "name"]);
    }

    #[test]
    fn table_without_primary_key_is_refused() {
        let provider = Arc::new(MemoryProvider::new("mem"));
        let table = SyncTable::new("Log").with_column(SyncColumn::new("line", DataType::Text));
        let err = SyncAdapter::new(provider, table, Arc::new(CommandCache::new()))
            .err()
            .unwrap();
        assert!(matches!(err, SyncError::MissingPrimaryKey { .. }));
    }

    #[test]
    fn connection_is_required() {
        let (provider, adapter) = setup(ParameterStyle::At);
        let err = adapter
            .prepare_command(DbCommandType::UpdateRow, None, None)
            .unwrap_err();
        assert!(matches!(err, SyncError::MissingConnection));

        let conn = provider.open().unwrap();
        provider.close(&conn).unwrap();
        let err = adapter
            .prepare_command(DbCommandType::UpdateRow, Some(&conn), None)
            .unwrap_err();
        assert!(matches!(err, SyncError::ConnectionClosed));
    }

    #[test]
    fn missing_command_is_reported() {
        let provider = MemoryProvider::new("mem")
            .with_table(product())
            .without_command(DbCommandType::Reset);
        let adapter =
            SyncAdapter::new(Arc::new(provider.clone()), product(), Arc::new(CommandCache::new()))
                .unwrap();
        let conn = provider.open().unwrap();
        let err = adapter.reset_table(&conn).unwrap_err();
        assert!(matches!(
            err,
            SyncError::MissingCommand {
                command_type: DbCommandType::Reset,
                ..
            }
        ));
    }

    #[test]
    fn commands_are_prepared_once() {
        let (provider, adapter) = setup(ParameterStyle::At);
        let conn = provider.open().unwrap();
        for _ in 0..3 {
            adapter
                .prepare_command(DbCommandType::UpdateRow, Some(&conn), None)
                .unwrap();
        }
        adapter
            .prepare_command(DbCommandType::DeleteRow, Some(&conn), None)
            .unwrap();
        assert_eq!(provider.prepare_count(), 2);
    }

    #[test]
    fn parameters_declared_once_per_name() {
        let (_, adapter) = setup(ParameterStyle::InPrefix);
        let mut command = adapter.get_command(DbCommandType::UpdateRow, None).unwrap();
        adapter.add_command_parameters(DbCommandType::UpdateRow, &mut command, None);
        adapter.add_command_parameters(DbCommandType::UpdateRow, &mut command, None);

        let names: Vec<_> = command.parameters.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "in_id",
                "in_name",
                "in_sync_min_timestamp",
                "in_sync_scope_id",
                "in_sync_force_write",
                "in_sync_row_is_tombstone",
                "in_sync_row_count",
            ]
        );
        assert_eq!(
            adapter
                .get_parameter(&command, "sync_row_count")
                .map(|p| p.direction),
            Some(ParameterDirection::Output)
        );
    }

    #[test]
    fn missing_values_bind_null() {
        let (_, adapter) = setup(ParameterStyle::Colon);
        let mut command = adapter.get_command(DbCommandType::UpdateRow, None).unwrap();
        adapter.add_command_parameters(DbCommandType::UpdateRow, &mut command, None);
        command.parameter_mut("sync_row_count").unwrap().value = 1.into();

        let short = SyncRow::modified(vec!["5".into()]);
        adapter
            .set_column_parameters_values(&mut command, &short, adapter.changes_table())
            .unwrap();
        assert_eq!(command.value(":id"), SyncValue::Integer(5));
        assert_eq!(command.value(":name"), SyncValue::Null);
        assert_eq!(command.value("sync_row_count"), SyncValue::Null);
    }

    #[test]
    fn prefixed_columns_are_bound_in_every_style() {
        let stock = SyncTable::new("Stock")
            .with_column(SyncColumn::new("id", DataType::Integer))
            .with_column(SyncColumn::new("in_stock", DataType::Integer))
            .with_primary_key("id");
        for style in [
            ParameterStyle::At,
            ParameterStyle::Colon,
            ParameterStyle::InPrefix,
            ParameterStyle::Bare,
        ] {
            let provider = MemoryProvider::new("mem")
                .with_parameter_style(style)
                .with_table(stock.clone());
            let adapter =
                SyncAdapter::new(Arc::new(provider.clone()), stock.clone(), Arc::new(CommandCache::new()))
                    .unwrap();
            let conn = provider.open().unwrap();
            provider.provision(&conn, &stock).unwrap();

            let mut insert = adapter
                .prepare_command(DbCommandType::InsertRow, Some(&conn), None)
                .unwrap();
            let mut failed = Vec::new();
            let applied = adapter
                .execute_batch_command(
                    &mut insert,
                    None,
                    &[SyncRow::modified(vec![1.into(), 7.into()])],
                    adapter.changes_table(),
                    &mut failed,
                    None,
                    false,
                    &conn,
                )
                .unwrap();
            assert_eq!(applied, 1);
            assert_eq!(
                provider.row("Stock", &[1.into()]).unwrap()[1],
                SyncValue::Integer(7)
            );
        }
    }

    #[test]
    fn scope_values_follow_timestamp_encoding() {
        let provider = MemoryProvider::new("mem")
            .with_table(product())
            .with_timestamp_encoding(TimestampEncoding::HexString);
        let adapter =
            SyncAdapter::new(Arc::new(provider), product(), Arc::new(CommandCache::new())).unwrap();
        let mut command = adapter.get_command(DbCommandType::DeleteRow, None).unwrap();
        adapter.add_command_parameters(DbCommandType::DeleteRow, &mut command, None);

        let id = Uuid::new_v4();
        adapter
            .add_scope_parameters_values(&mut command, Some(id), Some(Timestamp::new(255)), true, false)
            .unwrap();
        assert_eq!(command.value(SYNC_MIN_TIMESTAMP), SyncValue::Text("FF".into()));
        assert_eq!(command.value(SYNC_SCOPE_ID), SyncValue::Text(id.to_string()));
        assert_eq!(command.value(SYNC_ROW_IS_TOMBSTONE), SyncValue::Bool(true));
        assert_eq!(command.value(SYNC_FORCE_WRITE), SyncValue::Bool(false));
    }

    #[test]
    fn batch_sorts_failures() {
        let (provider, adapter) = setup(ParameterStyle::At);
        let conn = tracked(&provider);
        provider.insert("Product", vec![1.into(), "Lamp".into(), SyncValue::Null]).unwrap();

        let mut insert = adapter
            .prepare_command(DbCommandType::InsertRow, Some(&conn), None)
            .unwrap();
        let mut failed = Vec::new();
        let applied = adapter
            .execute_batch_command(
                &mut insert,
                None,
                &[row(1, "Lamp"), row(2, "Desk")],
                adapter.changes_table(),
                &mut failed,
                None,
                false,
                &conn,
            )
            .unwrap();
        assert_eq!(applied, 1);
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].reason, FailureReason::PrimaryKeyViolation);

        // Row 1 changed locally after watermark 0: the update conflicts.
        let mut update = adapter
            .prepare_command(DbCommandType::UpdateRow, Some(&conn), None)
            .unwrap();
        let mut failed = Vec::new();
        let applied = adapter
            .execute_batch_command(
                &mut update,
                Some(Uuid::new_v4()),
                &[row(1, "Floor lamp")],
                adapter.changes_table(),
                &mut failed,
                Some(Timestamp::ZERO),
                false,
                &conn,
            )
            .unwrap();
        assert_eq!(applied, 0);
        assert_eq!(failed[0].reason, FailureReason::Conflict);

        let mut failed = Vec::new();
        let applied = adapter
            .execute_batch_command(
                &mut update,
                Some(Uuid::new_v4()),
                &[row(1, "Floor lamp")],
                adapter.changes_table(),
                &mut failed,
                Some(Timestamp::ZERO),
                true,
                &conn,
            )
            .unwrap();
        assert_eq!(applied, 1);
        assert!(failed.is_empty());
        assert_eq!(
            provider.row("Product", &[1.into()]).unwrap()[1],
            SyncValue::from("Floor lamp")
        );
    }

    #[test]
    fn select_changes_excludes_the_sender() {
        let (provider, adapter) = setup(ParameterStyle::At);
        let conn = tracked(&provider);
        provider.insert("Product", vec![1.into(), "Lamp".into(), SyncValue::Null]).unwrap();

        let sender = Uuid::new_v4();
        let mut update = adapter
            .prepare_command(DbCommandType::UpdateRow, Some(&conn), None)
            .unwrap();
        let mut failed = Vec::new();
        adapter
            .execute_batch_command(
                &mut update,
                Some(sender),
                &[row(2, "Desk")],
                adapter.changes_table(),
                &mut failed,
                None,
                false,
                &conn,
            )
            .unwrap();

        let params = SyncParameters::new();
        let all = adapter
            .select_changes(&conn, None, &params, None, None, false)
            .unwrap();
        assert_eq!(all.len(), 2);

        let others = adapter
            .select_changes(&conn, None, &params, None, Some(sender), false)
            .unwrap();
        assert_eq!(others.len(), 1);
        assert_eq!(others.rows[0].values[0], SyncValue::Integer(1));
        assert_eq!(others.rows[0].timestamp, Some(Timestamp::new(1)));

        let since = adapter
            .select_changes(&conn, None, &params, Some(Timestamp::new(1)), None, false)
            .unwrap();
        assert_eq!(since.len(), 1);
    }

    #[test]
    fn tombstones_and_initial_selects() {
        let (provider, adapter) = setup(ParameterStyle::At);
        let conn = tracked(&provider);
        provider.insert("Product", vec![1.into(), "Lamp".into(), SyncValue::Null]).unwrap();
        provider.insert("Product", vec![2.into(), "Desk".into(), SyncValue::Null]).unwrap();
        provider.delete("Product", &[1.into()]).unwrap();

        let params = SyncParameters::new();
        let changes = adapter
            .select_changes(&conn, None, &params, None, None, false)
            .unwrap();
        assert_eq!(changes.rows.iter().filter(|r| r.is_tombstone()).count(), 1);

        let initial = adapter
            .select_changes(&conn, None, &params, None, None, true)
            .unwrap();
        assert_eq!(initial.len(), 1);

        let stored = adapter.select_row(&conn, &row(1, "")).unwrap().unwrap();
        assert!(stored.is_tombstone());
        assert!(adapter.select_row(&conn, &row(3, "")).unwrap().is_none());
    }

    #[test]
    fn filtered_selects_need_their_parameters() {
        let table = SyncTable::new("Order")
            .with_column(SyncColumn::new("id", DataType::Integer))
            .with_column(SyncColumn::new("customer_id", DataType::Integer))
            .with_primary_key("id");
        let provider = MemoryProvider::new("mem").with_table(table.clone());
        let adapter = SyncAdapter::new(
            Arc::new(provider.clone()),
            table.clone(),
            Arc::new(CommandCache::new()),
        )
        .unwrap();
        let conn = provider.open().unwrap();
        provider.provision(&conn, &table).unwrap();
        provider.insert("Order", vec![1.into(), 10.into()]).unwrap();
        provider.insert("Order", vec![2.into(), 20.into()]).unwrap();

        let filter = SyncFilter::new("Order")
            .with_parameter(FilterParameter::new("customer_id", DataType::Integer));

        let err = adapter
            .select_changes(&conn, Some(&filter), &SyncParameters::new(), None, None, false)
            .unwrap_err();
        assert!(matches!(err, SyncError::MissingParameter { .. }));

        let params = SyncParameters::new().with("customer_id", "20");
        let changes = adapter
            .select_changes(&conn, Some(&filter), &params, None, None, true)
            .unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes.rows[0].values[0], SyncValue::Integer(2));
    }

    #[test]
    fn parse_timestamp_shapes() {
        type A = SyncAdapter<MemoryProvider>;
        assert_eq!(A::parse_timestamp(&RawTimestamp::Null), Ok(Timestamp::ZERO));
        assert_eq!(A::parse_timestamp(&RawTimestamp::from(42i64)), Ok(Timestamp::new(42)));
        assert_eq!(A::parse_timestamp(&RawTimestamp::from("0x2A")), Ok(Timestamp::new(42)));
        assert_eq!(
            A::parse_timestamp(&RawTimestamp::from(vec![0, 0, 0, 0, 0, 0, 0, 0x2A])),
            Ok(Timestamp::new(42))
        );
        assert!(A::parse_timestamp(&RawTimestamp::from("zz")).is_err());
    }
}
