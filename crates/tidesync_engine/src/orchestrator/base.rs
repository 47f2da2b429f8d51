//! Enumeration and apply shared by both sides of a round.

use super::ConflictResolver;
use crate::adapter::{FailedRow, FailureReason, SyncAdapter};
use crate::batch::{BatchInfo, BatchWriter};
use crate::cache::CommandCache;
use crate::config::SyncOptions;
use crate::error::{Result, SyncError};
use crate::provider::{DbCommandType, SyncProvider};
use crate::state::{ProgressReporter, SessionState, TableStats};
use std::collections::BTreeMap;
use std::sync::Arc;
use tidesync_protocol::{
    ConflictAction, ConflictKind, ConflictResolutionPolicy, RawTimestamp, RowConflict,
    SyncParameters, SyncRow, SyncSet, SyncSetup, SyncSide, SyncTable, Timestamp,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// How changes are read for a batch.
#[derive(Debug, Clone, Copy)]
pub struct EnumerateArgs<'a> {
    /// Side reading its changes; decides the direction check and whether
    /// filters apply.
    pub side: SyncSide,
    /// Watermark; `None` reads from the beginning.
    pub since: Option<Timestamp>,
    /// Rows last written by this scope are skipped.
    pub exclude_scope_id: Option<Uuid>,
    /// Filter values.
    pub parameters: &'a SyncParameters,
    /// Read every live row instead of changes.
    pub initialize: bool,
}

/// How a batch is applied.
#[derive(Debug, Clone, Copy)]
pub struct ApplyArgs {
    /// Side applying the batch.
    pub side: SyncSide,
    /// Scope id stamped on applied rows.
    pub sender_scope_id: Option<Uuid>,
    /// Watermark of the peer in this store's clock.
    pub last_timestamp: Option<Timestamp>,
    /// Apply modifications as plain inserts.
    pub use_insert: bool,
    /// Policy used when no resolver is installed.
    pub policy: ConflictResolutionPolicy,
}

/// Counts of an apply.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ApplyOutcome {
    /// Per-table counts; only `applied`, `resolved_conflicts` and `failed`
    /// are filled.
    pub per_table: BTreeMap<String, TableStats>,
}

impl ApplyOutcome {
    /// Rows applied.
    pub fn applied(&self) -> usize {
        self.per_table.values().map(|s| s.applied).sum()
    }

    /// Conflicts resolved.
    pub fn resolved_conflicts(&self) -> usize {
        self.per_table.values().map(|s| s.resolved_conflicts).sum()
    }

    /// Rows that could not be applied.
    pub fn failed(&self) -> usize {
        self.per_table.values().map(|s| s.failed).sum()
    }
}

/// Provider, options, command cache and resolver of an orchestrator.
pub struct BaseOrchestrator<P: SyncProvider> {
    provider: Arc<P>,
    options: SyncOptions,
    cache: Arc<CommandCache>,
    resolver: Option<ConflictResolver>,
}

impl<P: SyncProvider> BaseOrchestrator<P> {
    /// Creates the shared part of an orchestrator.
    pub fn new(provider: Arc<P>, options: SyncOptions) -> Self {
        Self {
            provider,
            options,
            cache: Arc::new(CommandCache::new()),
            resolver: None,
        }
    }

    /// Installs a conflict resolver.
    pub fn set_resolver(&mut self, resolver: ConflictResolver) {
        self.resolver = Some(resolver);
    }

    /// The provider.
    pub fn provider(&self) -> &Arc<P> {
        &self.provider
    }

    /// The options.
    pub fn options(&self) -> &SyncOptions {
        &self.options
    }

    /// The command cache shared by every adapter of this orchestrator.
    pub fn cache(&self) -> &Arc<CommandCache> {
        &self.cache
    }

    /// Creates an adapter for a table.
    pub fn adapter(&self, table: &SyncTable) -> Result<SyncAdapter<P>> {
        SyncAdapter::new(Arc::clone(&self.provider), table.clone(), Arc::clone(&self.cache))
    }

    /// Opens a connection.
    pub fn open(&self) -> Result<P::Connection> {
        Ok(self.provider.open()?)
    }

    /// Closes a connection, logging failures.
    pub fn close(&self, connection: &P::Connection) {
        if let Err(err) = self.provider.close(connection) {
            warn!(error = %err, "failed to close connection");
        }
    }

    /// Current change-tracking timestamp of the store.
    pub fn local_timestamp(&self, connection: &P::Connection) -> Result<Timestamp> {
        let value = self.provider.get_local_timestamp(connection)?;
        Ok(Timestamp::parse(&RawTimestamp::try_from(&value)?)?)
    }

    /// Runs `f` in a transaction, rolling back on error.
    pub fn in_transaction<T>(
        &self,
        connection: &P::Connection,
        f: impl FnOnce() -> Result<T>,
    ) -> Result<T> {
        self.provider.begin_transaction(connection)?;
        match f() {
            Ok(value) => {
                self.provider.commit(connection)?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback) = self.provider.rollback(connection) {
                    warn!(error = %rollback, "rollback failed");
                }
                Err(err)
            }
        }
    }

    /// Reads changed rows of every table into `writer`, in setup order.
    /// Returns the row count per table.
    pub fn enumerate_changes(
        &self,
        connection: &P::Connection,
        schema: &SyncSet,
        setup: &SyncSetup,
        args: EnumerateArgs<'_>,
        writer: &mut BatchWriter,
    ) -> Result<BTreeMap<String, usize>> {
        let mut counts = BTreeMap::new();
        for table in &schema.tables {
            let name = table.full_name();
            let selected = match args.side {
                SyncSide::Client => table.direction.can_upload(),
                SyncSide::Server => table.direction.can_download(),
            };
            if !selected {
                continue;
            }
            let filter = match args.side {
                SyncSide::Server => setup.filter_for(&name),
                SyncSide::Client => None,
            };

            let adapter = self.adapter(table)?;
            let changes = adapter
                .select_changes(
                    connection,
                    filter,
                    args.parameters,
                    args.since,
                    args.exclude_scope_id,
                    args.initialize,
                )
                .map_err(|e| e.in_phase(SessionState::ChangesEnumerating, Some(&name)))?;

            debug!(table = %name, rows = changes.len(), "enumerated changes");
            counts.insert(name, changes.len());
            writer.add_rows(adapter.changes_table(), changes.rows)?;
        }
        Ok(counts)
    }

    /// Applies a batch.
    ///
    /// Tables are ordered parents first. Deletes run children first, then
    /// modifications parents first, so that foreign keys hold at every step.
    pub fn apply_changes(
        &self,
        connection: &P::Connection,
        schema: &SyncSet,
        batch: &BatchInfo,
        args: ApplyArgs,
        mut progress: Option<&mut ProgressReporter>,
    ) -> Result<ApplyOutcome> {
        let mut outcome = ApplyOutcome::default();
        if batch.is_empty() {
            return Ok(outcome);
        }
        for info in batch.parts_info() {
            if schema.table(&info.table_name).is_none() {
                return Err(SyncError::Protocol(format!(
                    "batch holds rows of unknown table {}",
                    info.table_name
                )));
            }
        }

        let ordered = schema.ordered_tables();
        let constraints_owner = match ordered.first() {
            Some(table) if self.options.disable_constraints_on_apply_changes => {
                let adapter = self.adapter(table)?;
                adapter.disable_constraints(connection)?;
                Some(adapter)
            }
            _ => None,
        };

        let steps = ordered
            .iter()
            .rev()
            .map(|t| (*t, true))
            .chain(ordered.iter().map(|t| (*t, false)));
        let step_count = ordered.len() * 2;

        let apply_steps = || -> Result<()> {
            for (done, (table, deletes)) in steps.enumerate() {
                let name = table.full_name();
                let stats = self
                    .apply_table(connection, table, batch, args, deletes)
                    .map_err(|e| e.in_phase(SessionState::ChangesApplying, Some(&name)))?;
                if let Some(stats) = stats {
                    let entry = outcome.per_table.entry(name.clone()).or_default();
                    entry.applied += stats.applied;
                    entry.resolved_conflicts += stats.resolved_conflicts;
                    entry.failed += stats.failed;
                }
                if let Some(reporter) = progress.as_deref_mut() {
                    let span = SessionState::ScopeCommitting.base_percentage()
                        - SessionState::ChangesApplying.base_percentage();
                    let percentage = SessionState::ChangesApplying.base_percentage()
                        + span * (done + 1) as f64 / step_count as f64;
                    reporter.report(SessionState::ChangesApplying, percentage, format!("applied {name}"));
                }
            }
            Ok(())
        };
        let applied = apply_steps();

        // Constraints come back on whatever happened to the apply.
        let enabled = match constraints_owner {
            Some(adapter) => adapter.enable_constraints(connection),
            None => Ok(()),
        };
        applied?;
        enabled?;

        info!(
            side = ?args.side,
            applied = outcome.applied(),
            conflicts = outcome.resolved_conflicts(),
            failed = outcome.failed(),
            "changes applied"
        );
        Ok(outcome)
    }

    fn apply_table(
        &self,
        connection: &P::Connection,
        table: &SyncTable,
        batch: &BatchInfo,
        args: ApplyArgs,
        deletes: bool,
    ) -> Result<Option<TableStats>> {
        let parts = batch.parts_for(table);
        if parts.is_empty() {
            return Ok(None);
        }

        let adapter = self.adapter(table)?;
        let command_type = match (deletes, args.use_insert) {
            (true, _) => DbCommandType::DeleteRow,
            (false, true) => DbCommandType::InsertRow,
            (false, false) => DbCommandType::UpdateRow,
        };
        let mut command = adapter.prepare_command(command_type, Some(connection), None)?;
        let mut stats = TableStats::default();

        for index in parts {
            let part = batch.load_part(index)?;
            let rows: Vec<SyncRow> = part
                .rows
                .into_iter()
                .filter(|r| r.is_tombstone() == deletes)
                .collect();
            if rows.is_empty() {
                continue;
            }

            let mut failed = Vec::new();
            stats.applied += adapter.execute_batch_command(
                &mut command,
                args.sender_scope_id,
                &rows,
                &part.table,
                &mut failed,
                args.last_timestamp,
                false,
                connection,
            )?;

            for failure in failed {
                self.resolve(connection, &adapter, &part.table, failure, command_type, args, &mut stats)?;
            }
        }
        Ok(Some(stats))
    }

    #[allow(clippy::too_many_arguments)]
    fn resolve(
        &self,
        connection: &P::Connection,
        adapter: &SyncAdapter<P>,
        part_table: &SyncTable,
        failure: FailedRow,
        command_type: DbCommandType,
        args: ApplyArgs,
        stats: &mut TableStats,
    ) -> Result<()> {
        let table = adapter.table().full_name();
        let local_row = match failure.reason {
            FailureReason::UniqueKeyViolation => None,
            _ => adapter.select_row(connection, &failure.row)?,
        };
        let kind = match failure.reason {
            FailureReason::UniqueKeyViolation => ConflictKind::UniqueKeyConstraint,
            FailureReason::PrimaryKeyViolation => ConflictKind::RemoteInsertLocalExists,
            FailureReason::Conflict if failure.row.is_tombstone() => {
                ConflictKind::RemoteDeleteLocalUpdate
            }
            FailureReason::Conflict => match &local_row {
                Some(local) if local.is_tombstone() => ConflictKind::RemoteUpdateLocalDelete,
                _ => ConflictKind::RemoteUpdateLocalUpdate,
            },
        };
        let conflict = RowConflict {
            table: table.clone(),
            kind,
            remote_row: failure.row,
            local_row,
        };

        let action = match &self.resolver {
            Some(resolver) => resolver(&conflict),
            None => args.policy.action_on(args.side),
        };
        debug!(table = %table, kind = ?kind, action = ?action, "row conflict");

        match action {
            ConflictAction::Abort => Err(SyncError::ConflictAborted { table }),
            ConflictAction::Continue => {
                if kind == ConflictKind::UniqueKeyConstraint {
                    stats.failed += 1;
                } else {
                    stats.resolved_conflicts += 1;
                }
                Ok(())
            }
            ConflictAction::ForceWrite if kind == ConflictKind::UniqueKeyConstraint => {
                warn!(table = %table, message = ?failure.message, "unique constraint cannot be forced");
                stats.failed += 1;
                Ok(())
            }
            ConflictAction::ForceWrite => {
                // A key that already exists on insert is forced through an update.
                let force_type = match command_type {
                    DbCommandType::InsertRow => DbCommandType::UpdateRow,
                    other => other,
                };
                let mut command = adapter.prepare_command(force_type, Some(connection), None)?;
                let mut failed = Vec::new();
                let applied = adapter.execute_batch_command(
                    &mut command,
                    args.sender_scope_id,
                    std::slice::from_ref(&conflict.remote_row),
                    part_table,
                    &mut failed,
                    args.last_timestamp,
                    true,
                    connection,
                )?;
                if applied == 1 {
                    stats.applied += 1;
                    stats.resolved_conflicts += 1;
                } else {
                    stats.failed += 1;
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryProvider;
    use tidesync_protocol::{DataType, SyncColumn, SyncRelation, SyncValue};

    fn customer() -> SyncTable {
        SyncTable::new("Customer")
            .with_column(SyncColumn::new("id", DataType::Integer))
            .with_column(SyncColumn::new("name", DataType::Text))
            .with_primary_key("id")
    }

    fn order() -> SyncTable {
        SyncTable::new("Order")
            .with_column(SyncColumn::new("id", DataType::Integer))
            .with_column(SyncColumn::new("customer_id", DataType::Integer))
            .with_primary_key("id")
    }

    fn schema() -> SyncSet {
        SyncSet::new(
            vec![order(), customer()],
            vec![SyncRelation::new("fk", "Customer", "id", "Order", "customer_id")],
        )
    }

    fn store() -> MemoryProvider {
        let provider = MemoryProvider::new("mem")
            .with_table(customer())
            .with_table(order())
            .with_relation(SyncRelation::new("fk", "Customer", "id", "Order", "customer_id"));
        let conn = provider.open().unwrap();
        provider.provision(&conn, &customer()).unwrap();
        provider.provision(&conn, &order()).unwrap();
        provider
    }

    fn base(provider: &MemoryProvider) -> BaseOrchestrator<MemoryProvider> {
        BaseOrchestrator::new(Arc::new(provider.clone()), SyncOptions::new())
    }

    fn args(side: SyncSide, policy: ConflictResolutionPolicy) -> ApplyArgs {
        ApplyArgs {
            side,
            sender_scope_id: Some(Uuid::new_v4()),
            last_timestamp: Some(Timestamp::ZERO),
            use_insert: false,
            policy,
        }
    }

    /// Children are listed first on purpose; the apply reorders them.
    fn batch(rows: Vec<(SyncTable, SyncRow)>) -> BatchInfo {
        let mut writer = BatchWriter::new("unused", 100, Default::default());
        for (table, row) in rows {
            writer.add_row(&table, row).unwrap();
        }
        writer.finish().unwrap()
    }

    #[test]
    fn parents_are_applied_before_children() {
        let provider = store();
        let base = base(&provider);
        let conn = provider.open().unwrap();

        let batch = batch(vec![
            (order(), SyncRow::modified(vec![10.into(), 1.into()])),
            (customer(), SyncRow::modified(vec![1.into(), "Ada".into()])),
        ]);
        let outcome = base
            .apply_changes(&conn, &schema(), &batch, args(SyncSide::Client, Default::default()), None)
            .unwrap();
        assert_eq!(outcome.applied(), 2);
        assert_eq!(provider.row_count("Order"), 1);
    }

    #[test]
    fn children_are_deleted_before_parents() {
        let provider = store();
        provider.insert("Customer", vec![1.into(), "Ada".into()]).unwrap();
        provider.insert("Order", vec![10.into(), 1.into()]).unwrap();
        let base = base(&provider);
        let conn = provider.open().unwrap();

        let batch = batch(vec![
            (customer(), SyncRow::deleted(vec![1.into(), SyncValue::Null])),
            (order(), SyncRow::deleted(vec![10.into(), SyncValue::Null])),
        ]);
        let mut args = args(SyncSide::Client, Default::default());
        args.last_timestamp = Some(Timestamp::new(100));
        let outcome = base
            .apply_changes(&conn, &schema(), &batch, args, None)
            .unwrap();
        assert_eq!(outcome.applied(), 2);
        assert_eq!(provider.row_count("Customer"), 0);
    }

    #[test]
    fn policy_decides_update_conflicts() {
        let provider = store();
        provider.insert("Customer", vec![1.into(), "Local".into()]).unwrap();
        let conn = provider.open().unwrap();
        let incoming = batch(vec![(customer(), SyncRow::modified(vec![1.into(), "Remote".into()]))]);

        // Applying server rows on the client under ServerWins forces them.
        let outcome = base(&provider)
            .apply_changes(
                &conn,
                &schema(),
                &incoming,
                args(SyncSide::Client, ConflictResolutionPolicy::ServerWins),
                None,
            )
            .unwrap();
        assert_eq!(outcome.resolved_conflicts(), 1);
        assert_eq!(provider.row("Customer", &[1.into()]).unwrap()[1], SyncValue::from("Remote"));

        provider.upsert("Customer", vec![1.into(), "Local again".into()]).unwrap();
        let outcome = base(&provider)
            .apply_changes(
                &conn,
                &schema(),
                &incoming,
                args(SyncSide::Server, ConflictResolutionPolicy::ServerWins),
                None,
            )
            .unwrap();
        assert_eq!(outcome.resolved_conflicts(), 1);
        assert_eq!(outcome.applied(), 0);
        assert_eq!(provider.row("Customer", &[1.into()]).unwrap()[1], SyncValue::from("Local again"));
    }

    #[test]
    fn resolver_sees_the_conflict_kind() {
        let provider = store();
        provider.insert("Customer", vec![1.into(), "Local".into()]).unwrap();
        provider.delete("Customer", &[1.into()]).unwrap();
        let conn = provider.open().unwrap();

        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let mut base = base(&provider);
        base.set_resolver(Arc::new(move |c: &RowConflict| {
            sink.lock().push(c.kind);
            ConflictAction::Abort
        }));

        let incoming = batch(vec![(customer(), SyncRow::modified(vec![1.into(), "Remote".into()]))]);
        let err = base
            .apply_changes(&conn, &schema(), &incoming, args(SyncSide::Client, Default::default()), None)
            .unwrap_err();
        assert!(matches!(err.root(), SyncError::ConflictAborted { .. }));
        assert_eq!(*seen.lock(), vec![ConflictKind::RemoteUpdateLocalDelete]);
    }

    #[test]
    fn existing_key_on_insert_is_forced_when_remote_wins() {
        let provider = store();
        provider.insert("Customer", vec![1.into(), "Local".into()]).unwrap();
        let conn = provider.open().unwrap();
        let incoming = batch(vec![(customer(), SyncRow::modified(vec![1.into(), "Remote".into()]))]);

        let mut args = args(SyncSide::Client, ConflictResolutionPolicy::ServerWins);
        args.use_insert = true;
        let outcome = base(&provider)
            .apply_changes(&conn, &schema(), &incoming, args, None)
            .unwrap();
        assert_eq!(outcome.applied(), 1);
        assert_eq!(outcome.resolved_conflicts(), 1);
        assert_eq!(provider.row("Customer", &[1.into()]).unwrap()[1], SyncValue::from("Remote"));
    }

    #[test]
    fn unique_violations_are_counted_as_failures() {
        let provider = MemoryProvider::new("mem")
            .with_table(customer())
            .with_unique("Customer", "name");
        let conn = provider.open().unwrap();
        provider.provision(&conn, &customer()).unwrap();
        provider.insert("Customer", vec![1.into(), "Ada".into()]).unwrap();

        let incoming = batch(vec![
            (customer(), SyncRow::modified(vec![2.into(), "Ada".into()])),
            (customer(), SyncRow::modified(vec![3.into(), "Grace".into()])),
        ]);
        let schema = SyncSet::new(vec![customer()], Vec::new());
        let outcome = base(&provider)
            .apply_changes(&conn, &schema, &incoming, args(SyncSide::Client, Default::default()), None)
            .unwrap();
        assert_eq!(outcome.applied(), 1);
        assert_eq!(outcome.failed(), 1);
    }

    #[test]
    fn disabled_constraints_allow_any_order() {
        let provider = store();
        let base = BaseOrchestrator::new(
            Arc::new(provider.clone()),
            SyncOptions::new().with_disable_constraints(true),
        );
        let conn = provider.open().unwrap();
        // The relation is unknown to this schema, so no ordering helps.
        let schema = SyncSet::new(vec![order(), customer()], Vec::new());
        let incoming = batch(vec![(order(), SyncRow::modified(vec![10.into(), 1.into()]))]);

        let outcome = base
            .apply_changes(&conn, &schema, &incoming, args(SyncSide::Client, Default::default()), None)
            .unwrap();
        assert_eq!(outcome.applied(), 1);
    }

    #[test]
    fn constraints_come_back_after_a_failed_apply() {
        let provider = store();
        let base = BaseOrchestrator::new(
            Arc::new(provider.clone()),
            SyncOptions::new().with_disable_constraints(true),
        );
        let conn = provider.open().unwrap();
        let incoming = batch(vec![(
            customer(),
            SyncRow::modified(vec!["not a key".into(), "Ada".into()]),
        )]);

        assert!(base
            .apply_changes(&conn, &schema(), &incoming, args(SyncSide::Client, Default::default()), None)
            .is_err());
        // an orphan order is refused again
        assert!(provider.insert("Order", vec![20.into(), 99.into()]).is_err());
    }

    #[test]
    fn enumeration_respects_direction_and_exclusion() {
        let provider = store();
        provider.insert("Customer", vec![1.into(), "Ada".into()]).unwrap();
        provider.insert("Order", vec![10.into(), 1.into()]).unwrap();
        let base = base(&provider);
        let conn = provider.open().unwrap();

        let schema = SyncSet::new(
            vec![
                customer(),
                order().with_direction(tidesync_protocol::SyncDirection::DownloadOnly),
            ],
            Vec::new(),
        );
        let params = SyncParameters::new();
        let mut writer = BatchWriter::new("unused", 100, Default::default());
        let counts = base
            .enumerate_changes(
                &conn,
                &schema,
                &SyncSetup::new(["Customer", "Order"]),
                EnumerateArgs {
                    side: SyncSide::Client,
                    since: None,
                    exclude_scope_id: None,
                    parameters: &params,
                    initialize: false,
                },
                &mut writer,
            )
            .unwrap();
        assert_eq!(counts.get("Customer"), Some(&1));
        assert!(!counts.contains_key("Order"));
        assert_eq!(writer.finish().unwrap().total_rows(), 1);
    }

    #[test]
    fn transactions_roll_back_on_error() {
        let provider = store();
        let base = base(&provider);
        let conn = provider.open().unwrap();

        let result: Result<()> = base.in_transaction(&conn, || {
            provider.insert("Customer", vec![1.into(), "Ada".into()]).unwrap();
            Err(SyncError::Cancelled)
        });
        assert!(result.is_err());
        assert_eq!(provider.row_count("Customer"), 0);
    }
}
