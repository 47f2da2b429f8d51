//! Client-side orchestrator.

use super::base::{ApplyArgs, ApplyOutcome, BaseOrchestrator, EnumerateArgs};
use super::{ConflictResolver, ConflictingSetupAction, SetupConflict, SetupConflictStrategy};
use crate::batch::{BatchInfo, BatchWriter};
use crate::config::SyncOptions;
use crate::error::{Result, SyncError};
use crate::provider::SyncProvider;
use crate::state::ProgressReporter;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tidesync_protocol::{
    SerializerKind, ServerScopeInfo, SyncParameters, SyncScope, SyncSet, SyncSetup, SyncSide,
    Timestamp,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Prefix of client scope records in the scope blob store.
pub const CLIENT_SCOPE_PREFIX: &str = "client:";

/// What [`LocalOrchestrator::provision`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionOutcome {
    /// The stored setup matches the server.
    Unchanged,
    /// First provisioning of the scope.
    Provisioned,
    /// The scope was provisioned again with the server setup.
    Reprovisioned,
    /// The setups differ and the strategy chose to go on.
    KeptLocal,
}

/// Drives the client store.
pub struct LocalOrchestrator<P: SyncProvider> {
    base: BaseOrchestrator<P>,
    setup: SyncSetup,
    setup_strategy: Option<SetupConflictStrategy>,
}

impl<P: SyncProvider> LocalOrchestrator<P> {
    /// Creates a client orchestrator.
    pub fn new(provider: Arc<P>, setup: SyncSetup, options: SyncOptions) -> Self {
        Self {
            base: BaseOrchestrator::new(provider, options),
            setup,
            setup_strategy: None,
        }
    }

    /// Installs a conflict resolver.
    pub fn with_resolver(mut self, resolver: ConflictResolver) -> Self {
        self.base.set_resolver(resolver);
        self
    }

    /// Installs the strategy consulted when setups diverge.
    pub fn with_setup_strategy(mut self, strategy: SetupConflictStrategy) -> Self {
        self.setup_strategy = Some(strategy);
        self
    }

    /// Shared orchestrator state.
    pub fn base(&self) -> &BaseOrchestrator<P> {
        &self.base
    }

    /// The client setup.
    pub fn setup(&self) -> &SyncSetup {
        &self.setup
    }

    /// Loads a scope, or creates a fresh one that is saved on first commit.
    pub fn load_scope(&self, connection: &P::Connection, name: &str) -> Result<SyncScope> {
        let key = format!("{CLIENT_SCOPE_PREFIX}{name}");
        match self.base.provider().load_scope_blob(connection, &key)? {
            Some(blob) => Ok(SerializerKind::Json.deserialize(&blob)?),
            None => {
                let scope = SyncScope::new(name);
                debug!(scope = name, scope_id = %scope.scope_id, "new client scope");
                Ok(scope)
            }
        }
    }

    /// Saves a scope.
    pub fn save_scope(&self, connection: &P::Connection, scope: &SyncScope) -> Result<()> {
        let key = format!("{CLIENT_SCOPE_PREFIX}{}", scope.name);
        let blob = SerializerKind::Json.serialize(scope)?;
        self.base.provider().save_scope_blob(connection, &key, blob)?;
        Ok(())
    }

    /// Makes the local store match the server scope.
    ///
    /// A fresh scope creates the server tables and their tracking. An
    /// already provisioned scope whose setup or schema diverges from the
    /// server is handed to the setup strategy, aborting by default.
    pub fn provision(
        &self,
        connection: &P::Connection,
        scope: &mut SyncScope,
        server: &ServerScopeInfo,
    ) -> Result<ProvisionOutcome> {
        let (local_setup, local_schema) = match (&scope.setup, &scope.schema) {
            (Some(setup), Some(schema)) => (setup.clone(), schema.clone()),
            _ => {
                self.provision_schema(connection, &server.schema)?;
                scope.setup = Some(server.setup.clone());
                scope.schema = Some(server.schema.clone());
                info!(scope = %scope.name, tables = server.schema.tables.len(), "scope provisioned");
                return Ok(ProvisionOutcome::Provisioned);
            }
        };

        if local_setup.signature() == server.setup.signature() && local_schema == server.schema {
            return Ok(ProvisionOutcome::Unchanged);
        }

        let conflict = SetupConflict {
            scope_name: scope.name.clone(),
            local_setup,
            server_setup: server.setup.clone(),
        };
        let action = self
            .setup_strategy
            .as_ref()
            .map(|strategy| strategy(&conflict))
            .unwrap_or_default();
        warn!(scope = %scope.name, action = ?action, "setup differs from the server");

        match action {
            ConflictingSetupAction::Abort => Err(SyncError::SetupConflict {
                scope: scope.name.clone(),
            }),
            ConflictingSetupAction::Continue => Ok(ProvisionOutcome::KeptLocal),
            ConflictingSetupAction::Reprovision => {
                for table in &local_schema.tables {
                    self.base.provider().deprovision(connection, table)?;
                }
                self.provision_schema(connection, &server.schema)?;
                scope.setup = Some(server.setup.clone());
                scope.schema = Some(server.schema.clone());
                scope.reset_server_watermark();
                Ok(ProvisionOutcome::Reprovisioned)
            }
        }
    }

    fn provision_schema(&self, connection: &P::Connection, schema: &SyncSet) -> Result<()> {
        for table in &schema.tables {
            table.ensure_primary_keys()?;
            self.base.provider().create_table(connection, table)?;
            self.base.provider().provision(connection, table)?;
        }
        Ok(())
    }

    /// Reads local changes since the scope watermark.
    ///
    /// The local timestamp is captured before reading so that rows written
    /// while the round runs are picked up by the next round. Rows last
    /// written by `exclude_scope_id` (the server) are skipped.
    pub fn get_changes(
        &self,
        connection: &P::Connection,
        scope: &SyncScope,
        exclude_scope_id: Option<Uuid>,
        writer: &mut BatchWriter,
    ) -> Result<(Timestamp, BTreeMap<String, usize>)> {
        let timestamp = self.base.local_timestamp(connection)?;
        let schema = scope.schema.as_ref().ok_or_else(|| {
            SyncError::Protocol(format!("scope {} is not provisioned", scope.name))
        })?;
        let setup = scope.setup.as_ref().unwrap_or(&self.setup);
        let parameters = SyncParameters::new();
        let counts = self.base.enumerate_changes(
            connection,
            schema,
            setup,
            EnumerateArgs {
                side: SyncSide::Client,
                since: scope.last_sync_timestamp,
                exclude_scope_id,
                parameters: &parameters,
                initialize: false,
            },
            writer,
        )?;
        Ok((timestamp, counts))
    }

    /// Applies the server batch.
    ///
    /// Modifications are plain inserts when `use_insert` is set (fresh or
    /// reinitialized scope); a key that already exists becomes a conflict.
    pub fn apply_changes(
        &self,
        connection: &P::Connection,
        scope: &SyncScope,
        batch: &BatchInfo,
        server_scope_id: Uuid,
        use_insert: bool,
        progress: Option<&mut ProgressReporter>,
    ) -> Result<ApplyOutcome> {
        let schema = scope.schema.as_ref().ok_or_else(|| {
            SyncError::Protocol(format!("scope {} is not provisioned", scope.name))
        })?;
        self.base.apply_changes(
            connection,
            schema,
            batch,
            ApplyArgs {
                side: SyncSide::Client,
                sender_scope_id: Some(server_scope_id),
                last_timestamp: scope.last_sync_timestamp,
                use_insert,
                policy: self.base.options().conflict_resolution_policy,
            },
            progress,
        )
    }

    /// Removes every row of the scope tables, children first.
    pub fn reset(&self, connection: &P::Connection, schema: &SyncSet) -> Result<()> {
        for table in schema.ordered_tables().into_iter().rev() {
            self.base.adapter(table)?.reset_table(connection)?;
        }
        info!(tables = schema.tables.len(), "local tables reset");
        Ok(())
    }

    /// Advances the watermarks and saves the scope.
    pub fn commit_scope(
        &self,
        connection: &P::Connection,
        scope: &mut SyncScope,
        local_timestamp: Timestamp,
        server_timestamp: Timestamp,
        duration: Duration,
    ) -> Result<()> {
        scope.advance(local_timestamp, server_timestamp);
        scope.last_sync = Some(unix_millis());
        scope.last_sync_duration_ms = Some(duration.as_millis() as u64);
        self.save_scope(connection, scope)
    }

    /// Purges tombstones already uploaded. Returns how many were removed.
    pub fn clean_metadatas(&self, connection: &P::Connection, scope: &SyncScope) -> Result<usize> {
        let (Some(up_to), Some(schema)) = (scope.last_sync_timestamp, scope.schema.as_ref()) else {
            return Ok(0);
        };
        let mut removed = 0;
        for table in &schema.tables {
            removed += self.base.provider().delete_metadata(connection, table, up_to)?;
        }
        if removed > 0 {
            debug!(scope = %scope.name, removed, "client metadata cleaned");
        }
        Ok(removed)
    }
}

pub(crate) fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryProvider;
    use tidesync_protocol::{DataType, SyncColumn, SyncTable};

    fn product() -> SyncTable {
        SyncTable::new("Product")
            .with_column(SyncColumn::new("id", DataType::Integer))
            .with_column(SyncColumn::new("name", DataType::Text))
            .with_primary_key("id")
    }

    fn server_scope(tables: Vec<SyncTable>) -> ServerScopeInfo {
        let names: Vec<String> = tables.iter().map(|t| t.full_name()).collect();
        ServerScopeInfo::new("DefaultScope", SyncSetup::new(names), SyncSet::new(tables, Vec::new()))
    }

    fn local(provider: &MemoryProvider) -> LocalOrchestrator<MemoryProvider> {
        LocalOrchestrator::new(
            Arc::new(provider.clone()),
            SyncSetup::new(["Product"]),
            SyncOptions::new(),
        )
    }

    #[test]
    fn scopes_persist_across_loads() {
        let provider = MemoryProvider::new("client");
        let local = local(&provider);
        let conn = provider.open().unwrap();

        let mut scope = local.load_scope(&conn, "DefaultScope").unwrap();
        let id = scope.scope_id;
        // unsaved scopes are not remembered
        assert_ne!(local.load_scope(&conn, "DefaultScope").unwrap().scope_id, id);

        local
            .commit_scope(&conn, &mut scope, Timestamp::new(5), Timestamp::new(7), Duration::from_millis(3))
            .unwrap();
        let loaded = local.load_scope(&conn, "DefaultScope").unwrap();
        assert_eq!(loaded.scope_id, id);
        assert_eq!(loaded.last_sync_timestamp, Some(Timestamp::new(5)));
        assert_eq!(loaded.last_sync_duration_ms, Some(3));
        assert!(loaded.last_sync.is_some());
    }

    #[test]
    fn watermarks_never_move_back() {
        let provider = MemoryProvider::new("client");
        let local = local(&provider);
        let conn = provider.open().unwrap();
        let mut scope = local.load_scope(&conn, "DefaultScope").unwrap();

        local
            .commit_scope(&conn, &mut scope, Timestamp::new(9), Timestamp::new(9), Duration::ZERO)
            .unwrap();
        local
            .commit_scope(&conn, &mut scope, Timestamp::new(4), Timestamp::new(12), Duration::ZERO)
            .unwrap();
        assert_eq!(scope.last_sync_timestamp, Some(Timestamp::new(9)));
        assert_eq!(scope.last_server_sync_timestamp, Some(Timestamp::new(12)));
    }

    #[test]
    fn first_provisioning_creates_tables() {
        let provider = MemoryProvider::new("client");
        let local = local(&provider);
        let conn = provider.open().unwrap();
        let mut scope = local.load_scope(&conn, "DefaultScope").unwrap();

        let outcome = local
            .provision(&conn, &mut scope, &server_scope(vec![product()]))
            .unwrap();
        assert_eq!(outcome, ProvisionOutcome::Provisioned);
        assert!(provider.has_table("Product"));
        assert!(provider.is_tracked("Product"));
        assert!(scope.is_provisioned());

        let again = local
            .provision(&conn, &mut scope, &server_scope(vec![product()]))
            .unwrap();
        assert_eq!(again, ProvisionOutcome::Unchanged);
    }

    #[test]
    fn diverging_setup_aborts_without_strategy() {
        let provider = MemoryProvider::new("client");
        let local = local(&provider);
        let conn = provider.open().unwrap();
        let mut scope = local.load_scope(&conn, "DefaultScope").unwrap();
        local
            .provision(&conn, &mut scope, &server_scope(vec![product()]))
            .unwrap();

        let category = SyncTable::new("Category")
            .with_column(SyncColumn::new("id", DataType::Integer))
            .with_primary_key("id");
        let changed = server_scope(vec![product(), category]);

        let err = local.provision(&conn, &mut scope, &changed).unwrap_err();
        assert!(matches!(err, SyncError::SetupConflict { .. }));
        assert!(!provider.has_table("Category"));
    }

    #[test]
    fn strategy_can_reprovision() {
        let provider = MemoryProvider::new("client");
        let local = local(&provider)
            .with_setup_strategy(Arc::new(|_: &SetupConflict| ConflictingSetupAction::Reprovision));
        let conn = provider.open().unwrap();
        let mut scope = local.load_scope(&conn, "DefaultScope").unwrap();
        local
            .provision(&conn, &mut scope, &server_scope(vec![product()]))
            .unwrap();
        scope.advance(Timestamp::new(1), Timestamp::new(1));

        let category = SyncTable::new("Category")
            .with_column(SyncColumn::new("id", DataType::Integer))
            .with_primary_key("id");
        let outcome = local
            .provision(&conn, &mut scope, &server_scope(vec![product(), category]))
            .unwrap();
        assert_eq!(outcome, ProvisionOutcome::Reprovisioned);
        assert!(provider.is_tracked("Category"));
        assert_eq!(scope.last_server_sync_timestamp, None);
    }

    #[test]
    fn changes_since_watermark_and_cleanup() {
        let provider = MemoryProvider::new("client");
        let local = local(&provider);
        let conn = provider.open().unwrap();
        let mut scope = local.load_scope(&conn, "DefaultScope").unwrap();
        local
            .provision(&conn, &mut scope, &server_scope(vec![product()]))
            .unwrap();

        provider.insert("Product", vec![1.into(), "Lamp".into()]).unwrap();
        provider.insert("Product", vec![2.into(), "Desk".into()]).unwrap();
        provider.delete("Product", &[2.into()]).unwrap();

        let mut writer = BatchWriter::new("unused", 100, SerializerKind::Json);
        let (timestamp, counts) = local.get_changes(&conn, &scope, None, &mut writer).unwrap();
        assert_eq!(timestamp, Timestamp::new(3));
        assert_eq!(counts["Product"], 2);

        local
            .commit_scope(&conn, &mut scope, timestamp, Timestamp::ZERO, Duration::ZERO)
            .unwrap();
        assert_eq!(local.clean_metadatas(&conn, &scope).unwrap(), 1);

        let mut writer = BatchWriter::new("unused", 100, SerializerKind::Json);
        let (_, counts) = local.get_changes(&conn, &scope, None, &mut writer).unwrap();
        assert_eq!(counts["Product"], 0);
    }

    #[test]
    fn reset_empties_tables() {
        let provider = MemoryProvider::new("client");
        let local = local(&provider);
        let conn = provider.open().unwrap();
        let mut scope = local.load_scope(&conn, "DefaultScope").unwrap();
        local
            .provision(&conn, &mut scope, &server_scope(vec![product()]))
            .unwrap();
        provider.insert("Product", vec![1.into(), "Lamp".into()]).unwrap();

        local.reset(&conn, scope.schema.as_ref().unwrap()).unwrap();
        assert_eq!(provider.row_count("Product"), 0);
    }
}
