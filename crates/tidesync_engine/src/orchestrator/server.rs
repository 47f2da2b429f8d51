//! Server-side orchestrator.

use super::base::{ApplyArgs, BaseOrchestrator, EnumerateArgs};
use super::local::unix_millis;
use super::{ConflictResolver, RemoteChanges, RemoteOrchestrator, RoundContext};
use crate::batch::{snapshot_directory, BatchInfo, BatchWriter, SUMMARY_FILE};
use crate::config::SyncOptions;
use crate::error::{Result, SyncError};
use crate::provider::SyncProvider;
use async_trait::async_trait;
use std::fs;
use std::sync::Arc;
use tidesync_protocol::{
    ScopeRequest, SerializerKind, ServerHistoryScope, ServerScopeInfo, SyncParameters, SyncSet,
    SyncSetup, SyncSide, Timestamp,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Prefix of server scope records in the scope blob store.
pub const SERVER_SCOPE_PREFIX: &str = "server:";

/// Prefix of the per-scope client history records.
pub const HISTORY_PREFIX: &str = "history:";

/// Drives the server store.
pub struct ServerOrchestrator<P: SyncProvider> {
    base: BaseOrchestrator<P>,
    setup: SyncSetup,
}

impl<P: SyncProvider> ServerOrchestrator<P> {
    /// Creates a server orchestrator for `setup`.
    pub fn new(provider: Arc<P>, setup: SyncSetup, options: SyncOptions) -> Self {
        Self {
            base: BaseOrchestrator::new(provider, options),
            setup,
        }
    }

    /// Installs a conflict resolver.
    pub fn with_resolver(mut self, resolver: ConflictResolver) -> Self {
        self.base.set_resolver(resolver);
        self
    }

    /// Shared orchestrator state.
    pub fn base(&self) -> &BaseOrchestrator<P> {
        &self.base
    }

    /// The server setup.
    pub fn setup(&self) -> &SyncSetup {
        &self.setup
    }

    /// Loads the scope record, provisioning the scope when it is missing or
    /// when its stored setup differs from the current one.
    pub fn ensure_scope_sync(&self, scope_name: &str) -> Result<ServerScopeInfo> {
        let connection = self.base.open()?;
        let result = self.ensure_scope_on(&connection, scope_name);
        self.base.close(&connection);
        result
    }

    fn ensure_scope_on(&self, connection: &P::Connection, scope_name: &str) -> Result<ServerScopeInfo> {
        let existing = self.load_scope(connection, scope_name)?;
        if let Some(scope) = &existing {
            if scope.setup.signature() == self.setup.signature() {
                return Ok(scope.clone());
            }
            warn!(scope = scope_name, "server setup changed, provisioning again");
            for table in &scope.schema.tables {
                self.base.provider().deprovision(connection, table)?;
            }
        }

        self.setup.validate()?;
        let schema = self.read_schema(connection)?;
        for table in &schema.tables {
            self.base.provider().provision(connection, table)?;
        }

        let mut scope = ServerScopeInfo::new(scope_name, self.setup.clone(), schema);
        if let Some(previous) = existing {
            scope.server_scope_id = previous.server_scope_id;
            scope.last_cleanup_timestamp = previous.last_cleanup_timestamp;
        }
        self.save_scope(connection, &scope)?;
        info!(
            scope = scope_name,
            server_scope_id = %scope.server_scope_id,
            tables = scope.schema.tables.len(),
            "server scope provisioned"
        );
        Ok(scope)
    }

    fn read_schema(&self, connection: &P::Connection) -> Result<SyncSet> {
        let provider = self.base.provider();
        let mut tables = Vec::with_capacity(self.setup.tables.len());
        for setup_table in &self.setup.tables {
            let table = provider
                .get_table_schema(connection, setup_table)?
                .ok_or_else(|| {
                    SyncError::Protocol(format!("table {} does not exist", setup_table.full_name()))
                })?;
            table.ensure_primary_keys()?;
            tables.push(table);
        }
        let relations = provider.get_relations(connection, &tables)?;
        Ok(SyncSet::new(tables, relations))
    }

    fn load_scope(&self, connection: &P::Connection, scope_name: &str) -> Result<Option<ServerScopeInfo>> {
        let key = format!("{SERVER_SCOPE_PREFIX}{scope_name}");
        match self.base.provider().load_scope_blob(connection, &key)? {
            Some(blob) => Ok(Some(SerializerKind::Json.deserialize(&blob)?)),
            None => Ok(None),
        }
    }

    fn save_scope(&self, connection: &P::Connection, scope: &ServerScopeInfo) -> Result<()> {
        let key = format!("{SERVER_SCOPE_PREFIX}{}", scope.name);
        let blob = SerializerKind::Json.serialize(scope)?;
        self.base.provider().save_scope_blob(connection, &key, blob)?;
        Ok(())
    }

    /// Every client that completed a round of `scope_name`.
    pub fn histories(&self, scope_name: &str) -> Result<Vec<ServerHistoryScope>> {
        let connection = self.base.open()?;
        let result = self.load_histories(&connection, scope_name);
        self.base.close(&connection);
        result
    }

    fn load_histories(&self, connection: &P::Connection, scope_name: &str) -> Result<Vec<ServerHistoryScope>> {
        let key = format!("{HISTORY_PREFIX}{scope_name}");
        match self.base.provider().load_scope_blob(connection, &key)? {
            Some(blob) => Ok(SerializerKind::Json.deserialize(&blob)?),
            None => Ok(Vec::new()),
        }
    }

    fn record_history(
        &self,
        connection: &P::Connection,
        scope_name: &str,
        client_scope_id: Uuid,
        timestamp: Timestamp,
    ) -> Result<()> {
        let mut histories = self.load_histories(connection, scope_name)?;
        let entry = match histories.iter_mut().position(|h| h.client_scope_id == client_scope_id) {
            Some(index) => &mut histories[index],
            None => {
                histories.push(ServerHistoryScope {
                    client_scope_id,
                    scope_name: scope_name.to_string(),
                    last_sync_timestamp: None,
                    last_sync: None,
                });
                let last = histories.len() - 1;
                &mut histories[last]
            }
        };
        entry.last_sync_timestamp = Some(timestamp);
        entry.last_sync = Some(unix_millis());

        let key = format!("{HISTORY_PREFIX}{scope_name}");
        let blob = SerializerKind::Json.serialize(&histories)?;
        self.base.provider().save_scope_blob(connection, &key, blob)?;
        Ok(())
    }

    /// Applies an uploaded batch, then reads the changes the client has not
    /// seen yet.
    ///
    /// The apply and the client history update run in one transaction. The
    /// returned server timestamp is read after the apply, so the uploaded
    /// rows are not sent back. A fresh client with nothing to upload is
    /// served the scope snapshot when one exists.
    pub fn apply_then_get_changes_sync(
        &self,
        context: &RoundContext,
        batch: &BatchInfo,
    ) -> Result<RemoteChanges> {
        let connection = self.base.open()?;
        let result = self.apply_then_get_changes_on(&connection, context, batch);
        self.base.close(&connection);
        result
    }

    fn apply_then_get_changes_on(
        &self,
        connection: &P::Connection,
        context: &RoundContext,
        batch: &BatchInfo,
    ) -> Result<RemoteChanges> {
        let scope = self.ensure_scope_on(connection, &context.scope_name)?;
        self.setup.check_parameters(&context.parameters)?;

        let fresh = context.server_timestamp.is_none();
        let snapshot = if fresh && batch.is_empty() {
            let directory = snapshot_directory(self.base.options(), &context.scope_name, &context.parameters);
            if directory.join(SUMMARY_FILE).exists() {
                Some(BatchInfo::open(&directory)?)
            } else {
                None
            }
        } else {
            None
        };

        // The history records the watermark the client is handed, so tombstones
        // newer than a snapshot survive cleanup until the client has them.
        let (outcome, server_timestamp) = self.base.in_transaction(connection, || {
            let outcome = self.base.apply_changes(
                connection,
                &scope.schema,
                batch,
                ApplyArgs {
                    side: SyncSide::Server,
                    sender_scope_id: Some(context.client_scope_id),
                    last_timestamp: context.server_timestamp,
                    use_insert: false,
                    policy: context.conflict_policy,
                },
                None,
            )?;
            let timestamp = match &snapshot {
                Some(snapshot) => snapshot.timestamp().unwrap_or(Timestamp::ZERO),
                None => self.base.local_timestamp(connection)?,
            };
            self.record_history(connection, &context.scope_name, context.client_scope_id, timestamp)?;
            Ok((outcome, timestamp))
        })?;

        if let Some(snapshot) = snapshot {
            info!(
                scope = %context.scope_name,
                client = %context.client_scope_id,
                rows = snapshot.total_rows(),
                "serving snapshot"
            );
            return Ok(RemoteChanges {
                server_timestamp,
                batch: snapshot,
                applied_on_server: outcome.applied(),
                resolved_conflicts_on_server: outcome.resolved_conflicts(),
                failed_on_server: outcome.failed(),
                is_snapshot: true,
                shared_batch: true,
            });
        }

        // A reinitializing client wipes its tables, so it needs its own rows back.
        let reinitialize = context.sync_type.is_reinitialize();
        let mut writer = BatchWriter::for_round(self.base.options(), context.client_scope_id);
        self.base.enumerate_changes(
            connection,
            &scope.schema,
            &scope.setup,
            EnumerateArgs {
                side: SyncSide::Server,
                since: context.server_timestamp,
                exclude_scope_id: (!reinitialize).then_some(context.client_scope_id),
                parameters: &context.parameters,
                initialize: fresh || reinitialize,
            },
            &mut writer,
        )?;
        let changes = writer.finish_with_timestamp(Some(server_timestamp))?;
        debug!(
            scope = %context.scope_name,
            client = %context.client_scope_id,
            rows = changes.total_rows(),
            "server changes enumerated"
        );

        Ok(RemoteChanges {
            server_timestamp,
            batch: changes,
            applied_on_server: outcome.applied(),
            resolved_conflicts_on_server: outcome.resolved_conflicts(),
            failed_on_server: outcome.failed(),
            is_snapshot: false,
            shared_batch: false,
        })
    }

    /// Writes a snapshot of the scope for `parameters`, replacing any
    /// previous one.
    pub fn create_snapshot(&self, scope_name: &str, parameters: &SyncParameters) -> Result<BatchInfo> {
        let connection = self.base.open()?;
        let result = self.create_snapshot_on(&connection, scope_name, parameters);
        self.base.close(&connection);
        result
    }

    fn create_snapshot_on(
        &self,
        connection: &P::Connection,
        scope_name: &str,
        parameters: &SyncParameters,
    ) -> Result<BatchInfo> {
        let scope = self.ensure_scope_on(connection, scope_name)?;
        self.setup.check_parameters(parameters)?;

        let timestamp = self.base.local_timestamp(connection)?;
        let directory = snapshot_directory(self.base.options(), scope_name, parameters);
        if directory.exists() {
            fs::remove_dir_all(&directory)?;
        }

        let options = self.base.options();
        let mut writer =
            BatchWriter::new(&directory, options.batch_size, options.serializer).always_spill();
        self.base.enumerate_changes(
            connection,
            &scope.schema,
            &scope.setup,
            EnumerateArgs {
                side: SyncSide::Server,
                since: None,
                exclude_scope_id: None,
                parameters,
                initialize: true,
            },
            &mut writer,
        )?;
        let snapshot = writer.finish_with_timestamp(Some(timestamp))?;
        info!(
            scope = scope_name,
            directory = %directory.display(),
            rows = snapshot.total_rows(),
            timestamp = %timestamp,
            "snapshot created"
        );
        Ok(snapshot)
    }

    /// Purges tombstones every known client has already downloaded.
    /// Returns how many were removed.
    pub fn clean_metadatas(&self, scope_name: &str) -> Result<usize> {
        let connection = self.base.open()?;
        let result = self.clean_metadatas_on(&connection, scope_name);
        self.base.close(&connection);
        result
    }

    fn clean_metadatas_on(&self, connection: &P::Connection, scope_name: &str) -> Result<usize> {
        let Some(mut scope) = self.load_scope(connection, scope_name)? else {
            return Ok(0);
        };
        let histories = self.load_histories(connection, scope_name)?;
        let Some(up_to) = histories.iter().filter_map(|h| h.last_sync_timestamp).min() else {
            return Ok(0);
        };

        let mut removed = 0;
        for table in &scope.schema.tables {
            removed += self.base.provider().delete_metadata(connection, table, up_to)?;
        }
        scope.last_cleanup_timestamp = Some(up_to);
        self.save_scope(connection, &scope)?;
        info!(scope = scope_name, removed, up_to = %up_to, "server metadata cleaned");
        Ok(removed)
    }
}

#[async_trait]
impl<P: SyncProvider> RemoteOrchestrator for ServerOrchestrator<P> {
    async fn ensure_scope(&self, request: ScopeRequest) -> Result<ServerScopeInfo> {
        let scope = self.ensure_scope_sync(&request.scope_name)?;
        if request.setup.signature() != scope.setup.signature() {
            debug!(
                scope = %request.scope_name,
                client = %request.client_scope_id,
                "client announced a different setup"
            );
        }
        Ok(scope)
    }

    async fn apply_then_get_changes(
        &self,
        context: &RoundContext,
        batch: &BatchInfo,
    ) -> Result<RemoteChanges> {
        self.apply_then_get_changes_sync(context, batch)
    }
}
