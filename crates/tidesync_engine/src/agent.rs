//! The sync agent: runs rounds between the local store and a remote server.

use crate::batch::{BatchInfo, BatchWriter};
use crate::config::SyncOptions;
use crate::error::{Result, SyncError};
use crate::orchestrator::{
    ConflictResolver, LocalOrchestrator, RemoteOrchestrator, RoundContext, SetupConflictStrategy,
};
use crate::provider::SyncProvider;
use crate::state::{ProgressReporter, SessionState, SyncProgress, SyncResult};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tidesync_protocol::{ScopeRequest, SyncParameters, SyncSetup, SyncType, DEFAULT_SCOPE_NAME};
use tokio::sync::{broadcast, mpsc::UnboundedSender};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const STATE_CHANNEL_CAPACITY: usize = 32;

/// Runs sync rounds for one client store.
///
/// An agent runs one round at a time. Rounds are driven by
/// [`synchronize`](Self::synchronize):
///
/// 1. load the client scope and the server scope
/// 2. provision the local store from the server schema
/// 3. read local changes since the last round
/// 4. upload them, receive the server changes
/// 5. apply the server changes and save the watermarks atomically
///
/// A failed round saves nothing, so the next round starts over from the
/// same watermarks.
pub struct SyncAgent<P: SyncProvider, R: RemoteOrchestrator> {
    local: LocalOrchestrator<P>,
    remote: Arc<R>,
    setup: SyncSetup,
    running: AtomicBool,
    state: Mutex<SessionState>,
    state_tx: broadcast::Sender<SessionState>,
}

/// Clears the running flag when a round ends.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl<P: SyncProvider, R: RemoteOrchestrator> SyncAgent<P, R> {
    /// Creates an agent syncing `setup` between `provider` and `remote`.
    pub fn new(provider: Arc<P>, remote: Arc<R>, setup: SyncSetup, options: SyncOptions) -> Self {
        let (state_tx, _) = broadcast::channel(STATE_CHANNEL_CAPACITY);
        Self {
            local: LocalOrchestrator::new(provider, setup.clone(), options),
            remote,
            setup,
            running: AtomicBool::new(false),
            state: Mutex::new(SessionState::Idle),
            state_tx,
        }
    }

    /// Installs the strategy consulted when the server setup diverges from
    /// the provisioned one.
    pub fn with_setup_strategy(mut self, strategy: SetupConflictStrategy) -> Self {
        self.local = self.local.with_setup_strategy(strategy);
        self
    }

    /// Installs a conflict resolver for rows applied locally.
    pub fn with_resolver(mut self, resolver: ConflictResolver) -> Self {
        self.local = self.local.with_resolver(resolver);
        self
    }

    /// The local orchestrator.
    pub fn local(&self) -> &LocalOrchestrator<P> {
        &self.local
    }

    /// The remote orchestrator.
    pub fn remote(&self) -> &Arc<R> {
        &self.remote
    }

    /// The options.
    pub fn options(&self) -> &SyncOptions {
        self.local.base().options()
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    /// Receives every state transition from now on.
    pub fn subscribe_state(&self) -> broadcast::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    fn set_state(&self, state: SessionState) {
        *self.state.lock() = state;
        debug!(state = ?state, "session state");
        // No receiver is fine.
        let _ = self.state_tx.send(state);
    }

    fn enter(
        &self,
        state: SessionState,
        reporter: &mut ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        self.set_state(state);
        reporter.enter(state);
        Ok(())
    }

    /// Runs one round.
    ///
    /// `scope_name` defaults to [`DEFAULT_SCOPE_NAME`]. Filter parameters
    /// are checked before any remote call. Cancellation is honoured between
    /// states. Errors are tagged with the state they happened in.
    pub async fn synchronize(
        &self,
        scope_name: Option<&str>,
        sync_type: SyncType,
        parameters: &SyncParameters,
        progress: Option<UnboundedSender<SyncProgress>>,
        cancel: &CancellationToken,
    ) -> Result<SyncResult> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(SyncError::SessionInProgress);
        }
        let _guard = RunningGuard(&self.running);

        let scope_name = scope_name.unwrap_or(DEFAULT_SCOPE_NAME);
        self.setup.check_parameters(parameters)?;

        let connection = self.local.base().open()?;
        let mut reporter = ProgressReporter::new(progress);
        let outcome = self
            .run_round(&connection, scope_name, sync_type, parameters, &mut reporter, cancel)
            .await;
        self.local.base().close(&connection);

        match outcome {
            Ok(result) => {
                self.set_state(SessionState::Idle);
                reporter.report(SessionState::Idle, 100.0, "done");
                info!(%result, "round completed");
                Ok(result)
            }
            Err(err) => {
                let err = err.in_phase(self.state(), None);
                warn!(error = %err, "round aborted");
                self.set_state(SessionState::Aborted);
                Err(err)
            }
        }
    }

    async fn run_round(
        &self,
        connection: &P::Connection,
        scope_name: &str,
        sync_type: SyncType,
        parameters: &SyncParameters,
        reporter: &mut ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<SyncResult> {
        let started = Instant::now();
        let mut result = SyncResult::new(scope_name);
        let options = self.options();

        self.enter(SessionState::ScopeLoading, reporter, cancel)?;
        let mut scope = self.local.load_scope(connection, scope_name)?;
        let server_scope = self
            .remote
            .ensure_scope(ScopeRequest {
                scope_name: scope_name.to_string(),
                client_scope_id: scope.scope_id,
                setup: self.setup.clone(),
            })
            .await?;

        self.enter(SessionState::SchemaProvisioning, reporter, cancel)?;
        let provisioned = self.local.base().in_transaction(connection, || {
            self.local.provision(connection, &mut scope, &server_scope)
        })?;
        debug!(scope = scope_name, outcome = ?provisioned, "provisioning checked");

        let reinitialize = sync_type.is_reinitialize();
        if reinitialize {
            scope.reset_server_watermark();
        }

        self.enter(SessionState::ChangesEnumerating, reporter, cancel)?;
        let (local_timestamp, upload) = if sync_type.uploads() {
            let mut writer = BatchWriter::for_round(options, scope.scope_id);
            let (timestamp, counts) = self.local.get_changes(
                connection,
                &scope,
                Some(server_scope.server_scope_id),
                &mut writer,
            )?;
            for (table, count) in counts {
                result.table_mut(&table).uploaded += count;
            }
            (timestamp, writer.finish()?)
        } else {
            (self.local.base().local_timestamp(connection)?, BatchInfo::empty())
        };
        result.total_changes_uploaded = upload.total_rows();

        self.enter(SessionState::ChangesTransmitting, reporter, cancel)?;
        let context = RoundContext {
            scope_name: scope_name.to_string(),
            client_scope_id: scope.scope_id,
            sync_type,
            server_timestamp: scope.last_server_sync_timestamp,
            parameters: parameters.clone(),
            conflict_policy: options.conflict_resolution_policy,
        };
        let changes = self.remote.apply_then_get_changes(&context, &upload).await?;
        result.total_changes_applied_on_server = changes.applied_on_server;
        result.total_changes_downloaded = changes.batch.total_rows();
        result.snapshot_applied = changes.is_snapshot;
        for info in changes.batch.parts_info() {
            result.table_mut(&info.table_name).downloaded += info.row_count;
        }

        self.enter(SessionState::ChangesApplying, reporter, cancel)?;
        let use_insert = reinitialize || scope.last_server_sync_timestamp.is_none();
        let applied = self.local.base().in_transaction(connection, || {
            if reinitialize {
                if let Some(schema) = &scope.schema {
                    self.local.reset(connection, schema)?;
                }
            }
            let applied = self.local.apply_changes(
                connection,
                &scope,
                &changes.batch,
                server_scope.server_scope_id,
                use_insert,
                Some(&mut *reporter),
            )?;
            self.set_state(SessionState::ScopeCommitting);
            reporter.enter(SessionState::ScopeCommitting);
            self.local.commit_scope(
                connection,
                &mut scope,
                local_timestamp,
                changes.server_timestamp,
                started.elapsed(),
            )?;
            Ok(applied)
        })?;

        result.total_changes_applied_on_client = applied.applied();
        result.total_resolved_conflicts =
            applied.resolved_conflicts() + changes.resolved_conflicts_on_server;
        result.total_failed_rows = applied.failed() + changes.failed_on_server;
        for (table, stats) in &applied.per_table {
            let entry = result.table_mut(table);
            entry.applied += stats.applied;
            entry.resolved_conflicts += stats.resolved_conflicts;
            entry.failed += stats.failed;
        }

        if options.clean_folder {
            upload.try_remove_directory();
            if !changes.shared_batch {
                changes.batch.try_remove_directory();
            }
        }
        // The round is committed: a failed cleanup is retried next round.
        if options.clean_metadatas {
            if let Err(err) = self.local.clean_metadatas(connection, &scope) {
                warn!(scope = scope_name, error = %err, "metadata cleanup failed");
            }
        }

        result.duration = started.elapsed();
        Ok(result)
    }

    /// Runs [`synchronize`](Self::synchronize), retrying retryable failures
    /// with the backoff of the configured [`RetryConfig`](crate::RetryConfig).
    pub async fn synchronize_with_retry(
        &self,
        scope_name: Option<&str>,
        sync_type: SyncType,
        parameters: &SyncParameters,
        progress: Option<UnboundedSender<SyncProgress>>,
        cancel: &CancellationToken,
    ) -> Result<SyncResult> {
        let retry = &self.options().retry;
        let mut attempt = 0;
        loop {
            match self
                .synchronize(scope_name, sync_type, parameters, progress.clone(), cancel)
                .await
            {
                Ok(result) => return Ok(result),
                Err(err) if err.is_retryable() && attempt + 1 < retry.max_attempts => {
                    attempt += 1;
                    let delay = retry.delay_for_attempt(attempt);
                    warn!(error = %err, attempt, delay_ms = delay.as_millis() as u64, "retrying round");
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(SyncError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }
}
