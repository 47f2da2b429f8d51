//! Round state machine, progress reporting and round outcome.

use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc::UnboundedSender;

/// State of a sync round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// No round running.
    Idle,
    /// Loading or creating the local scope and the server scope.
    ScopeLoading,
    /// Comparing setups and provisioning the local store.
    SchemaProvisioning,
    /// Reading local changes into a batch.
    ChangesEnumerating,
    /// Exchanging batches with the server.
    ChangesTransmitting,
    /// Applying the server batch locally.
    ChangesApplying,
    /// Saving the scope watermarks.
    ScopeCommitting,
    /// The last round failed or was cancelled.
    Aborted,
}

impl SessionState {
    /// Returns true while a round is running.
    pub fn is_active(&self) -> bool {
        !matches!(self, SessionState::Idle | SessionState::Aborted)
    }

    /// Returns true if a new round can start.
    pub fn can_start_sync(&self) -> bool {
        !self.is_active()
    }

    /// Progress percentage reached when entering this state.
    pub fn base_percentage(&self) -> f64 {
        match self {
            SessionState::Idle | SessionState::Aborted => 0.0,
            SessionState::ScopeLoading => 5.0,
            SessionState::SchemaProvisioning => 15.0,
            SessionState::ChangesEnumerating => 25.0,
            SessionState::ChangesTransmitting => 45.0,
            SessionState::ChangesApplying => 70.0,
            SessionState::ScopeCommitting => 95.0,
        }
    }
}

/// A progress notification.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncProgress {
    /// Percentage in `0.0..=100.0`, non-decreasing within a round.
    pub percentage: f64,
    /// Human readable message.
    pub message: String,
    /// State of the round.
    pub state: SessionState,
}

/// Sends monotonic progress notifications on an optional channel.
#[derive(Debug, Default)]
pub struct ProgressReporter {
    sender: Option<UnboundedSender<SyncProgress>>,
    last: f64,
}

impl ProgressReporter {
    /// Creates a reporter; `None` discards every report.
    pub fn new(sender: Option<UnboundedSender<SyncProgress>>) -> Self {
        Self { sender, last: 0.0 }
    }

    /// Reports progress. Values below the last report are raised to it.
    pub fn report(&mut self, state: SessionState, percentage: f64, message: impl Into<String>) {
        let percentage = percentage.clamp(0.0, 100.0).max(self.last);
        self.last = percentage;
        if let Some(sender) = &self.sender {
            // A dropped receiver only means nobody listens any more.
            let _ = sender.send(SyncProgress {
                percentage,
                message: message.into(),
                state,
            });
        }
    }

    /// Reports the entry into a state.
    pub fn enter(&mut self, state: SessionState) {
        self.report(state, state.base_percentage(), format!("{state:?}"));
    }

    /// Last reported percentage.
    pub fn last(&self) -> f64 {
        self.last
    }
}

/// Row counts of one table for one round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TableStats {
    /// Rows sent to the server.
    pub uploaded: usize,
    /// Rows received from the server.
    pub downloaded: usize,
    /// Received rows applied locally.
    pub applied: usize,
    /// Conflicts resolved locally.
    pub resolved_conflicts: usize,
    /// Received rows that could not be applied.
    pub failed: usize,
}

/// Outcome of a committed round.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncResult {
    /// Scope name.
    pub scope_name: String,
    /// Rows sent to the server.
    pub total_changes_uploaded: usize,
    /// Rows received from the server.
    pub total_changes_downloaded: usize,
    /// Uploaded rows the server applied.
    pub total_changes_applied_on_server: usize,
    /// Downloaded rows applied locally.
    pub total_changes_applied_on_client: usize,
    /// Conflicts resolved on either side.
    pub total_resolved_conflicts: usize,
    /// Rows that could not be applied on either side.
    pub total_failed_rows: usize,
    /// Whether the download was served from a snapshot.
    pub snapshot_applied: bool,
    /// Per-table counts, keyed by fully qualified name.
    pub per_table: BTreeMap<String, TableStats>,
    /// Start of the round.
    pub started_at: SystemTime,
    /// Duration of the round.
    pub duration: Duration,
}

impl SyncResult {
    /// Creates an empty outcome for a round starting now.
    pub fn new(scope_name: impl Into<String>) -> Self {
        Self {
            scope_name: scope_name.into(),
            total_changes_uploaded: 0,
            total_changes_downloaded: 0,
            total_changes_applied_on_server: 0,
            total_changes_applied_on_client: 0,
            total_resolved_conflicts: 0,
            total_failed_rows: 0,
            snapshot_applied: false,
            per_table: BTreeMap::new(),
            started_at: SystemTime::now(),
            duration: Duration::ZERO,
        }
    }

    /// Stats of a table, created on first use.
    pub fn table_mut(&mut self, table: &str) -> &mut TableStats {
        self.per_table.entry(table.to_string()).or_default()
    }
}

impl fmt::Display for SyncResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "scope {}: uploaded {} (applied on server {}), downloaded {} (applied {}), \
             conflicts {}, failed {}, in {} ms",
            self.scope_name,
            self.total_changes_uploaded,
            self.total_changes_applied_on_server,
            self.total_changes_downloaded,
            self.total_changes_applied_on_client,
            self.total_resolved_conflicts,
            self.total_failed_rows,
            self.duration.as_millis()
        )
    }
}
