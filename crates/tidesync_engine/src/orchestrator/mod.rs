//! Orchestrators drive one side of a round.
//!
//! [`LocalOrchestrator`] runs on the client store. [`ServerOrchestrator`]
//! runs on the server store and can be used in-process. The agent talks to
//! the server through [`RemoteOrchestrator`], implemented by the server
//! orchestrator itself and by [`WebRemoteOrchestrator`] over HTTP.

mod base;
mod local;
mod server;
mod web;

pub use base::{ApplyArgs, ApplyOutcome, BaseOrchestrator, EnumerateArgs};
pub use local::{LocalOrchestrator, ProvisionOutcome, CLIENT_SCOPE_PREFIX};
pub use server::{ServerOrchestrator, HISTORY_PREFIX, SERVER_SCOPE_PREFIX};
pub use web::{
    HttpClient, HttpResponse, LoopbackClient, LoopbackServer, WebRemoteOrchestrator,
};

use crate::batch::BatchInfo;
use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tidesync_protocol::{
    BatchPart, ChangesRequest, ConflictAction, ConflictResolutionPolicy, RowConflict,
    ScopeRequest, ServerScopeInfo, SyncParameters, SyncSetup, SyncType, Timestamp,
};
use uuid::Uuid;

/// Decides how a row conflict is resolved.
pub type ConflictResolver = Arc<dyn Fn(&RowConflict) -> ConflictAction + Send + Sync>;

/// Decides what happens when the stored setup diverges from the server's.
pub type SetupConflictStrategy =
    Arc<dyn Fn(&SetupConflict) -> ConflictingSetupAction + Send + Sync>;

/// Decision of a [`SetupConflictStrategy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConflictingSetupAction {
    /// Keep the local provisioning and sync anyway.
    Continue,
    /// Drop the local tracking and provision the server schema.
    Reprovision,
    /// Abort the round.
    #[default]
    Abort,
}

/// A diverging setup, as seen by a [`SetupConflictStrategy`].
#[derive(Debug, Clone)]
pub struct SetupConflict {
    /// Scope name.
    pub scope_name: String,
    /// Setup the client is provisioned with.
    pub local_setup: SyncSetup,
    /// Setup announced by the server.
    pub server_setup: SyncSetup,
}

/// What the client tells the server about a round.
#[derive(Debug, Clone)]
pub struct RoundContext {
    /// Scope name.
    pub scope_name: String,
    /// Client scope id.
    pub client_scope_id: Uuid,
    /// Kind of round.
    pub sync_type: SyncType,
    /// Server watermark of the client.
    pub server_timestamp: Option<Timestamp>,
    /// Filter values.
    pub parameters: SyncParameters,
    /// Policy applied on the server when it has no resolver.
    pub conflict_policy: ConflictResolutionPolicy,
}

impl RoundContext {
    /// Builds an upload request carrying `part`.
    pub fn changes_request(&self, part: Option<BatchPart>, is_last_part: bool) -> ChangesRequest {
        ChangesRequest {
            scope_name: self.scope_name.clone(),
            client_scope_id: self.client_scope_id,
            sync_type: self.sync_type,
            server_timestamp: self.server_timestamp,
            parameters: self.parameters.clone(),
            conflict_policy: self.conflict_policy,
            part,
            is_last_part,
        }
    }

    /// Recovers the context from an upload request.
    pub fn from_request(request: &ChangesRequest) -> Self {
        Self {
            scope_name: request.scope_name.clone(),
            client_scope_id: request.client_scope_id,
            sync_type: request.sync_type,
            server_timestamp: request.server_timestamp,
            parameters: request.parameters.clone(),
            conflict_policy: request.conflict_policy,
        }
    }
}

/// What the server returns for a round.
#[derive(Debug)]
pub struct RemoteChanges {
    /// New server watermark of the client.
    pub server_timestamp: Timestamp,
    /// Server changes to apply locally.
    pub batch: BatchInfo,
    /// Uploaded rows applied on the server.
    pub applied_on_server: usize,
    /// Conflicts the server resolved.
    pub resolved_conflicts_on_server: usize,
    /// Uploaded rows the server could not apply.
    pub failed_on_server: usize,
    /// Whether `batch` is a snapshot.
    pub is_snapshot: bool,
    /// Whether `batch` lives in the server's shared snapshot directory, which
    /// the round must not remove.
    pub shared_batch: bool,
}

/// The server side of a round, as seen by the agent.
#[async_trait]
pub trait RemoteOrchestrator: Send + Sync {
    /// Loads or provisions the server scope.
    async fn ensure_scope(&self, request: ScopeRequest) -> Result<ServerScopeInfo>;

    /// Applies the client batch, then returns the server changes.
    async fn apply_then_get_changes(
        &self,
        context: &RoundContext,
        batch: &BatchInfo,
    ) -> Result<RemoteChanges>;
}
