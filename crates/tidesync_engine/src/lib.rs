//! # TideSync Engine
//!
//! Provider-agnostic synchronization between a client store and a server
//! store.
//!
//! This crate provides:
//! - The [`SyncProvider`] contract every database backend implements
//! - The [`SyncAdapter`], which turns provider commands into batch reads
//!   and row applies with conflict detection
//! - Local and server orchestrators driving each side of a round
//! - The [`SyncAgent`], which runs rounds and reports progress
//! - Batches spilled to disk once they outgrow the configured size
//! - An in-memory reference provider, [`MemoryProvider`]
//!
//! ## Rounds
//!
//! A round is a single exchange:
//! 1. The client reads its changes since its last round
//! 2. The server applies them, then returns its own changes since the
//!    client's server watermark
//! 3. The client applies the server changes and advances both watermarks
//!
//! ## Key Invariants
//!
//! - Rows applied from a peer are stamped with the peer's scope id and are
//!   never sent back to it
//! - Watermarks only move forward, and only when a round commits
//! - Deletes apply children first, modifications parents first
//! - A failed row never aborts the batch; a failed round saves nothing

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod adapter;
mod agent;
mod batch;
mod cache;
mod config;
mod error;
mod memory;
mod orchestrator;
mod provider;
mod state;

pub use adapter::{FailedRow, FailureReason, SyncAdapter};
pub use agent::SyncAgent;
pub use batch::{
    part_file_name, round_directory, snapshot_directory, BatchInfo, BatchWriter, BATCH_EXTENSION,
    SUMMARY_FILE,
};
pub use cache::{CommandCache, CommandCacheKey};
pub use config::{RetryConfig, SyncOptions, DEFAULT_BATCH_SIZE};
pub use error::{Result, SyncError};
pub use memory::{MemoryConnection, MemoryProvider, ParameterStyle};
pub use orchestrator::{
    ApplyArgs, ApplyOutcome, BaseOrchestrator, ConflictResolver, ConflictingSetupAction,
    EnumerateArgs, HttpClient, HttpResponse, LocalOrchestrator, LoopbackClient, LoopbackServer,
    ProvisionOutcome, RemoteChanges, RemoteOrchestrator, RoundContext, ServerOrchestrator,
    SetupConflict, SetupConflictStrategy, WebRemoteOrchestrator, CLIENT_SCOPE_PREFIX,
    HISTORY_PREFIX, SERVER_SCOPE_PREFIX,
};
pub use provider::{
    normalize_parameter_name, parameter_name_candidates, ColumnBinding, ConnectionState, DbCommand,
    DbCommandType, DbParameter, DbRecord, ParameterDirection, ProviderError, ProviderResult, SyncProvider,
    SYNC_FORCE_WRITE, SYNC_MIN_TIMESTAMP, SYNC_ROW_COUNT, SYNC_ROW_IS_TOMBSTONE, SYNC_SCOPE_ID,
    SYNC_TIMESTAMP, SYNC_UPDATE_SCOPE_ID,
};
pub use state::{ProgressReporter, SessionState, SyncProgress, SyncResult, TableStats};

pub use tidesync_protocol as protocol;
pub use tokio_util::sync::CancellationToken;
