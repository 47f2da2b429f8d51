//! Error types for the sync engine.

use crate::provider::{DbCommandType, ProviderError};
use crate::state::SessionState;
use thiserror::Error;
use tidesync_protocol::{ErrorKind, ProtocolError, TimestampError};

/// Result type for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;

/// Errors that can occur during a sync round.
#[derive(Error, Debug)]
pub enum SyncError {
    /// A command was requested without a connection.
    #[error("no connection supplied")]
    MissingConnection,

    /// The supplied connection is not open.
    #[error("connection is closed")]
    ConnectionClosed,

    /// The provider has no command of this type for the table.
    #[error("provider has no {command_type} command for table {table}")]
    MissingCommand {
        /// Fully qualified table name.
        table: String,
        /// Requested command type.
        command_type: DbCommandType,
    },

    /// The store reported an error.
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    /// A setup table has no primary key.
    #[error("table {table} has no primary key")]
    MissingPrimaryKey {
        /// Fully qualified table name.
        table: String,
    },

    /// The stored setup diverges from the server setup and the round was
    /// aborted.
    #[error("setup of scope {scope} conflicts with the server setup")]
    SetupConflict {
        /// Scope name.
        scope: String,
    },

    /// A required filter parameter was not supplied.
    #[error("missing filter parameter {parameter} for table {table}")]
    MissingParameter {
        /// Filtered table.
        table: String,
        /// Parameter name.
        parameter: String,
    },

    /// The server refused the credentials.
    #[error("not authenticated: {0}")]
    NotAuthenticated(String),

    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// Encoding or decoding a payload failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Batch file I/O failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The round was cancelled.
    #[error("sync cancelled")]
    Cancelled,

    /// Another round is running on the same agent.
    #[error("a sync session is already in progress")]
    SessionInProgress,

    /// A conflict resolver aborted the round.
    #[error("conflict on table {table} aborted the round")]
    ConflictAborted {
        /// Fully qualified table name.
        table: String,
    },

    /// The server answered with an error.
    #[error("remote error ({status}): {message}")]
    Remote {
        /// HTTP status.
        status: u16,
        /// Error kind reported by the server.
        kind: Option<ErrorKind>,
        /// Error message.
        message: String,
    },

    /// A timestamp could not be decoded.
    #[error(transparent)]
    Timestamp(#[from] TimestampError),

    /// Other protocol error.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// An error raised inside a round, tagged with where it happened.
    #[error("{state:?}{}: {source}", table_suffix(.table))]
    Phase {
        /// State the round was in.
        state: SessionState,
        /// Table being processed, if any.
        table: Option<String>,
        /// Underlying error.
        source: Box<SyncError>,
    },
}

impl SyncError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport { retryable, .. } => *retryable,
            SyncError::Remote { status, .. } => *status >= 500,
            SyncError::Phase { source, .. } => source.is_retryable(),
            _ => false,
        }
    }

    /// Returns the underlying error, looking through phase tags.
    pub fn root(&self) -> &SyncError {
        match self {
            SyncError::Phase { source, .. } => source.root(),
            other => other,
        }
    }

    /// Tags the error with a state and table, keeping an existing tag.
    pub fn in_phase(self, state: SessionState, table: Option<&str>) -> Self {
        match self {
            SyncError::Phase { .. } | SyncError::Cancelled | SyncError::SessionInProgress => self,
            other => SyncError::Phase {
                state,
                table: table.map(str::to_string),
                source: Box::new(other),
            },
        }
    }
}

fn table_suffix(table: &Option<String>) -> String {
    table
        .as_deref()
        .map(|t| format!(" on {t}"))
        .unwrap_or_default()
}

impl From<ProtocolError> for SyncError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::MissingPrimaryKey { table } => SyncError::MissingPrimaryKey { table },
            ProtocolError::MissingParameter { table, parameter } => {
                SyncError::MissingParameter { table, parameter }
            }
            ProtocolError::Serialization(message) => SyncError::Serialization(message),
            ProtocolError::Timestamp(err) => SyncError::Timestamp(err),
            other => SyncError::Protocol(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors() {
        assert!(SyncError::transport_retryable("connection lost").is_retryable());
        assert!(!SyncError::transport_fatal("invalid certificate").is_retryable());
        assert!(!SyncError::Cancelled.is_retryable());
        assert!(!SyncError::ConflictAborted { table: "t".into() }.is_retryable());
        let remote = SyncError::Remote {
            status: 503,
            kind: None,
            message: "busy".into(),
        };
        assert!(remote.is_retryable());
    }

    #[test]
    fn phase_tag_is_transparent() {
        let err = SyncError::transport_retryable("reset")
            .in_phase(SessionState::ChangesTransmitting, None)
            .in_phase(SessionState::ChangesApplying, Some("x"));

        assert!(err.is_retryable());
        assert!(matches!(err.root(), SyncError::Transport { .. }));
        match &err {
            SyncError::Phase { state, .. } => assert_eq!(*state, SessionState::ChangesTransmitting),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn phase_display_names_table() {
        let err = SyncError::ConflictAborted { table: "Product".into() }
            .in_phase(SessionState::ChangesApplying, Some("Product"));
        let msg = err.to_string();
        assert!(msg.contains("ChangesApplying"));
        assert!(msg.contains("on Product"));
    }

    #[test]
    fn protocol_errors_map_to_sync_errors() {
        let err: SyncError = ProtocolError::MissingParameter {
            table: "Order".into(),
            parameter: "customer_id".into(),
        }
        .into();
        assert!(matches!(err, SyncError::MissingParameter { .. }));

        let err: SyncError = ProtocolError::MissingPrimaryKey {
            table: "Log".into(),
        }
        .into();
        assert!(matches!(err, SyncError::MissingPrimaryKey { .. }));
    }

    #[test]
    fn cancellation_is_never_tagged() {
        let err = SyncError::Cancelled.in_phase(SessionState::ScopeLoading, None);
        assert!(matches!(err, SyncError::Cancelled));
    }
}
