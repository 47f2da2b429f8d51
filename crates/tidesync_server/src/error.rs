//! Error types for the sync server.

use thiserror::Error;
use tidesync_engine::protocol::{ErrorKind, ErrorResponse, ProtocolError};
use tidesync_engine::SyncError;
use uuid::Uuid;

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors that can occur while serving a request.
#[derive(Error, Debug)]
pub enum ServerError {
    /// Invalid request format.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Missing, malformed or expired token.
    #[error("not authenticated: {0}")]
    NotAuthenticated(String),

    /// The serializer header names an unknown serializer.
    #[error("unknown serializer: {0}")]
    UnknownSerializer(String),

    /// Protocol version mismatch.
    #[error("protocol version mismatch: {0}")]
    ProtocolMismatch(String),

    /// A follow-up request without a session.
    #[error("no session for client {0}")]
    SessionNotFound(Uuid),

    /// The round failed on the server.
    #[error(transparent)]
    Sync(#[from] SyncError),

    /// Internal server error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<ProtocolError> for ServerError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Serialization(message) => ServerError::InvalidRequest(message),
            other => ServerError::Sync(other.into()),
        }
    }
}

impl ServerError {
    /// Wire classification of the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ServerError::InvalidRequest(_) => ErrorKind::BadRequest,
            ServerError::NotAuthenticated(_) => ErrorKind::NotAuthenticated,
            ServerError::UnknownSerializer(_) => ErrorKind::UnknownSerializer,
            ServerError::ProtocolMismatch(_) => ErrorKind::UnsupportedVersion,
            ServerError::SessionNotFound(_) => ErrorKind::SessionNotFound,
            ServerError::Internal(_) => ErrorKind::Internal,
            ServerError::Sync(err) => match err.root() {
                SyncError::MissingParameter { .. } => ErrorKind::MissingParameter,
                SyncError::SetupConflict { .. } => ErrorKind::SetupConflict,
                SyncError::ConflictAborted { .. } => ErrorKind::ConflictAborted,
                SyncError::NotAuthenticated(_) => ErrorKind::NotAuthenticated,
                _ => ErrorKind::Internal,
            },
        }
    }

    /// HTTP status of the error.
    pub fn status(&self) -> u16 {
        self.kind().status()
    }

    /// Returns true if this is a client error (4xx).
    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.status())
    }

    /// Body sent back to the client.
    pub fn to_response(&self) -> ErrorResponse {
        ErrorResponse::new(self.kind(), self.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tidesync_engine::SessionState;

    #[test]
    fn error_classification() {
        assert!(ServerError::InvalidRequest("bad".into()).is_client_error());
        assert!(!ServerError::Internal("oops".into()).is_client_error());
        assert_eq!(ServerError::UnknownSerializer("xml".into()).status(), 415);
        assert_eq!(ServerError::NotAuthenticated("expired".into()).status(), 401);
    }

    #[test]
    fn sync_errors_keep_their_kind_through_phases() {
        let err = ServerError::from(
            SyncError::MissingParameter {
                table: "Customer".into(),
                parameter: "region".into(),
            }
            .in_phase(SessionState::ChangesEnumerating, Some("Customer")),
        );
        assert_eq!(err.kind(), ErrorKind::MissingParameter);
        assert_eq!(err.status(), 400);

        let err = ServerError::from(SyncError::Protocol("boom".into()));
        assert_eq!(err.status(), 500);
    }

    #[test]
    fn bad_payloads_are_client_errors() {
        let err = ServerError::from(ProtocolError::Serialization("eof".into()));
        assert_eq!(err.kind(), ErrorKind::BadRequest);
        assert!(err.to_response().message.contains("eof"));
    }
}
