//! HTTP protocol messages.
//!
//! A round is three kinds of POST:
//!
//! 1. `/sync/scope`: the client announces its scope and setup, the server
//!    answers with its scope record (schema included).
//! 2. `/sync/changes`: the client uploads its batch one part per request.
//!    Every intermediate part is acknowledged; the last one triggers the
//!    server apply and enumeration, and the response carries the first
//!    downloaded part plus the download part count.
//! 3. `/sync/changes/more`: the client fetches the remaining parts.

use crate::batch::BatchPart;
use crate::conflict::ConflictResolutionPolicy;
use crate::scope::{ServerScopeInfo, SyncType};
use crate::setup::{SyncParameters, SyncSetup};
use crate::timestamp::Timestamp;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Current protocol version.
pub const PROTOCOL_VERSION: u16 = 1;

/// Header naming the payload serializer.
pub const HEADER_SERIALIZER: &str = "tidesync-serializer";
/// Header carrying the client protocol version.
pub const HEADER_PROTOCOL_VERSION: &str = "tidesync-version";
/// Header carrying the scope name.
pub const HEADER_SCOPE_NAME: &str = "tidesync-scope-name";
/// Header carrying the authentication token.
pub const HEADER_TOKEN: &str = "tidesync-token";

/// The HTTP endpoints of a round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HttpStep {
    /// Scope handshake.
    EnsureScope,
    /// Upload changes, receive the first downloaded part.
    SendChanges,
    /// Fetch a further downloaded part.
    GetMoreChanges,
}

impl HttpStep {
    /// Request path.
    pub fn path(&self) -> &'static str {
        match self {
            HttpStep::EnsureScope => "/sync/scope",
            HttpStep::SendChanges => "/sync/changes",
            HttpStep::GetMoreChanges => "/sync/changes/more",
        }
    }

    /// Resolves a request path.
    pub fn from_path(path: &str) -> Option<Self> {
        match path.trim_end_matches('/') {
            "/sync/scope" => Some(HttpStep::EnsureScope),
            "/sync/changes" => Some(HttpStep::SendChanges),
            "/sync/changes/more" => Some(HttpStep::GetMoreChanges),
            _ => None,
        }
    }
}

/// Scope handshake request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScopeRequest {
    /// Scope name.
    pub scope_name: String,
    /// Client scope identifier.
    pub client_scope_id: Uuid,
    /// Setup the client was configured with.
    pub setup: SyncSetup,
}

/// Scope handshake response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScopeResponse {
    /// Server scope record.
    pub server_scope: ServerScopeInfo,
}

/// One uploaded part of a client batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangesRequest {
    /// Scope name.
    pub scope_name: String,
    /// Client scope identifier.
    pub client_scope_id: Uuid,
    /// Round kind.
    pub sync_type: SyncType,
    /// Server watermark held by the client, `None` on a first round.
    pub server_timestamp: Option<Timestamp>,
    /// Filter parameters.
    pub parameters: SyncParameters,
    /// Policy the client asks the server to apply.
    pub conflict_policy: ConflictResolutionPolicy,
    /// Uploaded part; `None` when the client has nothing to send.
    pub part: Option<BatchPart>,
    /// Whether this is the last uploaded part.
    pub is_last_part: bool,
}

/// Server answer to an uploaded part.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangesResponse {
    /// False for the acknowledgement of an intermediate part.
    pub complete: bool,
    /// Server timestamp the download was read at.
    pub server_timestamp: Timestamp,
    /// First downloaded part.
    pub part: Option<BatchPart>,
    /// Number of downloaded parts.
    pub part_count: usize,
    /// Client rows applied by the server.
    pub applied_on_server: usize,
    /// Conflicts the server resolved.
    pub resolved_conflicts_on_server: usize,
    /// Client rows the server could not apply.
    pub failed_on_server: usize,
    /// Whether the download was served from a snapshot.
    pub is_snapshot: bool,
}

impl ChangesResponse {
    /// Acknowledgement of an intermediate part.
    pub fn ack() -> Self {
        Self {
            complete: false,
            server_timestamp: Timestamp::ZERO,
            part: None,
            part_count: 0,
            applied_on_server: 0,
            resolved_conflicts_on_server: 0,
            failed_on_server: 0,
            is_snapshot: false,
        }
    }
}

/// Request for a further downloaded part.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoreChangesRequest {
    /// Scope name.
    pub scope_name: String,
    /// Client scope identifier.
    pub client_scope_id: Uuid,
    /// Index of the requested part.
    pub part_index: usize,
}

/// A further downloaded part.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MoreChangesResponse {
    /// The part.
    pub part: BatchPart,
    /// Whether this is the last part.
    pub is_last_part: bool,
}

/// Classification of a failed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Missing, invalid or expired token.
    NotAuthenticated,
    /// A required filter parameter was not supplied.
    MissingParameter,
    /// Client and server setups diverge.
    SetupConflict,
    /// The serializer header names an unknown serializer.
    UnknownSerializer,
    /// The client speaks another protocol version.
    UnsupportedVersion,
    /// Malformed request.
    BadRequest,
    /// No session for a follow-up request.
    SessionNotFound,
    /// A conflict resolver aborted the round.
    ConflictAborted,
    /// Any other server failure.
    Internal,
}

impl ErrorKind {
    /// HTTP status code for this kind.
    pub fn status(&self) -> u16 {
        match self {
            ErrorKind::NotAuthenticated => 401,
            ErrorKind::MissingParameter
            | ErrorKind::UnsupportedVersion
            | ErrorKind::BadRequest => 400,
            ErrorKind::SessionNotFound => 404,
            ErrorKind::SetupConflict | ErrorKind::ConflictAborted => 409,
            ErrorKind::UnknownSerializer => 415,
            ErrorKind::Internal => 500,
        }
    }
}

/// Error body returned with a non-2xx status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Error kind.
    pub kind: ErrorKind,
    /// Human readable message.
    pub message: String,
}

impl ErrorResponse {
    /// Creates an error body.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}
