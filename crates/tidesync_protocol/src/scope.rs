//! Scope records kept by clients and servers between rounds.

use crate::schema::SyncSet;
use crate::setup::SyncSetup;
use crate::timestamp::Timestamp;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Scope name used when the caller does not name one.
pub const DEFAULT_SCOPE_NAME: &str = "DefaultScope";

/// Kind of round to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SyncType {
    /// Exchange changes since the last watermarks.
    #[default]
    Normal,
    /// Drop local rows and re-download everything, without uploading.
    Reinitialize,
    /// Upload local changes, then drop local rows and re-download everything.
    ReinitializeWithUpload,
}

impl SyncType {
    /// Returns true for both reinitialize variants.
    pub fn is_reinitialize(&self) -> bool {
        !matches!(self, SyncType::Normal)
    }

    /// Returns true if local changes are uploaded during the round.
    pub fn uploads(&self) -> bool {
        !matches!(self, SyncType::Reinitialize)
    }
}

/// Client-side record of a scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncScope {
    /// Identifier of this client for the scope.
    pub scope_id: Uuid,
    /// Scope name.
    pub name: String,
    /// Local watermark: local changes up to here have been uploaded.
    pub last_sync_timestamp: Option<Timestamp>,
    /// Server watermark: server changes up to here have been applied.
    pub last_server_sync_timestamp: Option<Timestamp>,
    /// Setup the scope was provisioned with.
    pub setup: Option<SyncSetup>,
    /// Schema the scope was provisioned with.
    pub schema: Option<SyncSet>,
    /// End of the last successful round, unix milliseconds.
    pub last_sync: Option<u64>,
    /// Duration of the last successful round, milliseconds.
    pub last_sync_duration_ms: Option<u64>,
}

impl SyncScope {
    /// Creates a fresh, unprovisioned scope with a new identifier.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            scope_id: Uuid::new_v4(),
            name: name.into(),
            last_sync_timestamp: None,
            last_server_sync_timestamp: None,
            setup: None,
            schema: None,
            last_sync: None,
            last_sync_duration_ms: None,
        }
    }

    /// Returns true once a setup and schema have been stored.
    pub fn is_provisioned(&self) -> bool {
        self.setup.is_some() && self.schema.is_some()
    }

    /// Records a committed round.
    ///
    /// Both watermarks only move forward.
    pub fn advance(&mut self, local: Timestamp, server: Timestamp) {
        self.last_sync_timestamp = Some(max_of(self.last_sync_timestamp, local));
        self.last_server_sync_timestamp = Some(max_of(self.last_server_sync_timestamp, server));
    }

    /// Forgets the server watermark so the next round downloads everything.
    pub fn reset_server_watermark(&mut self) {
        self.last_server_sync_timestamp = None;
    }
}

fn max_of(previous: Option<Timestamp>, next: Timestamp) -> Timestamp {
    previous.map_or(next, |p| p.max(next))
}

/// Server-side record of a scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerScopeInfo {
    /// Scope name.
    pub name: String,
    /// Identifier stamped on rows written by the server itself.
    pub server_scope_id: Uuid,
    /// Setup the scope serves.
    pub setup: SyncSetup,
    /// Schema read from the server store.
    pub schema: SyncSet,
    /// Timestamp of the last tombstone cleanup.
    pub last_cleanup_timestamp: Option<Timestamp>,
}

impl ServerScopeInfo {
    /// Creates a server scope record.
    pub fn new(name: impl Into<String>, setup: SyncSetup, schema: SyncSet) -> Self {
        Self {
            name: name.into(),
            server_scope_id: Uuid::new_v4(),
            setup,
            schema,
            last_cleanup_timestamp: None,
        }
    }
}

/// Server-side history of one client for one scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerHistoryScope {
    /// Client scope identifier.
    pub client_scope_id: Uuid,
    /// Scope name.
    pub scope_name: String,
    /// Server timestamp the client has been served up to.
    pub last_sync_timestamp: Option<Timestamp>,
    /// End of the client's last round, unix milliseconds.
    pub last_sync: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_scope_is_unprovisioned() {
        let a = SyncScope::new(DEFAULT_SCOPE_NAME);
        let b = SyncScope::new(DEFAULT_SCOPE_NAME);
        assert_ne!(a.scope_id, b.scope_id);
        assert!(!a.is_provisioned());
        assert_eq!(a.last_sync_timestamp, None);
    }

    #[test]
    fn watermarks_never_move_back() {
        let mut scope = SyncScope::new("s");
        scope.advance(Timestamp::new(10), Timestamp::new(40));
        scope.advance(Timestamp::new(7), Timestamp::new(55));
        assert_eq!(scope.last_sync_timestamp, Some(Timestamp::new(10)));
        assert_eq!(scope.last_server_sync_timestamp, Some(Timestamp::new(55)));
    }

    #[test]
    fn sync_type_flags() {
        assert!(!SyncType::Normal.is_reinitialize());
        assert!(SyncType::Reinitialize.is_reinitialize());
        assert!(!SyncType::Reinitialize.uploads());
        assert!(SyncType::ReinitializeWithUpload.uploads());
    }
}
