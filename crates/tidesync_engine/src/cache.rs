//! Shared record of prepared commands.

use crate::provider::DbCommandType;
use parking_lot::RwLock;
use std::collections::HashSet;

/// Identity of a prepared command.
///
/// Data source and database keep tenants that share one adapter apart.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CommandCacheKey {
    /// Data source of the connection.
    pub data_source: String,
    /// Database of the connection.
    pub database: String,
    /// Fully qualified table name.
    pub table: String,
    /// Command type.
    pub command_type: DbCommandType,
}

/// Set of commands already prepared, safe for concurrent rounds.
#[derive(Debug, Default)]
pub struct CommandCache {
    prepared: RwLock<HashSet<CommandCacheKey>>,
}

impl CommandCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if the command was prepared.
    pub fn contains(&self, key: &CommandCacheKey) -> bool {
        self.prepared.read().contains(key)
    }

    /// Claims a key. Returns false when another caller already holds it.
    pub fn try_reserve(&self, key: CommandCacheKey) -> bool {
        self.prepared.write().insert(key)
    }

    /// Releases a key whose preparation failed.
    pub fn release(&self, key: &CommandCacheKey) {
        self.prepared.write().remove(key);
    }

    /// Number of prepared commands.
    pub fn len(&self) -> usize {
        self.prepared.read().len()
    }

    /// Returns true if nothing was prepared.
    pub fn is_empty(&self) -> bool {
        self.prepared.read().is_empty()
    }

    /// Forgets every prepared command.
    pub fn clear(&self) {
        self.prepared.write().clear();
    }
}
