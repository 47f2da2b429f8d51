//! Row conflict description and resolution.

use crate::row::SyncRow;
use serde::{Deserialize, Serialize};

/// The side of a round a decision is taken on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncSide {
    /// The client store.
    Client,
    /// The server store.
    Server,
}

/// What collided when a remote row was applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConflictKind {
    /// Both sides updated the row.
    RemoteUpdateLocalUpdate,
    /// The remote side updated a row the local side deleted.
    RemoteUpdateLocalDelete,
    /// The remote side deleted a row the local side updated.
    RemoteDeleteLocalUpdate,
    /// The remote side inserted a row whose key already exists locally.
    RemoteInsertLocalExists,
    /// The remote row violates a unique constraint other than the key.
    UniqueKeyConstraint,
}

impl ConflictKind {
    /// Converts to a code.
    pub fn to_code(&self) -> u8 {
        match self {
            ConflictKind::RemoteUpdateLocalUpdate => 1,
            ConflictKind::RemoteUpdateLocalDelete => 2,
            ConflictKind::RemoteDeleteLocalUpdate => 3,
            ConflictKind::RemoteInsertLocalExists => 4,
            ConflictKind::UniqueKeyConstraint => 5,
        }
    }

    /// Converts from a code.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(ConflictKind::RemoteUpdateLocalUpdate),
            2 => Some(ConflictKind::RemoteUpdateLocalDelete),
            3 => Some(ConflictKind::RemoteDeleteLocalUpdate),
            4 => Some(ConflictKind::RemoteInsertLocalExists),
            5 => Some(ConflictKind::UniqueKeyConstraint),
            _ => None,
        }
    }
}

/// A remote row that could not be applied as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowConflict {
    /// Fully qualified table name.
    pub table: String,
    /// Conflict kind.
    pub kind: ConflictKind,
    /// The incoming row.
    pub remote_row: SyncRow,
    /// The local row, when it still exists.
    pub local_row: Option<SyncRow>,
}

/// Decision taken for a conflicting row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConflictAction {
    /// Keep the local row and skip the incoming one.
    Continue,
    /// Write the incoming row regardless of timestamps.
    ForceWrite,
    /// Abort the round.
    Abort,
}

/// Policy used when no custom resolver is installed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConflictResolutionPolicy {
    /// Server rows win.
    #[default]
    ServerWins,
    /// Client rows win.
    ClientWins,
}

impl ConflictResolutionPolicy {
    /// The side whose row survives.
    pub fn winner(&self) -> SyncSide {
        match self {
            ConflictResolutionPolicy::ServerWins => SyncSide::Server,
            ConflictResolutionPolicy::ClientWins => SyncSide::Client,
        }
    }

    /// Action for a conflict detected while applying rows on `side`.
    ///
    /// Incoming rows come from the opposite side, so they are forced when
    /// the opposite side is the winner.
    pub fn action_on(&self, side: SyncSide) -> ConflictAction {
        if self.winner() == side {
            ConflictAction::Continue
        } else {
            ConflictAction::ForceWrite
        }
    }

    /// Converts to a code.
    pub fn to_code(&self) -> u8 {
        match self {
            ConflictResolutionPolicy::ServerWins => 1,
            ConflictResolutionPolicy::ClientWins => 2,
        }
    }

    /// Converts from a code.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(ConflictResolutionPolicy::ServerWins),
            2 => Some(ConflictResolutionPolicy::ClientWins),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_wins() {
        let policy = ConflictResolutionPolicy::ServerWins;
        assert_eq!(policy.action_on(SyncSide::Client), ConflictAction::ForceWrite);
        assert_eq!(policy.action_on(SyncSide::Server), ConflictAction::Continue);
    }

    #[test]
    fn client_wins() {
        let policy = ConflictResolutionPolicy::ClientWins;
        assert_eq!(policy.action_on(SyncSide::Client), ConflictAction::Continue);
        assert_eq!(policy.action_on(SyncSide::Server), ConflictAction::ForceWrite);
    }

    #[test]
    fn policy_codes() {
        assert_eq!(
            ConflictResolutionPolicy::from_code(1),
            Some(ConflictResolutionPolicy::ServerWins)
        );
        assert_eq!(
            ConflictResolutionPolicy::from_code(2),
            Some(ConflictResolutionPolicy::ClientWins)
        );
        assert_eq!(ConflictResolutionPolicy::from_code(0), None);
    }

    #[test]
    fn kind_codes() {
        for kind in [
            ConflictKind::RemoteUpdateLocalUpdate,
            ConflictKind::RemoteUpdateLocalDelete,
            ConflictKind::RemoteDeleteLocalUpdate,
            ConflictKind::RemoteInsertLocalExists,
            ConflictKind::UniqueKeyConstraint,
        ] {
            assert_eq!(ConflictKind::from_code(kind.to_code()), Some(kind));
        }
        assert_eq!(ConflictKind::from_code(9), None);
    }
}
