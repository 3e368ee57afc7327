//! Error type shared by the queue, the state machine and the consensus glue.

use std::io;

use thiserror::Error;

/// Convenience alias used across the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Everything that can go wrong between a client call and an applied entry.
#[derive(Debug, Error)]
pub enum Error {
    /// The local node is not the leader. `leader` is the last known leader, if any.
    #[error("node is not the leader (known leader: {leader:?})")]
    NotLeader { leader: Option<u64> },

    /// No commit decision arrived in time. The entry may still commit later.
    #[error("timed out waiting for the entry to commit; outcome unknown")]
    Timeout,

    /// The node stepped down while the entry was in flight. Outcome unknown.
    #[error("leadership lost before the entry was applied; outcome unknown")]
    LeadershipLost,

    #[error("command serialization failed: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("unknown operation tag {0}")]
    UnknownOperation(u8),

    /// A snapshot or configuration payload could not be decoded.
    #[error("malformed payload: {0}")]
    Decode(String),

    #[error("snapshot i/o failed: {0}")]
    SnapshotIo(#[source] io::Error),

    /// A snapshot could not be captured or persisted.
    #[error("snapshot failed: {0}")]
    Snapshot(String),

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// A membership step failed while reconciling a join.
    #[error("failed to {action} node {id} ({address}): {source}")]
    Membership {
        action: &'static str,
        id: u64,
        address: String,
        #[source]
        source: Box<Error>,
    },

    #[error("a configuration change is already in progress")]
    ConfChangeInProgress,

    #[error("configuration changed (expected index {expected}, current {current})")]
    ConfigurationChanged { expected: u64, current: u64 },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("consensus engine error: {0}")]
    Raft(#[from] raft::Error),

    /// The node worker is gone.
    #[error("node has stopped")]
    Stopped,
}

/// The small error set exposed to clients.
///
/// It is enough to decide whether to retry, and against which node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotLeader,
    Timeout,
    Internal,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotLeader { .. } => ErrorKind::NotLeader,
            Error::Timeout | Error::LeadershipLost => ErrorKind::Timeout,
            Error::Membership { source, .. } => source.kind(),
            Error::Raft(raft::Error::ProposalDropped) => ErrorKind::NotLeader,
            _ => ErrorKind::Internal,
        }
    }

    pub(crate) fn decode(err: impl std::fmt::Display) -> Self {
        Error::Decode(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn membership_errors_inherit_the_kind_of_their_cause() {
        let err = Error::Membership {
            action: "remove",
            id: 2,
            address: "127.0.0.1:7002".into(),
            source: Box::new(Error::NotLeader { leader: Some(1) }),
        };
        assert_eq!(err.kind(), ErrorKind::NotLeader);
        assert!(err.to_string().contains("failed to remove node 2"));
    }

    #[test]
    fn unknown_failures_are_internal() {
        assert_eq!(Error::UnknownOperation(9).kind(), ErrorKind::Internal);
        assert_eq!(Error::LeadershipLost.kind(), ErrorKind::Timeout);
    }
}
