use serde::Serialize;
use thiserror::Error;

use crate::types::RoundStats;

/// Failure reported by a single node. Folded into an "against" vote by the
/// coordinator, never raised to callers on its own.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum NodeError {
    #[error("script is not cached on the node")]
    NoScript,
    #[error("resource locked: {affected} of {expected} keys affected")]
    ResourceLocked { affected: i64, expected: usize },
    #[error("node call timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    #[error("node connection closed")]
    Closed,
    #[error("node unreachable: {0}")]
    Unreachable(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("server error: {0}")]
    Server(String),
}

impl NodeError {
    pub fn is_resource_locked(&self) -> bool {
        matches!(self, Self::ResourceLocked { .. })
    }
}

#[derive(Debug, Error)]
pub enum MaxlockError {
    #[error("precondition failed: {0}")]
    Precondition(String),
    #[error("unable to reach quorum after {} attempt(s)", attempts.len())]
    QuorumUnreachable { attempts: Vec<RoundStats> },
    #[error("quorum round fault: {0}")]
    RoundFault(String),
    #[error("internal error: {0}")]
    InternalError(String),
    #[error(transparent)]
    Node(#[from] NodeError),
}

impl MaxlockError {
    pub fn precondition(message: impl Into<String>) -> Self {
        Self::Precondition(message.into())
    }

    /// True when a failed quorum was caused, at least in part, by another
    /// holder owning one or more of the requested keys.
    pub fn is_resource_locked(&self) -> bool {
        match self {
            Self::QuorumUnreachable { attempts } => attempts
                .iter()
                .any(|stats| stats.votes_against.values().any(NodeError::is_resource_locked)),
            Self::Node(err) => err.is_resource_locked(),
            _ => false,
        }
    }

    pub fn attempts(&self) -> &[RoundStats] {
        match self {
            Self::QuorumUnreachable { attempts } => attempts,
            _ => &[],
        }
    }
}

pub type Result<T> = std::result::Result<T, MaxlockError>;

#[cfg(test)]
mod tests {
    use crate::types::{NodeId, RoundStats};

    use super::{MaxlockError, NodeError};

    #[test]
    fn quorum_failure_reports_resource_locked_votes() {
        let mut stats = RoundStats::new(3);
        stats.record_against(
            NodeId::new("a"),
            NodeError::ResourceLocked {
                affected: 0,
                expected: 1,
            },
        );
        stats.record_against(NodeId::new("b"), NodeError::Closed);

        let err = MaxlockError::QuorumUnreachable {
            attempts: vec![stats],
        };
        assert!(err.is_resource_locked());
        assert_eq!(err.to_string(), "unable to reach quorum after 1 attempt(s)");
    }

    #[test]
    fn transport_only_failure_is_not_resource_locked() {
        let mut stats = RoundStats::new(3);
        stats.record_against(NodeId::new("a"), NodeError::Unreachable("refused".to_string()));

        let err = MaxlockError::QuorumUnreachable {
            attempts: vec![stats],
        };
        assert!(!err.is_resource_locked());
        assert!(!MaxlockError::precondition("closed").is_resource_locked());
    }

    #[test]
    fn node_error_serializes_with_kind_tag() {
        let value = serde_json::to_value(NodeError::Timeout { timeout_ms: 50 }).unwrap();
        assert_eq!(value["kind"], "timeout");
        assert_eq!(value["detail"]["timeout_ms"], 50);
    }
}
