use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    sync::Arc,
};

use serde::{Deserialize, Serialize};

use crate::error::NodeError;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(Arc<str>);

impl NodeId {
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(Arc::from(id.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Vote tally for one quorum round.
///
/// A node appears on at most one side and votes are never retracted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoundStats {
    pub membership_size: usize,
    pub quorum_size: usize,
    pub votes_for: BTreeSet<NodeId>,
    pub votes_against: BTreeMap<NodeId, NodeError>,
}

impl RoundStats {
    pub fn new(membership_size: usize) -> Self {
        Self {
            membership_size,
            quorum_size: quorum_size(membership_size),
            votes_for: BTreeSet::new(),
            votes_against: BTreeMap::new(),
        }
    }

    pub fn record_for(&mut self, node: NodeId) -> bool {
        if self.votes_against.contains_key(&node) {
            return false;
        }
        self.votes_for.insert(node)
    }

    pub fn record_against(&mut self, node: NodeId, error: NodeError) -> bool {
        if self.votes_for.contains(&node) || self.votes_against.contains_key(&node) {
            return false;
        }
        self.votes_against.insert(node, error);
        true
    }

    pub fn votes_cast(&self) -> usize {
        self.votes_for.len() + self.votes_against.len()
    }

    pub fn is_complete(&self) -> bool {
        self.votes_cast() >= self.membership_size
    }

    pub fn has_quorum_for(&self) -> bool {
        self.votes_for.len() >= self.quorum_size
    }

    pub fn has_quorum_against(&self) -> bool {
        self.votes_against.len() >= self.quorum_size
    }
}

pub fn quorum_size(membership_size: usize) -> usize {
    membership_size / 2 + 1
}
