use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use async_trait::async_trait;
use maxlock_common::{NodeError, NodeId};
use tokio::{sync::watch, time::Instant};

use crate::{
    node::{Node, SharedNode},
    scripts::{ScriptKind, ScriptSet},
};

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Instant,
}

#[derive(Debug, Default)]
struct MemoryState {
    entries: HashMap<String, Entry>,
    cached_scripts: HashSet<String>,
    unreachable: bool,
    hang: bool,
    injected: VecDeque<NodeError>,
    calls: HashMap<ScriptKind, usize>,
}

/// In-process node executing the lock scripts natively against a private
/// key space. Each evaluation runs under one mutex, so it is atomic with
/// respect to every other call on the same node.
pub struct MemoryNode {
    id: NodeId,
    scripts: Arc<ScriptSet>,
    state: Mutex<MemoryState>,
    closed: watch::Sender<bool>,
}

impl MemoryNode {
    pub fn new(id: impl AsRef<str>) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            id: NodeId::new(id),
            scripts: ScriptSet::standard(),
            state: Mutex::new(MemoryState::default()),
            closed,
        }
    }

    pub fn cluster(size: usize) -> Vec<Arc<MemoryNode>> {
        (0..size)
            .map(|index| Arc::new(MemoryNode::new(format!("memory-{index}"))))
            .collect()
    }

    pub fn shared(nodes: &[Arc<MemoryNode>]) -> Vec<SharedNode> {
        nodes
            .iter()
            .map(|node| Arc::clone(node) as SharedNode)
            .collect()
    }

    /// Every call fails immediately with [`NodeError::Unreachable`].
    pub fn set_unreachable(&self, unreachable: bool) {
        self.state().unreachable = unreachable;
    }

    /// Every call blocks until the node is closed.
    pub fn set_hang(&self, hang: bool) {
        self.state().hang = hang;
    }

    /// The next call fails with `error` without touching any key.
    pub fn fail_next(&self, error: NodeError) {
        self.state().injected.push_back(error);
    }

    /// Writes a key directly, as another lock holder would.
    pub fn insert(&self, key: impl Into<String>, value: impl Into<String>, ttl: Duration) {
        self.state().entries.insert(
            key.into(),
            Entry {
                value: value.into(),
                expires_at: Instant::now() + ttl,
            },
        );
    }

    pub fn value(&self, key: &str) -> Option<String> {
        let mut state = self.state();
        purge_expired(&mut state, key);
        state.entries.get(key).map(|entry| entry.value.clone())
    }

    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let mut state = self.state();
        purge_expired(&mut state, key);
        state
            .entries
            .get(key)
            .map(|entry| entry.expires_at.saturating_duration_since(Instant::now()))
    }

    pub fn calls(&self, kind: ScriptKind) -> usize {
        self.state().calls.get(&kind).copied().unwrap_or(0)
    }

    pub fn is_cached(&self, kind: ScriptKind) -> bool {
        let sha = &self.scripts.get(kind).sha;
        self.state().cached_scripts.contains(sha)
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    async fn admit(&self, kind: Option<ScriptKind>) -> Result<(), NodeError> {
        let hang = {
            let mut state = self.state();
            if let Some(kind) = kind {
                *state.calls.entry(kind).or_insert(0) += 1;
            }
            if *self.closed.borrow() {
                return Err(NodeError::Closed);
            }
            if state.unreachable {
                return Err(NodeError::Unreachable(format!("{} is down", self.id)));
            }
            if let Some(error) = state.injected.pop_front() {
                return Err(error);
            }
            state.hang
        };

        if hang {
            let mut closed = self.closed.subscribe();
            let _ = closed.wait_for(|closed| *closed).await;
            return Err(NodeError::Closed);
        }
        Ok(())
    }

    fn execute(
        &self,
        kind: ScriptKind,
        keys: &[String],
        args: &[String],
    ) -> Result<i64, NodeError> {
        let token = args
            .first()
            .ok_or_else(|| NodeError::Server("missing token argument".to_string()))?;

        let mut state = self.state();
        for key in keys {
            purge_expired(&mut state, key);
        }

        match kind {
            ScriptKind::Acquire => {
                let ttl = ttl_argument(args)?;
                if keys.iter().any(|key| state.entries.contains_key(key)) {
                    return Ok(0);
                }
                set_all(&mut state, keys, token, ttl);
                Ok(key_count(keys))
            }
            ScriptKind::Extend => {
                let ttl = ttl_argument(args)?;
                let held = keys.iter().all(|key| {
                    state
                        .entries
                        .get(key)
                        .is_some_and(|entry| &entry.value == token)
                });
                if !held {
                    return Ok(0);
                }
                set_all(&mut state, keys, token, ttl);
                Ok(key_count(keys))
            }
            ScriptKind::Release => {
                let mut deleted = 0;
                for key in keys {
                    if state
                        .entries
                        .get(key)
                        .is_some_and(|entry| &entry.value == token)
                    {
                        state.entries.remove(key);
                        deleted += 1;
                    }
                }
                Ok(deleted)
            }
        }
    }
}

#[async_trait]
impl Node for MemoryNode {
    fn id(&self) -> &NodeId {
        &self.id
    }

    async fn eval_sha(
        &self,
        sha: &str,
        keys: &[String],
        args: &[String],
    ) -> Result<i64, NodeError> {
        let kind = self.scripts.lookup_sha(sha);
        self.admit(kind).await?;

        if !self.state().cached_scripts.contains(sha) {
            return Err(NodeError::NoScript);
        }
        let kind = kind.ok_or(NodeError::NoScript)?;
        self.execute(kind, keys, args)
    }

    async fn eval(&self, body: &str, keys: &[String], args: &[String]) -> Result<i64, NodeError> {
        let kind = self.scripts.lookup_body(body);
        self.admit(kind).await?;

        let kind = kind.ok_or_else(|| NodeError::Server("unsupported script body".to_string()))?;
        let sha = self.scripts.get(kind).sha.clone();
        self.state().cached_scripts.insert(sha);
        self.execute(kind, keys, args)
    }

    async fn close(&self) -> Result<(), NodeError> {
        self.closed.send_replace(true);
        Ok(())
    }
}

fn purge_expired(state: &mut MemoryState, key: &str) {
    if state
        .entries
        .get(key)
        .is_some_and(|entry| entry.expires_at <= Instant::now())
    {
        state.entries.remove(key);
    }
}

fn set_all(state: &mut MemoryState, keys: &[String], token: &str, ttl: Duration) {
    let expires_at = Instant::now() + ttl;
    for key in keys {
        state.entries.insert(
            key.clone(),
            Entry {
                value: token.to_string(),
                expires_at,
            },
        );
    }
}

fn ttl_argument(args: &[String]) -> Result<Duration, NodeError> {
    args.get(1)
        .and_then(|raw| raw.parse::<u64>().ok())
        .filter(|millis| *millis > 0)
        .map(Duration::from_millis)
        .ok_or_else(|| NodeError::Server("invalid expire time".to_string()))
}

fn key_count(keys: &[String]) -> i64 {
    i64::try_from(keys.len()).unwrap_or(i64::MAX)
}
