use std::{
    collections::HashSet,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use futures::future::join_all;
use maxlock_common::{
    RoundStats,
    error::{MaxlockError, Result},
    quorum_size, time,
};
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::{
    config::{CoordinatorConfig, validate_policy},
    events::{EventSink, default_sink},
    lock::Lock,
    node::SharedNode,
    retry::RetryPolicy,
    round::{Decision, PendingRound, QuorumRound},
    scripts::{Script, ScriptSet},
    token::LockToken,
};

/// Slack between validating a duration and the round start it is measured from.
const EXPIRATION_HEADROOM: Duration = Duration::from_secs(24 * 60 * 60);

struct Execution {
    start: DateTime<Utc>,
    attempts: Vec<RoundStats>,
    pending: Vec<PendingRound>,
}

/// Quorum lock coordinator over a fixed set of independent nodes.
#[derive(Clone)]
pub struct LockCoordinator {
    nodes: Arc<[SharedNode]>,
    config: CoordinatorConfig,
    scripts: Arc<ScriptSet>,
    sink: Arc<dyn EventSink>,
    closed: Arc<AtomicBool>,
}

impl LockCoordinator {
    pub fn new(nodes: Vec<SharedNode>, config: CoordinatorConfig) -> Result<Self> {
        if nodes.is_empty() {
            return Err(MaxlockError::precondition(
                "a lock coordinator needs at least one node",
            ));
        }

        let mut seen = HashSet::new();
        for node in &nodes {
            if !seen.insert(node.id().clone()) {
                return Err(MaxlockError::precondition(format!(
                    "duplicate node id: {}",
                    node.id()
                )));
            }
        }
        config.validate()?;

        Ok(Self {
            nodes: nodes.into(),
            config,
            scripts: ScriptSet::standard(),
            sink: default_sink(),
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn quorum(&self) -> usize {
        quorum_size(self.nodes.len())
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn scripts(&self) -> &ScriptSet {
        &self.scripts
    }

    pub fn is_shutdown(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Locks every resource in `resources` on a quorum of nodes.
    ///
    /// When the retry budget runs out a single release round is started in the
    /// background for any partially written keys, and the quorum failure is
    /// returned without waiting for it.
    pub async fn acquire(
        &self,
        resources: &[String],
        duration: Duration,
        policy: Option<&RetryPolicy>,
    ) -> Result<Lock> {
        self.ensure_open()?;
        ensure_resources(resources)?;
        let duration_ms = self.lock_duration(duration)?;
        let policy = self.policy(policy)?;

        let token = LockToken::generate()?;
        let keys: Arc<[String]> = resources.into();
        let args: Arc<[String]> = vec![token.to_string(), duration_ms.to_string()].into();

        let acquired = self
            .execute(&self.scripts.acquire, Arc::clone(&keys), args, policy)
            .await
            .and_then(|execution| {
                Ok(Lock::new(
                    resources.to_vec(),
                    token.clone(),
                    self.expiration(execution.start, duration)?,
                    execution.attempts,
                    execution.pending,
                ))
            });

        if acquired.is_err() {
            self.spawn_compensating_release(keys, &token, policy);
        }
        acquired
    }

    /// Pushes the expiration of a held lock out to `duration` from now.
    ///
    /// On success `lock` is invalidated and its replacement returned; on
    /// failure `lock` is left untouched.
    pub async fn extend(
        &self,
        lock: &mut Lock,
        duration: Duration,
        policy: Option<&RetryPolicy>,
    ) -> Result<Lock> {
        self.ensure_open()?;
        if lock.is_expired() {
            return Err(MaxlockError::precondition(
                "cannot extend an already-expired lock",
            ));
        }
        let duration_ms = self.lock_duration(duration)?;
        let policy = self.policy(policy)?;

        let keys: Arc<[String]> = lock.resources().into();
        let args: Arc<[String]> = vec![lock.token().to_string(), duration_ms.to_string()].into();
        let execution = self
            .execute(&self.scripts.extend, keys, args, policy)
            .await?;

        let expiration = self.expiration(execution.start, duration)?;
        lock.invalidate();
        Ok(Lock::new(
            lock.resources().to_vec(),
            lock.token().clone(),
            expiration,
            execution.attempts,
            execution.pending,
        ))
    }

    /// Releases a lock. The handle is invalidated before any node is
    /// contacted; a single round is attempted and the keys self-expire if it
    /// fails to reach quorum.
    pub async fn release(
        &self,
        lock: &mut Lock,
        policy: Option<&RetryPolicy>,
    ) -> Result<RoundStats> {
        lock.invalidate();
        self.ensure_open()?;
        let policy = self.policy(policy)?.no_retry();

        let keys: Arc<[String]> = lock.resources().into();
        let args: Arc<[String]> = vec![lock.token().to_string()].into();
        let mut execution = self
            .execute(&self.scripts.release, keys, args, &policy)
            .await?;

        execution
            .attempts
            .pop()
            .ok_or_else(|| MaxlockError::InternalError("release produced no round".to_string()))
    }

    /// Closes every node connection. Operations still in flight fail with a
    /// closed-connection vote; later operations are rejected.
    pub async fn shutdown(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let results = join_all(self.nodes.iter().map(|node| node.close())).await;
        let mut first_error = None;
        for (node, result) in self.nodes.iter().zip(results) {
            if let Err(err) = result {
                warn!(node = %node.id(), error = %err, "failed to close node");
                first_error.get_or_insert(err);
            }
        }

        match first_error {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }

    async fn execute(
        &self,
        script: &Script,
        keys: Arc<[String]>,
        args: Arc<[String]>,
        policy: &RetryPolicy,
    ) -> Result<Execution> {
        let max_attempts = policy.max_attempts();
        let mut attempts = Vec::new();
        let mut pending = Vec::new();

        for attempt in 1..=max_attempts {
            let round = QuorumRound::new(
                script.clone(),
                Arc::clone(&keys),
                Arc::clone(&args),
                policy.attempt_timeout,
            );
            let outcome = round.run(&self.nodes, &self.sink).await?;
            attempts.push(outcome.snapshot);
            pending.push(outcome.pending);

            if outcome.decision == Decision::For {
                return Ok(Execution {
                    start: outcome.start,
                    attempts,
                    pending,
                });
            }

            if attempt < max_attempts {
                if self.is_shutdown() {
                    break;
                }
                sleep(policy.backoff()).await;
            }
        }

        warn!(
            operation = %script.kind,
            attempts = attempts.len(),
            resources = ?keys,
            "quorum not reached"
        );
        Err(MaxlockError::QuorumUnreachable { attempts })
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_shutdown() {
            return Err(MaxlockError::precondition("lock coordinator is shut down"));
        }
        Ok(())
    }

    fn policy<'a>(&'a self, policy: Option<&'a RetryPolicy>) -> Result<&'a RetryPolicy> {
        let policy = policy.unwrap_or(&self.config.retry);
        validate_policy(policy)?;
        Ok(policy)
    }

    /// Validates a requested lock duration and returns it in milliseconds.
    ///
    /// The duration must outlast its own drift allowance, and the resulting
    /// expiration must be representable with room to spare, so neither check
    /// can fail once keys have been written.
    fn lock_duration(&self, duration: Duration) -> Result<u64> {
        let millis = lock_millis(duration)?;
        let drift = self.config.drift(duration);
        if duration <= drift {
            return Err(MaxlockError::precondition(format!(
                "lock duration of {millis}ms does not exceed the {}ms drift allowance",
                drift.as_millis()
            )));
        }
        let padded = duration.saturating_add(EXPIRATION_HEADROOM);
        if time::checked_deadline(time::now(), padded, drift).is_none() {
            return Err(MaxlockError::precondition(format!(
                "lock duration of {millis}ms is out of range"
            )));
        }
        Ok(millis)
    }

    fn expiration(&self, start: DateTime<Utc>, duration: Duration) -> Result<DateTime<Utc>> {
        time::checked_deadline(start, duration, self.config.drift(duration)).ok_or_else(|| {
            MaxlockError::InternalError("lock expiration is out of range".to_string())
        })
    }

    /// Releases whatever a failed acquire may have written. Runs detached with
    /// a single round; the outcome is only logged.
    fn spawn_compensating_release(
        &self,
        keys: Arc<[String]>,
        token: &LockToken,
        policy: &RetryPolicy,
    ) {
        let coordinator = self.clone();
        let args: Arc<[String]> = vec![token.to_string()].into();
        let policy = policy.no_retry();
        tokio::spawn(async move {
            let release = coordinator.scripts.release.clone();
            if let Err(err) = coordinator.execute(&release, keys, args, &policy).await {
                debug!(error = %err, "compensating release did not reach quorum");
            }
        });
    }
}

fn ensure_resources(resources: &[String]) -> Result<()> {
    if resources.is_empty() {
        return Err(MaxlockError::precondition("at least one resource is required"));
    }
    Ok(())
}

fn lock_millis(duration: Duration) -> Result<u64> {
    match time::whole_millis(duration) {
        Some(0) => Err(MaxlockError::precondition("lock duration must be positive")),
        Some(millis) => Ok(millis),
        None => Err(MaxlockError::precondition(
            "lock duration must be a whole number of milliseconds",
        )),
    }
}
