use std::time::Duration;

use maxlock_common::NodeError;
use tokio::time;
use tracing::debug;

use crate::{
    events::{EventSink, LockEvent},
    node::Node,
    scripts::Script,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Vote {
    For,
    Against(NodeError),
}

/// Runs one script against one node and turns the result into a vote.
///
/// The hash is tried first; a cache miss is retried once with the full body.
/// Every other failure, including the timeout covering both calls, becomes an
/// "against" vote that is published to `sink` before returning.
pub async fn attempt(
    node: &dyn Node,
    script: &Script,
    keys: &[String],
    args: &[String],
    timeout: Duration,
    sink: &dyn EventSink,
) -> Vote {
    let outcome = match time::timeout(timeout, evaluate(node, script, keys, args)).await {
        Ok(outcome) => outcome,
        Err(_) => Err(NodeError::Timeout {
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        }),
    };

    let vote = classify(script, keys.len(), outcome);
    if let Vote::Against(error) = &vote {
        debug!(node = %node.id(), operation = %script.kind, error = %error, "node voted against");
        sink.publish(LockEvent::new(node.id().clone(), script.kind, error.clone()));
    }
    vote
}

async fn evaluate(
    node: &dyn Node,
    script: &Script,
    keys: &[String],
    args: &[String],
) -> Result<i64, NodeError> {
    match node.eval_sha(&script.sha, keys, args).await {
        Err(NodeError::NoScript) => {
            debug!(node = %node.id(), operation = %script.kind, "script not cached; sending body");
            node.eval(script.body, keys, args).await
        }
        outcome => outcome,
    }
}

fn classify(script: &Script, expected: usize, outcome: Result<i64, NodeError>) -> Vote {
    match outcome {
        Ok(affected) if script.kind.accepts(affected, expected) => Vote::For,
        Ok(affected) if affected < 0 => Vote::Against(NodeError::Protocol(format!(
            "negative key count {affected}"
        ))),
        Ok(affected) => Vote::Against(NodeError::ResourceLocked { affected, expected }),
        Err(error) => Vote::Against(error),
    }
}
