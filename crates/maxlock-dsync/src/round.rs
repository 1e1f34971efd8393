use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use futures::{StreamExt, stream::FuturesUnordered};
use maxlock_common::{
    NodeId, RoundStats,
    error::{MaxlockError, Result},
    time,
};
use tokio::{sync::oneshot, task::JoinHandle};
use tracing::debug;

use crate::{
    attempt::{Vote, attempt},
    events::EventSink,
    node::SharedNode,
    scripts::Script,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    For,
    Against,
}

/// Background collector for the votes still outstanding once a round's
/// decision is known. Dropping it detaches the collector; it is never aborted.
#[derive(Debug)]
pub struct PendingRound {
    handle: JoinHandle<Result<RoundStats>>,
}

impl PendingRound {
    /// Waits for every node to vote and returns the complete tally.
    pub async fn settled(self) -> Result<RoundStats> {
        match self.handle.await {
            Ok(result) => result,
            Err(err) => Err(MaxlockError::RoundFault(format!(
                "round collector failed: {err}"
            ))),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

#[derive(Debug)]
pub struct RoundOutcome {
    pub start: DateTime<Utc>,
    pub decision: Decision,
    /// Tally at the moment the decision was reached.
    pub snapshot: RoundStats,
    pub pending: PendingRound,
}

/// One fan-out of a script to every node.
#[derive(Clone)]
pub struct QuorumRound {
    script: Script,
    keys: Arc<[String]>,
    args: Arc<[String]>,
    timeout: Duration,
}

type DecisionSender = oneshot::Sender<Result<(Decision, RoundStats)>>;

impl QuorumRound {
    pub fn new(
        script: Script,
        keys: Arc<[String]>,
        args: Arc<[String]>,
        timeout: Duration,
    ) -> Self {
        Self {
            script,
            keys,
            args,
            timeout,
        }
    }

    /// Dispatches the script to every node concurrently and returns as soon as
    /// either side holds a quorum. Votes still in flight keep being folded
    /// into the tally behind [`RoundOutcome::pending`].
    ///
    /// A node task that dies instead of voting fails the round.
    pub async fn run(
        &self,
        nodes: &[SharedNode],
        sink: &Arc<dyn EventSink>,
    ) -> Result<RoundOutcome> {
        let start = time::now();
        let membership = nodes.len();

        let mut votes = FuturesUnordered::new();
        for node in nodes {
            let node = Arc::clone(node);
            let sink = Arc::clone(sink);
            let round = self.clone();
            votes.push(tokio::spawn(async move {
                let vote = attempt(
                    node.as_ref(),
                    &round.script,
                    &round.keys,
                    &round.args,
                    round.timeout,
                    sink.as_ref(),
                )
                .await;
                (node.id().clone(), vote)
            }));
        }

        let (decision_tx, decision_rx) = oneshot::channel();
        let kind = self.script.kind;
        let handle = tokio::spawn(async move {
            let mut stats = RoundStats::new(membership);
            let mut decision_tx = Some(decision_tx);

            while let Some(joined) = votes.next().await {
                let (node, vote): (NodeId, Vote) = match joined {
                    Ok(vote) => vote,
                    Err(err) => {
                        let message = format!("{kind} attempt task failed: {err}");
                        if let Some(sender) = decision_tx.take() {
                            let _ = sender.send(Err(MaxlockError::RoundFault(message.clone())));
                        }
                        return Err(MaxlockError::RoundFault(message));
                    }
                };

                match vote {
                    Vote::For => stats.record_for(node),
                    Vote::Against(error) => stats.record_against(node, error),
                };

                if let Some(decision) = decide(&stats) {
                    resolve(&mut decision_tx, decision, &stats);
                }
            }

            resolve(&mut decision_tx, Decision::Against, &stats);
            debug!(
                operation = %kind,
                votes_for = stats.votes_for.len(),
                votes_against = stats.votes_against.len(),
                "round settled"
            );
            Ok(stats)
        });

        let (decision, snapshot) = match decision_rx.await {
            Ok(result) => result?,
            Err(_) => {
                return Err(MaxlockError::RoundFault(format!(
                    "{kind} round collector exited without a decision"
                )));
            }
        };

        Ok(RoundOutcome {
            start,
            decision,
            snapshot,
            pending: PendingRound { handle },
        })
    }
}

/// Quorum on either side settles the round. With every vote in and no
/// quorum (an even split), the round is lost.
fn decide(stats: &RoundStats) -> Option<Decision> {
    if stats.has_quorum_for() {
        Some(Decision::For)
    } else if stats.has_quorum_against() || stats.is_complete() {
        Some(Decision::Against)
    } else {
        None
    }
}

fn resolve(sender: &mut Option<DecisionSender>, decision: Decision, stats: &RoundStats) {
    if let Some(sender) = sender.take() {
        let _ = sender.send(Ok((decision, stats.clone())));
    }
}
