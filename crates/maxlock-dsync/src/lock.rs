use std::time::Duration;

use chrono::{DateTime, Utc};
use maxlock_common::{RoundStats, error::Result, time};
use serde::Serialize;

use crate::{round::PendingRound, token::LockToken};

/// A held lock, owned by the caller that acquired it.
///
/// The lock must be treated as lost once [`Lock::expiration`] has passed,
/// whatever the nodes still hold. Release and a successful extend pin the
/// expiration to the epoch.
#[derive(Debug, Serialize)]
pub struct Lock {
    resources: Vec<String>,
    token: LockToken,
    expiration: DateTime<Utc>,
    attempts: Vec<RoundStats>,
    #[serde(skip)]
    pending: Vec<PendingRound>,
}

impl Lock {
    pub(crate) fn new(
        resources: Vec<String>,
        token: LockToken,
        expiration: DateTime<Utc>,
        attempts: Vec<RoundStats>,
        pending: Vec<PendingRound>,
    ) -> Self {
        Self {
            resources,
            token,
            expiration,
            attempts,
            pending,
        }
    }

    pub fn resources(&self) -> &[String] {
        &self.resources
    }

    pub fn token(&self) -> &LockToken {
        &self.token
    }

    pub fn expiration(&self) -> DateTime<Utc> {
        self.expiration
    }

    pub fn expiration_millis(&self) -> i64 {
        self.expiration.timestamp_millis()
    }

    pub fn is_expired(&self) -> bool {
        self.expiration <= time::now()
    }

    pub fn remaining(&self) -> Duration {
        (self.expiration - time::now())
            .to_std()
            .unwrap_or(Duration::ZERO)
    }

    /// Tallies captured when each round of the operation reached its decision.
    pub fn attempts(&self) -> &[RoundStats] {
        &self.attempts
    }

    /// Waits for the votes still outstanding from the rounds that produced
    /// this lock and returns their complete tallies.
    pub async fn settle(&mut self) -> Vec<Result<RoundStats>> {
        let mut settled = Vec::with_capacity(self.pending.len());
        for pending in self.pending.drain(..) {
            settled.push(pending.settled().await);
        }
        settled
    }

    pub(crate) fn invalidate(&mut self) {
        self.expiration = time::epoch();
    }
}
