use std::time::Duration;

use rand::Rng;

pub const DEFAULT_RETRY_COUNT: u32 = 10;
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(200);
pub const DEFAULT_RETRY_JITTER: Duration = Duration::from_millis(100);
pub const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(5);

/// How many quorum rounds an operation may run, how long to wait between
/// them, and how long a single node call may take.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub retry_count: u32,
    pub retry_delay: Duration,
    pub retry_jitter: Duration,
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retry_count: DEFAULT_RETRY_COUNT,
            retry_delay: DEFAULT_RETRY_DELAY,
            retry_jitter: DEFAULT_RETRY_JITTER,
            attempt_timeout: DEFAULT_ATTEMPT_TIMEOUT,
        }
    }
}

impl RetryPolicy {
    pub fn no_retry(&self) -> Self {
        Self {
            retry_count: 0,
            ..self.clone()
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.retry_count.saturating_add(1)
    }

    /// Delay before the next round: `retry_delay` shifted by a uniform offset
    /// in `[-retry_jitter, retry_jitter]`, never negative.
    pub fn backoff(&self) -> Duration {
        let delay = millis_i64(self.retry_delay);
        let jitter = millis_i64(self.retry_jitter);
        let offset = if jitter == 0 {
            0
        } else {
            rand::thread_rng().gen_range(-jitter..=jitter)
        };

        let millis = delay.saturating_add(offset).max(0);
        Duration::from_millis(u64::try_from(millis).unwrap_or(0))
    }
}

fn millis_i64(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::RetryPolicy;

    #[test]
    fn backoff_stays_within_jitter_window() {
        let policy = RetryPolicy {
            retry_delay: Duration::from_millis(200),
            retry_jitter: Duration::from_millis(100),
            ..RetryPolicy::default()
        };

        for _ in 0..200 {
            let backoff = policy.backoff();
            assert!(backoff >= Duration::from_millis(100));
            assert!(backoff <= Duration::from_millis(300));
        }
    }

    #[test]
    fn backoff_is_never_negative() {
        let policy = RetryPolicy {
            retry_delay: Duration::ZERO,
            retry_jitter: Duration::from_millis(50),
            ..RetryPolicy::default()
        };

        for _ in 0..100 {
            assert!(policy.backoff() <= Duration::from_millis(50));
        }
    }

    #[test]
    fn no_retry_keeps_timeout() {
        let policy = RetryPolicy {
            attempt_timeout: Duration::from_millis(75),
            ..RetryPolicy::default()
        };
        let single = policy.no_retry();

        assert_eq!(single.retry_count, 0);
        assert_eq!(single.max_attempts(), 1);
        assert_eq!(single.attempt_timeout, Duration::from_millis(75));
    }
}
