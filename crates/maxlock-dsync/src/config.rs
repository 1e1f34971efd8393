use std::{str::FromStr, time::Duration};

use maxlock_common::error::{MaxlockError, Result};

use crate::retry::RetryPolicy;

pub const DEFAULT_DRIFT_FACTOR: f64 = 0.01;
pub const DEFAULT_AUTOMATIC_EXTENSION_THRESHOLD: Duration = Duration::from_millis(500);

/// Fixed clock-drift allowance added on top of the proportional margin.
pub const DRIFT_CONSTANT: Duration = Duration::from_millis(2);

#[derive(Debug, Clone, PartialEq)]
pub struct CoordinatorConfig {
    /// Fraction of a lock's duration reserved for clock skew between nodes.
    pub drift_factor: f64,
    /// Reserved for renewal helpers; the coordinator does not act on it.
    pub automatic_extension_threshold: Duration,
    pub retry: RetryPolicy,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            drift_factor: DEFAULT_DRIFT_FACTOR,
            automatic_extension_threshold: DEFAULT_AUTOMATIC_EXTENSION_THRESHOLD,
            retry: RetryPolicy::default(),
        }
    }
}

impl CoordinatorConfig {
    /// Defaults overridden by `MAXLOCK_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each `MAXLOCK_*`
    /// name. Blank values are ignored.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(value) = parse_value::<f64>(&lookup, "MAXLOCK_DRIFT_FACTOR")? {
            config.drift_factor = value;
        }
        if let Some(value) =
            parse_value::<u64>(&lookup, "MAXLOCK_AUTOMATIC_EXTENSION_THRESHOLD_MS")?
        {
            config.automatic_extension_threshold = Duration::from_millis(value);
        }
        if let Some(value) = parse_value::<u32>(&lookup, "MAXLOCK_RETRY_COUNT")? {
            config.retry.retry_count = value;
        }
        if let Some(value) = parse_value::<u64>(&lookup, "MAXLOCK_RETRY_DELAY_MS")? {
            config.retry.retry_delay = Duration::from_millis(value);
        }
        if let Some(value) = parse_value::<u64>(&lookup, "MAXLOCK_RETRY_JITTER_MS")? {
            config.retry.retry_jitter = Duration::from_millis(value);
        }
        if let Some(value) = parse_value::<u64>(&lookup, "MAXLOCK_ATTEMPT_TIMEOUT_MS")? {
            config.retry.attempt_timeout = Duration::from_millis(value);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.drift_factor.is_finite() || !(0.0..1.0).contains(&self.drift_factor) {
            return Err(MaxlockError::precondition(format!(
                "drift factor must be within [0, 1), got {}",
                self.drift_factor
            )));
        }
        validate_policy(&self.retry)
    }

    /// Safety margin subtracted from a lock's nominal duration.
    pub fn drift(&self, duration: Duration) -> Duration {
        let millis = (self.drift_factor * duration.as_millis() as f64).round();
        Duration::from_millis(millis as u64) + DRIFT_CONSTANT
    }
}

pub fn validate_policy(policy: &RetryPolicy) -> Result<()> {
    if policy.attempt_timeout.is_zero() {
        return Err(MaxlockError::precondition(
            "attempt timeout must be greater than zero",
        ));
    }
    Ok(())
}

fn parse_value<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
) -> Result<Option<T>> {
    let Some(raw) = lookup(name) else {
        return Ok(None);
    };
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }

    raw.parse::<T>()
        .map(Some)
        .map_err(|_| MaxlockError::precondition(format!("invalid value for {name}: {raw}")))
}
