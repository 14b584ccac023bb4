//! # Queue configuration
//!
//! Every option has a default, so an empty document is a valid
//! configuration:
//!
//! ```rust
//! use dog_taskqueue::QueueConfig;
//!
//! let config = QueueConfig::default();
//! assert_eq!(config.priority_weights.high, 3);
//! assert_eq!(config.rate_limit.max_requests_per_window, 100);
//! assert_eq!(config.retry.max_attempts, 3);
//! ```
//!
//! ## Environment overrides
//! Keys follow the DogRS convention: a prefix, then the dotted path with
//! `__` as the separator.
//!
//! ```bash
//! export TASKQ__RATE_LIMIT__WINDOW_SECONDS=30
//! export TASKQ__RETRY__MAX_ATTEMPTS=5
//! ```
//!
//! ```rust
//! use dog_taskqueue::QueueConfig;
//!
//! let config = QueueConfig::default()
//!     .apply_overrides("TASKQ__", [("TASKQ__RETRY__MAX_ATTEMPTS".to_string(), "5".to_string())])
//!     .unwrap();
//! assert_eq!(config.retry.max_attempts, 5);
//! ```

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{PriorityTier, QueueError, QueueResult};

/// Weighted round-robin shares per lane
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PriorityWeights {
    pub high: u32,
    pub medium: u32,
    pub low: u32,
}

impl Default for PriorityWeights {
    fn default() -> Self {
        Self {
            high: 3,
            medium: 2,
            low: 1,
        }
    }
}

impl PriorityWeights {
    /// Weight of a single tier
    pub fn weight(&self, tier: PriorityTier) -> u32 {
        match tier {
            PriorityTier::High => self.high,
            PriorityTier::Medium => self.medium,
            PriorityTier::Low => self.low,
        }
    }

    /// Length of one full round
    pub fn total(&self) -> u32 {
        self.high.saturating_add(self.medium).saturating_add(self.low)
    }

    fn checked_total(&self) -> Option<u32> {
        self.high.checked_add(self.medium)?.checked_add(self.low)
    }
}

/// Sliding-window admission limits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub window_seconds: u64,
    pub max_requests_per_window: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_seconds: 60,
            max_requests_per_window: 100,
        }
    }
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_seconds)
    }
}

/// Exponential backoff and dead-letter threshold
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries before a job is dead-lettered
    #[serde(alias = "max_retries")]
    pub max_attempts: u32,

    /// Delay before the first retry
    pub base_delay_seconds: f64,

    /// Upper bound on any single delay
    pub max_delay_seconds: f64,

    /// Scale each delay by a random factor in [0.5, 1.5]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_seconds: 1.0,
            max_delay_seconds: 60.0,
            jitter: false,
        }
    }
}

impl RetryConfig {
    pub fn base_delay(&self) -> Duration {
        seconds(self.base_delay_seconds)
    }

    pub fn max_delay(&self) -> Duration {
        seconds(self.max_delay_seconds)
    }
}

/// Configuration for a [`TaskQueue`](crate::TaskQueue)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub priority_weights: PriorityWeights,
    pub rate_limit: RateLimitConfig,
    pub retry: RetryConfig,

    /// A running job is reported failed on the worker's behalf after this
    pub lease_timeout_seconds: f64,

    /// How often the lease reaper scans running jobs
    pub reaper_interval_seconds: f64,

    /// Buffered events per subscriber
    pub event_capacity: usize,

    /// How long success markers of acknowledged jobs are kept for late dependents
    pub archive_retention_seconds: f64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            priority_weights: PriorityWeights::default(),
            rate_limit: RateLimitConfig::default(),
            retry: RetryConfig::default(),
            lease_timeout_seconds: 300.0, // 5 minutes
            reaper_interval_seconds: 30.0,
            event_capacity: 1000,
            archive_retention_seconds: 3600.0, // 1 hour
        }
    }
}

impl QueueConfig {
    pub fn lease_timeout(&self) -> Duration {
        seconds(self.lease_timeout_seconds)
    }

    pub fn reaper_interval(&self) -> Duration {
        seconds(self.reaper_interval_seconds)
    }

    pub fn archive_retention(&self) -> Duration {
        seconds(self.archive_retention_seconds)
    }

    /// Reject configurations the queue cannot honor
    pub fn validate(&self) -> QueueResult<()> {
        match self.priority_weights.checked_total() {
            Some(0) => {
                return Err(QueueError::InvalidConfig(
                    "priority weights must not all be zero".to_string(),
                ))
            }
            None => {
                return Err(QueueError::InvalidConfig(
                    "priority weights overflow a u32 round".to_string(),
                ))
            }
            Some(_) => {}
        }
        if self.rate_limit.window_seconds == 0 {
            return Err(QueueError::InvalidConfig(
                "rate_limit.window_seconds must be positive".to_string(),
            ));
        }
        if self.rate_limit.max_requests_per_window == 0 {
            return Err(QueueError::InvalidConfig(
                "rate_limit.max_requests_per_window must be positive".to_string(),
            ));
        }
        for (name, value) in [
            ("retry.base_delay_seconds", self.retry.base_delay_seconds),
            ("retry.max_delay_seconds", self.retry.max_delay_seconds),
            ("lease_timeout_seconds", self.lease_timeout_seconds),
            ("reaper_interval_seconds", self.reaper_interval_seconds),
            ("archive_retention_seconds", self.archive_retention_seconds),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(QueueError::InvalidConfig(format!(
                    "{} must be a non-negative number, got {}",
                    name, value
                )));
            }
            if value > MAX_SECONDS {
                return Err(QueueError::InvalidConfig(format!(
                    "{} must be at most {} seconds, got {}",
                    name, MAX_SECONDS, value
                )));
            }
        }
        if self.retry.base_delay_seconds > self.retry.max_delay_seconds {
            return Err(QueueError::InvalidConfig(
                "retry.base_delay_seconds exceeds retry.max_delay_seconds".to_string(),
            ));
        }
        if self.lease_timeout_seconds == 0.0 {
            return Err(QueueError::InvalidConfig(
                "lease_timeout_seconds must be positive".to_string(),
            ));
        }
        if self.event_capacity == 0 {
            return Err(QueueError::InvalidConfig(
                "event_capacity must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Defaults overridden by `PREFIX...` environment variables
    pub fn from_env(prefix: &str) -> QueueResult<Self> {
        Self::default().apply_overrides(prefix, std::env::vars())
    }

    /// Apply `PREFIX` + `SECTION__KEY` style overrides, then validate.
    ///
    /// Variables without the prefix are ignored; unknown keys are logged and skipped.
    pub fn apply_overrides<I>(mut self, prefix: &str, vars: I) -> QueueResult<Self>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            let Some(stripped) = key.strip_prefix(prefix) else {
                continue;
            };
            let normalized = stripped.to_lowercase().replace("__", ".");
            self.set(&normalized, value.trim())?;
        }
        self.validate()?;
        Ok(self)
    }

    fn set(&mut self, key: &str, value: &str) -> QueueResult<()> {
        match key {
            "priority_weights.high" => self.priority_weights.high = parse(key, value)?,
            "priority_weights.medium" => self.priority_weights.medium = parse(key, value)?,
            "priority_weights.low" => self.priority_weights.low = parse(key, value)?,
            "rate_limit.window_seconds" => self.rate_limit.window_seconds = parse(key, value)?,
            "rate_limit.max_requests_per_window" => {
                self.rate_limit.max_requests_per_window = parse(key, value)?
            }
            "retry.max_attempts" | "retry.max_retries" => {
                self.retry.max_attempts = parse(key, value)?
            }
            "retry.base_delay_seconds" => self.retry.base_delay_seconds = parse(key, value)?,
            "retry.max_delay_seconds" => self.retry.max_delay_seconds = parse(key, value)?,
            "retry.jitter" => self.retry.jitter = parse(key, value)?,
            "lease_timeout_seconds" => self.lease_timeout_seconds = parse(key, value)?,
            "reaper_interval_seconds" => self.reaper_interval_seconds = parse(key, value)?,
            "event_capacity" => self.event_capacity = parse(key, value)?,
            "archive_retention_seconds" => self.archive_retention_seconds = parse(key, value)?,
            _ => warn!("Ignoring unknown queue config key: {}", key),
        }
        Ok(())
    }

    /// Parse a JSON document; missing fields take their defaults
    #[cfg(feature = "json")]
    pub fn from_json_str(json: &str) -> QueueResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }
}

fn parse<T: FromStr>(key: &str, value: &str) -> QueueResult<T> {
    value
        .parse()
        .map_err(|_| QueueError::InvalidConfig(format!("invalid value for {}: {:?}", key, value)))
}

/// Longest accepted duration setting, 100 years
const MAX_SECONDS: f64 = 100.0 * 365.0 * 86_400.0;

/// Validated values convert exactly; anything else is clamped
fn seconds(value: f64) -> Duration {
    if value.is_nan() || value <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(value.min(MAX_SECONDS)).unwrap_or(Duration::ZERO)
}
