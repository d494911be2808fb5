//! Runner configuration.
//!
//! Environment-based with sensible defaults and validation.
//!
//! | Variable                            | Default | Meaning                               |
//! |-------------------------------------|---------|---------------------------------------|
//! | `PROJECTION_POLL_INTERVAL_MS`       | 500     | Fallback poll / gap wait interval     |
//! | `PROJECTION_REPLAY_BATCH_SIZE`      | 500     | Events read per catch-up page         |
//! | `PROJECTION_RETRY_MAX`              | 5       | Retries for transient store errors    |
//! | `PROJECTION_RETRY_INITIAL_DELAY_MS` | 100     | First backoff delay                   |
//! | `PROJECTION_RETRY_MAX_DELAY_MS`     | 10000   | Backoff cap                           |
//!
//! # Example
//!
//! ```no_run
//! use projector_projections::config::RunnerConfig;
//! use std::time::Duration;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = RunnerConfig::from_env()?;
//!
//! let tuned = RunnerConfig::default()
//!     .with_poll_interval(Duration::from_millis(50))
//!     .with_replay_batch_size(1_000);
//! tuned.validate()?;
//! # Ok(())
//! # }
//! ```

use crate::retry::RetryPolicy;
use std::time::Duration;
use thiserror::Error;

/// Configuration error
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Environment variable holds something that is not a number
    #[error("Invalid value for {var}: {value}")]
    InvalidValue {
        /// Variable name
        var: String,
        /// Raw value
        value: String,
    },
    /// Configuration validation failed
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

/// Tuning knobs shared by every projection loop.
#[derive(Debug, Clone, PartialEq)]
pub struct RunnerConfig {
    /// How long to wait before re-reading the log when no notification arrives,
    /// and how long to wait when the next event is not `checkpoint + 1` yet.
    pub poll_interval: Duration,
    /// Events read per page during catch-up and rebuild.
    pub replay_batch_size: usize,
    /// Backoff for transient store errors.
    pub retry: RetryPolicy,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            replay_batch_size: 500,
            retry: RetryPolicy::default(),
        }
    }
}

impl RunnerConfig {
    /// Set the poll interval.
    #[must_use]
    pub const fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Set the replay page size.
    #[must_use]
    pub const fn with_replay_batch_size(mut self, replay_batch_size: usize) -> Self {
        self.replay_batch_size = replay_batch_size;
        self
    }

    /// Set the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Load configuration from `PROJECTION_*` environment variables.
    ///
    /// Unset variables keep their default.
    ///
    /// # Errors
    ///
    /// Returns error if a variable is not a valid number or the result fails
    /// [`validate`](Self::validate).
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    ///
    /// # Errors
    ///
    /// Same as [`from_env`](Self::from_env).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let number = |var: &str| -> Result<Option<u64>, ConfigError> {
            lookup(var)
                .map(|value| {
                    value.trim().parse::<u64>().map_err(|_| ConfigError::InvalidValue {
                        var: var.to_string(),
                        value,
                    })
                })
                .transpose()
        };

        let poll_interval = number("PROJECTION_POLL_INTERVAL_MS")?
            .map_or(defaults.poll_interval, Duration::from_millis);
        let replay_batch_size = number("PROJECTION_REPLAY_BATCH_SIZE")?
            .map_or(Ok(defaults.replay_batch_size), usize::try_from)
            .map_err(|e| ConfigError::ValidationError(e.to_string()))?;
        let max_retries = number("PROJECTION_RETRY_MAX")?
            .map_or(Ok(defaults.retry.max_retries), usize::try_from)
            .map_err(|e| ConfigError::ValidationError(e.to_string()))?;
        let initial_delay = number("PROJECTION_RETRY_INITIAL_DELAY_MS")?
            .map_or(defaults.retry.initial_delay, Duration::from_millis);
        let max_delay = number("PROJECTION_RETRY_MAX_DELAY_MS")?
            .map_or(defaults.retry.max_delay, Duration::from_millis);

        let config = Self {
            poll_interval,
            replay_batch_size,
            retry: RetryPolicy::builder()
                .max_retries(max_retries)
                .initial_delay(initial_delay)
                .max_delay(max_delay)
                .build(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns error if configuration is invalid
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval.is_zero() {
            return Err(ConfigError::ValidationError(
                "poll_interval must be > 0".to_string(),
            ));
        }
        if self.replay_batch_size == 0 {
            return Err(ConfigError::ValidationError(
                "replay_batch_size must be > 0".to_string(),
            ));
        }
        if self.retry.initial_delay > self.retry.max_delay {
            return Err(ConfigError::ValidationError(
                "retry initial delay must not exceed max delay".to_string(),
            ));
        }
        if self.retry.multiplier < 1.0 {
            return Err(ConfigError::ValidationError(
                "retry multiplier must be >= 1.0".to_string(),
            ));
        }
        Ok(())
    }
}
