use std::time::Duration;

use serde::Deserialize;

/// Configuration of the per-stream extraction loop.
///
/// Deserialized from the `[extract]` table of the process configuration file. Every field has a
/// default, so an empty table is valid.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Maximum number of in-flight node requests per stream. Streams do not share this budget.
    pub concurrent_request_limit: usize,

    /// Number of blocks covered by each output file.
    pub flush_threshold: u64,

    /// Initial block range size of ranged queries (logs, traces). Per-block streams use it as the
    /// number of blocks requested concurrently per fetch round.
    pub window_size: u64,

    /// The adaptive window never shrinks below this many blocks.
    pub min_window_size: u64,

    /// Pause before retrying a ranged query with a smaller window, in milliseconds.
    pub overflow_pause_ms: u64,

    pub retry: RetryConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            concurrent_request_limit: 5,
            flush_threshold: 5_000,
            window_size: 100,
            min_window_size: 10,
            overflow_pause_ms: 500,
            retry: RetryConfig::default(),
        }
    }
}

impl Config {
    pub fn overflow_pause(&self) -> Duration {
        Duration::from_millis(self.overflow_pause_ms)
    }

    /// Checks the values that would make the extraction loop misbehave.
    pub fn validate(&self) -> Result<(), InvalidConfigError> {
        if self.concurrent_request_limit == 0 {
            return Err(InvalidConfigError::Zero("concurrent_request_limit"));
        }
        if self.flush_threshold == 0 {
            return Err(InvalidConfigError::Zero("flush_threshold"));
        }
        if self.min_window_size == 0 {
            return Err(InvalidConfigError::Zero("min_window_size"));
        }
        if self.window_size < self.min_window_size {
            return Err(InvalidConfigError::WindowBelowMinimum {
                window_size: self.window_size,
                min_window_size: self.min_window_size,
            });
        }
        if self.retry.max_attempts == 0 {
            return Err(InvalidConfigError::Zero("retry.max_attempts"));
        }
        if self.retry.multiplier < 1.0 {
            return Err(InvalidConfigError::Multiplier(self.retry.multiplier));
        }
        Ok(())
    }
}

/// Bounded exponential backoff for transient failures.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Consecutive failures after which a stream gives up and reports a fatal error.
    pub max_attempts: usize,

    /// Delay after the first failure, in milliseconds.
    pub base_delay_ms: u64,

    /// Factor applied to the delay after each further consecutive failure.
    pub multiplier: f32,

    /// Upper bound of a single delay, in milliseconds.
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 1_000,
            multiplier: 2.0,
            max_delay_ms: 30_000,
        }
    }
}

impl RetryConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum InvalidConfigError {
    #[error("extract.{0} must be greater than zero")]
    Zero(&'static str),

    #[error("extract.window_size ({window_size}) is below extract.min_window_size ({min_window_size})")]
    WindowBelowMinimum {
        window_size: u64,
        min_window_size: u64,
    },

    #[error("extract.retry.multiplier must be at least 1.0, got {0}")]
    Multiplier(f32),
}
