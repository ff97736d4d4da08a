use std::time::Duration;

use backon::{BackoffBuilder as _, ExponentialBackoff, ExponentialBuilder};

use crate::config::RetryConfig;

/// Tracks consecutive failures of one stream and yields the delay before the next retry.
///
/// Delays start at the configured base, grow by the multiplier, and are capped at the maximum
/// delay. Once `max_attempts` consecutive failures have been recorded no further delay is
/// yielded and the caller must give up. A success resets the sequence.
#[derive(Debug)]
pub struct Backoff {
    builder: ExponentialBuilder,
    delays: ExponentialBackoff,
    failures: usize,
}

impl Backoff {
    pub fn new(config: &RetryConfig) -> Self {
        let builder = ExponentialBuilder::default()
            .with_min_delay(config.base_delay())
            .with_max_delay(config.max_delay())
            .with_factor(config.multiplier)
            // The failure that exhausts the attempts gets no delay, it is surfaced instead.
            .with_max_times(config.max_attempts.saturating_sub(1));
        Self {
            delays: builder.clone().build(),
            builder,
            failures: 0,
        }
    }

    /// Records a failure and returns how long to wait before retrying, or `None` if the stream
    /// has failed `max_attempts` times in a row.
    pub fn next_delay(&mut self) -> Option<Duration> {
        self.failures += 1;
        self.delays.next()
    }

    /// Records a success.
    pub fn reset(&mut self) {
        if self.failures > 0 {
            self.delays = self.builder.clone().build();
            self.failures = 0;
        }
    }

    /// Consecutive failures recorded since the last success.
    pub fn failures(&self) -> usize {
        self.failures
    }
}
