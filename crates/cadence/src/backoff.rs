//! Delay generation for retrying a failing unit of work.

use std::time::Duration;

use ::backoff::ExponentialBackoff;
use ::backoff::backoff::Backoff;

/// Delay before the first retry.
const INITIAL_DELAY: Duration = Duration::from_secs(1);

/// Ceiling on the delay between retries.
const MAX_DELAY: Duration = Duration::from_secs(60);

/// Exponential backoff with jitter for consecutive work failures.
///
/// Delays roughly double from [`INITIAL_DELAY`] up to [`MAX_DELAY`], with
/// randomized jitter so many drivers recovering from the same outage do not
/// retry in lockstep. [`reset`](Self::reset) restores the base delay after a
/// successful iteration.
#[derive(Debug)]
pub(crate) struct RetryBackoff {
    inner: ExponentialBackoff,
}

impl RetryBackoff {
    pub(crate) fn new() -> Self {
        Self {
            inner: ExponentialBackoff {
                initial_interval: INITIAL_DELAY,
                max_interval: MAX_DELAY,
                multiplier: 2.0,
                max_elapsed_time: None, // Retry forever
                ..Default::default()
            },
        }
    }

    /// Next delay to sleep before re-attempting the work.
    pub(crate) fn next_delay(&mut self) -> Duration {
        // max_elapsed_time is None, so next_backoff never gives up
        self.inner.next_backoff().unwrap_or(MAX_DELAY)
    }

    /// Restore the initial delay after a successful iteration.
    pub(crate) fn reset(&mut self) {
        self.inner.reset();
    }
}
