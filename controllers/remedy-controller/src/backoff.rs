//! # Backoff
//!
//! Backoff helpers used by the actuators and the orphan IP sweep:
//!
//! - [`FibonacciBackoff`] grows more slowly than exponential backoff and is used
//!   between failed sweeps. Sequence: 1s, 1s, 2s, 3s, 5s, 8s ... capped.
//! - [`exponential_backoff`] computes the requeue delay of a failed cloud
//!   operation from its attempt count.
//! - [`retry_on_conflict`] retries a Kubernetes write that failed with a
//!   conflict, waiting 10ms, 50ms and 250ms between the four attempts.

use crate::client::is_conflict;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

const CONFLICT_RETRY_INITIAL_DELAY: Duration = Duration::from_millis(10);
const CONFLICT_RETRY_FACTOR: u32 = 5;
const CONFLICT_RETRY_STEPS: u32 = 4;

/// Fibonacci backoff calculator
///
/// Generates backoff durations following the Fibonacci sequence, in seconds.
/// Each backoff is the sum of the previous two backoffs.
#[derive(Debug, Clone)]
pub struct FibonacciBackoff {
    /// Minimum backoff value in seconds (for reset)
    min_seconds: u64,
    /// Previous backoff value in seconds
    prev_seconds: u64,
    /// Current backoff value in seconds
    current_seconds: u64,
    /// Maximum backoff value in seconds
    max_seconds: u64,
}

impl FibonacciBackoff {
    /// Create a new Fibonacci backoff with specified minimum and maximum values in seconds
    ///
    /// # Arguments
    ///
    /// * `min_seconds` - Minimum backoff duration (used for the first two values, typically 1)
    /// * `max_seconds` - Maximum backoff duration (caps the sequence)
    #[must_use]
    pub fn new(min_seconds: u64, max_seconds: u64) -> Self {
        Self {
            min_seconds,
            prev_seconds: 0,
            current_seconds: min_seconds,
            max_seconds,
        }
    }

    /// Get the next backoff duration and advance the sequence
    pub fn next_backoff(&mut self) -> Duration {
        let result = self.current_seconds;

        let next_seconds = self.prev_seconds + self.current_seconds;
        self.prev_seconds = self.current_seconds;
        self.current_seconds = std::cmp::min(next_seconds, self.max_seconds);

        Duration::from_secs(result)
    }

    /// Reset the backoff to the initial state
    pub fn reset(&mut self) {
        self.prev_seconds = 0;
        self.current_seconds = self.min_seconds;
    }
}

/// Requeue delay after the `attempts`-th consecutive failure of an operation.
///
/// Returns `interval * 2^(attempts-1)`; the first failure waits `interval`.
#[must_use]
pub fn exponential_backoff(interval: Duration, attempts: u32) -> Duration {
    let exponent = attempts.saturating_sub(1).min(31);
    interval.saturating_mul(1u32 << exponent)
}

/// Run `attempt` until it succeeds, fails with anything but a conflict, or
/// the conflict retries are used up.
///
/// `attempt` receives the zero-based attempt number so callers can re-read
/// the object before retrying.
pub async fn retry_on_conflict<T, F, Fut>(mut attempt: F) -> Result<T, kube::Error>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, kube::Error>>,
{
    let mut delay = CONFLICT_RETRY_INITIAL_DELAY;
    let mut n = 0;
    loop {
        match attempt(n).await {
            Err(e) if is_conflict(&e) && n + 1 < CONFLICT_RETRY_STEPS => {
                debug!("Write conflict on attempt {}, retrying in {:?}", n + 1, delay);
                tokio::time::sleep(delay).await;
                delay *= CONFLICT_RETRY_FACTOR;
                n += 1;
            }
            result => return result,
        }
    }
}
