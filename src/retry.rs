//! Bounded retry loop for batch delivery.
//!
//! Convention: one delivery is attempted `fetch_retry_count + 1` times
//! (initial try plus N retries), uniformly across the SDK. Exactly one
//! error is logged per exhausted batch, never one per attempt.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, error, warn};

use crate::backoff::ExponentialBackoff;
use crate::{Error, Result};

#[derive(Clone, Debug)]
pub(crate) struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: ExponentialBackoff,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            backoff: ExponentialBackoff::for_delivery(base_delay),
        }
    }
}

/// Outcome of a single delivery attempt.
pub(crate) enum Attempt<T> {
    /// Terminal result; no further attempts.
    Done(T),
    /// Transient failure (network, timeout, 5xx, 429).
    Retryable {
        error: Error,
        retry_after: Option<Duration>,
    },
    /// Permanent failure (4xx); resolves immediately without a backoff wait.
    Fatal(Error),
}

/// Run `attempt_fn` until it is done, fatal, or retries are exhausted.
///
/// The attempt number passed to `attempt_fn` is 1-based. A `Retry-After`
/// hint from the server takes precedence over the computed backoff when it
/// is larger.
pub(crate) async fn run_with_retry<T, F, Fut>(policy: &RetryPolicy, mut attempt_fn: F) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Attempt<T>>,
{
    let attempts = policy.max_retries + 1;
    let mut last_error = None;

    for attempt in 1..=attempts {
        match attempt_fn(attempt).await {
            Attempt::Done(value) => return Ok(value),
            Attempt::Fatal(e) => {
                warn!(error = %e, "Event batch rejected, not retrying");
                return Err(e);
            }
            Attempt::Retryable { error, retry_after } => {
                if attempt < attempts {
                    let delay = policy.backoff.delay_for(attempt);
                    let delay = retry_after.map_or(delay, |ra| ra.max(delay));
                    debug!(
                        error = %error,
                        attempt,
                        max_attempts = attempts,
                        delay_ms = delay.as_millis() as u64,
                        "Event batch delivery failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                last_error = Some(error);
            }
        }
    }

    let error = last_error.unwrap_or(Error::Api {
        message: "delivery failed without an attempt".to_string(),
        status: None,
    });
    error!(
        attempts,
        error = %error,
        "Event batch delivery failed after exhausting retries"
    );
    Err(error)
}
