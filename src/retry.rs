//! Retry utilities for transient failure recovery.
//!
//! Sessions retry provisioning and command execution at most once. The
//! operation receives the attempt number so the second attempt can
//! re-provision before running again.

use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Attempts for session operations: one initial attempt plus one retry.
const SESSION_MAX_ATTEMPTS: u32 = 2;

/// Pause before the retry, long enough for a restarted container to settle.
const SESSION_RETRY_DELAY_MS: u64 = 200;

/// Standard exponential backoff multiplier.
const BACKOFF_MULTIPLIER: f64 = 2.0;

/// Retry policy: how many attempts and how long to wait between them.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the initial attempt).
    pub max_attempts: u32,
    /// Initial delay between retries.
    pub initial_delay: Duration,
    /// Maximum delay between retries (caps exponential growth).
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::for_session()
    }
}

impl RetryPolicy {
    /// One retry after a short pause.
    pub fn for_session() -> Self {
        Self {
            max_attempts: SESSION_MAX_ATTEMPTS,
            initial_delay: Duration::from_millis(SESSION_RETRY_DELAY_MS),
            max_delay: Duration::from_millis(SESSION_RETRY_DELAY_MS),
            backoff_multiplier: BACKOFF_MULTIPLIER,
        }
    }
}

/// The last error of a retried operation and how many attempts were made.
#[derive(Debug)]
pub struct Exhausted<E> {
    /// Error from the final attempt.
    pub error: E,
    /// Attempts made, including the first.
    pub attempts: u32,
}

impl<E: std::fmt::Display> std::fmt::Display for Exhausted<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (after {} attempts)", self.error, self.attempts)
    }
}

/// Run an async operation, retrying errors `should_retry` accepts.
///
/// `operation` is called with the 1-based attempt number.
///
/// ```ignore
/// let record = retry_async(RetryPolicy::for_session(), "provision", |attempt| async move {
///     if attempt > 1 {
///         registry.forget(&owner, os);
///     }
///     registry.ensure_container(&owner, os).await
/// }, Error::is_provisioning_retryable).await?;
/// ```
pub async fn retry_async<T, E, F, Fut, R>(
    policy: RetryPolicy,
    operation_name: &str,
    mut operation: F,
    should_retry: R,
) -> Result<T, Exhausted<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let mut attempt = 0;
    let mut delay = policy.initial_delay;

    loop {
        attempt += 1;

        match operation(attempt).await {
            Ok(result) => {
                if attempt > 1 {
                    debug!(
                        operation = %operation_name,
                        attempts = attempt,
                        "operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(e) => {
                if attempt >= policy.max_attempts {
                    warn!(
                        operation = %operation_name,
                        attempts = attempt,
                        error = %e,
                        "operation failed after max attempts"
                    );
                    return Err(Exhausted { error: e, attempts: attempt });
                }

                if !should_retry(&e) {
                    debug!(
                        operation = %operation_name,
                        attempt = attempt,
                        error = %e,
                        "operation failed with non-retryable error"
                    );
                    return Err(Exhausted { error: e, attempts: attempt });
                }

                warn!(
                    operation = %operation_name,
                    attempt = attempt,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "operation failed, will retry"
                );

                tokio::time::sleep(delay).await;

                delay = Duration::from_secs_f64(
                    (delay.as_secs_f64() * policy.backoff_multiplier)
                        .min(policy.max_delay.as_secs_f64()),
                );
            }
        }
    }
}
