// =============================================================================
// RETRY MODULE
// =============================================================================
// Bounded re-execution of whole booking transactions.
//
// Only errors that `AppError::is_retryable` accepts are retried: database
// serialization failures, capacity-constraint violations caught at commit,
// and billing provider failures. Business-rule errors (not found, wrong
// status, no capacity) return on the first attempt. Each retry re-runs the
// full transaction, including the availability check, so a competitor that
// committed in between is seen and reported as a clean Conflict.
// =============================================================================

use std::future::Future;
use std::time::Duration;

use crate::error::AppResult;
use crate::metrics;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, first one included
    pub max_attempts: u32,
    /// Delay step; attempt `n` waits `n * backoff` before attempt `n + 1`
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    /// Delay after failed attempt `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.backoff * attempt
    }
}

/// Run `operation` until it succeeds, fails permanently, or the attempt
/// budget is spent.
///
/// `operation` receives the 1-based attempt number and must open and commit
/// its own transaction.
///
/// # Returns
/// - `Ok(T)` from the first successful attempt
/// - the first non-retryable error unchanged
/// - the last retryable error passed through `AppError::exhausted`
pub async fn run_with_retry<F, Fut, T>(
    policy: &RetryPolicy,
    operation_name: &'static str,
    mut operation: F,
) -> AppResult<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = AppResult<T>>,
{
    let mut attempt = 1;

    loop {
        match operation(attempt).await {
            Ok(value) => {
                if attempt > 1 {
                    tracing::info!(operation = operation_name, attempt, "Transaction succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) if err.is_retryable() && attempt < policy.max_attempts => {
                tracing::warn!(
                    operation = operation_name,
                    attempt,
                    error = %err,
                    "Retrying booking transaction"
                );
                metrics::record_transaction_retry(operation_name);
                tokio::time::sleep(policy.delay_after(attempt)).await;
                attempt += 1;
            }
            Err(err) => {
                if err.is_retryable() {
                    tracing::warn!(
                        operation = operation_name,
                        attempts = attempt,
                        error = %err,
                        "Retry budget exhausted"
                    );
                }
                return Err(err.exhausted());
            }
        }
    }
}
