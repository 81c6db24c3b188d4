//! Bounded retry with exponential backoff, driven by the error kind.
//!
//! Transient network failures consume the attempt budget and back off
//! exponentially. Rate-limit responses wait for the server's hint (or the
//! backoff delay when no hint was given) and never count against the budget;
//! callers bound those waits with their own deadlines. Every other kind is
//! returned to the caller immediately.

use std::future::Future;
use std::time::Duration;

use log::{debug, warn};
use rand::Rng;

use crate::core::error::{ErrorKind, ReconcileResult};

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Maximum attempts for transient failures, including the first call.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Adds up to 50% random delay on top of the computed backoff.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts.max(1),
            ..Default::default()
        }
    }

    /// Backoff before retry number `retry` (1-based), without jitter.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(31) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = secs.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }

    fn jittered_delay_for(&self, retry: u32) -> Duration {
        let base = self.delay_for(retry);
        if !self.jitter || base.is_zero() {
            return base;
        }
        let factor = rand::thread_rng().gen_range(1.0..1.5);
        Duration::from_secs_f64(base.as_secs_f64() * factor)
    }
}

/// Runs `operation` until it succeeds, fails with a non-retryable kind, or
/// exhausts the transient-failure budget.
pub async fn retry_with_backoff<F, Fut, T>(
    policy: &RetryPolicy,
    operation_name: &str,
    operation: F,
) -> ReconcileResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ReconcileResult<T>>,
{
    retry_on_kinds(
        policy,
        operation_name,
        &[ErrorKind::TransientNetworkError],
        operation,
    )
    .await
}

/// Like [`retry_with_backoff`], with `retryable` naming the kinds that
/// consume the attempt budget. Rate limits are always waited out.
pub async fn retry_on_kinds<F, Fut, T>(
    policy: &RetryPolicy,
    operation_name: &str,
    retryable: &[ErrorKind],
    mut operation: F,
) -> ReconcileResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ReconcileResult<T>>,
{
    let mut counted_failures = 0u32;
    let mut rate_limit_waits = 0u32;

    loop {
        let err = match operation().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        match err.kind() {
            ErrorKind::RateLimited => {
                rate_limit_waits += 1;
                let wait = err
                    .retry_after()
                    .unwrap_or_else(|| policy.jittered_delay_for(rate_limit_waits));
                warn!(
                    "[retry] {} rate limited (wait #{}), sleeping {}ms",
                    operation_name,
                    rate_limit_waits,
                    wait.as_millis()
                );
                tokio::time::sleep(wait).await;
            }
            kind if retryable.contains(&kind) => {
                counted_failures += 1;
                if counted_failures >= policy.max_attempts {
                    warn!(
                        "[retry] {} failed after {} attempt(s): {}",
                        operation_name, counted_failures, err
                    );
                    return Err(err);
                }
                let wait = policy.jittered_delay_for(counted_failures);
                debug!(
                    "[retry] {} failed (attempt {}), retrying in {}ms: {}",
                    operation_name,
                    counted_failures,
                    wait.as_millis(),
                    err
                );
                tokio::time::sleep(wait).await;
            }
            _ => return Err(err),
        }
    }
}
