//! Retry policy shared by the registry client and the downloader.
//!
//! Delays grow exponentially from `base_delay`, are capped at `max_delay`
//! and optionally scaled by a random factor in `0.5..1.5`. Which failures
//! are worth another attempt is part of the policy, not the call site.

use crate::error::{AimodelError, FailureKind};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Bounded retry with exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts, the first one included.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub exponential_base: f64,
    pub jitter: bool,
    /// Failure kinds that earn another attempt.
    pub retryable: Vec<FailureKind>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            exponential_base: 2.0,
            jitter: true,
            retryable: vec![FailureKind::Network, FailureKind::Timeout],
        }
    }
}

impl RetryPolicy {
    /// Create a policy with the default attempts, delays and retryable kinds.
    pub fn new() -> Self {
        Self::default()
    }

    /// A policy that makes exactly one attempt.
    pub fn none() -> Self {
        Self::default().with_max_attempts(1)
    }

    /// Set the total number of attempts, the first one included.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Set the delay before the first retry.
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Cap the delay between attempts.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Enable or disable random jitter on delays.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Replace the set of retryable failure kinds.
    pub fn with_retryable(mut self, kinds: impl IntoIterator<Item = FailureKind>) -> Self {
        self.retryable = kinds.into_iter().collect();
        self
    }

    /// Whether `err` deserves another attempt under this policy.
    pub fn should_retry(&self, err: &AimodelError) -> bool {
        self.retryable.contains(&err.kind())
    }

    /// Delay before the retry that follows attempt `attempt` (0-indexed).
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let multiplier = self.exponential_base.powi(attempt as i32);
        let delay_secs = self.base_delay.as_secs_f64() * multiplier;
        let capped_secs = delay_secs.min(self.max_delay.as_secs_f64());

        let final_secs = if self.jitter {
            let factor = rand::rng().random_range(0.5..1.5);
            (capped_secs * factor).min(self.max_delay.as_secs_f64())
        } else {
            capped_secs
        };

        Duration::from_secs_f64(final_secs)
    }

    /// Run `operation` under this policy, retrying what [`should_retry`](Self::should_retry) accepts.
    pub async fn run<F, Fut, T>(&self, operation: F) -> (Result<T, AimodelError>, RetryStats)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, AimodelError>>,
    {
        retry_async(self, operation, |e| self.should_retry(e)).await
    }
}

/// What happened during a retried operation.
#[derive(Debug, Clone, Default)]
pub struct RetryStats {
    pub attempts: u32,
    pub total_delay: Duration,
    pub success: bool,
    pub last_error: Option<String>,
}

/// Retry an async operation with backoff.
///
/// `should_retry` decides per error; non-retryable errors return
/// immediately. Returns the final result along with [`RetryStats`].
pub async fn retry_async<F, Fut, T, E>(
    policy: &RetryPolicy,
    mut operation: F,
    should_retry: impl Fn(&E) -> bool,
) -> (Result<T, E>, RetryStats)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut stats = RetryStats::default();
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        stats.attempts = attempt + 1;

        let err = match operation().await {
            Ok(value) => {
                stats.success = true;
                if attempt > 0 {
                    debug!("Succeeded after {} attempts", attempt + 1);
                }
                return (Ok(value), stats);
            }
            Err(e) => e,
        };

        stats.last_error = Some(err.to_string());

        if !should_retry(&err) {
            debug!("Not retrying: {}", err);
            return (Err(err), stats);
        }

        if attempt + 1 >= max_attempts {
            warn!("All {} attempts exhausted: {}", max_attempts, err);
            return (Err(err), stats);
        }

        let delay = policy.calculate_delay(attempt);
        stats.total_delay += delay;
        warn!(
            "Attempt {}/{} failed: {}. Retrying in {:?}",
            attempt + 1,
            max_attempts,
            err,
            delay
        );
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}
