//! Retry policy with exponential backoff and jitter.
//!
//! Each attempt's failure is classified before the policy sees it. Transient
//! failures are retried until the attempt budget is spent; permanent failures
//! and non-upstream errors end the loop immediately.

use fetchgate_core::{GatewayError, UpstreamFailure};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Result of a retried operation
pub type RetryResult<T> = Result<T, GatewayError>;

/// Retry configuration
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub base_delay: Duration,
    /// Growth factor applied per attempt
    pub multiplier: f64,
    /// Upper bound on any single delay
    pub max_delay: Duration,
    /// Jitter fraction (0.0 - 1.0) applied symmetrically around the delay
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            jitter: 0.1,
        }
    }
}

impl RetryConfig {
    /// Configuration without jitter, useful when delays must be predictable
    #[must_use]
    pub fn without_jitter(mut self) -> Self {
        self.jitter = 0.0;
        self
    }
}

/// Per-request retry bookkeeping
#[derive(Debug, Clone, Default)]
pub struct RetryState {
    /// Attempt that just finished (1-based)
    pub attempt: u32,
    /// Failure of that attempt
    pub last_error: Option<UpstreamFailure>,
    /// Delay before the next attempt, if one will be made
    pub next_delay: Option<Duration>,
}

/// Retry policy
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    /// Create a new retry policy
    #[must_use]
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Create with default configuration
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(RetryConfig::default())
    }

    /// Get the configuration
    #[must_use]
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Attempt budget; a configured value of zero still allows one attempt
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts.max(1)
    }

    /// Backoff before attempt `attempt + 1`, without jitter
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let factor = self.config.multiplier.max(1.0).powi(exponent);
        let secs = self.config.base_delay.as_secs_f64() * factor;
        let max = self.config.max_delay.as_secs_f64();
        if !secs.is_finite() || secs >= max {
            self.config.max_delay
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    /// Backoff before attempt `attempt + 1`, randomized by the jitter fraction
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay = self.backoff(attempt);
        let jitter = self.config.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 || delay.is_zero() {
            return delay;
        }
        let spread = rand::thread_rng().gen_range(-jitter..=jitter);
        delay.mul_f64(1.0 + spread)
    }

    /// Delay after `failure` on `attempt`, honouring a server `Retry-After` hint
    #[must_use]
    pub fn delay_after(&self, attempt: u32, failure: &UpstreamFailure) -> Duration {
        let delay = self.delay_for_attempt(attempt);
        match failure.retry_after {
            Some(hint) => delay.max(hint).min(self.config.max_delay),
            None => delay,
        }
    }

    /// Run `operation` until it succeeds, fails permanently or the attempt
    /// budget is spent.
    ///
    /// The closure receives the 1-based attempt number.
    ///
    /// # Errors
    /// Returns `GatewayError::Upstream` carrying the last failure and the
    /// number of attempts made. Any other error from `operation` is returned
    /// unchanged and stops the loop.
    pub async fn execute<F, Fut, T>(&self, operation: F) -> RetryResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = RetryResult<T>>,
    {
        self.execute_observed(operation, |_| {}).await
    }

    /// Like [`execute`](Self::execute), calling `on_retry` before each backoff sleep
    ///
    /// # Errors
    /// Same as [`execute`](Self::execute)
    pub async fn execute_observed<F, Fut, T, O>(&self, mut operation: F, mut on_retry: O) -> RetryResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = RetryResult<T>>,
        O: FnMut(&RetryState),
    {
        let max_attempts = self.max_attempts();
        let mut state = RetryState::default();

        loop {
            state.attempt += 1;
            let failure = match operation(state.attempt).await {
                Ok(value) => {
                    if state.attempt > 1 {
                        debug!(attempt = state.attempt, "Upstream call succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(GatewayError::Upstream { failure, .. }) => failure,
                Err(other) => return Err(other),
            };

            if !failure.is_transient() {
                warn!(
                    attempt = state.attempt,
                    status = ?failure.status_code,
                    error = %failure.message,
                    "Permanent upstream failure, not retrying"
                );
                return Err(GatewayError::upstream(failure, state.attempt));
            }

            if state.attempt >= max_attempts {
                error!(
                    attempts = state.attempt,
                    status = ?failure.status_code,
                    error = %failure.message,
                    "Upstream retries exhausted"
                );
                return Err(GatewayError::upstream(failure, state.attempt));
            }

            let delay = self.delay_after(state.attempt, &failure);
            warn!(
                attempt = state.attempt,
                max_attempts,
                delay_ms = delay.as_millis(),
                status = ?failure.status_code,
                error = %failure.message,
                "Transient upstream failure, retrying"
            );
            state.next_delay = Some(delay);
            state.last_error = Some(failure);
            on_retry(&state);

            tokio::time::sleep(delay).await;
        }
    }
}
