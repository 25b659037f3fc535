//! Deadlines for logical requests and individual upstream attempts.
//!
//! A logical request carries one overall deadline. Each upstream attempt gets
//! its own, shorter budget that never outlives the overall deadline.

use fetchgate_core::GatewayError;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::warn;

/// Longest span ever added to an instant (about thirty years)
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// `from + span`, with `span` capped so the sum cannot overflow
#[must_use]
pub fn instant_after(from: Instant, span: Duration) -> Instant {
    let span = span.min(FAR_FUTURE);
    from.checked_add(span)
        .or_else(|| from.checked_add(span / 1_000))
        .unwrap_or(from)
}

/// Timeout configuration
#[derive(Debug, Clone)]
pub struct TimeoutConfig {
    /// Overall budget for a logical request, waits included
    pub request: Duration,
    /// Budget for a single upstream attempt
    pub attempt: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            request: Duration::from_secs(60),
            attempt: Duration::from_secs(30),
        }
    }
}

/// Point in time by which a request must finish
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    at: Instant,
    budget: Duration,
}

impl Deadline {
    /// Deadline `budget` from now
    #[must_use]
    pub fn after(budget: Duration) -> Self {
        Self {
            at: instant_after(Instant::now(), budget),
            budget,
        }
    }

    /// Instant at which the deadline elapses
    #[must_use]
    pub fn instant(&self) -> Instant {
        self.at
    }

    /// Budget the deadline was created with
    #[must_use]
    pub fn budget(&self) -> Duration {
        self.budget
    }

    /// Time left before the deadline
    #[must_use]
    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    /// Whether the deadline has passed
    #[must_use]
    pub fn is_elapsed(&self) -> bool {
        Instant::now() >= self.at
    }

    /// The earlier of this deadline and `budget` from now
    #[must_use]
    pub fn capped(&self, budget: Duration) -> Instant {
        instant_after(Instant::now(), budget).min(self.at)
    }

    /// Run `future` until it completes or the deadline passes
    ///
    /// # Errors
    /// Returns `GatewayError::Timeout` carrying the original budget if the
    /// deadline passes first
    pub async fn run<F, T>(&self, future: F) -> Result<T, GatewayError>
    where
        F: Future<Output = Result<T, GatewayError>>,
    {
        if let Ok(result) = tokio::time::timeout_at(self.at, future).await {
            result
        } else {
            warn!(timeout_ms = self.budget.as_millis(), "Request deadline elapsed");
            Err(GatewayError::timeout(self.budget))
        }
    }
}

/// Timeout manager
#[derive(Debug, Clone)]
pub struct TimeoutManager {
    config: TimeoutConfig,
}

impl TimeoutManager {
    /// Create a new timeout manager
    #[must_use]
    pub fn new(config: TimeoutConfig) -> Self {
        Self { config }
    }

    /// Create with default configuration
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(TimeoutConfig::default())
    }

    /// Get the configuration
    #[must_use]
    pub fn config(&self) -> &TimeoutConfig {
        &self.config
    }

    /// Get the request timeout
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        self.config.request
    }

    /// Get the per-attempt timeout
    #[must_use]
    pub fn attempt_timeout(&self) -> Duration {
        self.config.attempt
    }

    /// Deadline for a request starting now
    #[must_use]
    pub fn request_deadline(&self) -> Deadline {
        Deadline::after(self.config.request)
    }

    /// Deadline for an upstream attempt starting now
    #[must_use]
    pub fn attempt_deadline(&self) -> Instant {
        instant_after(Instant::now(), self.config.attempt)
    }

    /// Execute an operation with the request timeout
    ///
    /// # Errors
    /// Returns `GatewayError::Timeout` if the operation times out
    pub async fn with_timeout<F, T>(&self, future: F) -> Result<T, GatewayError>
    where
        F: Future<Output = Result<T, GatewayError>>,
    {
        self.with_custom_timeout(future, self.config.request).await
    }

    /// Execute an operation with a custom timeout
    ///
    /// # Errors
    /// Returns `GatewayError::Timeout` if the operation times out
    pub async fn with_custom_timeout<F, T>(
        &self,
        future: F,
        timeout: Duration,
    ) -> Result<T, GatewayError>
    where
        F: Future<Output = Result<T, GatewayError>>,
    {
        Deadline::after(timeout).run(future).await
    }
}
