//! Client statistics.

use fetchgate_resilience::{CacheStats, LimiterStats};
use std::collections::VecDeque;
use std::time::Duration;

/// Number of successful attempts kept for the response time average
const RESPONSE_TIME_WINDOW: usize = 100;

/// Snapshot of client activity
#[derive(Debug, Clone)]
pub struct ClientStats {
    /// Upstream attempts made, retries included
    pub total_attempts: u64,
    /// Attempts that produced a cacheable payload
    pub successful_attempts: u64,
    /// Mean response time over recent successful attempts
    pub avg_response_time: Duration,
    /// Fetches currently in flight
    pub in_flight: usize,
    /// Cache statistics
    pub cache: CacheStats,
    /// Limiter statistics
    pub limiter: LimiterStats,
}

impl ClientStats {
    /// Fraction of attempts that succeeded (1.0 before any attempt)
    #[must_use]
    pub fn success_rate(&self) -> f64 {
        if self.total_attempts == 0 {
            1.0
        } else {
            self.successful_attempts as f64 / self.total_attempts as f64
        }
    }

    /// Fraction of attempts that failed
    #[must_use]
    pub fn error_rate(&self) -> f64 {
        1.0 - self.success_rate()
    }
}

/// Running counters for upstream attempts
#[derive(Debug, Default)]
pub(crate) struct AttemptTracker {
    total: u64,
    successful: u64,
    response_times: VecDeque<Duration>,
}

impl AttemptTracker {
    pub(crate) fn record_success(&mut self, elapsed: Duration) {
        self.total += 1;
        self.successful += 1;
        if self.response_times.len() == RESPONSE_TIME_WINDOW {
            self.response_times.pop_front();
        }
        self.response_times.push_back(elapsed);
    }

    pub(crate) fn record_failure(&mut self) {
        self.total += 1;
    }

    pub(crate) fn total(&self) -> u64 {
        self.total
    }

    pub(crate) fn successful(&self) -> u64 {
        self.successful
    }

    pub(crate) fn average_response_time(&self) -> Duration {
        if self.response_times.is_empty() {
            return Duration::ZERO;
        }
        let sum: Duration = self.response_times.iter().sum();
        sum / self.response_times.len() as u32
    }
}
