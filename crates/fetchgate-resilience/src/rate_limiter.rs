//! Admission control for outbound upstream calls using the token bucket algorithm.
//!
//! The bucket refills lazily: every acquisition attempt first credits
//! `elapsed * refill_per_second` tokens (capped at capacity). Callers that
//! find too few tokens sleep for the time the deficit needs to refill and try
//! again. Waiters queue in FIFO order, so nobody is starved while the refill
//! rate is positive.

use fetchgate_core::GatewayError;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, warn};

/// Slack for floating point token accounting
const TOKEN_EPSILON: f64 = 1e-9;

/// Lower bound on a single wait, so rounding never produces a busy loop
const MIN_WAIT: Duration = Duration::from_millis(1);

/// Upper bound on a single wait; longer deficits are re-polled
const MAX_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Window used for the observed admission rate
const RATE_WINDOW: Duration = Duration::from_secs(10);

/// Minimum admissions inside the window before a rate is reported
const MIN_ADMISSIONS_FOR_RATE: usize = 2;

/// Token bucket configuration
#[derive(Debug, Clone)]
pub struct TokenBucketConfig {
    /// Maximum tokens held (burst size)
    pub capacity: u32,
    /// Tokens credited per second
    pub refill_per_second: f64,
    /// Upper bound on the refill pause applied after an upstream 429
    pub max_penalty: Duration,
}

impl Default for TokenBucketConfig {
    fn default() -> Self {
        Self {
            capacity: 10,
            refill_per_second: 5.0,
            max_penalty: Duration::from_secs(60),
        }
    }
}

impl TokenBucketConfig {
    /// Create a configuration with the given rate and burst size
    #[must_use]
    pub fn new(refill_per_second: f64, capacity: u32) -> Self {
        Self {
            capacity,
            refill_per_second,
            ..Self::default()
        }
    }
}

/// Token bucket state.
///
/// `last_refill` may lie in the future while a 429 penalty is active; no
/// tokens accrue until it is reached.
#[derive(Debug, Clone)]
struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_second: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(config: &TokenBucketConfig, now: Instant) -> Self {
        let capacity = f64::from(config.capacity);
        Self {
            capacity,
            tokens: capacity,
            refill_per_second: config.refill_per_second,
            last_refill: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        if now <= self.last_refill {
            return;
        }
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_second).min(self.capacity);
        self.last_refill = now;
    }

    /// Tokens that a refill at `now` would produce, without mutating state
    fn projected(&self, now: Instant) -> f64 {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        (self.tokens + elapsed * self.refill_per_second).min(self.capacity)
    }

    /// Consume `cost` tokens, or report how long until they will be available
    fn try_consume(&mut self, cost: f64, now: Instant) -> Result<(), Duration> {
        self.refill(now);
        if self.tokens + TOKEN_EPSILON >= cost {
            self.tokens -= cost;
            Ok(())
        } else {
            Err(self.time_until(cost, now))
        }
    }

    fn time_until(&self, cost: f64, now: Instant) -> Duration {
        let paused = self.last_refill.saturating_duration_since(now);
        let deficit = (cost - self.tokens).max(0.0);
        let refill = Duration::try_from_secs_f64(deficit / self.refill_per_second)
            .unwrap_or(MAX_POLL_INTERVAL)
            .min(MAX_POLL_INTERVAL);
        paused.saturating_add(refill)
    }

    fn penalize(&mut self, now: Instant, pause: Duration) {
        self.refill(now);
        self.tokens = 0.0;
        let Some(resume_at) = now.checked_add(pause) else {
            return;
        };
        if resume_at > self.last_refill {
            self.last_refill = resume_at;
        }
    }

    fn check_invariant(&self) -> Result<(), GatewayError> {
        if !self.tokens.is_finite()
            || self.tokens < -TOKEN_EPSILON
            || self.tokens > self.capacity + TOKEN_EPSILON
        {
            return Err(GatewayError::internal_invariant(format!(
                "token count {} outside [0, {}]",
                self.tokens, self.capacity
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct AdmissionLog {
    recent: VecDeque<Instant>,
    admissions: u64,
    penalties: u64,
    total_wait: Duration,
}

impl AdmissionLog {
    fn record(&mut self, now: Instant, waited: Duration) {
        self.admissions += 1;
        self.total_wait += waited;
        self.recent.push_back(now);
        self.prune(now);
    }

    fn prune(&mut self, now: Instant) {
        while let Some(front) = self.recent.front() {
            if now.saturating_duration_since(*front) > RATE_WINDOW {
                self.recent.pop_front();
            } else {
                break;
            }
        }
    }

    fn rate(&self, now: Instant) -> f64 {
        let recent: Vec<&Instant> = self
            .recent
            .iter()
            .filter(|t| now.saturating_duration_since(**t) <= RATE_WINDOW)
            .collect();
        if recent.len() < MIN_ADMISSIONS_FOR_RATE {
            return 0.0;
        }
        let span = now.saturating_duration_since(*recent[0]).as_secs_f64();
        if span <= 0.0 {
            return 0.0;
        }
        recent.len() as f64 / span
    }
}

/// Limiter statistics snapshot
#[derive(Debug, Clone)]
pub struct LimiterStats {
    /// Tokens available right now
    pub tokens_available: f64,
    /// Bucket capacity
    pub capacity: u32,
    /// Refill rate in tokens per second
    pub refill_per_second: f64,
    /// Total successful acquisitions
    pub admissions: u64,
    /// Number of 429 penalties applied
    pub penalties: u64,
    /// Cumulative time callers spent waiting for tokens
    pub total_wait: Duration,
    /// Observed admissions per second over the last ten seconds
    pub current_rate: f64,
}

impl LimiterStats {
    /// Fraction of the bucket currently in use, as a percentage
    #[must_use]
    pub fn utilization(&self) -> f64 {
        if self.capacity == 0 {
            return 0.0;
        }
        let used = f64::from(self.capacity) - self.tokens_available;
        (used / f64::from(self.capacity) * 100.0).max(0.0)
    }
}

/// Shared token bucket limiter for one upstream target
pub struct RateLimiter {
    /// Identifier
    id: String,
    /// Configuration
    config: TokenBucketConfig,
    /// Token accounting
    bucket: Mutex<TokenBucket>,
    /// FIFO admission queue; the holder is the only caller allowed to wait on the bucket
    queue: tokio::sync::Mutex<()>,
    /// Admission history
    log: Mutex<AdmissionLog>,
    /// Whether rate limiting is enabled
    enabled: bool,
}

impl RateLimiter {
    /// Create a new rate limiter
    ///
    /// # Errors
    /// Returns a configuration error if the capacity is zero or the refill
    /// rate is not a positive finite number
    pub fn new(id: impl Into<String>, config: TokenBucketConfig) -> Result<Self, GatewayError> {
        if config.capacity == 0 {
            return Err(GatewayError::configuration("token bucket capacity must be at least 1"));
        }
        if !config.refill_per_second.is_finite() || config.refill_per_second <= 0.0 {
            return Err(GatewayError::configuration(format!(
                "token bucket refill rate must be positive, got {}",
                config.refill_per_second
            )));
        }

        Ok(Self {
            id: id.into(),
            bucket: Mutex::new(TokenBucket::new(&config, Instant::now())),
            config,
            queue: tokio::sync::Mutex::new(()),
            log: Mutex::new(AdmissionLog::default()),
            enabled: true,
        })
    }

    /// Create a disabled rate limiter (always admits)
    #[must_use]
    pub fn disabled(id: impl Into<String>) -> Self {
        let config = TokenBucketConfig::default();
        Self {
            id: id.into(),
            bucket: Mutex::new(TokenBucket::new(&config, Instant::now())),
            config,
            queue: tokio::sync::Mutex::new(()),
            log: Mutex::new(AdmissionLog::default()),
            enabled: false,
        }
    }

    /// Get the rate limiter ID
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Check if rate limiting is enabled
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Get the configuration
    #[must_use]
    pub fn config(&self) -> &TokenBucketConfig {
        &self.config
    }

    fn ensure_satisfiable(&self, cost: u32) -> Result<(), GatewayError> {
        if cost > self.config.capacity {
            warn!(
                rate_limiter = %self.id,
                cost,
                capacity = self.config.capacity,
                "Limiter cost can never be satisfied"
            );
            return Err(GatewayError::limiter_config(cost, self.config.capacity));
        }
        Ok(())
    }

    /// Take `cost` tokens or report the wait needed, checking the bucket invariant
    fn consume(&self, cost: u32) -> Result<Result<(), Duration>, GatewayError> {
        let mut bucket = self.bucket.lock();
        let outcome = bucket.try_consume(f64::from(cost), Instant::now());
        if let Err(err) = bucket.check_invariant() {
            error!(rate_limiter = %self.id, error = %err, "Token bucket invariant violated");
            return Err(err);
        }
        Ok(outcome)
    }

    /// Wait until `cost` tokens are available, then consume them.
    ///
    /// Only the calling task is suspended. Returns the time spent waiting.
    ///
    /// # Errors
    /// Returns `GatewayError::LimiterConfig` immediately if `cost` exceeds
    /// the bucket capacity, and `GatewayError::InternalInvariant` if the
    /// token accounting is ever found out of range
    pub async fn acquire(&self, cost: u32) -> Result<Duration, GatewayError> {
        if !self.enabled {
            return Ok(Duration::ZERO);
        }
        self.ensure_satisfiable(cost)?;

        let started = Instant::now();
        let _turn = self.queue.lock().await;

        loop {
            match self.consume(cost)? {
                Ok(()) => {
                    let now = Instant::now();
                    let waited = now.saturating_duration_since(started);
                    self.log.lock().record(now, waited);
                    debug!(
                        rate_limiter = %self.id,
                        cost,
                        wait_ms = waited.as_millis(),
                        "Limiter admitted request"
                    );
                    return Ok(waited);
                }
                Err(wait) => {
                    let wait = wait.max(MIN_WAIT);
                    debug!(
                        rate_limiter = %self.id,
                        cost,
                        wait_ms = wait.as_millis(),
                        "Waiting for token refill"
                    );
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }

    /// Consume `cost` tokens if they are available right now.
    ///
    /// Never jumps ahead of callers already waiting in [`acquire`](Self::acquire).
    ///
    /// # Errors
    /// Same conditions as [`acquire`](Self::acquire)
    pub fn try_acquire(&self, cost: u32) -> Result<bool, GatewayError> {
        if !self.enabled {
            return Ok(true);
        }
        self.ensure_satisfiable(cost)?;

        let Ok(_turn) = self.queue.try_lock() else {
            return Ok(false);
        };
        match self.consume(cost)? {
            Ok(()) => {
                self.log.lock().record(Instant::now(), Duration::ZERO);
                Ok(true)
            }
            Err(_) => Ok(false),
        }
    }

    /// React to an upstream 429: drop all remaining burst and pause refill for
    /// `retry_after` (bounded by the configured maximum penalty).
    pub fn penalize(&self, retry_after: Option<Duration>) {
        if !self.enabled {
            return;
        }
        let pause = retry_after.unwrap_or(Duration::ZERO).min(self.config.max_penalty);
        self.bucket.lock().penalize(Instant::now(), pause);
        self.log.lock().penalties += 1;
        warn!(
            rate_limiter = %self.id,
            pause_ms = pause.as_millis(),
            "Upstream rate limited us, draining token bucket"
        );
    }

    /// Tokens available now, without consuming any
    #[must_use]
    pub fn available_tokens(&self) -> f64 {
        self.bucket.lock().projected(Instant::now())
    }

    /// Get current statistics
    #[must_use]
    pub fn stats(&self) -> LimiterStats {
        let now = Instant::now();
        let tokens_available = self.bucket.lock().projected(now);
        let log = self.log.lock();
        LimiterStats {
            tokens_available,
            capacity: self.config.capacity,
            refill_per_second: self.config.refill_per_second,
            admissions: log.admissions,
            penalties: log.penalties,
            total_wait: log.total_wait,
            current_rate: log.rate(now),
        }
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("id", &self.id)
            .field("capacity", &self.config.capacity)
            .field("refill_per_second", &self.config.refill_per_second)
            .field("enabled", &self.enabled)
            .finish()
    }
}
