//! Adaptive rate limiter for AWS APIs.
//!
//! Epistemic foundation:
//! - K_i: AWS signals throttling via 429, 503 SlowDown or Throttling error codes
//! - K_i: CloudTrail LookupEvents is capped at 2 requests per second
//! - B_i: STS and S3 limits vary by account and are not advertised
//! - I^B: Exact limits unknowable → space requests, back off on throttling

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Upper bound for a single throttling backoff.
const MAX_BACKOFF_SECS: f64 = 30.0;

/// Rate limit state for a single service.
#[derive(Debug)]
pub struct ServiceRateLimitState {
    /// Minimum spacing between request starts
    pub min_interval: Duration,
    /// When the last request was allowed through
    pub last_request_at: Option<Instant>,
    /// Consecutive throttling responses (for backoff)
    pub consecutive_throttles: u32,
    /// Backoff until this time
    pub backoff_until: Option<Instant>,
}

impl ServiceRateLimitState {
    fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_request_at: None,
            consecutive_throttles: 0,
            backoff_until: None,
        }
    }

    /// Get time to wait before proceeding.
    pub fn wait_time(&self) -> Duration {
        let now = Instant::now();
        let mut max_wait = Duration::ZERO;

        if let Some(backoff_until) = self.backoff_until.filter(|&t| t > now) {
            max_wait = max_wait.max(backoff_until - now);
        }

        if let Some(next) = self.last_request_at.map(|t| t + self.min_interval) {
            if next > now {
                max_wait = max_wait.max(next - now);
            }
        }

        max_wait
    }

    /// Record a throttling response and calculate backoff.
    pub fn record_throttle(&mut self, retry_after: Option<f64>) {
        self.consecutive_throttles += 1;
        let exponential = (2.0_f64).powi(self.consecutive_throttles as i32 - 1);
        let backoff_secs = retry_after.unwrap_or(exponential).min(MAX_BACKOFF_SECS);
        self.backoff_until = Some(Instant::now() + Duration::from_secs_f64(backoff_secs));
        warn!(
            consecutive_throttles = self.consecutive_throttles,
            backoff_secs = backoff_secs,
            "Throttled, backing off"
        );
    }

    /// Record a request that was not throttled.
    pub fn record_success(&mut self) {
        if self.consecutive_throttles > 0 {
            self.consecutive_throttles = 0;
            self.backoff_until = None;
        }
    }
}

/// Adaptive rate limiter shared by all AWS clients.
///
/// Tracks per-service spacing and provides backoff on throttling.
#[derive(Debug)]
pub struct RateLimiter {
    /// Per-service rate limit state
    states: DashMap<String, ServiceRateLimitState>,
    /// Spacing applied to services registered via `with_min_interval`
    intervals: DashMap<String, Duration>,
    /// Global stats
    total_requests: AtomicU64,
    total_throttles: AtomicU64,
    total_wait_ms: AtomicU64,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter {
    /// Create a new rate limiter.
    pub fn new() -> Self {
        Self {
            states: DashMap::new(),
            intervals: DashMap::new(),
            total_requests: AtomicU64::new(0),
            total_throttles: AtomicU64::new(0),
            total_wait_ms: AtomicU64::new(0),
        }
    }

    /// Require at least `interval` between requests to `service`.
    pub fn with_min_interval(self, service: &str, interval: Duration) -> Self {
        self.intervals.insert(service.to_string(), interval);
        self
    }

    fn interval_for(&self, service: &str) -> Duration {
        self.intervals
            .get(service)
            .map(|i| *i)
            .unwrap_or(Duration::ZERO)
    }

    /// Wait if necessary before making a request to the given service.
    ///
    /// Reserves the next slot, so concurrent callers are spaced out.
    /// Returns the duration waited.
    pub async fn wait_if_needed(&self, service: &str) -> Duration {
        let wait_time = {
            let interval = self.interval_for(service);
            let mut state = self
                .states
                .entry(service.to_string())
                .or_insert_with(|| ServiceRateLimitState::new(interval));
            let wait = state.wait_time();
            state.last_request_at = Some(Instant::now() + wait);
            wait
        };

        if wait_time > Duration::ZERO {
            debug!(
                service = service,
                wait_ms = wait_time.as_millis() as u64,
                "Waiting for rate limit"
            );
            self.total_wait_ms
                .fetch_add(wait_time.as_millis() as u64, Ordering::Relaxed);
            tokio::time::sleep(wait_time).await;
        }

        wait_time
    }

    /// Record a request result.
    pub fn record_request(&self, service: &str, throttled: bool, retry_after: Option<f64>) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);

        let interval = self.interval_for(service);
        let mut state = self
            .states
            .entry(service.to_string())
            .or_insert_with(|| ServiceRateLimitState::new(interval));

        if throttled {
            self.total_throttles.fetch_add(1, Ordering::Relaxed);
            state.record_throttle(retry_after);
        } else {
            state.record_success();
        }
    }

    /// Get statistics.
    pub fn stats(&self) -> RateLimiterStats {
        let total_requests = self.total_requests.load(Ordering::Relaxed);
        let total_throttles = self.total_throttles.load(Ordering::Relaxed);
        let total_wait_ms = self.total_wait_ms.load(Ordering::Relaxed);

        RateLimiterStats {
            total_requests,
            total_throttles,
            total_wait_secs: total_wait_ms as f64 / 1000.0,
            throttle_ratio: if total_requests > 0 {
                total_throttles as f64 / total_requests as f64
            } else {
                0.0
            },
            services_tracked: self.states.len(),
        }
    }
}

/// Rate limiter statistics.
#[derive(Debug, Clone)]
pub struct RateLimiterStats {
    pub total_requests: u64,
    pub total_throttles: u64,
    pub total_wait_secs: f64,
    pub throttle_ratio: f64,
    pub services_tracked: usize,
}
