//! # Per-origin rate limiter
//! Gates requests so no two hit the same origin closer together than an
//! adaptively-computed minimum interval. Failures grow the interval
//! (rate-limit responses faster than generic errors), successes relax it
//! back toward the configured default.

use rand::Rng;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::config::RateConfig;

/// Multiplier applied on a generic failure.
const GROWTH_GENERIC: f64 = 1.5;
/// Multiplier applied on a rate-limit-class failure (HTTP 429).
const GROWTH_RATE_LIMITED: f64 = 3.0;
/// Sub-1 relaxation factor applied on success.
const RELAX: f64 = 0.85;

#[derive(Debug)]
struct OriginState {
    last_request: Option<Instant>,
    current_delay: Duration,
    consecutive_errors: u32,
}

/// Adaptive per-origin request gate.
///
/// Each origin gets its own lock, so acquirers for the same origin are
/// serialized while different origins proceed in parallel. The outer map
/// lock is only held for the get-or-create of an entry.
#[derive(Debug)]
pub struct RateLimiter {
    cfg: RateConfig,
    origins: StdMutex<HashMap<String, Arc<Mutex<OriginState>>>>,
}

impl RateLimiter {
    pub fn new(cfg: RateConfig) -> Self {
        Self {
            cfg,
            origins: StdMutex::new(HashMap::new()),
        }
    }

    fn entry(&self, origin: &str) -> Arc<Mutex<OriginState>> {
        let mut map = self.origins.lock().expect("origin map poisoned");
        map.entry(origin.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(OriginState {
                    last_request: None,
                    current_delay: Duration::from_secs_f64(self.cfg.default_delay_secs),
                    consecutive_errors: 0,
                }))
            })
            .clone()
    }

    /// Apply symmetric jitter and clamp above zero.
    fn jittered(&self, delay: Duration) -> Duration {
        if self.cfg.jitter <= 0.0 {
            return delay;
        }
        let factor = 1.0 + rand::rng().random_range(-self.cfg.jitter..=self.cfg.jitter);
        delay.mul_f64(factor.max(0.01))
    }

    /// Wait until the origin's minimum interval has elapsed since its last
    /// request, then record "now" as the new last-request time.
    ///
    /// The per-origin lock is held across the sleep, so concurrent acquirers
    /// for one origin line up; other origins are unaffected.
    pub async fn acquire(&self, origin: &str) {
        let entry = self.entry(origin);
        let mut st = entry.lock().await;
        if let Some(last) = st.last_request {
            let wait = self.jittered(st.current_delay);
            let elapsed = last.elapsed();
            if elapsed < wait {
                tokio::time::sleep(wait - elapsed).await;
            }
        }
        st.last_request = Some(Instant::now());
    }

    /// Reset the error counter and relax the delay toward the default.
    pub async fn report_success(&self, origin: &str) {
        let entry = self.entry(origin);
        let mut st = entry.lock().await;
        st.consecutive_errors = 0;
        let floor = Duration::from_secs_f64(self.cfg.default_delay_secs);
        st.current_delay = st.current_delay.mul_f64(RELAX).max(floor);
    }

    /// Grow the delay and bump the error counter. Rate-limit-class statuses
    /// (429) grow faster than generic failures.
    pub async fn report_failure(&self, origin: &str, status: Option<u16>) {
        let entry = self.entry(origin);
        let mut st = entry.lock().await;
        st.consecutive_errors = st.consecutive_errors.saturating_add(1);
        let growth = if status == Some(429) {
            GROWTH_RATE_LIMITED
        } else {
            GROWTH_GENERIC
        };
        let ceiling = Duration::from_secs_f64(self.cfg.max_delay_secs);
        st.current_delay = st.current_delay.mul_f64(growth).min(ceiling);
        tracing::debug!(
            origin,
            ?status,
            errors = st.consecutive_errors,
            delay_secs = st.current_delay.as_secs_f64(),
            "origin backoff grown"
        );
    }

    /// True once the origin has accumulated `max_errors` consecutive
    /// failures; cleared only by a subsequent success.
    pub async fn should_skip(&self, origin: &str, max_errors: u32) -> bool {
        let entry = self.entry(origin);
        let st = entry.lock().await;
        st.consecutive_errors >= max_errors
    }

    /// Current adaptive delay for an origin (diagnostics and tests).
    pub async fn current_delay(&self, origin: &str) -> Duration {
        let entry = self.entry(origin);
        let st = entry.lock().await;
        st.current_delay
    }

    /// Current consecutive error count for an origin.
    pub async fn consecutive_errors(&self, origin: &str) -> u32 {
        let entry = self.entry(origin);
        let st = entry.lock().await;
        st.consecutive_errors
    }
}
