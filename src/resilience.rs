//! Write-side limits: rate, concurrency and retry backoff.
//!
//! The dispatch queue takes a [`Bulkhead`] slot, then a [`RateLimiter`] token,
//! before every bulk write. A failed write may be retried according to
//! [`RetryConfig`]; retries are off unless configured.
//!
//! ```rust,no_run
//! # async fn example() -> couch_firehose::Result<()> {
//! use couch_firehose::resilience::{Bulkhead, RateLimiter};
//!
//! let limiter = RateLimiter::per_second(50);
//! let slots = Bulkhead::new(2);
//!
//! let _slot = slots.acquire().await?;
//! limiter.acquire().await;
//! // ... one bulk write ...
//! # Ok(())
//! # }
//! ```

use crate::error::{FirehoseError, Result};
use governor::{
    clock::DefaultClock,
    middleware::NoOpMiddleware,
    state::{InMemoryState, NotKeyed},
    Quota,
};
use serde::{Deserialize, Serialize};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

// ═══════════════════════════════════════════════════════════════════════════════
// Retry
// ═══════════════════════════════════════════════════════════════════════════════

/// Retry policy for a failed bulk write.
///
/// `max_attempts` includes the first try; the default of `1` disables
/// retries so a failed batch is logged and counted straight away.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,

    /// Wait before the first retry.
    #[serde(default = "default_initial_delay", with = "duration_serde")]
    pub initial_delay: Duration,

    /// Upper bound on any single wait.
    #[serde(default = "default_max_delay", with = "duration_serde")]
    pub max_delay: Duration,

    /// Growth of the wait between consecutive retries.
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
}

fn default_max_attempts() -> usize {
    1
}

fn default_initial_delay() -> Duration {
    Duration::from_millis(500)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(30)
}

fn default_backoff_factor() -> f64 {
    2.0
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            backoff_factor: default_backoff_factor(),
        }
    }
}

impl RetryConfig {
    /// Allow `retries` extra attempts with the default backoff.
    pub fn with_retries(retries: usize) -> Self {
        Self {
            max_attempts: retries.saturating_add(1),
            ..Self::default()
        }
    }

    /// Two retries, millisecond backoff.
    pub fn testing() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
            ..Self::default()
        }
    }

    /// Whether attempt number `attempt` (1-based) may be followed by another.
    pub fn should_retry(&self, attempt: usize) -> bool {
        attempt < self.max_attempts
    }

    /// Wait after failed attempt number `attempt` (1-based).
    ///
    /// `initial_delay * backoff_factor^(attempt - 1)`, capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let scaled = self.initial_delay.as_secs_f64() * self.backoff_factor.powi(exponent);
        Duration::try_from_secs_f64(scaled)
            .map(|d| d.min(self.max_delay))
            .unwrap_or(self.max_delay)
    }
}

/// humantime strings ("250ms", "5s") for `Duration` config fields.
pub(crate) mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(&humantime::format_duration(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(d)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Write rate
// ═══════════════════════════════════════════════════════════════════════════════

type DirectLimiter = governor::RateLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>;

/// Caps bulk writes started per second.
///
/// Token bucket with a burst of one, so writes are spaced evenly at
/// `1 / rate` rather than bunched at the start of each second. Callers over
/// the rate wait their turn.
pub struct RateLimiter {
    inner: DirectLimiter,
    rate: NonZeroU32,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter").field("rate", &self.rate).finish()
    }
}

impl RateLimiter {
    /// `rate` writes per second; zero is treated as one.
    pub fn per_second(rate: u32) -> Self {
        let rate = NonZeroU32::new(rate).unwrap_or(NonZeroU32::MIN);
        let quota = Quota::per_second(rate).allow_burst(NonZeroU32::MIN);
        Self {
            inner: governor::RateLimiter::direct(quota),
            rate,
        }
    }

    /// Wait for the next write slot. Cancel-safe.
    pub async fn acquire(&self) {
        self.inner.until_ready().await;
    }

    pub fn rate(&self) -> u32 {
        self.rate.get()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Concurrency
// ═══════════════════════════════════════════════════════════════════════════════

/// Caps bulk writes in flight.
///
/// Each write holds one permit for its whole lifetime, retries included.
#[derive(Debug, Clone)]
pub struct Bulkhead {
    slots: Arc<Semaphore>,
    capacity: usize,
}

impl Bulkhead {
    /// `capacity` concurrent writes; zero is treated as one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Wait for a free slot.
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit> {
        Arc::clone(&self.slots)
            .acquire_owned()
            .await
            .map_err(|_| FirehoseError::Internal("write slots closed".to_string()))
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Slots currently held.
    pub fn in_flight(&self) -> usize {
        self.capacity - self.slots.available_permits()
    }
}
