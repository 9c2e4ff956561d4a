//! Backoff policy for retried remote calls.
//!
//! Delays grow exponentially with ±`jitter` multiplicative randomization,
//! capped at `max_delay`.  A server-supplied `Retry-After` hint overrides
//! the computed delay exactly (clamped to the cap, no jitter): when the
//! server says how long to wait, we wait that long.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Configuration for the retry loop.  Passed explicitly into
/// [`crate::executor::RequestExecutor`]; there are no process-wide knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempt budget, including the first call.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the first retry.
    #[serde(with = "humantime_serde", default = "default_initial_delay")]
    pub initial_delay: Duration,
    /// Upper bound on any single wait, computed or server-hinted.
    #[serde(with = "humantime_serde", default = "default_max_delay")]
    pub max_delay: Duration,
    /// Jitter factor (0.3 = delay × random in [0.7, 1.3]).
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            jitter: default_jitter(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(60)
}

fn default_jitter() -> f64 {
    0.3
}

/// Compute the jittered exponential delay after `attempt` failed attempts
/// (0-based): `min(max_delay, initial_delay × 2^attempt)` ± jitter.
pub fn calculate_delay(config: &RetryConfig, attempt: u32) -> Duration {
    let pow = attempt.min(16);
    let raw = config
        .initial_delay
        .saturating_mul(2_u32.saturating_pow(pow));
    let capped = raw.min(config.max_delay);

    if config.jitter > 0.0 {
        apply_jitter(capped, config.jitter)
    } else {
        capped
    }
}

/// The wait before the next attempt: the server hint clamped to the cap
/// when present, otherwise the jittered exponential delay.
pub fn delay_for(config: &RetryConfig, attempt: u32, hint: Option<Duration>) -> Duration {
    match hint {
        Some(hint) => hint.min(config.max_delay),
        None => calculate_delay(config, attempt),
    }
}

/// Apply jitter to a delay value.
/// Jitter factor of 0.3 means delay × (0.7 to 1.3).
fn apply_jitter(delay: Duration, jitter: f64) -> Duration {
    let jitter_range = 2.0 * jitter;
    let random_factor = 1.0 - jitter + (rand::random::<f64>() * jitter_range);
    let millis = (delay.as_millis() as f64 * random_factor).round() as u64;
    Duration::from_millis(millis)
}

/// Parse a `Retry-After` header value relative to `now`.
///
/// Accepts an integer seconds value or an HTTP-date; anything else yields
/// `None` and the caller falls back to computed backoff.
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }

    if let Ok(seconds) = value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }

    // HTTP-dates in the past clamp to zero: retry immediately.
    let date = DateTime::parse_from_rfc2822(value).ok()?;
    Some(
        date.signed_duration_since(now)
            .to_std()
            .unwrap_or(Duration::ZERO),
    )
}
