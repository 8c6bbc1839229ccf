//! Reconnect backoff policy and delay calculation.
//!
//! The ops transport reconnects with capped exponential backoff. The async
//! scheduling lives in `bridle-ops`; this module holds the portable,
//! sync-only pieces:
//!
//! - [`ReconnectPolicy`]: backoff parameters (base, cap, jitter, attempts)
//! - [`delay_with_random`]: exponential delay with explicit jitter input

use serde::{Deserialize, Serialize};

// ─────────────────────────────────────────────────────────────────────────────
// Policy
// ─────────────────────────────────────────────────────────────────────────────

/// Default base delay in milliseconds.
pub const DEFAULT_BASE_DELAY_MS: u64 = 500;
/// Default maximum delay in milliseconds.
pub const DEFAULT_MAX_DELAY_MS: u64 = 30_000;
/// Default jitter factor (0.0–1.0).
pub const DEFAULT_JITTER_FACTOR: f64 = 0.2;

/// Backoff parameters for the reconnect loop.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconnectPolicy {
    /// Base delay for exponential backoff in ms (default: 500).
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Maximum delay between attempts in ms (default: 30000).
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Jitter factor 0.0–1.0 (default: 0.2).
    #[serde(default = "default_jitter_factor")]
    pub jitter_factor: f64,
    /// Give up after this many consecutive failed attempts; `None` retries
    /// forever (default).
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

fn default_base_delay_ms() -> u64 {
    DEFAULT_BASE_DELAY_MS
}
fn default_max_delay_ms() -> u64 {
    DEFAULT_MAX_DELAY_MS
}
fn default_jitter_factor() -> f64 {
    DEFAULT_JITTER_FACTOR
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            jitter_factor: DEFAULT_JITTER_FACTOR,
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before the given zero-based attempt, with fresh randomness.
    #[must_use]
    pub fn delay_ms(&self, attempt: u32) -> u64 {
        delay_with_random(
            attempt,
            self.base_delay_ms,
            self.max_delay_ms,
            self.jitter_factor,
            rand::random::<f64>(),
        )
    }

    /// Whether another attempt is allowed after `attempt` failures.
    #[must_use]
    pub fn allows_attempt(&self, attempt: u32) -> bool {
        self.max_attempts.is_none_or(|max| attempt < max)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Delay calculation
// ─────────────────────────────────────────────────────────────────────────────

/// Calculate a capped exponential backoff delay with explicit randomness.
///
/// Formula: `min(max_delay, base_delay * 2^attempt) * (1 + (random*2-1) * jitter)`
///
/// `random` should be a value in `[0.0, 1.0)` from a PRNG; it maps to a
/// symmetric `[-jitter, +jitter]` band around the capped exponential value.
#[must_use]
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
pub fn delay_with_random(
    attempt: u32,
    base_delay_ms: u64,
    max_delay_ms: u64,
    jitter_factor: f64,
    random: f64,
) -> u64 {
    let exponential = base_delay_ms.saturating_mul(1u64 << attempt.min(31));
    let capped = exponential.min(max_delay_ms);

    // Maps random [0,1) to [-jitter, +jitter]
    let jitter = 1.0 + (random * 2.0 - 1.0) * jitter_factor;
    let with_jitter = (capped as f64) * jitter;

    with_jitter.round().max(0.0) as u64
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
