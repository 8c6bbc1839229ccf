//! Governor policy: pressure thresholds and per-mode concurrency ceilings.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Default free-memory percentage at or below which pressure is critical.
pub const DEFAULT_CRITICAL_MEM_PCT: f64 = 5.0;
/// Default free-memory percentage at or below which pressure is high.
pub const DEFAULT_HIGH_MEM_PCT: f64 = 10.0;
/// Default free-memory percentage at or below which pressure is medium.
pub const DEFAULT_MEDIUM_MEM_PCT: f64 = 20.0;
/// Default process-RSS percentage at or above which pressure is critical.
pub const DEFAULT_CRITICAL_RSS_PCT: f64 = 90.0;
/// Default process-RSS percentage at or above which pressure is high.
pub const DEFAULT_HIGH_RSS_PCT: f64 = 75.0;
/// Default process-RSS percentage at or above which pressure is medium.
pub const DEFAULT_SOFT_RSS_PCT: f64 = 60.0;
/// Default queue age at or above which pressure is critical.
pub const DEFAULT_CRITICAL_QUEUE_AGE_MS: u64 = 30_000;
/// Default queue age at or above which pressure is high.
pub const DEFAULT_HIGH_QUEUE_AGE_MS: u64 = 10_000;
/// Default consecutive healthy samples required before one slot recovers.
pub const DEFAULT_RECOVERY_STABLE_WINDOWS: u32 = 3;
/// Default lowest cap the governor will ever grant.
pub const DEFAULT_FLOOR: u32 = 1;

/// Execution mode a session runs under.
///
/// Ceilings differ per mode because a headed window costs more than a
/// headless one, and driving the debugger through the extension relay costs
/// more per session than a direct debugger socket.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ModeVariant {
    /// Visible window, extension-hosted relay.
    #[default]
    HeadedRelay,
    /// Headless browser, extension-hosted relay.
    HeadlessRelay,
    /// Visible window, direct debugger socket.
    HeadedDirect,
    /// Headless browser, direct debugger socket.
    HeadlessDirect,
}

impl ModeVariant {
    /// Every mode, for initializing per-mode governor states.
    pub const ALL: [Self; 4] = [
        Self::HeadedRelay,
        Self::HeadlessRelay,
        Self::HeadedDirect,
        Self::HeadlessDirect,
    ];
}

impl fmt::Display for ModeVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::HeadedRelay => "headedRelay",
            Self::HeadlessRelay => "headlessRelay",
            Self::HeadedDirect => "headedDirect",
            Self::HeadlessDirect => "headlessDirect",
        };
        f.write_str(s)
    }
}

/// Static concurrency ceiling per execution mode.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModeCaps {
    /// Ceiling for [`ModeVariant::HeadedRelay`] (default: 4).
    #[serde(default = "default_headed_relay")]
    pub headed_relay: u32,
    /// Ceiling for [`ModeVariant::HeadlessRelay`] (default: 6).
    #[serde(default = "default_headless_relay")]
    pub headless_relay: u32,
    /// Ceiling for [`ModeVariant::HeadedDirect`] (default: 6).
    #[serde(default = "default_headed_direct")]
    pub headed_direct: u32,
    /// Ceiling for [`ModeVariant::HeadlessDirect`] (default: 12).
    #[serde(default = "default_headless_direct")]
    pub headless_direct: u32,
}

fn default_headed_relay() -> u32 {
    4
}
fn default_headless_relay() -> u32 {
    6
}
fn default_headed_direct() -> u32 {
    6
}
fn default_headless_direct() -> u32 {
    12
}

impl Default for ModeCaps {
    fn default() -> Self {
        Self {
            headed_relay: default_headed_relay(),
            headless_relay: default_headless_relay(),
            headed_direct: default_headed_direct(),
            headless_direct: default_headless_direct(),
        }
    }
}

/// Thresholds and ceilings driving [`evaluate`](crate::evaluate).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GovernorPolicy {
    /// Free host memory % at or below which pressure is critical.
    #[serde(default = "default_critical_mem_pct")]
    pub critical_mem_pct: f64,
    /// Free host memory % at or below which pressure is high.
    #[serde(default = "default_high_mem_pct")]
    pub high_mem_pct: f64,
    /// Free host memory % at or below which pressure is medium.
    #[serde(default = "default_medium_mem_pct")]
    pub medium_mem_pct: f64,
    /// Process RSS % at or above which pressure is critical.
    #[serde(default = "default_critical_rss_pct")]
    pub critical_rss_pct: f64,
    /// Process RSS % at or above which pressure is high.
    #[serde(default = "default_high_rss_pct")]
    pub high_rss_pct: f64,
    /// Process RSS % at or above which pressure is medium.
    #[serde(default = "default_soft_rss_pct")]
    pub soft_rss_pct: f64,
    /// Queue age in ms at or above which pressure is critical.
    #[serde(default = "default_critical_queue_age_ms")]
    pub critical_queue_age_ms: u64,
    /// Queue age in ms at or above which pressure is high.
    #[serde(default = "default_high_queue_age_ms")]
    pub high_queue_age_ms: u64,
    /// Consecutive healthy samples required before one slot recovers.
    #[serde(default = "default_recovery_stable_windows")]
    pub recovery_stable_windows: u32,
    /// Lowest cap ever granted, even under critical pressure.
    #[serde(default = "default_floor")]
    pub floor: u32,
    /// Per-mode static ceilings.
    #[serde(default)]
    pub caps: ModeCaps,
}

fn default_critical_mem_pct() -> f64 {
    DEFAULT_CRITICAL_MEM_PCT
}
fn default_high_mem_pct() -> f64 {
    DEFAULT_HIGH_MEM_PCT
}
fn default_medium_mem_pct() -> f64 {
    DEFAULT_MEDIUM_MEM_PCT
}
fn default_critical_rss_pct() -> f64 {
    DEFAULT_CRITICAL_RSS_PCT
}
fn default_high_rss_pct() -> f64 {
    DEFAULT_HIGH_RSS_PCT
}
fn default_soft_rss_pct() -> f64 {
    DEFAULT_SOFT_RSS_PCT
}
fn default_critical_queue_age_ms() -> u64 {
    DEFAULT_CRITICAL_QUEUE_AGE_MS
}
fn default_high_queue_age_ms() -> u64 {
    DEFAULT_HIGH_QUEUE_AGE_MS
}
fn default_recovery_stable_windows() -> u32 {
    DEFAULT_RECOVERY_STABLE_WINDOWS
}
fn default_floor() -> u32 {
    DEFAULT_FLOOR
}

impl Default for GovernorPolicy {
    fn default() -> Self {
        Self {
            critical_mem_pct: DEFAULT_CRITICAL_MEM_PCT,
            high_mem_pct: DEFAULT_HIGH_MEM_PCT,
            medium_mem_pct: DEFAULT_MEDIUM_MEM_PCT,
            critical_rss_pct: DEFAULT_CRITICAL_RSS_PCT,
            high_rss_pct: DEFAULT_HIGH_RSS_PCT,
            soft_rss_pct: DEFAULT_SOFT_RSS_PCT,
            critical_queue_age_ms: DEFAULT_CRITICAL_QUEUE_AGE_MS,
            high_queue_age_ms: DEFAULT_HIGH_QUEUE_AGE_MS,
            recovery_stable_windows: DEFAULT_RECOVERY_STABLE_WINDOWS,
            floor: DEFAULT_FLOOR,
            caps: ModeCaps::default(),
        }
    }
}

impl GovernorPolicy {
    /// Static ceiling for the given mode.
    #[must_use]
    pub fn static_cap(&self, mode: ModeVariant) -> u32 {
        match mode {
            ModeVariant::HeadedRelay => self.caps.headed_relay,
            ModeVariant::HeadlessRelay => self.caps.headless_relay,
            ModeVariant::HeadedDirect => self.caps.headed_direct,
            ModeVariant::HeadlessDirect => self.caps.headless_direct,
        }
    }

    /// Floor clamped so it never exceeds the mode's static ceiling.
    #[must_use]
    pub fn floor_for(&self, mode: ModeVariant) -> u32 {
        self.floor.min(self.static_cap(mode))
    }
}
