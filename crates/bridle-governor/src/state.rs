//! Governor state and the pressure classification it tracks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::policy::{GovernorPolicy, ModeVariant};

/// Pressure classification, ordered most severe first.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PressureClass {
    /// Cap is forced to the floor.
    Critical,
    /// Cap shrinks by two slots plus lifecycle penalties.
    High,
    /// Cap shrinks by one slot plus lifecycle penalties.
    Medium,
    /// No penalty; recovery windows accrue.
    Healthy,
}

impl PressureClass {
    /// Fixed penalty applied to the static cap for non-critical classes.
    ///
    /// Critical has no finite penalty; callers short-circuit it to the floor.
    #[must_use]
    pub fn penalty(self) -> u32 {
        match self {
            Self::Critical => u32::MAX,
            Self::High => 2,
            Self::Medium => 1,
            Self::Healthy => 0,
        }
    }
}

impl fmt::Display for PressureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Medium => "medium",
            Self::Healthy => "healthy",
        };
        f.write_str(s)
    }
}

/// Admission state for one execution mode.
///
/// Mutated only by [`evaluate`](crate::evaluate); callers read it and pass
/// it back as the prior state for the next sample.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GovernorState {
    /// Execution mode this state governs.
    pub mode_variant: ModeVariant,
    /// Per-mode ceiling the cap can never exceed.
    pub static_cap: u32,
    /// Current admission limit.
    pub effective_cap: u32,
    /// Consecutive healthy samples with recovery headroom.
    pub healthy_windows: u32,
    /// When the last sample was evaluated.
    pub last_sample_at: Option<DateTime<Utc>>,
    /// Classification of the last sample.
    pub last_pressure: Option<PressureClass>,
}

impl GovernorState {
    /// Fresh state for a mode: effective cap starts at the static ceiling.
    #[must_use]
    pub fn new(mode: ModeVariant, policy: &GovernorPolicy) -> Self {
        let static_cap = policy.static_cap(mode);
        Self {
            mode_variant: mode,
            static_cap,
            effective_cap: static_cap,
            healthy_windows: 0,
            last_sample_at: None,
            last_pressure: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_state_starts_at_ceiling() {
        let policy = GovernorPolicy::default();
        let state = GovernorState::new(ModeVariant::HeadlessDirect, &policy);
        assert_eq!(state.static_cap, 12);
        assert_eq!(state.effective_cap, 12);
        assert_eq!(state.healthy_windows, 0);
        assert!(state.last_sample_at.is_none());
        assert!(state.last_pressure.is_none());
    }

    #[test]
    fn pressure_class_penalties() {
        assert_eq!(PressureClass::Healthy.penalty(), 0);
        assert_eq!(PressureClass::Medium.penalty(), 1);
        assert_eq!(PressureClass::High.penalty(), 2);
        assert_eq!(PressureClass::Critical.penalty(), u32::MAX);
    }

    #[test]
    fn pressure_class_serde_lowercase() {
        assert_eq!(
            serde_json::to_string(&PressureClass::Critical).unwrap(),
            "\"critical\""
        );
        let back: PressureClass = serde_json::from_str("\"healthy\"").unwrap();
        assert_eq!(back, PressureClass::Healthy);
    }

    #[test]
    fn pressure_class_display() {
        assert_eq!(PressureClass::High.to_string(), "high");
        assert_eq!(PressureClass::Medium.to_string(), "medium");
    }

    #[test]
    fn state_serde_camel_case() {
        let policy = GovernorPolicy::default();
        let state = GovernorState::new(ModeVariant::HeadedRelay, &policy);
        let json = serde_json::to_string(&state).unwrap();
        assert!(json.contains("modeVariant"));
        assert!(json.contains("effectiveCap"));
        assert!(json.contains("healthyWindows"));
    }
}
