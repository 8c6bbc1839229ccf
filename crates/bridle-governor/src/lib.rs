//! # bridle-governor
//!
//! Adaptive admission/parallelism governor. A pure evaluation step maps a
//! resource-pressure sample plus the prior state onto a new admission cap:
//!
//! - classification is threshold-based, most severe first
//!   (critical / high / medium / healthy)
//! - the effective cap shrinks immediately under pressure and recovers one
//!   slot at a time, gated on consecutive healthy windows, so borderline
//!   pressure cannot flap the cap
//! - malformed samples are clamped, never rejected
//!
//! No I/O and no clocks in here; the caller supplies `now` and owns the
//! sampling interval.

#![deny(unsafe_code)]

pub mod policy;
pub mod sample;
pub mod state;

pub use policy::{GovernorPolicy, ModeCaps, ModeVariant};
pub use sample::{PressureSample, QueueSnapshot};
pub use state::{GovernorState, PressureClass};

use chrono::{DateTime, Utc};

/// Everything one evaluation step produces.
#[derive(Clone, Debug)]
pub struct Evaluation {
    /// Successor state; feed it back as the prior on the next sample.
    pub state: GovernorState,
    /// Classification of this sample.
    pub pressure: PressureClass,
    /// Cap the policy asked for this window (the effective cap chases it).
    pub target_cap: u32,
    /// Normalized queue depth/age for the caller's own backpressure.
    pub queue: QueueSnapshot,
}

/// Clamp a percentage into `[0, 100]`; non-finite values collapse to 0.
fn clamp_pct(raw: f64) -> f64 {
    if raw.is_finite() {
        raw.clamp(0.0, 100.0)
    } else {
        0.0
    }
}

/// Clamp an age in ms to a non-negative integer; non-finite values collapse
/// to 0.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn clamp_age_ms(raw: f64) -> u64 {
    if raw.is_finite() && raw > 0.0 {
        raw.round() as u64
    } else {
        0
    }
}

/// Clamp a count to a non-negative `u32`.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn clamp_count(raw: i64) -> u32 {
    raw.clamp(0, i64::from(u32::MAX)) as u32
}

/// Classify one clamped sample against the policy thresholds.
fn classify(
    policy: &GovernorPolicy,
    free_mem_pct: f64,
    rss_pct: f64,
    queue_age_ms: u64,
    discarded: u32,
    frozen: u32,
) -> PressureClass {
    if free_mem_pct <= policy.critical_mem_pct
        || rss_pct >= policy.critical_rss_pct
        || queue_age_ms >= policy.critical_queue_age_ms
    {
        PressureClass::Critical
    } else if free_mem_pct <= policy.high_mem_pct
        || rss_pct >= policy.high_rss_pct
        || queue_age_ms >= policy.high_queue_age_ms
        || discarded > 0
    {
        PressureClass::High
    } else if free_mem_pct <= policy.medium_mem_pct || rss_pct >= policy.soft_rss_pct || frozen > 0
    {
        PressureClass::Medium
    } else {
        PressureClass::Healthy
    }
}

/// Run one evaluation step.
///
/// Pure: the prior state is not touched; the successor state comes back in
/// the [`Evaluation`]. The effective cap drops to the target immediately
/// (resetting the healthy-window counter) and recovers by exactly one slot
/// only after `recoveryStableWindows` consecutive healthy samples whose
/// target sits above the current effective cap.
#[must_use]
pub fn evaluate(
    policy: &GovernorPolicy,
    prior: &GovernorState,
    sample: &PressureSample,
    now: DateTime<Utc>,
) -> Evaluation {
    let free_mem_pct = clamp_pct(sample.host_free_mem_pct);
    let rss_pct = clamp_pct(sample.proc_rss_pct);
    let queue_age_ms = clamp_age_ms(sample.queue_age_ms);
    let queue_depth = clamp_count(sample.queue_depth);
    let discarded = clamp_count(sample.discarded_signals);
    let frozen = clamp_count(sample.frozen_signals);

    let pressure = classify(policy, free_mem_pct, rss_pct, queue_age_ms, discarded, frozen);

    let static_cap = prior.static_cap;
    let floor = policy.floor.min(static_cap);
    let target_cap = if pressure == PressureClass::Critical {
        floor
    } else {
        let penalty = pressure.penalty().saturating_add(discarded).saturating_add(frozen);
        static_cap.saturating_sub(penalty).clamp(floor, static_cap)
    };

    let mut state = prior.clone();
    if target_cap < prior.effective_cap {
        // Fast shrink, no hysteresis on the way down.
        state.effective_cap = target_cap;
        state.healthy_windows = 0;
    } else if target_cap > prior.effective_cap && pressure == PressureClass::Healthy {
        state.healthy_windows = prior.healthy_windows + 1;
        if state.healthy_windows >= policy.recovery_stable_windows {
            state.effective_cap = prior.effective_cap + 1;
            state.healthy_windows = 0;
        }
    } else {
        // No headroom, or headroom without health: the streak breaks.
        state.healthy_windows = 0;
    }
    state.last_sample_at = Some(now);
    state.last_pressure = Some(pressure);

    Evaluation {
        state,
        pressure,
        target_cap,
        queue: QueueSnapshot {
            depth: queue_depth,
            age_ms: queue_age_ms,
        },
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn policy() -> GovernorPolicy {
        GovernorPolicy::default()
    }

    fn fresh(mode: ModeVariant) -> GovernorState {
        GovernorState::new(mode, &policy())
    }

    fn eval(prior: &GovernorState, sample: &PressureSample) -> Evaluation {
        evaluate(&policy(), prior, sample, Utc::now())
    }

    // -- classification --

    #[test]
    fn healthy_when_all_clear() {
        let out = eval(&fresh(ModeVariant::HeadedRelay), &PressureSample::healthy());
        assert_eq!(out.pressure, PressureClass::Healthy);
        assert_eq!(out.target_cap, 4);
    }

    #[test]
    fn critical_on_low_free_memory() {
        let sample = PressureSample {
            host_free_mem_pct: 4.0,
            ..PressureSample::healthy()
        };
        let out = eval(&fresh(ModeVariant::HeadedRelay), &sample);
        assert_eq!(out.pressure, PressureClass::Critical);
        assert_eq!(out.state.effective_cap, 1);
    }

    #[test]
    fn critical_on_rss() {
        let sample = PressureSample {
            proc_rss_pct: 95.0,
            ..PressureSample::healthy()
        };
        let out = eval(&fresh(ModeVariant::HeadlessDirect), &sample);
        assert_eq!(out.pressure, PressureClass::Critical);
        assert_eq!(out.state.effective_cap, 1);
    }

    #[test]
    fn critical_on_queue_age() {
        let sample = PressureSample {
            queue_age_ms: 31_000.0,
            ..PressureSample::healthy()
        };
        let out = eval(&fresh(ModeVariant::HeadedRelay), &sample);
        assert_eq!(out.pressure, PressureClass::Critical);
    }

    #[test]
    fn high_on_discarded_signals() {
        let sample = PressureSample {
            discarded_signals: 1,
            ..PressureSample::healthy()
        };
        let out = eval(&fresh(ModeVariant::HeadedRelay), &sample);
        assert_eq!(out.pressure, PressureClass::High);
    }

    #[test]
    fn medium_on_frozen_signals() {
        let sample = PressureSample {
            frozen_signals: 1,
            ..PressureSample::healthy()
        };
        let out = eval(&fresh(ModeVariant::HeadedRelay), &sample);
        assert_eq!(out.pressure, PressureClass::Medium);
    }

    #[test]
    fn medium_on_soft_rss() {
        let sample = PressureSample {
            proc_rss_pct: 61.0,
            ..PressureSample::healthy()
        };
        let out = eval(&fresh(ModeVariant::HeadedRelay), &sample);
        assert_eq!(out.pressure, PressureClass::Medium);
    }

    #[test]
    fn severity_order_critical_wins() {
        // Inputs that trip medium, high, and critical at once classify critical.
        let sample = PressureSample {
            host_free_mem_pct: 1.0,
            proc_rss_pct: 70.0,
            frozen_signals: 2,
            ..PressureSample::healthy()
        };
        let out = eval(&fresh(ModeVariant::HeadedRelay), &sample);
        assert_eq!(out.pressure, PressureClass::Critical);
    }

    // -- malformed input clamping --

    #[test]
    fn nan_free_memory_degrades_to_critical() {
        let sample = PressureSample {
            host_free_mem_pct: f64::NAN,
            ..PressureSample::healthy()
        };
        let out = eval(&fresh(ModeVariant::HeadedRelay), &sample);
        assert_eq!(out.pressure, PressureClass::Critical);
    }

    #[test]
    fn infinite_rss_degrades_safely() {
        // Non-finite RSS clamps to 0, which by itself is permissive; the
        // evaluation must still complete without panicking.
        let sample = PressureSample {
            proc_rss_pct: f64::INFINITY,
            ..PressureSample::healthy()
        };
        let out = eval(&fresh(ModeVariant::HeadedRelay), &sample);
        assert_eq!(out.pressure, PressureClass::Healthy);
    }

    #[test]
    fn negative_counts_clamp_to_zero() {
        let sample = PressureSample {
            discarded_signals: -5,
            frozen_signals: -2,
            queue_depth: -10,
            queue_age_ms: -400.0,
            ..PressureSample::healthy()
        };
        let out = eval(&fresh(ModeVariant::HeadedRelay), &sample);
        assert_eq!(out.pressure, PressureClass::Healthy);
        assert_eq!(out.queue, QueueSnapshot { depth: 0, age_ms: 0 });
    }

    #[test]
    fn queue_snapshot_normalized() {
        let sample = PressureSample {
            queue_depth: 7,
            queue_age_ms: 1234.4,
            ..PressureSample::healthy()
        };
        let out = eval(&fresh(ModeVariant::HeadedRelay), &sample);
        assert_eq!(out.queue, QueueSnapshot { depth: 7, age_ms: 1234 });
    }

    // -- cap policy --

    #[test]
    fn medium_shrinks_by_one_plus_lifecycle() {
        let sample = PressureSample {
            frozen_signals: 1,
            ..PressureSample::healthy()
        };
        let out = eval(&fresh(ModeVariant::HeadlessDirect), &sample);
        // static 12, medium penalty 1, lifecycle penalty 1
        assert_eq!(out.target_cap, 10);
        assert_eq!(out.state.effective_cap, 10);
    }

    #[test]
    fn high_shrinks_by_two_plus_lifecycle() {
        let sample = PressureSample {
            discarded_signals: 2,
            ..PressureSample::healthy()
        };
        let out = eval(&fresh(ModeVariant::HeadlessDirect), &sample);
        // static 12, high penalty 2, lifecycle penalty 2
        assert_eq!(out.target_cap, 8);
    }

    #[test]
    fn penalties_never_pierce_floor() {
        let sample = PressureSample {
            discarded_signals: 100,
            ..PressureSample::healthy()
        };
        let out = eval(&fresh(ModeVariant::HeadedRelay), &sample);
        assert_eq!(out.target_cap, 1);
    }

    #[test]
    fn floor_above_ceiling_is_clamped() {
        let p = GovernorPolicy {
            floor: 50,
            ..GovernorPolicy::default()
        };
        let prior = GovernorState::new(ModeVariant::HeadedRelay, &p);
        let sample = PressureSample {
            host_free_mem_pct: 1.0,
            ..PressureSample::healthy()
        };
        let out = evaluate(&p, &prior, &sample, Utc::now());
        assert_eq!(out.target_cap, 4);
    }

    #[test]
    fn drop_is_immediate_and_resets_windows() {
        let mut prior = fresh(ModeVariant::HeadlessDirect);
        prior.healthy_windows = 2;
        let sample = PressureSample {
            proc_rss_pct: 76.0,
            ..PressureSample::healthy()
        };
        let out = eval(&prior, &sample);
        assert_eq!(out.state.effective_cap, 10);
        assert_eq!(out.state.healthy_windows, 0);
    }

    #[test]
    fn prior_state_is_untouched() {
        let prior = fresh(ModeVariant::HeadedRelay);
        let sample = PressureSample {
            host_free_mem_pct: 1.0,
            ..PressureSample::healthy()
        };
        let _ = eval(&prior, &sample);
        assert_eq!(prior.effective_cap, 4);
        assert!(prior.last_pressure.is_none());
    }

    // -- recovery hysteresis --

    fn degraded_state() -> GovernorState {
        // Drive a fresh headless-direct state down with one high sample.
        let out = eval(
            &fresh(ModeVariant::HeadlessDirect),
            &PressureSample {
                proc_rss_pct: 80.0,
                ..PressureSample::healthy()
            },
        );
        assert_eq!(out.state.effective_cap, 10);
        out.state
    }

    #[test]
    fn recovery_needs_exact_window_count() {
        let mut state = degraded_state();
        // recoveryStableWindows = 3: two healthy samples leave the cap alone.
        for _ in 0..2 {
            let out = eval(&state, &PressureSample::healthy());
            assert_eq!(out.state.effective_cap, 10);
            state = out.state;
        }
        // The third recovers exactly one slot and resets the counter.
        let out = eval(&state, &PressureSample::healthy());
        assert_eq!(out.state.effective_cap, 11);
        assert_eq!(out.state.healthy_windows, 0);
    }

    #[test]
    fn unhealthy_sample_breaks_the_streak() {
        let mut state = degraded_state();
        state = eval(&state, &PressureSample::healthy()).state;
        state = eval(&state, &PressureSample::healthy()).state;
        // A medium sample before the third window resets progress.
        state = eval(
            &state,
            &PressureSample {
                frozen_signals: 1,
                ..PressureSample::healthy()
            },
        )
        .state;
        assert_eq!(state.healthy_windows, 0);
        // Two more healthy windows still are not enough.
        state = eval(&state, &PressureSample::healthy()).state;
        state = eval(&state, &PressureSample::healthy()).state;
        assert_eq!(state.effective_cap, 10);
    }

    #[test]
    fn full_recovery_is_one_slot_per_window_set() {
        let mut state = degraded_state();
        // 12 - 10 = 2 slots to regain; each costs 3 healthy windows.
        for _ in 0..6 {
            state = eval(&state, &PressureSample::healthy()).state;
        }
        assert_eq!(state.effective_cap, 12);
        // At the ceiling, further healthy samples change nothing.
        let out = eval(&state, &PressureSample::healthy());
        assert_eq!(out.state.effective_cap, 12);
        assert_eq!(out.state.healthy_windows, 0);
    }

    #[test]
    fn recovery_never_skips_slots() {
        let mut state = degraded_state();
        let mut previous = state.effective_cap;
        for _ in 0..20 {
            state = eval(&state, &PressureSample::healthy()).state;
            assert!(state.effective_cap <= previous + 1);
            previous = state.effective_cap;
        }
    }

    #[test]
    fn state_records_sample_metadata() {
        let now = Utc::now();
        let out = evaluate(
            &policy(),
            &fresh(ModeVariant::HeadedRelay),
            &PressureSample::healthy(),
            now,
        );
        assert_eq!(out.state.last_sample_at, Some(now));
        assert_eq!(out.state.last_pressure, Some(PressureClass::Healthy));
    }

    // -- property-based invariants --

    fn arb_sample() -> impl Strategy<Value = PressureSample> {
        (
            prop_oneof![any::<f64>(), 0.0..100.0f64],
            prop_oneof![any::<f64>(), 0.0..100.0f64],
            any::<i64>(),
            prop_oneof![any::<f64>(), 0.0..60_000.0f64],
            -10i64..10,
            -10i64..10,
        )
            .prop_map(
                |(mem, rss, depth, age, discarded, frozen)| PressureSample {
                    host_free_mem_pct: mem,
                    proc_rss_pct: rss,
                    queue_depth: depth,
                    queue_age_ms: age,
                    discarded_signals: discarded,
                    frozen_signals: frozen,
                },
            )
    }

    proptest! {
        #[test]
        fn critical_free_memory_always_floors(
            mem in 0.0f64..5.0,
            rss in 0.0f64..100.0,
            depth in any::<i64>(),
            age in 0.0f64..100_000.0,
        ) {
            let sample = PressureSample {
                host_free_mem_pct: mem,
                proc_rss_pct: rss,
                queue_depth: depth,
                queue_age_ms: age,
                discarded_signals: 0,
                frozen_signals: 0,
            };
            let out = eval(&fresh(ModeVariant::HeadlessDirect), &sample);
            prop_assert_eq!(out.pressure, PressureClass::Critical);
            prop_assert_eq!(out.state.effective_cap, 1);
        }

        #[test]
        fn effective_cap_bounded_by_target(samples in prop::collection::vec(arb_sample(), 1..40)) {
            let mut state = fresh(ModeVariant::HeadlessDirect);
            for sample in &samples {
                let out = eval(&state, sample);
                prop_assert!(out.state.effective_cap <= out.target_cap);
                prop_assert!(out.state.effective_cap <= out.state.static_cap);
                state = out.state;
            }
        }

        #[test]
        fn effective_cap_rises_at_most_one(samples in prop::collection::vec(arb_sample(), 1..40)) {
            let mut state = fresh(ModeVariant::HeadlessDirect);
            for sample in &samples {
                let before = state.effective_cap;
                let out = eval(&state, sample);
                prop_assert!(out.state.effective_cap <= before + 1);
                state = out.state;
            }
        }

        #[test]
        fn evaluation_never_panics_on_garbage(sample in arb_sample()) {
            let _ = eval(&fresh(ModeVariant::HeadedRelay), &sample);
        }
    }
}
