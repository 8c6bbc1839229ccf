//! Pressure samples fed into the governor and the normalized queue snapshot
//! it returns.

use serde::{Deserialize, Serialize};

/// One resource-pressure observation.
///
/// Produced by whatever component owns admission (the relay's sampler).
/// Fields arrive raw and untrusted: percentages may be non-finite, counts
/// may be negative. [`evaluate`](crate::evaluate) clamps everything before
/// comparing, so a malformed sample degrades toward the conservative
/// classification instead of failing.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PressureSample {
    /// Free host memory as a percentage of total.
    pub host_free_mem_pct: f64,
    /// Process resident-set size as a percentage of total host memory.
    pub proc_rss_pct: f64,
    /// Commands currently waiting in per-target queues.
    pub queue_depth: i64,
    /// Age of the oldest queued command in milliseconds.
    pub queue_age_ms: f64,
    /// Signals discarded since the previous sample.
    pub discarded_signals: i64,
    /// Signals observed stalled ("frozen") since the previous sample.
    pub frozen_signals: i64,
}

impl PressureSample {
    /// A fully healthy sample (plenty of memory, idle queues).
    #[must_use]
    pub fn healthy() -> Self {
        Self {
            host_free_mem_pct: 50.0,
            proc_rss_pct: 10.0,
            queue_depth: 0,
            queue_age_ms: 0.0,
            discarded_signals: 0,
            frozen_signals: 0,
        }
    }
}

/// Queue state normalized by the evaluation step.
///
/// Returned alongside the cap so the admission owner can apply its own
/// backpressure (queuing is itself one of the pressure signals).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueSnapshot {
    /// Waiting commands, clamped non-negative.
    pub depth: u32,
    /// Age of the oldest waiting command in ms, clamped non-negative.
    pub age_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_sample_is_all_zero() {
        let sample = PressureSample::default();
        assert!((sample.host_free_mem_pct - 0.0).abs() < f64::EPSILON);
        assert_eq!(sample.queue_depth, 0);
    }

    #[test]
    fn healthy_sample_has_headroom() {
        let sample = PressureSample::healthy();
        assert!(sample.host_free_mem_pct > 20.0);
        assert_eq!(sample.discarded_signals, 0);
    }

    #[test]
    fn sample_serde_partial() {
        let sample: PressureSample =
            serde_json::from_str(r#"{"hostFreeMemPct": 42.5, "queueDepth": 3}"#).unwrap();
        assert!((sample.host_free_mem_pct - 42.5).abs() < f64::EPSILON);
        assert_eq!(sample.queue_depth, 3);
        assert_eq!(sample.frozen_signals, 0);
    }

    #[test]
    fn snapshot_serde_camel_case() {
        let snap = QueueSnapshot {
            depth: 2,
            age_ms: 1500,
        };
        let json = serde_json::to_string(&snap).unwrap();
        assert_eq!(json, r#"{"depth":2,"ageMs":1500}"#);
    }
}
