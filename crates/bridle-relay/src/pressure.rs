//! Resource sampling and the background maintenance loop.
//!
//! A sampler task periodically reads host/process memory, folds in queue
//! pressure from the registry, and feeds the combined sample to the
//! per-mode governors. The same loop runs the idle-session sweep.

use std::sync::Arc;
use std::time::Duration;

use bridle_governor::{ModeVariant, PressureClass, PressureSample};
use bridle_registry::SessionRegistry;
use chrono::Utc;
use metrics::{counter, gauge};
use parking_lot::Mutex;
use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broadcast::ConnectionRegistry;
use crate::metrics::{
    GOVERNOR_EFFECTIVE_CAP, GOVERNOR_PRESSURE_CLASS, SESSIONS_ACTIVE, SESSIONS_EXPIRED_TOTAL,
};
use crate::runtime::SessionDrivers;

/// Source of host and process memory readings.
pub trait MemoryProbe: Send + Sync {
    /// Free host memory as a percentage of total.
    fn host_free_mem_pct(&self) -> f64;
    /// Process resident-set size as a percentage of total host memory.
    fn proc_rss_pct(&self) -> f64;
}

/// Probe backed by `/proc`. Readings fall back to healthy values when a
/// file is unreadable, so a sandboxed environment does not throttle itself.
#[derive(Debug, Default)]
pub struct ProcMemoryProbe;

// statm reports pages; Linux x86-64/aarch64 default.
const PAGE_SIZE_BYTES: u64 = 4096;

impl ProcMemoryProbe {
    fn meminfo_kb() -> Option<(u64, u64)> {
        let text = std::fs::read_to_string("/proc/meminfo").ok()?;
        parse_meminfo(&text)
    }
}

impl MemoryProbe for ProcMemoryProbe {
    fn host_free_mem_pct(&self) -> f64 {
        match Self::meminfo_kb() {
            Some((total, available)) if total > 0 => {
                (available as f64 / total as f64) * 100.0
            }
            _ => PressureSample::healthy().host_free_mem_pct,
        }
    }

    fn proc_rss_pct(&self) -> f64 {
        let total_kb = match Self::meminfo_kb() {
            Some((total, _)) if total > 0 => total,
            _ => return PressureSample::healthy().proc_rss_pct,
        };
        let rss_bytes = std::fs::read_to_string("/proc/self/statm")
            .ok()
            .and_then(|text| parse_statm(&text, PAGE_SIZE_BYTES));
        match rss_bytes {
            Some(rss) => (rss as f64 / (total_kb as f64 * 1024.0)) * 100.0,
            None => PressureSample::healthy().proc_rss_pct,
        }
    }
}

/// Extract `(MemTotal, MemAvailable)` in kB from `/proc/meminfo` text.
fn parse_meminfo(text: &str) -> Option<(u64, u64)> {
    let mut total = None;
    let mut available = None;
    for line in text.lines() {
        let mut parts = line.split_whitespace();
        match parts.next() {
            Some("MemTotal:") => total = parts.next().and_then(|v| v.parse().ok()),
            Some("MemAvailable:") => available = parts.next().and_then(|v| v.parse().ok()),
            _ => {}
        }
    }
    Some((total?, available?))
}

/// Extract resident-set bytes from `/proc/self/statm` text (second field,
/// in pages).
fn parse_statm(text: &str, page_size: u64) -> Option<u64> {
    let rss_pages: u64 = text.split_whitespace().nth(1)?.parse().ok()?;
    Some(rss_pages * page_size)
}

/// Probe with fixed, settable readings. Lets tests drive the governor into
/// a chosen pressure class without touching real memory.
#[derive(Debug)]
pub struct StaticMemoryProbe {
    free_pct: Mutex<f64>,
    rss_pct: Mutex<f64>,
}

impl StaticMemoryProbe {
    #[must_use]
    pub fn new(free_pct: f64, rss_pct: f64) -> Self {
        Self {
            free_pct: Mutex::new(free_pct),
            rss_pct: Mutex::new(rss_pct),
        }
    }

    pub fn set_free_pct(&self, pct: f64) {
        *self.free_pct.lock() = pct;
    }

    pub fn set_rss_pct(&self, pct: f64) {
        *self.rss_pct.lock() = pct;
    }
}

impl MemoryProbe for StaticMemoryProbe {
    fn host_free_mem_pct(&self) -> f64 {
        *self.free_pct.lock()
    }

    fn proc_rss_pct(&self) -> f64 {
        *self.rss_pct.lock()
    }
}

fn pressure_rank(class: PressureClass) -> f64 {
    match class {
        PressureClass::Healthy => 0.0,
        PressureClass::Medium => 1.0,
        PressureClass::High => 2.0,
        PressureClass::Critical => 3.0,
    }
}

/// Run one sampling step: probe, evaluate, publish gauges.
pub fn sample_once(registry: &SessionRegistry, probe: &dyn MemoryProbe) {
    let (queue_depth, queue_age_ms) = registry.queue_pressure();
    let sample = PressureSample {
        host_free_mem_pct: probe.host_free_mem_pct(),
        proc_rss_pct: probe.proc_rss_pct(),
        queue_depth,
        queue_age_ms,
        discarded_signals: 0,
        frozen_signals: 0,
    };
    let evaluations = registry.apply_sample(&sample, Utc::now());
    for (mode, evaluation) in &evaluations {
        gauge!(GOVERNOR_EFFECTIVE_CAP, "mode" => mode.to_string())
            .set(f64::from(evaluation.state.effective_cap));
        gauge!(GOVERNOR_PRESSURE_CLASS, "mode" => mode.to_string())
            .set(pressure_rank(evaluation.pressure));
        if evaluation.pressure != PressureClass::Healthy {
            warn!(
                mode = %mode,
                pressure = ?evaluation.pressure,
                effective_cap = evaluation.state.effective_cap,
                "resource pressure detected"
            );
        }
    }
    debug!(
        host_free_mem_pct = sample.host_free_mem_pct,
        proc_rss_pct = sample.proc_rss_pct,
        queue_depth = sample.queue_depth,
        "pressure sample applied"
    );
}

/// Sweep idle sessions past their TTL: tear down the runtime, notify the
/// owner, then drop the registry entry's bookkeeping.
pub async fn sweep_idle(
    registry: &SessionRegistry,
    drivers: &SessionDrivers,
    connections: &ConnectionRegistry,
    ttl: Duration,
) {
    let expired = registry.expire_idle(ttl);
    for session in expired {
        info!(ops_session_id = %session.id, "session expired idle");
        let _ = drivers.stop(&session.id).await;
        connections.push_event(
            &session.owner_client_id,
            "ops_session_expired",
            Some(json!({ "opsSessionId": session.id, "reason": "idle" })),
            Some(session.id.clone()),
        );
        counter!(SESSIONS_EXPIRED_TOTAL).increment(1);
    }
    gauge!(SESSIONS_ACTIVE).set(registry.session_count() as f64);
}

/// Spawn the combined sampler/sweeper task. Stops when cancelled.
pub fn spawn_sampler(
    registry: Arc<SessionRegistry>,
    drivers: Arc<SessionDrivers>,
    connections: Arc<ConnectionRegistry>,
    probe: Arc<dyn MemoryProbe>,
    sample_interval: Duration,
    idle_ttl: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(sample_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    sample_once(&registry, probe.as_ref());
                    sweep_idle(&registry, &drivers, &connections, idle_ttl).await;
                }
                () = cancel.cancelled() => break,
            }
        }
    })
}

// Seed each mode's governor so the first status read and the first sample
// report caps for every variant, not just modes already in use.
pub fn seed_governors(registry: &SessionRegistry) {
    for mode in ModeVariant::ALL {
        gauge!(GOVERNOR_EFFECTIVE_CAP, "mode" => mode.to_string())
            .set(f64::from(registry.effective_cap(mode)));
    }
}
