//! The session registry: admission, lookup, governor bookkeeping, expiry.

use bridle_core::{ClientId, LeaseId, OpsSessionId, TabId};
use bridle_governor::{
    Evaluation, GovernorPolicy, GovernorState, ModeVariant, PressureSample, evaluate,
};
use bridle_ops::{OpsErrorBody, codes};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::recently::RecentlyClosed;
use crate::session::{OpsSession, SessionState};

/// Default retained recently-closed records.
pub const DEFAULT_RECENTLY_CLOSED_CAPACITY: usize = 128;
/// Default per-buffer console/network ring capacity.
pub const DEFAULT_RING_CAPACITY: usize = 256;

/// Registry-level failures, each mapping to a wire error code.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Admission refused: the mode is at its effective cap.
    #[error("admission rejected for {mode}: {active} active at cap {cap}")]
    AdmissionRejected {
        /// Mode that was refused.
        mode: ModeVariant,
        /// Sessions currently active in that mode.
        active: usize,
        /// Effective cap at refusal time.
        cap: u32,
    },

    /// No live session and no recently-closed record.
    #[error("session {0} not found")]
    NotFound(OpsSessionId),

    /// The session closed recently; a definitive answer for late races.
    #[error("session {0} is closed")]
    Closed(OpsSessionId),

    /// The session was opened under a lease and this request carries none.
    #[error("session {0} requires a lease")]
    LeaseRequired(OpsSessionId),
}

impl RegistryError {
    /// Wire error code for this failure.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::AdmissionRejected { .. } => codes::MAX_SESSIONS_REACHED,
            Self::NotFound(_) => codes::SESSION_NOT_FOUND,
            Self::Closed(_) => codes::SESSION_CLOSED,
            Self::LeaseRequired(_) => codes::LEASE_REQUIRED,
        }
    }

    /// Admission rejections are retryable once pressure eases; the rest are
    /// definitive.
    #[must_use]
    pub fn retryable(&self) -> bool {
        matches!(self, Self::AdmissionRejected { .. })
    }

    /// Convert into the wire error body.
    #[must_use]
    pub fn to_error_body(&self) -> OpsErrorBody {
        let details = match self {
            Self::AdmissionRejected { mode, active, cap } => Some(json!({
                "mode": mode,
                "activeSessions": active,
                "effectiveCap": cap,
            })),
            _ => None,
        };
        OpsErrorBody {
            code: self.code().to_owned(),
            message: self.to_string(),
            retryable: self.retryable(),
            details,
        }
    }
}

/// Process-wide session registry.
///
/// Constructed once with an injected lifetime and torn down explicitly; no
/// ambient singletons, so tests build isolated instances.
pub struct SessionRegistry {
    policy: GovernorPolicy,
    sessions: DashMap<OpsSessionId, Arc<OpsSession>>,
    governors: Mutex<HashMap<ModeVariant, GovernorState>>,
    // Serializes cap-check-plus-insert so concurrent opens cannot both
    // pass the check at cap - 1.
    admission: Mutex<()>,
    recently_closed: RecentlyClosed,
    ring_capacity: usize,
}

impl SessionRegistry {
    /// A registry with per-mode governor states at their static ceilings.
    #[must_use]
    pub fn new(policy: GovernorPolicy) -> Self {
        let governors = ModeVariant::ALL
            .iter()
            .map(|&mode| (mode, GovernorState::new(mode, &policy)))
            .collect();
        Self {
            policy,
            sessions: DashMap::new(),
            governors: Mutex::new(governors),
            admission: Mutex::new(()),
            recently_closed: RecentlyClosed::new(DEFAULT_RECENTLY_CLOSED_CAPACITY),
            ring_capacity: DEFAULT_RING_CAPACITY,
        }
    }

    /// Open a session, gated by the mode's effective cap.
    pub fn open_session(
        &self,
        owner: ClientId,
        lease: Option<LeaseId>,
        mode: ModeVariant,
        primary_tab: TabId,
    ) -> Result<Arc<OpsSession>, RegistryError> {
        let _admission = self.admission.lock();
        let cap = self.effective_cap(mode);
        let active = self.active_count(mode);
        if active >= cap as usize {
            return Err(RegistryError::AdmissionRejected { mode, active, cap });
        }

        let session = Arc::new(OpsSession::new(
            owner,
            lease,
            mode,
            primary_tab,
            self.ring_capacity,
        ));
        info!(ops_session_id = %session.id, %mode, active = active + 1, "session opened");
        let _ = self.sessions.insert(session.id.clone(), Arc::clone(&session));
        Ok(session)
    }

    /// Look a live session up; recently-closed ids answer with
    /// [`RegistryError::Closed`] instead of not-found.
    pub fn get(&self, id: &OpsSessionId) -> Result<Arc<OpsSession>, RegistryError> {
        if let Some(session) = self.sessions.get(id) {
            return Ok(Arc::clone(&session));
        }
        if self.recently_closed.contains(id) {
            return Err(RegistryError::Closed(id.clone()));
        }
        Err(RegistryError::NotFound(id.clone()))
    }

    /// Lease gate for a session-scoped request.
    pub fn authorize(
        &self,
        session: &OpsSession,
        lease: Option<&LeaseId>,
    ) -> Result<(), RegistryError> {
        if session.authorize(lease) {
            Ok(())
        } else {
            Err(RegistryError::LeaseRequired(session.id.clone()))
        }
    }

    /// Close a session, retaining a recently-closed record. Closing an
    /// already-closed session reports [`RegistryError::Closed`].
    pub fn close_session(&self, id: &OpsSessionId) -> Result<Arc<OpsSession>, RegistryError> {
        let Some((_, session)) = self.sessions.remove(id) else {
            if self.recently_closed.contains(id) {
                return Err(RegistryError::Closed(id.clone()));
            }
            return Err(RegistryError::NotFound(id.clone()));
        };
        let _ = session.begin_close();
        self.recently_closed.record(id.clone(), Utc::now());
        info!(ops_session_id = %id, "session closed");
        Ok(session)
    }

    /// Close every session idle past `ttl`, returning the expired sessions.
    pub fn expire_idle(&self, ttl: Duration) -> Vec<Arc<OpsSession>> {
        let doomed: Vec<OpsSessionId> = self
            .sessions
            .iter()
            .filter(|entry| {
                entry.value().state() == SessionState::Active && entry.value().idle_for() >= ttl
            })
            .map(|entry| entry.key().clone())
            .collect();

        let mut expired = Vec::with_capacity(doomed.len());
        for id in doomed {
            if let Ok(session) = self.close_session(&id) {
                debug!(ops_session_id = %id, "session expired idle");
                expired.push(session);
            }
        }
        expired
    }

    /// Run one governor evaluation for every mode against a shared sample.
    /// Returns each mode's evaluation for metrics/backpressure.
    pub fn apply_sample(
        &self,
        sample: &PressureSample,
        now: DateTime<Utc>,
    ) -> HashMap<ModeVariant, Evaluation> {
        let mut governors = self.governors.lock();
        let mut evaluations = HashMap::with_capacity(governors.len());
        for (&mode, state) in governors.iter_mut() {
            let evaluation = evaluate(&self.policy, state, sample, now);
            *state = evaluation.state.clone();
            let _ = evaluations.insert(mode, evaluation);
        }
        evaluations
    }

    /// Current governor state for a mode.
    #[must_use]
    pub fn governor_state(&self, mode: ModeVariant) -> GovernorState {
        self.governors
            .lock()
            .get(&mode)
            .cloned()
            .unwrap_or_else(|| GovernorState::new(mode, &self.policy))
    }

    /// Current effective cap for a mode.
    #[must_use]
    pub fn effective_cap(&self, mode: ModeVariant) -> u32 {
        self.governor_state(mode).effective_cap
    }

    /// Live sessions in one mode.
    #[must_use]
    pub fn active_count(&self, mode: ModeVariant) -> usize {
        self.sessions
            .iter()
            .filter(|entry| entry.value().mode == mode)
            .count()
    }

    /// All live sessions.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Snapshot of every live session, for sweeps and shutdown.
    #[must_use]
    pub fn sessions(&self) -> Vec<Arc<OpsSession>> {
        self.sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Aggregate queue pressure across all sessions: total waiting depth
    /// and the oldest wait anywhere. Feeds the governor's own sample.
    #[must_use]
    pub fn queue_pressure(&self) -> (i64, f64) {
        let mut depth: i64 = 0;
        let mut oldest_ms: u64 = 0;
        for entry in &self.sessions {
            let snapshot = entry.value().gates.snapshot();
            depth += i64::from(snapshot.depth);
            oldest_ms = oldest_ms.max(snapshot.age_ms);
        }
        #[allow(clippy::cast_precision_loss)]
        (depth, oldest_ms as f64)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn registry() -> SessionRegistry {
        SessionRegistry::new(GovernorPolicy::default())
    }

    fn open(registry: &SessionRegistry, mode: ModeVariant) -> Arc<OpsSession> {
        registry
            .open_session(ClientId::from("client-1"), None, mode, TabId::new(7))
            .expect("admission")
    }

    #[test]
    fn admission_stops_at_the_static_cap() {
        let reg = registry();
        // HeadedRelay ceiling is 4.
        for _ in 0..4 {
            let _ = open(&reg, ModeVariant::HeadedRelay);
        }
        let err = reg
            .open_session(
                ClientId::from("client-1"),
                None,
                ModeVariant::HeadedRelay,
                TabId::new(7),
            )
            .unwrap_err();
        assert_matches!(err, RegistryError::AdmissionRejected { active: 4, cap: 4, .. });
        assert!(err.retryable());
        assert_eq!(err.code(), codes::MAX_SESSIONS_REACHED);

        // Other modes are unaffected.
        let _ = open(&reg, ModeVariant::HeadlessDirect);
    }

    #[test]
    fn concurrent_opens_never_exceed_the_cap() {
        let reg = Arc::new(registry());
        let mut handles = Vec::new();
        // HeadedRelay ceiling is 4; race four times as many opens at it.
        for i in 0..16 {
            let reg = Arc::clone(&reg);
            handles.push(std::thread::spawn(move || {
                reg.open_session(
                    ClientId::from(format!("client-{i}").as_str()),
                    None,
                    ModeVariant::HeadedRelay,
                    TabId::new(7),
                )
                .is_ok()
            }));
        }
        let admitted = handles
            .into_iter()
            .map(|handle| handle.join().expect("opener thread"))
            .filter(|ok| *ok)
            .count();
        assert_eq!(admitted, 4);
        assert_eq!(reg.active_count(ModeVariant::HeadedRelay), 4);
    }

    #[test]
    fn critical_pressure_shrinks_admission_to_the_floor() {
        let reg = registry();
        let sample = PressureSample {
            host_free_mem_pct: 1.0,
            ..PressureSample::healthy()
        };
        let evaluations = reg.apply_sample(&sample, Utc::now());
        assert_eq!(evaluations.len(), 4);
        assert_eq!(reg.effective_cap(ModeVariant::HeadedRelay), 1);

        let _ = open(&reg, ModeVariant::HeadedRelay);
        let err = reg
            .open_session(
                ClientId::from("client-2"),
                None,
                ModeVariant::HeadedRelay,
                TabId::new(8),
            )
            .unwrap_err();
        assert_matches!(err, RegistryError::AdmissionRejected { cap: 1, .. });
    }

    #[test]
    fn closed_sessions_answer_late_races_distinctly() {
        let reg = registry();
        let session = open(&reg, ModeVariant::HeadedRelay);
        let id = session.id.clone();

        let _ = reg.close_session(&id).unwrap();
        assert_matches!(reg.get(&id), Err(RegistryError::Closed(_)));
        assert_matches!(reg.close_session(&id), Err(RegistryError::Closed(_)));
        assert_matches!(
            reg.get(&OpsSessionId::from("never-existed")),
            Err(RegistryError::NotFound(_))
        );
    }

    #[test]
    fn lease_gate() {
        let reg = registry();
        let leased = reg
            .open_session(
                ClientId::from("client-1"),
                Some(LeaseId::from("l-1")),
                ModeVariant::HeadedRelay,
                TabId::new(7),
            )
            .unwrap();

        let err = reg.authorize(&leased, None).unwrap_err();
        assert_eq!(err.code(), codes::LEASE_REQUIRED);
        assert!(reg.authorize(&leased, Some(&LeaseId::from("l-1"))).is_ok());
    }

    #[test]
    fn idle_expiry_closes_only_stale_sessions() {
        let reg = registry();
        let stale = open(&reg, ModeVariant::HeadedRelay);
        let fresh = open(&reg, ModeVariant::HeadedRelay);

        std::thread::sleep(Duration::from_millis(30));
        fresh.touch();

        let expired = reg.expire_idle(Duration::from_millis(20));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, stale.id);
        assert_matches!(reg.get(&stale.id), Err(RegistryError::Closed(_)));
        assert!(reg.get(&fresh.id).is_ok());
    }

    #[test]
    fn recovery_restores_admission_after_stable_windows() {
        let reg = registry();
        let critical = PressureSample {
            host_free_mem_pct: 1.0,
            ..PressureSample::healthy()
        };
        let _ = reg.apply_sample(&critical, Utc::now());
        assert_eq!(reg.effective_cap(ModeVariant::HeadlessDirect), 1);

        let healthy = PressureSample::healthy();
        let windows = GovernorPolicy::default().recovery_stable_windows;
        for _ in 0..windows {
            let _ = reg.apply_sample(&healthy, Utc::now());
        }
        // One slot of recovery after the stable run.
        assert_eq!(reg.effective_cap(ModeVariant::HeadlessDirect), 2);
    }
}
