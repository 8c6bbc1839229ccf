//! Per-session state: targets, refs, capture buffers, command gates.

use bridle_core::{ClientId, LeaseId, OpsSessionId, TabId, TargetId};
use bridle_governor::ModeVariant;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::queue::TargetGates;
use crate::refs::InMemoryRefStore;
use crate::ring::{ConsoleEntry, NetworkEntry, RingBuffer, SeqEntry};

/// Lifecycle state of one session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// Accepting commands.
    Active,
    /// Teardown has begun; new commands are refused.
    Closing,
}

#[derive(Debug, Default)]
struct TargetRoster {
    tabs: HashMap<TargetId, TabId>,
    name_to_id: HashMap<String, TargetId>,
    id_to_name: HashMap<TargetId, String>,
    active: Option<TargetId>,
}

/// One automation session bound to a client.
///
/// Invariant: `active_target` is always a key of the target table while any
/// target exists, and is cleared only when the table empties.
pub struct OpsSession {
    /// Session id handed to the client.
    pub id: OpsSessionId,
    /// Client that opened the session.
    pub owner_client_id: ClientId,
    /// Lease the session was opened under, if any. When present, every
    /// session-scoped request must carry one.
    pub lease_id: Option<LeaseId>,
    /// Execution mode (governs admission ceilings).
    pub mode: ModeVariant,
    /// Tab the session's router attaches to first.
    pub primary_tab: TabId,
    /// Element refs captured for this session's targets.
    pub refs: InMemoryRefStore,
    /// Per-target FIFO command gates.
    pub gates: TargetGates,

    state: Mutex<SessionState>,
    roster: RwLock<TargetRoster>,
    console: Mutex<RingBuffer<ConsoleEntry>>,
    network: Mutex<RingBuffer<NetworkEntry>>,
    created_at: DateTime<Utc>,
    last_activity: Mutex<Instant>,
}

impl std::fmt::Debug for OpsSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpsSession")
            .field("id", &self.id)
            .field("owner_client_id", &self.owner_client_id)
            .finish_non_exhaustive()
    }
}

impl OpsSession {
    /// A fresh active session with empty state.
    #[must_use]
    pub fn new(
        owner_client_id: ClientId,
        lease_id: Option<LeaseId>,
        mode: ModeVariant,
        primary_tab: TabId,
        ring_capacity: usize,
    ) -> Self {
        Self {
            id: OpsSessionId::new(),
            owner_client_id,
            lease_id,
            mode,
            primary_tab,
            refs: InMemoryRefStore::new(),
            gates: TargetGates::new(),
            state: Mutex::new(SessionState::Active),
            roster: RwLock::new(TargetRoster::default()),
            console: Mutex::new(RingBuffer::new(ring_capacity)),
            network: Mutex::new(RingBuffer::new(ring_capacity)),
            created_at: Utc::now(),
            last_activity: Mutex::new(Instant::now()),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    /// Move to closing. Returns false when already closing.
    pub fn begin_close(&self) -> bool {
        let mut state = self.state.lock();
        if *state == SessionState::Closing {
            return false;
        }
        *state = SessionState::Closing;
        true
    }

    /// Whether a session-scoped request with this lease may proceed. The
    /// lease value is opaque; only presence is checked here — validation
    /// belongs to the external daemon.
    #[must_use]
    pub fn authorize(&self, lease: Option<&LeaseId>) -> bool {
        self.lease_id.is_none() || lease.is_some()
    }

    /// Record activity, deferring idle expiry.
    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    /// Time since the last recorded activity.
    #[must_use]
    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    // ── Target roster ────────────────────────────────────────────────────

    /// Register a target, optionally under a name. The first registered
    /// target becomes active.
    pub fn register_target(&self, target_id: TargetId, tab_id: TabId, name: Option<&str>) {
        let mut roster = self.roster.write();
        let _ = roster.tabs.insert(target_id.clone(), tab_id);
        if let Some(name) = name {
            let _ = roster.name_to_id.insert(name.to_owned(), target_id.clone());
            let _ = roster.id_to_name.insert(target_id.clone(), name.to_owned());
        }
        if roster.active.is_none() {
            roster.active = Some(target_id);
        }
    }

    /// Remove a target, repairing the active pointer: another target takes
    /// over when one exists, otherwise active clears.
    pub fn remove_target(&self, target_id: &TargetId) {
        let mut roster = self.roster.write();
        let _ = roster.tabs.remove(target_id);
        if let Some(name) = roster.id_to_name.remove(target_id) {
            let _ = roster.name_to_id.remove(&name);
        }
        if roster.active.as_ref() == Some(target_id) {
            roster.active = roster.tabs.keys().next().cloned();
        }
        self.refs.clear_target(target_id);
        self.gates.remove_target(target_id);
    }

    /// Switch the active target. Returns false for an unknown target.
    pub fn set_active_target(&self, target_id: &TargetId) -> bool {
        let mut roster = self.roster.write();
        if !roster.tabs.contains_key(target_id) {
            return false;
        }
        roster.active = Some(target_id.clone());
        true
    }

    #[must_use]
    pub fn active_target(&self) -> Option<TargetId> {
        self.roster.read().active.clone()
    }

    #[must_use]
    pub fn target_count(&self) -> usize {
        self.roster.read().tabs.len()
    }

    #[must_use]
    pub fn contains_target(&self, target_id: &TargetId) -> bool {
        self.roster.read().tabs.contains_key(target_id)
    }

    /// Look a target up by its registered name.
    #[must_use]
    pub fn target_by_name(&self, name: &str) -> Option<TargetId> {
        self.roster.read().name_to_id.get(name).cloned()
    }

    // ── Capture buffers ──────────────────────────────────────────────────

    /// Append a console entry, returning its sequence number.
    pub fn push_console(&self, entry: ConsoleEntry) -> u64 {
        self.console.lock().push(entry)
    }

    /// Append a network entry, returning its sequence number.
    pub fn push_network(&self, entry: NetworkEntry) -> u64 {
        self.network.lock().push(entry)
    }

    /// Console entries after a cursor, oldest first.
    #[must_use]
    pub fn console_since(&self, since_seq: u64) -> Vec<SeqEntry<ConsoleEntry>> {
        self.console.lock().since(since_seq)
    }

    /// Network entries after a cursor, oldest first.
    #[must_use]
    pub fn network_since(&self, since_seq: u64) -> Vec<SeqEntry<NetworkEntry>> {
        self.network.lock().since(since_seq)
    }

    /// Latest console/network sequence numbers.
    #[must_use]
    pub fn capture_cursors(&self) -> (u64, u64) {
        (
            self.console.lock().latest_seq(),
            self.network.lock().latest_seq(),
        )
    }

    /// Status JSON for `session.status`.
    #[must_use]
    pub fn status_value(&self) -> Value {
        let roster = self.roster.read();
        let targets: Vec<Value> = roster
            .tabs
            .iter()
            .map(|(target_id, tab_id)| {
                json!({
                    "targetId": target_id,
                    "tabId": tab_id,
                    "name": roster.id_to_name.get(target_id),
                    "active": roster.active.as_ref() == Some(target_id),
                })
            })
            .collect();
        json!({
            "opsSessionId": self.id,
            "state": match *self.state.lock() {
                SessionState::Active => "active",
                SessionState::Closing => "closing",
            },
            "mode": self.mode,
            "primaryTabId": self.primary_tab,
            "leaseRequired": self.lease_id.is_some(),
            "activeTargetId": roster.active,
            "targets": targets,
            "createdAt": self.created_at,
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> OpsSession {
        OpsSession::new(
            ClientId::from("client-1"),
            None,
            ModeVariant::HeadedRelay,
            TabId::new(7),
            16,
        )
    }

    #[test]
    fn first_target_becomes_active() {
        let s = session();
        assert!(s.active_target().is_none());
        let t1 = TargetId::from("t-1");
        s.register_target(t1.clone(), TabId::new(7), Some("main"));
        assert_eq!(s.active_target(), Some(t1.clone()));
        assert_eq!(s.target_by_name("main"), Some(t1));
    }

    #[test]
    fn removing_active_target_repairs_the_pointer() {
        let s = session();
        let t1 = TargetId::from("t-1");
        let t2 = TargetId::from("t-2");
        s.register_target(t1.clone(), TabId::new(7), None);
        s.register_target(t2.clone(), TabId::new(8), None);
        assert_eq!(s.active_target(), Some(t1.clone()));

        s.remove_target(&t1);
        // Another target exists, so active stays a live key.
        assert_eq!(s.active_target(), Some(t2.clone()));

        s.remove_target(&t2);
        assert!(s.active_target().is_none());
        assert_eq!(s.target_count(), 0);
    }

    #[test]
    fn set_active_rejects_unknown_target() {
        let s = session();
        s.register_target(TargetId::from("t-1"), TabId::new(7), None);
        assert!(!s.set_active_target(&TargetId::from("ghost")));
        assert!(s.set_active_target(&TargetId::from("t-1")));
    }

    #[test]
    fn lease_free_session_authorizes_anything() {
        let s = session();
        assert!(s.authorize(None));
        assert!(s.authorize(Some(&LeaseId::from("l-1"))));
    }

    #[test]
    fn leased_session_requires_a_lease() {
        let s = OpsSession::new(
            ClientId::from("client-1"),
            Some(LeaseId::from("l-1")),
            ModeVariant::HeadedRelay,
            TabId::new(7),
            16,
        );
        assert!(!s.authorize(None));
        // Value stays opaque: any lease presence passes here.
        assert!(s.authorize(Some(&LeaseId::from("l-other"))));
    }

    #[test]
    fn begin_close_is_one_way_and_idempotent() {
        let s = session();
        assert_eq!(s.state(), SessionState::Active);
        assert!(s.begin_close());
        assert!(!s.begin_close());
        assert_eq!(s.state(), SessionState::Closing);
    }

    #[test]
    fn capture_buffers_sequence_independently() {
        let s = session();
        let seq_c = s.push_console(ConsoleEntry {
            level: "log".into(),
            text: "hi".into(),
            target_id: None,
            timestamp: Utc::now(),
        });
        let seq_n = s.push_network(NetworkEntry {
            url: "https://example.com".into(),
            status: 200,
            mime_type: Some("text/html".into()),
            target_id: None,
            timestamp: Utc::now(),
        });
        assert_eq!(seq_c, 1);
        assert_eq!(seq_n, 1);
        assert_eq!(s.console_since(0).len(), 1);
        assert!(s.console_since(1).is_empty());
        assert_eq!(s.capture_cursors(), (1, 1));
    }

    #[test]
    fn status_reports_roster_and_lease_flag() {
        let s = session();
        s.register_target(TargetId::from("t-1"), TabId::new(7), Some("main"));
        let status = s.status_value();
        assert_eq!(status["state"], "active");
        assert_eq!(status["leaseRequired"], false);
        assert_eq!(status["activeTargetId"], "t-1");
        assert_eq!(status["targets"][0]["name"], "main");
        assert_eq!(status["targets"][0]["active"], true);
    }
}
