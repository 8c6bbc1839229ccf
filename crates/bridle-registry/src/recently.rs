//! Recently-closed session records.
//!
//! A late `session.status` or `session.close` for a just-closed session
//! must get a definitive "closed" answer rather than "never existed". The
//! record set is capacity-bounded with oldest-first eviction; entry ids are
//! opaque and an empty string is a valid retained key.

use bridle_core::OpsSessionId;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::VecDeque;

/// Bounded map of closed-session id → close time.
#[derive(Debug)]
pub struct RecentlyClosed {
    entries: Mutex<VecDeque<(OpsSessionId, DateTime<Utc>)>>,
    capacity: usize,
}

impl RecentlyClosed {
    /// A record set retaining at most `capacity` entries (min 1).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    /// Record a closure. When over capacity, the oldest entry is evicted —
    /// strictly by insertion order, never by inspecting the id value.
    pub fn record(&self, id: OpsSessionId, closed_at: DateTime<Utc>) {
        let mut entries = self.entries.lock();
        entries.retain(|(existing, _)| existing != &id);
        entries.push_back((id, closed_at));
        while entries.len() > self.capacity {
            let _ = entries.pop_front();
        }
    }

    /// When the session closed, if still retained.
    #[must_use]
    pub fn closed_at(&self, id: &OpsSessionId) -> Option<DateTime<Utc>> {
        self.entries
            .lock()
            .iter()
            .find(|(existing, _)| existing == id)
            .map(|(_, at)| *at)
    }

    #[must_use]
    pub fn contains(&self, id: &OpsSessionId) -> bool {
        self.closed_at(id).is_some()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eviction_is_oldest_first() {
        let recent = RecentlyClosed::new(2);
        recent.record(OpsSessionId::from("a"), Utc::now());
        recent.record(OpsSessionId::from("b"), Utc::now());
        recent.record(OpsSessionId::from("c"), Utc::now());

        assert!(!recent.contains(&OpsSessionId::from("a")));
        assert!(recent.contains(&OpsSessionId::from("b")));
        assert!(recent.contains(&OpsSessionId::from("c")));
        assert_eq!(recent.len(), 2);
    }

    #[test]
    fn empty_string_id_is_retained_like_any_other() {
        let recent = RecentlyClosed::new(3);
        recent.record(OpsSessionId::from(""), Utc::now());
        recent.record(OpsSessionId::from("x"), Utc::now());

        assert!(recent.contains(&OpsSessionId::from("")));
        assert_eq!(recent.len(), 2);

        // Eviction pressure removes by age, not by falsiness.
        recent.record(OpsSessionId::from("y"), Utc::now());
        recent.record(OpsSessionId::from("z"), Utc::now());
        assert!(!recent.contains(&OpsSessionId::from("")));
        assert!(recent.contains(&OpsSessionId::from("x")));
    }

    #[test]
    fn re_recording_refreshes_position() {
        let recent = RecentlyClosed::new(2);
        recent.record(OpsSessionId::from("a"), Utc::now());
        recent.record(OpsSessionId::from("b"), Utc::now());
        recent.record(OpsSessionId::from("a"), Utc::now());
        recent.record(OpsSessionId::from("c"), Utc::now());

        // "b" was the oldest after "a" was refreshed.
        assert!(recent.contains(&OpsSessionId::from("a")));
        assert!(!recent.contains(&OpsSessionId::from("b")));
        assert!(recent.contains(&OpsSessionId::from("c")));
    }
}
