//! Logical-session table: virtual CDP sessions multiplexed onto one
//! physical attachment.

use bridle_core::{CdpSessionId, TabId, TargetId};
use std::collections::HashMap;

/// How commands for a logical session reach the platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionLink {
    /// Addressed by flat `sessionId` over the single attachment.
    Flat,
    /// Tunnelled through a `Target.sendMessageToTarget` envelope; replies
    /// come back as nested messages resolved by inner id.
    Envelope,
}

/// One virtual CDP session.
#[derive(Debug, Clone)]
pub struct LogicalSession {
    /// Synthesized opaque session token.
    pub session_id: CdpSessionId,
    /// Target this session is scoped to.
    pub target_id: TargetId,
    /// Tab backing the physical attachment underneath.
    pub tab_id: TabId,
    /// Root sessions represent the page itself; children are auto-attached
    /// sub-targets.
    pub is_root: bool,
    /// Command routing mode.
    pub link: SessionLink,
}

/// Session table for one physical attachment.
#[derive(Debug, Default)]
pub struct SessionTable {
    by_id: HashMap<CdpSessionId, LogicalSession>,
    root: Option<CdpSessionId>,
}

impl SessionTable {
    /// Create the root session, or return the existing one's id.
    ///
    /// Returns `(session_id, created)`; `created` is false when a root
    /// already existed, which is what makes `setAutoAttach` idempotent.
    pub fn ensure_root(&mut self, target_id: TargetId, tab_id: TabId) -> (CdpSessionId, bool) {
        if let Some(root_id) = &self.root {
            return (root_id.clone(), false);
        }
        let session_id = CdpSessionId::new();
        let _ = self.by_id.insert(
            session_id.clone(),
            LogicalSession {
                session_id: session_id.clone(),
                target_id,
                tab_id,
                is_root: true,
                link: SessionLink::Flat,
            },
        );
        self.root = Some(session_id.clone());
        (session_id, true)
    }

    /// Create a child session scoped to a target.
    pub fn create_child(
        &mut self,
        target_id: TargetId,
        tab_id: TabId,
        link: SessionLink,
    ) -> CdpSessionId {
        let session_id = CdpSessionId::new();
        let _ = self.by_id.insert(
            session_id.clone(),
            LogicalSession {
                session_id: session_id.clone(),
                target_id,
                tab_id,
                is_root: false,
                link,
            },
        );
        session_id
    }

    /// Register a platform-reported child under its platform-issued id.
    /// The link records how the attach arrived: flat for native events,
    /// envelope for children announced through the tunnel.
    pub fn adopt_child(
        &mut self,
        session_id: CdpSessionId,
        target_id: TargetId,
        tab_id: TabId,
        link: SessionLink,
    ) {
        let _ = self.by_id.insert(
            session_id.clone(),
            LogicalSession {
                session_id,
                target_id,
                tab_id,
                is_root: false,
                link,
            },
        );
    }

    pub fn get(&self, session_id: &CdpSessionId) -> Option<&LogicalSession> {
        self.by_id.get(session_id)
    }

    /// The root session, if attached.
    pub fn root(&self) -> Option<&LogicalSession> {
        self.root.as_ref().and_then(|id| self.by_id.get(id))
    }

    /// Tear down the root session, returning it. The freed id is never
    /// reused; a later re-attach synthesizes a fresh one.
    pub fn remove_root(&mut self) -> Option<LogicalSession> {
        let root_id = self.root.take()?;
        self.by_id.remove(&root_id)
    }

    pub fn remove(&mut self, session_id: &CdpSessionId) -> Option<LogicalSession> {
        if self.root.as_ref() == Some(session_id) {
            self.root = None;
        }
        self.by_id.remove(session_id)
    }

    /// Drop every session scoped to a target, returning the removed ids.
    pub fn remove_for_target(&mut self, target_id: &TargetId) -> Vec<CdpSessionId> {
        let doomed: Vec<CdpSessionId> = self
            .by_id
            .values()
            .filter(|s| &s.target_id == target_id)
            .map(|s| s.session_id.clone())
            .collect();
        for id in &doomed {
            let _ = self.remove(id);
        }
        doomed
    }

    /// Drop everything. Used on hard detach.
    pub fn clear(&mut self) {
        self.by_id.clear();
        self.root = None;
    }

    #[must_use]
    pub fn contains(&self, session_id: &CdpSessionId) -> bool {
        self.by_id.contains_key(session_id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
