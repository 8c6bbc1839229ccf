//! Target table: the router's view of debuggable pages.

use bridle_core::{TabId, TargetId};
use serde_json::{Value, json};
use std::collections::HashMap;

/// Metadata for one debuggable target.
#[derive(Debug, Clone)]
pub struct TargetInfo {
    /// Synthesized target id, stable for the target's lifetime.
    pub target_id: TargetId,
    /// Host tab backing this target.
    pub tab_id: TabId,
    /// CDP target type (`"page"` for tabs).
    pub kind: String,
    /// Page title, when known.
    pub title: String,
    /// Page URL, when known.
    pub url: String,
    /// Browser context the target belongs to.
    pub browser_context_id: String,
    /// Whether a logical session is currently attached.
    pub attached: bool,
}

impl TargetInfo {
    /// A page target for a tab, with a fresh synthesized id.
    #[must_use]
    pub fn page(tab_id: TabId, url: &str, browser_context_id: &str) -> Self {
        Self {
            target_id: TargetId::new(),
            tab_id,
            kind: "page".to_owned(),
            title: String::new(),
            url: url.to_owned(),
            browser_context_id: browser_context_id.to_owned(),
            attached: false,
        }
    }

    /// The CDP `TargetInfo` wire shape.
    #[must_use]
    pub fn to_cdp(&self) -> Value {
        json!({
            "targetId": self.target_id,
            "type": self.kind,
            "title": self.title,
            "url": self.url,
            "attached": self.attached,
            "browserContextId": self.browser_context_id,
            "canAccessOpener": false,
        })
    }
}

/// All targets the router currently knows about, keyed by target id.
#[derive(Debug, Default)]
pub struct TargetTable {
    by_id: HashMap<TargetId, TargetInfo>,
}

impl TargetTable {
    /// Register or replace a target.
    pub fn insert(&mut self, info: TargetInfo) {
        let _ = self.by_id.insert(info.target_id.clone(), info);
    }

    /// Remove a target, returning its entry.
    pub fn remove(&mut self, target_id: &TargetId) -> Option<TargetInfo> {
        self.by_id.remove(target_id)
    }

    pub fn get(&self, target_id: &TargetId) -> Option<&TargetInfo> {
        self.by_id.get(target_id)
    }

    pub fn get_mut(&mut self, target_id: &TargetId) -> Option<&mut TargetInfo> {
        self.by_id.get_mut(target_id)
    }

    /// Find the target backed by a tab, if registered.
    pub fn by_tab(&self, tab_id: TabId) -> Option<&TargetInfo> {
        self.by_id.values().find(|info| info.tab_id == tab_id)
    }

    #[must_use]
    pub fn contains(&self, target_id: &TargetId) -> bool {
        self.by_id.contains_key(target_id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// The `Target.getTargets` result shape.
    #[must_use]
    pub fn to_cdp_list(&self) -> Value {
        let infos: Vec<Value> = self.by_id.values().map(TargetInfo::to_cdp).collect();
        json!({ "targetInfos": infos })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
