//! Stable element references.
//!
//! Snapshot capture (an external collaborator) assigns stable `ref` tokens
//! to page elements; forwarded interaction commands name elements by ref.
//! This module holds the read surface the registry consumes: resolve a ref
//! to its descriptor before dispatch, fail fast when it is unknown.

use bridle_core::TargetId;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// What a ref resolves to.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElementDescriptor {
    /// CSS selector for the element.
    pub selector: String,
    /// CDP backend node id, when captured.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend_node_id: Option<i64>,
    /// Frame the element lives in, when not the main frame.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frame_id: Option<String>,
    /// Accessibility role, when captured.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    /// Accessible name, when captured.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Read surface for ref resolution.
pub trait RefStore: Send + Sync {
    /// Resolve a ref within a target's snapshot; `None` when unknown.
    fn resolve(&self, target_id: &TargetId, ref_id: &str) -> Option<ElementDescriptor>;
}

/// In-memory ref store, written by snapshot capture and read by dispatch.
#[derive(Debug, Default)]
pub struct InMemoryRefStore {
    refs: RwLock<HashMap<TargetId, HashMap<String, ElementDescriptor>>>,
}

impl InMemoryRefStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a ref for a target, replacing any previous descriptor.
    pub fn insert(&self, target_id: TargetId, ref_id: &str, descriptor: ElementDescriptor) {
        let _ = self
            .refs
            .write()
            .entry(target_id)
            .or_default()
            .insert(ref_id.to_owned(), descriptor);
    }

    /// Drop every ref captured for a target (new snapshot, target closed).
    pub fn clear_target(&self, target_id: &TargetId) {
        let _ = self.refs.write().remove(target_id);
    }

    /// Number of refs held for a target.
    #[must_use]
    pub fn len_for(&self, target_id: &TargetId) -> usize {
        self.refs.read().get(target_id).map_or(0, HashMap::len)
    }
}

impl RefStore for InMemoryRefStore {
    fn resolve(&self, target_id: &TargetId, ref_id: &str) -> Option<ElementDescriptor> {
        self.refs.read().get(target_id)?.get(ref_id).cloned()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(selector: &str) -> ElementDescriptor {
        ElementDescriptor {
            selector: selector.to_owned(),
            backend_node_id: Some(42),
            frame_id: None,
            role: Some("button".into()),
            name: Some("Submit".into()),
        }
    }

    #[test]
    fn resolve_known_ref() {
        let store = InMemoryRefStore::new();
        let target = TargetId::from("t-1");
        store.insert(target.clone(), "e3", descriptor("#submit"));

        let found = store.resolve(&target, "e3").unwrap();
        assert_eq!(found.selector, "#submit");
        assert_eq!(found.backend_node_id, Some(42));
    }

    #[test]
    fn unknown_ref_and_unknown_target_miss() {
        let store = InMemoryRefStore::new();
        let target = TargetId::from("t-1");
        store.insert(target.clone(), "e3", descriptor("#submit"));

        assert!(store.resolve(&target, "e4").is_none());
        assert!(store.resolve(&TargetId::from("t-2"), "e3").is_none());
    }

    #[test]
    fn refs_are_scoped_per_target() {
        let store = InMemoryRefStore::new();
        let a = TargetId::from("t-a");
        let b = TargetId::from("t-b");
        store.insert(a.clone(), "e1", descriptor("#a"));
        store.insert(b.clone(), "e1", descriptor("#b"));

        assert_eq!(store.resolve(&a, "e1").unwrap().selector, "#a");
        assert_eq!(store.resolve(&b, "e1").unwrap().selector, "#b");
    }

    #[test]
    fn clear_target_drops_only_that_target() {
        let store = InMemoryRefStore::new();
        let a = TargetId::from("t-a");
        let b = TargetId::from("t-b");
        store.insert(a.clone(), "e1", descriptor("#a"));
        store.insert(b.clone(), "e1", descriptor("#b"));

        store.clear_target(&a);
        assert_eq!(store.len_for(&a), 0);
        assert_eq!(store.len_for(&b), 1);
    }
}
