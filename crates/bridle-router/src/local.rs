//! Locally-answered CDP methods.
//!
//! The host platform has no concept of a browser target, browser contexts,
//! or download behavior, so these methods never reach the debugger; the
//! router synthesizes stable answers instead.

use serde_json::{Value, json};

use crate::targets::TargetTable;

/// Browser context id reported for every target.
pub const DEFAULT_BROWSER_CONTEXT: &str = "ctx-default";

/// `Browser.getVersion` — static synthesized identity.
#[must_use]
pub fn browser_version() -> Value {
    json!({
        "protocolVersion": "1.3",
        "product": "Chrome/124.0.0.0",
        "revision": "@relay",
        "userAgent": "Mozilla/5.0 (relay)",
        "jsVersion": "12.4",
    })
}

/// `Target.getBrowserContexts` — the single default context.
#[must_use]
pub fn browser_contexts() -> Value {
    json!({ "browserContextIds": [DEFAULT_BROWSER_CONTEXT] })
}

/// `Browser.setDownloadBehavior` — accepted and ignored.
#[must_use]
pub fn set_download_behavior() -> Value {
    json!({})
}

/// `Target.getTargets` — the router's own table.
#[must_use]
pub fn get_targets(targets: &TargetTable) -> Value {
    targets.to_cdp_list()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_shape() {
        let v = browser_version();
        assert!(v["protocolVersion"].is_string());
        assert!(v["product"].as_str().unwrap().starts_with("Chrome/"));
    }

    #[test]
    fn contexts_contain_default() {
        let v = browser_contexts();
        assert_eq!(v["browserContextIds"][0], DEFAULT_BROWSER_CONTEXT);
    }
}
