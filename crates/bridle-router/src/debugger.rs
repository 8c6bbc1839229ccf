//! Narrow capability seam over the host platform's debugger API.
//!
//! The router's logic never touches the platform directly; everything goes
//! through [`DebuggerApi`] so it can run against the scriptable
//! [`crate::fake::FakeDebugger`] in tests and against a real platform
//! binding in production.

use async_trait::async_trait;
use bridle_core::{CdpSessionId, TabId};
use serde_json::Value;
use tokio::sync::broadcast;

/// Errors surfaced by a debugger backend.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DebuggerError {
    /// The tab no longer exists (stale id).
    #[error("no tab {0}")]
    NoSuchTab(TabId),

    /// Attach was refused for a reason other than staleness.
    #[error("attach to tab {tab} failed: {message}")]
    AttachFailed {
        /// Tab the attach targeted.
        tab: TabId,
        /// Platform-reported reason.
        message: String,
    },

    /// A forwarded command failed inside the platform.
    #[error("debugger command {method} failed: {message}")]
    Command {
        /// CDP method that failed.
        method: String,
        /// Platform-reported reason.
        message: String,
    },

    /// The attachment is gone; the command cannot be delivered.
    #[error("debugger detached from tab {0}")]
    Detached(TabId),
}

impl DebuggerError {
    /// Whether the error indicates the target tab is stale/vanished, which
    /// makes it eligible for the attach fallback ladder.
    #[must_use]
    pub fn is_stale_tab(&self) -> bool {
        matches!(self, Self::NoSuchTab(_))
    }
}

/// Unsolicited notifications from the debugger backend.
#[derive(Debug, Clone)]
pub enum DebuggerNotice {
    /// A native debugger event addressed to an attached tab.
    Event {
        /// Tab the event originated from.
        tab: TabId,
        /// CDP event method.
        method: String,
        /// CDP event params.
        params: Value,
        /// Flat-session id, when the platform tagged one.
        session_id: Option<CdpSessionId>,
    },
    /// The platform dropped the attachment (tab closed, user cancelled,
    /// devtools opened). Not retried internally.
    Detached {
        /// Tab that was detached.
        tab: TabId,
        /// Platform-reported reason.
        reason: String,
    },
}

/// Capability interface the router requires from the host platform.
///
/// One implementation per platform binding; at most one attachment is live
/// at a time per instance.
#[async_trait]
pub trait DebuggerApi: Send + Sync {
    /// Attach the debugger to a tab. Attaching to the already-attached tab
    /// must be a no-op; attaching to a different tab while attached replaces
    /// the attachment.
    async fn attach(&self, tab: TabId) -> Result<(), DebuggerError>;

    /// Detach from a tab. Detaching when not attached is a no-op.
    async fn detach(&self, tab: TabId) -> Result<(), DebuggerError>;

    /// Send a CDP command to an attached tab, optionally addressed to a
    /// flat session, and await its result.
    async fn send_command(
        &self,
        tab: TabId,
        method: &str,
        params: Option<Value>,
        session_id: Option<&CdpSessionId>,
    ) -> Result<Value, DebuggerError>;

    /// Subscribe to native events and detach notifications.
    fn subscribe(&self) -> broadcast::Receiver<DebuggerNotice>;

    /// The browser's currently focused tab, if any.
    async fn active_tab(&self) -> Result<Option<TabId>, DebuggerError>;

    /// Open a new tab at the given URL and return its id.
    async fn create_tab(&self, url: &str) -> Result<TabId, DebuggerError>;

    /// Close a tab.
    async fn close_tab(&self, tab: TabId) -> Result<(), DebuggerError>;

    /// Whether the platform supports flat (session-id-addressed) command
    /// routing over the single attachment. Without it the multiplexer
    /// cannot work at all.
    fn supports_flat_sessions(&self) -> bool;
}
