//! Physical attachment lifecycle and the stale-attach fallback ladder.

use bridle_core::TabId;
use tracing::{debug, warn};

use crate::debugger::{DebuggerApi, DebuggerError};
use crate::error::RouterError;

/// The one live debugger attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhysicalAttachment {
    /// Tab currently under debugging.
    pub tab: TabId,
}

/// Attach to `requested`, recovering from stale tab ids.
///
/// Ladder: the requested tab, then the browser's active tab, then — only
/// when no usable candidate remains — a fresh blank tab. Returns the tab
/// that actually attached. The flat-session capability is probed first;
/// without it the multiplexer cannot route at all, so attach fails fast
/// instead of degrading into a broken mode.
pub async fn attach_with_fallback(
    api: &dyn DebuggerApi,
    requested: TabId,
) -> Result<PhysicalAttachment, RouterError> {
    if !api.supports_flat_sessions() {
        return Err(RouterError::CapabilityRequired {
            capability: "flat sessions",
        });
    }

    let first = match api.attach(requested).await {
        Ok(()) => return Ok(PhysicalAttachment { tab: requested }),
        Err(err) if err.is_stale_tab() => err,
        Err(err) => return Err(RouterError::Debugger(err)),
    };
    debug!(tab = requested.raw(), error = %first, "requested tab is stale, trying active tab");

    // Rung 2: the browser's focused tab, when it differs.
    let active = api.active_tab().await.map_err(RouterError::Debugger)?;
    if let Some(active) = active.filter(|&tab| tab != requested) {
        match api.attach(active).await {
            Ok(()) => return Ok(PhysicalAttachment { tab: active }),
            Err(err) if err.is_stale_tab() => {
                debug!(tab = active.raw(), error = %err, "active tab also stale");
            }
            Err(err) => return Err(RouterError::Debugger(err)),
        }
    }

    // Rung 3: last resort, a fresh blank tab.
    warn!(
        requested = requested.raw(),
        "no usable tab candidate, creating a blank tab"
    );
    let fresh = api
        .create_tab("about:blank")
        .await
        .map_err(RouterError::Debugger)?;
    match api.attach(fresh).await {
        Ok(()) => Ok(PhysicalAttachment { tab: fresh }),
        Err(err) => Err(RouterError::AttachExhausted {
            tab: fresh,
            message: err.to_string(),
        }),
    }
}

/// Detach, tolerating an already-gone attachment.
pub async fn detach_quietly(api: &dyn DebuggerApi, attachment: PhysicalAttachment) {
    if let Err(err) = api.detach(attachment.tab).await {
        match err {
            DebuggerError::NoSuchTab(_) | DebuggerError::Detached(_) => {}
            other => debug!(tab = attachment.tab.raw(), error = %other, "detach failed"),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
