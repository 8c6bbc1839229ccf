//! Scriptable in-memory debugger backend.
//!
//! Not gated to `cfg(test)`: the relay binary wires it as a stub backend
//! and the integration suite drives full end-to-end scenarios through it.

use bridle_core::{CdpSessionId, TabId};
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::collections::{BTreeSet, HashMap, VecDeque};
use tokio::sync::broadcast;

use crate::debugger::{DebuggerApi, DebuggerError, DebuggerNotice};

/// One recorded `send_command` call.
#[derive(Debug, Clone)]
pub struct RecordedCommand {
    /// Tab the command addressed.
    pub tab: TabId,
    /// CDP method.
    pub method: String,
    /// CDP params, if any.
    pub params: Option<Value>,
    /// Flat-session id, if any.
    pub session_id: Option<CdpSessionId>,
}

#[derive(Default)]
struct FakeState {
    tabs: BTreeSet<TabId>,
    active: Option<TabId>,
    attached: Option<TabId>,
    attach_log: Vec<TabId>,
    commands: Vec<RecordedCommand>,
    responses: HashMap<String, VecDeque<Result<Value, String>>>,
    next_tab: i64,
}

/// Scriptable [`DebuggerApi`] implementation.
///
/// Attaching to a tab that is not in the tab set fails with
/// [`DebuggerError::NoSuchTab`], which is exactly the staleness shape the
/// attach fallback ladder recovers from. Commands answer from per-method
/// scripted queues, defaulting to `{}`.
pub struct FakeDebugger {
    state: Mutex<FakeState>,
    notices: broadcast::Sender<DebuggerNotice>,
    flat: bool,
}

impl FakeDebugger {
    /// A fake with no tabs and flat sessions supported.
    #[must_use]
    pub fn new() -> Self {
        let (notices, _) = broadcast::channel(64);
        Self {
            state: Mutex::new(FakeState {
                next_tab: 1_000,
                ..FakeState::default()
            }),
            notices,
            flat: true,
        }
    }

    /// A fake pre-populated with the given tabs; the first becomes active.
    #[must_use]
    pub fn with_tabs(tabs: &[i64]) -> Self {
        let fake = Self::new();
        {
            let mut state = fake.state.lock();
            for &raw in tabs {
                let _ = state.tabs.insert(TabId::new(raw));
            }
            state.active = tabs.first().map(|&raw| TabId::new(raw));
        }
        fake
    }

    /// A fake that reports flat sessions as unsupported.
    #[must_use]
    pub fn without_flat_sessions() -> Self {
        let mut fake = Self::new();
        fake.flat = false;
        fake
    }

    /// Queue the next result for a method. Multiple calls queue in order;
    /// once drained, the method falls back to the `{}` default.
    pub fn script_response(&self, method: &str, result: Result<Value, String>) {
        self.state
            .lock()
            .responses
            .entry(method.to_owned())
            .or_default()
            .push_back(result);
    }

    /// Mark which tab the browser considers focused.
    pub fn set_active_tab(&self, tab: Option<TabId>) {
        self.state.lock().active = tab;
    }

    /// Remove a tab, simulating the user closing it out from under us.
    pub fn drop_tab(&self, tab: TabId) {
        let mut state = self.state.lock();
        let _ = state.tabs.remove(&tab);
        if state.active == Some(tab) {
            state.active = None;
        }
    }

    /// Emit a native event notice to subscribers.
    pub fn emit_event(
        &self,
        tab: TabId,
        method: &str,
        params: Value,
        session_id: Option<CdpSessionId>,
    ) {
        let _ = self.notices.send(DebuggerNotice::Event {
            tab,
            method: method.to_owned(),
            params,
            session_id,
        });
    }

    /// Emit a detach notice and clear the attachment.
    pub fn emit_detached(&self, tab: TabId, reason: &str) {
        {
            let mut state = self.state.lock();
            if state.attached == Some(tab) {
                state.attached = None;
            }
        }
        let _ = self.notices.send(DebuggerNotice::Detached {
            tab,
            reason: reason.to_owned(),
        });
    }

    /// Currently attached tab, if any.
    #[must_use]
    pub fn attached_tab(&self) -> Option<TabId> {
        self.state.lock().attached
    }

    /// Every attach call so far, in order.
    #[must_use]
    pub fn attach_log(&self) -> Vec<TabId> {
        self.state.lock().attach_log.clone()
    }

    /// Every `send_command` call so far, in order.
    #[must_use]
    pub fn commands(&self) -> Vec<RecordedCommand> {
        self.state.lock().commands.clone()
    }

    /// Whether a tab currently exists.
    #[must_use]
    pub fn has_tab(&self, tab: TabId) -> bool {
        self.state.lock().tabs.contains(&tab)
    }
}

impl Default for FakeDebugger {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl DebuggerApi for FakeDebugger {
    async fn attach(&self, tab: TabId) -> Result<(), DebuggerError> {
        let mut state = self.state.lock();
        state.attach_log.push(tab);
        if !state.tabs.contains(&tab) {
            return Err(DebuggerError::NoSuchTab(tab));
        }
        state.attached = Some(tab);
        Ok(())
    }

    async fn detach(&self, tab: TabId) -> Result<(), DebuggerError> {
        let mut state = self.state.lock();
        if state.attached == Some(tab) {
            state.attached = None;
        }
        Ok(())
    }

    async fn send_command(
        &self,
        tab: TabId,
        method: &str,
        params: Option<Value>,
        session_id: Option<&CdpSessionId>,
    ) -> Result<Value, DebuggerError> {
        let mut state = self.state.lock();
        if state.attached != Some(tab) {
            return Err(DebuggerError::Detached(tab));
        }
        state.commands.push(RecordedCommand {
            tab,
            method: method.to_owned(),
            params,
            session_id: session_id.cloned(),
        });
        let scripted = state
            .responses
            .get_mut(method)
            .and_then(VecDeque::pop_front);
        match scripted {
            Some(Ok(value)) => Ok(value),
            Some(Err(message)) => Err(DebuggerError::Command {
                method: method.to_owned(),
                message,
            }),
            None => Ok(json!({})),
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<DebuggerNotice> {
        self.notices.subscribe()
    }

    async fn active_tab(&self) -> Result<Option<TabId>, DebuggerError> {
        Ok(self.state.lock().active)
    }

    async fn create_tab(&self, _url: &str) -> Result<TabId, DebuggerError> {
        let mut state = self.state.lock();
        state.next_tab += 1;
        let tab = TabId::new(state.next_tab);
        let _ = state.tabs.insert(tab);
        Ok(tab)
    }

    async fn close_tab(&self, tab: TabId) -> Result<(), DebuggerError> {
        let mut state = self.state.lock();
        if !state.tabs.remove(&tab) {
            return Err(DebuggerError::NoSuchTab(tab));
        }
        if state.attached == Some(tab) {
            state.attached = None;
        }
        if state.active == Some(tab) {
            state.active = None;
        }
        Ok(())
    }

    fn supports_flat_sessions(&self) -> bool {
        self.flat
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
