//! The CDP session multiplexer.
//!
//! One [`CdpRouter`] owns one physical debugger attachment and presents the
//! full multi-session CDP surface on top of it: synthesized root/child
//! sessions, locally-answered browser-level methods, target lifecycle
//! events, and forwarding for everything else.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bridle_core::{CdpSessionId, TabId, TargetId};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::attachment::{PhysicalAttachment, attach_with_fallback, detach_quietly};
use crate::debugger::{DebuggerApi, DebuggerError, DebuggerNotice};
use crate::decode::{Nested, decode_nested};
use crate::error::RouterError;
use crate::local;
use crate::sessions::{SessionLink, SessionTable};
use crate::targets::{TargetInfo, TargetTable};

/// Deadline for a reply tunnelled through the target-relay envelope.
const NESTED_REPLY_TIMEOUT: Duration = Duration::from_secs(30);

/// An event to forward to the remote client.
#[derive(Debug, Clone)]
pub struct CdpEvent {
    /// CDP event method.
    pub method: String,
    /// CDP event params.
    pub params: Value,
    /// Logical session the event is scoped to, when any.
    pub session_id: Option<CdpSessionId>,
}

/// Router output consumed by the relay endpoint.
#[derive(Debug, Clone)]
pub enum RouterNotice {
    /// Forward this CDP event to the client.
    Event(CdpEvent),
    /// The platform dropped the attachment; the session is unusable until
    /// re-attached. Surfaced, never retried internally.
    Detached {
        /// Tab that was attached.
        tab: TabId,
        /// Platform-reported reason.
        reason: String,
    },
}

struct Inner {
    attachment: Option<PhysicalAttachment>,
    sessions: SessionTable,
    targets: TargetTable,
    discover_targets: bool,
    last_auto_attach: Option<Value>,
}

/// Session-multiplexing CDP router over one physical attachment.
pub struct CdpRouter {
    api: Arc<dyn DebuggerApi>,
    primary_tab: TabId,
    inner: Mutex<Inner>,
    nested_pending: Mutex<HashMap<u64, oneshot::Sender<Result<Value, RouterError>>>>,
    next_nested_id: AtomicU64,
    notices: mpsc::UnboundedSender<RouterNotice>,
}

impl CdpRouter {
    /// Build a router for a primary tab. The receiver yields forwarded
    /// events and detach notices; the physical attachment is created lazily
    /// on the first command that needs it.
    pub fn new(
        api: Arc<dyn DebuggerApi>,
        primary_tab: TabId,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<RouterNotice>) {
        let (notices, rx) = mpsc::unbounded_channel();
        let router = Arc::new(Self {
            api,
            primary_tab,
            inner: Mutex::new(Inner {
                attachment: None,
                sessions: SessionTable::default(),
                targets: TargetTable::default(),
                discover_targets: false,
                last_auto_attach: None,
            }),
            nested_pending: Mutex::new(HashMap::new()),
            next_nested_id: AtomicU64::new(1),
            notices,
        });
        (router, rx)
    }

    /// Spawn the native-event pump. Runs until cancelled or the debugger
    /// subscription closes.
    pub fn start_event_pump(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let router = Arc::clone(self);
        let mut notices = router.api.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    notice = notices.recv() => match notice {
                        Ok(notice) => router.handle_notice(notice).await,
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!(missed, "event pump lagged, native events dropped");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    () = cancel.cancelled() => break,
                }
            }
        })
    }

    /// Tab currently attached, if any.
    #[must_use]
    pub fn attached_tab(&self) -> Option<TabId> {
        self.inner.lock().attachment.map(|a| a.tab)
    }

    /// Root logical session id, if auto-attach is active.
    #[must_use]
    pub fn root_session_id(&self) -> Option<CdpSessionId> {
        self.inner.lock().sessions.root().map(|s| s.session_id.clone())
    }

    /// Number of live logical sessions.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.inner.lock().sessions.len()
    }

    /// The target table in CDP list shape, for status reporting.
    #[must_use]
    pub fn targets_snapshot(&self) -> Value {
        local::get_targets(&self.inner.lock().targets)
    }

    /// Tear everything down: logical sessions, target table, attachment.
    pub async fn shutdown(&self) {
        let attachment = {
            let mut inner = self.inner.lock();
            inner.sessions.clear();
            inner.last_auto_attach = None;
            inner.attachment.take()
        };
        if let Some(attachment) = attachment {
            detach_quietly(self.api.as_ref(), attachment).await;
        }
    }

    /// Route one forwarded CDP command.
    #[instrument(skip_all, fields(method = %method))]
    pub async fn handle_command(
        &self,
        method: &str,
        params: Option<Value>,
        session_id: Option<CdpSessionId>,
    ) -> Result<Value, RouterError> {
        match method {
            "Browser.getVersion" => Ok(local::browser_version()),
            "Target.getBrowserContexts" => Ok(local::browser_contexts()),
            "Browser.setDownloadBehavior" => Ok(local::set_download_behavior()),
            "Target.getTargets" => {
                self.ensure_attached().await?;
                Ok(self.targets_snapshot())
            }
            "Target.attachToBrowserTarget" => self.attach_to_browser_target().await,
            "Target.setAutoAttach" => self.set_auto_attach(params).await,
            "Target.attachToTarget" => self.attach_to_target(params).await,
            "Target.createTarget" => self.create_target(params).await,
            "Target.closeTarget" => self.close_target(params).await,
            "Target.setDiscoverTargets" => self.set_discover_targets(params),
            _ => self.forward(method, params, session_id).await,
        }
    }

    /// Attach (with the fallback ladder) if not already attached, and make
    /// sure the attached tab has a target table entry.
    async fn ensure_attached(&self) -> Result<PhysicalAttachment, RouterError> {
        if let Some(attachment) = self.inner.lock().attachment {
            return Ok(attachment);
        }
        let attachment = attach_with_fallback(self.api.as_ref(), self.primary_tab).await?;
        let mut inner = self.inner.lock();
        inner.attachment = Some(attachment);
        if inner.targets.by_tab(attachment.tab).is_none() {
            inner.targets.insert(TargetInfo::page(
                attachment.tab,
                "about:blank",
                local::DEFAULT_BROWSER_CONTEXT,
            ));
        }
        Ok(attachment)
    }

    async fn attach_to_browser_target(&self) -> Result<Value, RouterError> {
        let attachment = self.ensure_attached().await?;
        let mut inner = self.inner.lock();
        let target_id = inner
            .targets
            .by_tab(attachment.tab)
            .map(|info| info.target_id.clone())
            .ok_or_else(|| RouterError::TargetNotFound(attachment.tab.to_string()))?;
        let session_id = inner
            .sessions
            .create_child(target_id, attachment.tab, SessionLink::Flat);
        Ok(json!({ "sessionId": session_id }))
    }

    async fn set_auto_attach(&self, params: Option<Value>) -> Result<Value, RouterError> {
        let params = params.unwrap_or_else(|| json!({}));
        let auto_attach = params
            .get("autoAttach")
            .and_then(Value::as_bool)
            .ok_or_else(|| RouterError::InvalidParams {
                method: "Target.setAutoAttach".to_owned(),
                message: "missing autoAttach".to_owned(),
            })?;

        if !auto_attach {
            let removed = {
                let mut inner = self.inner.lock();
                inner.last_auto_attach = None;
                let removed = inner.sessions.remove_root();
                if let Some(root) = &removed {
                    if let Some(info) = inner.targets.get_mut(&root.target_id) {
                        info.attached = false;
                    }
                }
                removed
            };
            if let Some(root) = removed {
                self.emit(CdpEvent {
                    method: "Target.detachedFromTarget".to_owned(),
                    params: json!({
                        "sessionId": root.session_id,
                        "targetId": root.target_id,
                    }),
                    session_id: None,
                });
            }
            return Ok(json!({}));
        }

        let attachment = self.ensure_attached().await?;
        let emitted = {
            let mut inner = self.inner.lock();
            inner.last_auto_attach = Some(params);
            let info = inner
                .targets
                .by_tab(attachment.tab)
                .cloned()
                .ok_or_else(|| RouterError::TargetNotFound(attachment.tab.to_string()))?;
            let (session_id, created) = inner
                .sessions
                .ensure_root(info.target_id.clone(), attachment.tab);
            if !created {
                // Already auto-attached; do not re-emit.
                return Ok(json!({}));
            }
            if let Some(entry) = inner.targets.get_mut(&info.target_id) {
                entry.attached = true;
            }
            let mut target_info = info.to_cdp();
            target_info["attached"] = json!(true);
            CdpEvent {
                method: "Target.attachedToTarget".to_owned(),
                params: json!({
                    "sessionId": session_id,
                    "targetInfo": target_info,
                    "waitingForDebugger": false,
                }),
                session_id: None,
            }
        };
        self.emit(emitted);
        Ok(json!({}))
    }

    async fn attach_to_target(&self, params: Option<Value>) -> Result<Value, RouterError> {
        let params = params.unwrap_or_else(|| json!({}));
        let target_id = params
            .get("targetId")
            .and_then(Value::as_str)
            .map(TargetId::from)
            .ok_or_else(|| RouterError::InvalidParams {
                method: "Target.attachToTarget".to_owned(),
                message: "missing targetId".to_owned(),
            })?;
        let attachment = self.ensure_attached().await?;

        // Known targets get a session synchronously, no round-trip.
        {
            let mut inner = self.inner.lock();
            if let Some(info) = inner.targets.get(&target_id).cloned() {
                let session_id =
                    inner
                        .sessions
                        .create_child(target_id, info.tab_id, SessionLink::Flat);
                return Ok(json!({ "sessionId": session_id }));
            }
        }

        // Genuinely new child target: issue the underlying attach.
        let reply = self
            .api
            .send_command(
                attachment.tab,
                "Target.attachToTarget",
                Some(params),
                None,
            )
            .await?;
        let session_id = reply
            .get("sessionId")
            .and_then(Value::as_str)
            .map_or_else(CdpSessionId::new, CdpSessionId::from);

        let mut inner = self.inner.lock();
        let mut info = TargetInfo::page(attachment.tab, "", local::DEFAULT_BROWSER_CONTEXT);
        info.target_id = target_id.clone();
        info.attached = true;
        inner.targets.insert(info);
        inner.sessions.adopt_child(
            session_id.clone(),
            target_id,
            attachment.tab,
            SessionLink::Flat,
        );
        Ok(json!({ "sessionId": session_id }))
    }

    async fn create_target(&self, params: Option<Value>) -> Result<Value, RouterError> {
        let params = params.unwrap_or_else(|| json!({}));
        let url = params
            .get("url")
            .and_then(Value::as_str)
            .unwrap_or("about:blank")
            .to_owned();
        let _ = self.ensure_attached().await?;
        let tab = self.api.create_tab(&url).await?;

        let (target_id, event) = {
            let mut inner = self.inner.lock();
            let info = TargetInfo::page(tab, &url, local::DEFAULT_BROWSER_CONTEXT);
            let target_id = info.target_id.clone();
            let event = inner.discover_targets.then(|| CdpEvent {
                method: "Target.targetCreated".to_owned(),
                params: json!({ "targetInfo": info.to_cdp() }),
                session_id: None,
            });
            inner.targets.insert(info);
            (target_id, event)
        };
        if let Some(event) = event {
            self.emit(event);
        }
        Ok(json!({ "targetId": target_id }))
    }

    async fn close_target(&self, params: Option<Value>) -> Result<Value, RouterError> {
        let params = params.unwrap_or_else(|| json!({}));
        let target_id = params
            .get("targetId")
            .and_then(Value::as_str)
            .map(TargetId::from)
            .ok_or_else(|| RouterError::InvalidParams {
                method: "Target.closeTarget".to_owned(),
                message: "missing targetId".to_owned(),
            })?;

        let tab = {
            let inner = self.inner.lock();
            inner
                .targets
                .get(&target_id)
                .map(|info| info.tab_id)
                .ok_or_else(|| RouterError::TargetNotFound(target_id.to_string()))?
        };
        if let Err(err) = self.api.close_tab(tab).await {
            // The tab vanishing on its own still counts as closed.
            if !err.is_stale_tab() {
                return Err(RouterError::Debugger(err));
            }
        }

        let event = {
            let mut inner = self.inner.lock();
            let _ = inner.targets.remove(&target_id);
            let _ = inner.sessions.remove_for_target(&target_id);
            if inner.attachment.map(|a| a.tab) == Some(tab) {
                inner.attachment = None;
            }
            inner.discover_targets.then(|| CdpEvent {
                method: "Target.targetDestroyed".to_owned(),
                params: json!({ "targetId": target_id }),
                session_id: None,
            })
        };
        if let Some(event) = event {
            self.emit(event);
        }
        Ok(json!({ "success": true }))
    }

    fn set_discover_targets(&self, params: Option<Value>) -> Result<Value, RouterError> {
        let discover = params
            .as_ref()
            .and_then(|p| p.get("discover"))
            .and_then(Value::as_bool)
            .ok_or_else(|| RouterError::InvalidParams {
                method: "Target.setDiscoverTargets".to_owned(),
                message: "missing discover".to_owned(),
            })?;
        self.inner.lock().discover_targets = discover;
        Ok(json!({}))
    }

    /// Forward a command to the physical attachment addressed by
    /// `(tab, sessionId)`.
    async fn forward(
        &self,
        method: &str,
        params: Option<Value>,
        session_id: Option<CdpSessionId>,
    ) -> Result<Value, RouterError> {
        let attachment = self.ensure_attached().await?;
        let route = {
            let inner = self.inner.lock();
            match &session_id {
                None => Route::Tab,
                Some(sid) => {
                    let session = inner
                        .sessions
                        .get(sid)
                        .ok_or_else(|| RouterError::SessionNotFound(sid.clone()))?;
                    if session.is_root {
                        // The root session is a client-facing fiction; on the
                        // wire, root traffic addresses the tab directly.
                        Route::Tab
                    } else if session.link == SessionLink::Envelope {
                        Route::Envelope(session.session_id.clone())
                    } else {
                        Route::Flat(session.session_id.clone())
                    }
                }
            }
        };

        match route {
            Route::Tab => Ok(self
                .api
                .send_command(attachment.tab, method, params, None)
                .await?),
            Route::Flat(sid) => Ok(self
                .api
                .send_command(attachment.tab, method, params, Some(&sid))
                .await?),
            Route::Envelope(sid) => self.send_enveloped(attachment.tab, &sid, method, params).await,
        }
    }

    /// Tunnel a command through `Target.sendMessageToTarget` and await the
    /// nested reply resolved by the event pump.
    async fn send_enveloped(
        &self,
        tab: TabId,
        session_id: &CdpSessionId,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value, RouterError> {
        let id = self.next_nested_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        let _ = self.nested_pending.lock().insert(id, tx);

        let message = serde_json::to_string(&json!({
            "id": id,
            "method": method,
            "params": params.unwrap_or_else(|| json!({})),
        }))
        .map_err(|e| RouterError::InvalidParams {
            method: method.to_owned(),
            message: e.to_string(),
        })?;

        let sent = self
            .api
            .send_command(
                tab,
                "Target.sendMessageToTarget",
                Some(json!({ "sessionId": session_id, "message": message })),
                None,
            )
            .await;
        if let Err(err) = sent {
            let _ = self.nested_pending.lock().remove(&id);
            return Err(RouterError::Debugger(err));
        }

        match tokio::time::timeout(NESTED_REPLY_TIMEOUT, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) | Err(_) => {
                let _ = self.nested_pending.lock().remove(&id);
                Err(RouterError::Debugger(DebuggerError::Command {
                    method: method.to_owned(),
                    message: "nested reply timed out".to_owned(),
                }))
            }
        }
    }

    async fn handle_notice(&self, notice: DebuggerNotice) {
        match notice {
            DebuggerNotice::Event {
                tab,
                method,
                params,
                session_id,
            } => self.handle_native_event(tab, &method, params, session_id).await,
            DebuggerNotice::Detached { tab, reason } => {
                let ours = {
                    let mut inner = self.inner.lock();
                    let ours = inner.attachment.map(|a| a.tab) == Some(tab);
                    if ours {
                        inner.attachment = None;
                        inner.sessions.clear();
                        inner.last_auto_attach = None;
                    }
                    ours
                };
                if ours {
                    let _ = self.notices.send(RouterNotice::Detached { tab, reason });
                }
            }
        }
    }

    async fn handle_native_event(
        &self,
        tab: TabId,
        method: &str,
        params: Value,
        session_id: Option<CdpSessionId>,
    ) {
        if self.inner.lock().attachment.map(|a| a.tab) != Some(tab) {
            debug!(tab = tab.raw(), method, "event for unattached tab dropped");
            return;
        }

        if method == "Target.receivedMessageFromTarget" {
            self.handle_envelope(tab, &params, session_id);
            return;
        }
        if method == "Target.attachedToTarget" {
            self.handle_out_of_band_child(tab, &params).await;
            return;
        }

        // Route to a live logical session or drop.
        let resolved = {
            let inner = self.inner.lock();
            match session_id {
                Some(sid) if inner.sessions.contains(&sid) => Some(Some(sid)),
                Some(_) => None,
                None => inner
                    .sessions
                    .root()
                    .map(|root| Some(root.session_id.clone())),
            }
        };
        match resolved {
            Some(tag) => self.emit(CdpEvent {
                method: method.to_owned(),
                params,
                session_id: tag,
            }),
            None => debug!(method, "event for dead logical session dropped"),
        }
    }

    fn handle_envelope(&self, tab: TabId, params: &Value, raw_session: Option<CdpSessionId>) {
        match decode_nested(params) {
            Nested::Response { id, result, error } => {
                let Some(tx) = self.nested_pending.lock().remove(&id) else {
                    debug!(id, "nested reply for unknown inner id dropped");
                    return;
                };
                let outcome = match error {
                    Some(err) => Err(RouterError::Debugger(DebuggerError::Command {
                        method: "Target.sendMessageToTarget".to_owned(),
                        message: err
                            .get("message")
                            .and_then(Value::as_str)
                            .unwrap_or("nested command failed")
                            .to_owned(),
                    })),
                    None => Ok(result.unwrap_or(Value::Null)),
                };
                let _ = tx.send(outcome);
            }
            Nested::Event {
                method,
                params: inner_params,
            } => {
                // A child attach announced inside the tunnel: the platform
                // only speaks to this child through the envelope, so adopt
                // it with an envelope link before forwarding the event.
                if method == "Target.attachedToTarget" {
                    self.adopt_envelope_child(tab, &inner_params);
                    self.emit(CdpEvent {
                        method,
                        params: inner_params,
                        session_id: None,
                    });
                    return;
                }
                let sid = params
                    .get("sessionId")
                    .and_then(Value::as_str)
                    .map(CdpSessionId::from);
                let live = sid
                    .as_ref()
                    .is_some_and(|sid| self.inner.lock().sessions.contains(sid));
                if live {
                    self.emit(CdpEvent {
                        method,
                        params: inner_params,
                        session_id: sid,
                    });
                } else {
                    debug!(method, "nested event for dead session dropped");
                }
            }
            Nested::Unparseable => {
                // Explicit fallback: forward the raw envelope event.
                let live = raw_session
                    .as_ref()
                    .is_none_or(|sid| self.inner.lock().sessions.contains(sid));
                if live {
                    self.emit(CdpEvent {
                        method: "Target.receivedMessageFromTarget".to_owned(),
                        params: params.clone(),
                        session_id: raw_session,
                    });
                }
            }
        }
    }

    /// Register a child session announced through the target-relay envelope.
    /// Commands for it are tunnelled via `Target.sendMessageToTarget` and
    /// replies come back as nested messages.
    fn adopt_envelope_child(&self, tab: TabId, params: &Value) {
        let Some(child_sid) = params
            .get("sessionId")
            .and_then(Value::as_str)
            .map(CdpSessionId::from)
        else {
            debug!("enveloped attachedToTarget without sessionId dropped");
            return;
        };
        let target_id = params
            .get("targetInfo")
            .and_then(|info| info.get("targetId"))
            .and_then(Value::as_str)
            .map_or_else(TargetId::new, TargetId::from);

        let mut inner = self.inner.lock();
        if !inner.targets.contains(&target_id) {
            let mut info = TargetInfo::page(tab, "", local::DEFAULT_BROWSER_CONTEXT);
            info.target_id = target_id.clone();
            info.attached = true;
            if let Some(url) = params
                .get("targetInfo")
                .and_then(|info| info.get("url"))
                .and_then(Value::as_str)
            {
                info.url = url.to_owned();
            }
            inner.targets.insert(info);
        }
        inner
            .sessions
            .adopt_child(child_sid, target_id, tab, SessionLink::Envelope);
    }

    /// The platform reported a new auto-attached child out-of-band: adopt
    /// it, reissue the last `setAutoAttach` params against it so the remote
    /// client's recursive auto-attach holds, and forward the event.
    async fn handle_out_of_band_child(&self, tab: TabId, params: &Value) {
        let Some(child_sid) = params
            .get("sessionId")
            .and_then(Value::as_str)
            .map(CdpSessionId::from)
        else {
            debug!("attachedToTarget without sessionId dropped");
            return;
        };
        let target_id = params
            .get("targetInfo")
            .and_then(|info| info.get("targetId"))
            .and_then(Value::as_str)
            .map_or_else(TargetId::new, TargetId::from);

        let reissue = {
            let mut inner = self.inner.lock();
            if !inner.targets.contains(&target_id) {
                let mut info = TargetInfo::page(tab, "", local::DEFAULT_BROWSER_CONTEXT);
                info.target_id = target_id.clone();
                info.attached = true;
                if let Some(url) = params
                    .get("targetInfo")
                    .and_then(|info| info.get("url"))
                    .and_then(Value::as_str)
                {
                    info.url = url.to_owned();
                }
                inner.targets.insert(info);
            }
            inner
                .sessions
                .adopt_child(child_sid.clone(), target_id, tab, SessionLink::Flat);
            inner.last_auto_attach.clone()
        };

        if let Some(auto_attach_params) = reissue {
            if let Err(err) = self
                .api
                .send_command(
                    tab,
                    "Target.setAutoAttach",
                    Some(auto_attach_params),
                    Some(&child_sid),
                )
                .await
            {
                debug!(error = %err, "auto-attach reissue to child failed");
            }
        }

        self.emit(CdpEvent {
            method: "Target.attachedToTarget".to_owned(),
            params: params.clone(),
            session_id: None,
        });
    }

    fn emit(&self, event: CdpEvent) {
        let _ = self.notices.send(RouterNotice::Event(event));
    }
}

enum Route {
    Tab,
    Flat(CdpSessionId),
    Envelope(CdpSessionId),
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
