//! Per-session runtime: one CDP router, its event pump, and the bridge
//! that turns router notices into ops pushes and ring-buffer captures.

use std::sync::Arc;

use bridle_core::{OpsSessionId, TabId};
use bridle_registry::registry::SessionRegistry;
use bridle_registry::ring::{ConsoleEntry, NetworkEntry};
use bridle_registry::session::OpsSession;
use bridle_router::debugger::DebuggerApi;
use bridle_router::router::{CdpEvent, CdpRouter, RouterNotice};
use chrono::Utc;
use dashmap::DashMap;
use metrics::counter;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::broadcast::ConnectionRegistry;
use crate::metrics::SESSIONS_CLOSED_TOTAL;

/// Produces a debugger attachment surface for a new session.
///
/// The relay never talks to the host platform directly; sessions get their
/// debugger through this seam so tests (and the stub binary) can inject a
/// scriptable implementation.
pub trait DebuggerFactory: Send + Sync {
    /// The debugger a session opened on `tab` should route through.
    fn debugger_for(&self, tab: TabId) -> Arc<dyn DebuggerApi>;
}

/// A factory handing every session the same debugger instance.
pub struct SharedDebuggerFactory {
    api: Arc<dyn DebuggerApi>,
}

impl SharedDebuggerFactory {
    pub fn new(api: Arc<dyn DebuggerApi>) -> Self {
        Self { api }
    }
}

impl DebuggerFactory for SharedDebuggerFactory {
    fn debugger_for(&self, _tab: TabId) -> Arc<dyn DebuggerApi> {
        Arc::clone(&self.api)
    }
}

/// Live runtime attached to one ops session.
pub struct SessionDriver {
    /// The registry session this driver serves.
    pub session: Arc<OpsSession>,
    /// The session's CDP router.
    pub router: Arc<CdpRouter>,
    cancel: CancellationToken,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl SessionDriver {
    /// Stop the pumps and detach the router.
    pub async fn stop(&self) {
        self.cancel.cancel();
        self.router.shutdown().await;
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

/// All live session drivers, keyed by ops session id.
pub struct SessionDrivers {
    drivers: DashMap<OpsSessionId, Arc<SessionDriver>>,
    factory: Arc<dyn DebuggerFactory>,
    registry: Arc<SessionRegistry>,
    connections: Arc<ConnectionRegistry>,
}

impl SessionDrivers {
    pub fn new(
        factory: Arc<dyn DebuggerFactory>,
        registry: Arc<SessionRegistry>,
        connections: Arc<ConnectionRegistry>,
    ) -> Self {
        Self {
            drivers: DashMap::new(),
            factory,
            registry,
            connections,
        }
    }

    /// Build and start the runtime for a freshly opened session.
    pub fn start(self: &Arc<Self>, session: Arc<OpsSession>) -> Arc<SessionDriver> {
        let api = self.factory.debugger_for(session.primary_tab);
        let (router, notice_rx) = CdpRouter::new(api, session.primary_tab);
        let cancel = CancellationToken::new();

        let pump = router.start_event_pump(cancel.clone());
        let bridge = tokio::spawn(run_notice_bridge(
            Arc::clone(self),
            Arc::clone(&session),
            notice_rx,
            cancel.clone(),
        ));

        let driver = Arc::new(SessionDriver {
            session: Arc::clone(&session),
            router,
            cancel,
            tasks: parking_lot::Mutex::new(vec![pump, bridge]),
        });
        let _ = self
            .drivers
            .insert(session.id.clone(), Arc::clone(&driver));
        driver
    }

    pub fn get(&self, id: &OpsSessionId) -> Option<Arc<SessionDriver>> {
        self.drivers.get(id).map(|d| Arc::clone(&d))
    }

    /// Remove and stop one driver. Returns whether it existed.
    pub async fn stop(&self, id: &OpsSessionId) -> bool {
        let Some((_, driver)) = self.drivers.remove(id) else {
            return false;
        };
        driver.stop().await;
        true
    }

    /// Stop every driver, for shutdown.
    pub async fn stop_all(&self) {
        let ids: Vec<OpsSessionId> = self.drivers.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            let _ = self.stop(&id).await;
        }
    }

    pub fn len(&self) -> usize {
        self.drivers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.drivers.is_empty()
    }

    /// The platform dropped the session's attachment: close the session,
    /// tell the owner, and drop the driver.
    async fn hard_detach(&self, session: &OpsSession, reason: &str) {
        warn!(ops_session_id = %session.id, reason, "attachment lost, closing session");
        // No task aborts here: this runs on the bridge task itself, which
        // exits right after; the cancelled token stops the pump.
        if let Some((_, driver)) = self.drivers.remove(&session.id) {
            driver.cancel.cancel();
        }
        if self.registry.close_session(&session.id).is_ok() {
            counter!(SESSIONS_CLOSED_TOTAL).increment(1);
        }
        self.connections.push_event(
            &session.owner_client_id,
            "ops_session_closed",
            Some(json!({ "reason": reason })),
            Some(session.id.clone()),
        );
    }
}

/// Forward router notices to the owning client and feed the session's
/// console/network rings from the event stream.
async fn run_notice_bridge(
    drivers: Arc<SessionDrivers>,
    session: Arc<OpsSession>,
    mut notices: mpsc::UnboundedReceiver<RouterNotice>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            notice = notices.recv() => match notice {
                Some(RouterNotice::Event(event)) => {
                    capture(&session, &event);
                    let mut payload = json!({
                        "method": event.method,
                        "params": event.params,
                    });
                    if let Some(sid) = &event.session_id {
                        payload["sessionId"] = json!(sid);
                    }
                    drivers.connections.push_event(
                        &session.owner_client_id,
                        "forwardCDPEvent",
                        Some(payload),
                        Some(session.id.clone()),
                    );
                }
                Some(RouterNotice::Detached { reason, .. }) => {
                    drivers.hard_detach(&session, &reason).await;
                    break;
                }
                None => break,
            },
            () = cancel.cancelled() => break,
        }
    }
    info!(ops_session_id = %session.id, "notice bridge stopped");
}

/// Record console/network events into the session's ring buffers.
fn capture(session: &OpsSession, event: &CdpEvent) {
    let target_id = session.active_target().map(|t| t.to_string());
    match event.method.as_str() {
        "Runtime.consoleAPICalled" => {
            let level = event.params["type"].as_str().unwrap_or("log").to_owned();
            let text = console_text(&event.params);
            let _ = session.push_console(ConsoleEntry {
                level,
                text,
                target_id,
                timestamp: Utc::now(),
            });
        }
        "Network.responseReceived" => {
            let response = &event.params["response"];
            let _ = session.push_network(NetworkEntry {
                url: response["url"].as_str().unwrap_or_default().to_owned(),
                status: u16::try_from(response["status"].as_u64().unwrap_or(0)).unwrap_or(0),
                mime_type: response["mimeType"].as_str().map(str::to_owned),
                target_id,
                timestamp: Utc::now(),
            });
        }
        _ => {}
    }
}

/// Flatten console call arguments into one line of text.
fn console_text(params: &Value) -> String {
    let Some(args) = params["args"].as_array() else {
        return String::new();
    };
    args.iter()
        .map(|arg| match &arg["value"] {
            Value::String(s) => s.clone(),
            Value::Null => arg["description"].as_str().unwrap_or("").to_owned(),
            other => other.to_string(),
        })
        .collect::<Vec<_>>()
        .join(" ")
}
