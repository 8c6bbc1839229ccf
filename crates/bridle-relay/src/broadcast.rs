//! Push fan-out to connected ops clients.
//!
//! Session events go to the session's owning client only; shutdown notices
//! broadcast to everyone still connected.

use std::sync::Arc;

use bridle_core::{ClientId, OpsSessionId};
use bridle_ops::OpsFrame;
use dashmap::DashMap;
use metrics::counter;
use serde_json::Value;
use tracing::{debug, warn};

use crate::connection::OpsClientConn;
use crate::metrics::OPS_EVENTS_PUSHED_TOTAL;

/// Registry of connected ops clients, keyed by client id.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: DashMap<ClientId, Arc<OpsClientConn>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, conn: Arc<OpsClientConn>) {
        let _ = self.connections.insert(conn.id.clone(), conn);
    }

    pub fn remove(&self, client_id: &ClientId) {
        let _ = self.connections.remove(client_id);
    }

    pub fn get(&self, client_id: &ClientId) -> Option<Arc<OpsClientConn>> {
        self.connections.get(client_id).map(|c| Arc::clone(&c))
    }

    /// Number of live connections.
    pub fn count(&self) -> usize {
        self.connections.len()
    }

    /// Push an `ops_event` to one client. Silently a no-op when the client
    /// is gone; a full channel is logged and counted by the connection.
    pub fn push_event(
        &self,
        client_id: &ClientId,
        event: &str,
        payload: Option<Value>,
        ops_session_id: Option<OpsSessionId>,
    ) {
        let Some(conn) = self.get(client_id) else {
            debug!(%client_id, event, "push target not connected");
            return;
        };
        counter!(OPS_EVENTS_PUSHED_TOTAL, "event" => event.to_owned()).increment(1);
        let sent = conn.send(OpsFrame::Event {
            event: event.to_owned(),
            payload,
            ops_session_id,
        });
        if !sent {
            warn!(%client_id, event, "push dropped, client channel full or closed");
        }
    }

    /// Broadcast an `ops_event` to every connected client.
    pub fn broadcast_event(&self, event: &str, payload: Option<Value>) {
        for conn in &self.connections {
            counter!(OPS_EVENTS_PUSHED_TOTAL, "event" => event.to_owned()).increment(1);
            let _ = conn.send(OpsFrame::Event {
                event: event.to_owned(),
                payload: payload.clone(),
                ops_session_id: None,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::sync::mpsc;

    fn connect(registry: &ConnectionRegistry, id: &str) -> mpsc::Receiver<OpsFrame> {
        let (tx, rx) = mpsc::channel(16);
        registry.add(Arc::new(OpsClientConn::new(ClientId::from(id), tx, 1024)));
        rx
    }

    #[tokio::test]
    async fn push_reaches_only_the_owner() {
        let registry = ConnectionRegistry::new();
        let mut owner_rx = connect(&registry, "owner");
        let mut other_rx = connect(&registry, "other");

        registry.push_event(
            &ClientId::from("owner"),
            "ops_session_closed",
            None,
            Some(OpsSessionId::from("s1")),
        );

        let frame = owner_rx.recv().await.unwrap();
        let OpsFrame::Event { event, .. } = frame else {
            panic!("expected event frame");
        };
        assert_eq!(event, "ops_session_closed");
        assert!(other_rx.try_recv().is_err());
    }

    #[test]
    fn push_to_missing_client_is_noop() {
        let registry = ConnectionRegistry::new();
        registry.push_event(&ClientId::from("ghost"), "ops_session_closed", None, None);
        assert_eq!(registry.count(), 0);
    }

    #[tokio::test]
    async fn broadcast_reaches_everyone() {
        let registry = ConnectionRegistry::new();
        let mut rx1 = connect(&registry, "a");
        let mut rx2 = connect(&registry, "b");

        registry.broadcast_event("relay_shutdown", Some(json!({"reason": "drain"})));

        assert!(rx1.recv().await.is_some());
        assert!(rx2.recv().await.is_some());
    }

    #[test]
    fn remove_drops_connection() {
        let registry = ConnectionRegistry::new();
        let _rx = connect(&registry, "a");
        assert_eq!(registry.count(), 1);
        registry.remove(&ClientId::from("a"));
        assert_eq!(registry.count(), 0);
    }
}
