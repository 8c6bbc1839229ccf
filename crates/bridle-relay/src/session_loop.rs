//! Ops websocket session lifecycle: handshake, frame dispatch, heartbeat,
//! and disconnect cleanup for a single connected client.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use bridle_core::ClientId;
use bridle_ops::frames::{OpsErrorBody, OpsFrame};
use bridle_ops::{PROTOCOL_VERSION, codes};
use futures::stream::SplitStream;
use futures::{SinkExt, StreamExt};
use metrics::{counter, gauge};
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use crate::chunker;
use crate::commands::{CommandContext, CommandRequest};
use crate::connection::{OpsClientConn, SEND_QUEUE_DEPTH};
use crate::metrics::{
    OPS_CONNECTIONS_ACTIVE, OPS_CONNECTIONS_TOTAL, OPS_DISCONNECTIONS_TOTAL,
    OPS_HANDSHAKES_REJECTED_TOTAL, OPS_HEARTBEAT_CLOSES_TOTAL, SESSIONS_ACTIVE,
    SESSIONS_CLOSED_TOTAL,
};
use crate::server::AppState;

/// Capabilities the server advertises in the handshake ack.
pub const SERVER_CAPABILITIES: &[&str] = &["chunking", "heartbeat"];

/// Run an ops session on an upgraded websocket: handshake first, then the
/// request/heartbeat loop until the client leaves or the relay shuts down.
#[instrument(skip_all)]
pub async fn run_ops_session(ws: WebSocket, state: AppState) {
    let (mut ws_tx, mut ws_rx) = ws.split();

    // The first frame must be ops_hello, within the deadline.
    let deadline = Duration::from_millis(state.config.handshake_timeout_ms);
    let hello = tokio::time::timeout(deadline, next_frame(&mut ws_rx)).await;
    let (version, client_capabilities) = match hello {
        Ok(Some(OpsFrame::Hello {
            version,
            capabilities,
        })) => (version, capabilities),
        Ok(_) => {
            counter!(OPS_HANDSHAKES_REJECTED_TOTAL).increment(1);
            reject(&mut ws_tx, codes::HANDSHAKE_FAILED, "expected ops_hello", None).await;
            return;
        }
        Err(_elapsed) => {
            counter!(OPS_HANDSHAKES_REJECTED_TOTAL).increment(1);
            reject(
                &mut ws_tx,
                codes::HANDSHAKE_TIMEOUT,
                "no ops_hello within the handshake deadline",
                None,
            )
            .await;
            return;
        }
    };

    if version != PROTOCOL_VERSION {
        counter!(OPS_HANDSHAKES_REJECTED_TOTAL).increment(1);
        warn!(version, "rejecting client with unsupported protocol version");
        reject(
            &mut ws_tx,
            codes::NOT_SUPPORTED,
            &format!("protocol version {version} is not supported"),
            Some(json!({ "supported": [PROTOCOL_VERSION] })),
        )
        .await;
        return;
    }

    let client_id = ClientId::new();
    let (send_tx, mut send_rx) = mpsc::channel::<OpsFrame>(SEND_QUEUE_DEPTH);
    let conn = Arc::new(OpsClientConn::new(
        client_id.clone(),
        send_tx,
        state.config.max_payload_bytes,
    ));
    state.connections.add(Arc::clone(&conn));

    info!(client_id = %client_id, capabilities = ?client_capabilities, "ops client connected");
    counter!(OPS_CONNECTIONS_TOTAL).increment(1);
    gauge!(OPS_CONNECTIONS_ACTIVE).increment(1.0);

    let ack = OpsFrame::HelloAck {
        version: PROTOCOL_VERSION,
        client_id: client_id.clone(),
        max_payload_bytes: state.config.max_payload_bytes,
        capabilities: SERVER_CAPABILITIES.iter().map(|&c| c.to_owned()).collect(),
    };
    if send_direct(&mut ws_tx, &ack).await.is_err() {
        state.connections.remove(&client_id);
        gauge!(OPS_CONNECTIONS_ACTIVE).decrement(1.0);
        return;
    }

    // Writer half: drains the send channel and drives the heartbeat.
    let heartbeat = Duration::from_secs(state.config.heartbeat_interval_secs);
    let max_missed = state.config.max_missed_pongs;
    let writer_conn = Arc::clone(&conn);
    let writer = tokio::spawn(async move {
        let mut ping_timer = tokio::time::interval(heartbeat);
        // The first tick fires immediately; skip it.
        let _ = ping_timer.tick().await;
        loop {
            tokio::select! {
                frame = send_rx.recv() => match frame {
                    Some(frame) => {
                        if send_direct(&mut ws_tx, &frame).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
                _ = ping_timer.tick() => {
                    let missed = writer_conn.record_missed_pong();
                    if missed > max_missed {
                        warn!(
                            client_id = %writer_conn.id,
                            missed,
                            "heartbeat timeout, closing socket"
                        );
                        counter!(OPS_HEARTBEAT_CLOSES_TOTAL).increment(1);
                        let close = CloseFrame {
                            code: codes::CLOSE_RECONNECT,
                            reason: codes::HEARTBEAT_TIMEOUT.into(),
                        };
                        let _ = ws_tx.send(Message::Close(Some(close))).await;
                        break;
                    }
                    let ping = OpsFrame::Ping { id: writer_conn.next_ping_id() };
                    if send_direct(&mut ws_tx, &ping).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let ctx = CommandContext {
        registry: Arc::clone(&state.registry),
        drivers: Arc::clone(&state.drivers),
        connections: Arc::clone(&state.connections),
        client_id: client_id.clone(),
    };
    let cancel = state.shutdown.token();
    let mut shutting_down = false;

    loop {
        let msg = tokio::select! {
            msg = ws_rx.next() => msg,
            () = cancel.cancelled() => {
                shutting_down = true;
                break;
            }
        };
        let Some(Ok(msg)) = msg else { break };
        let text = match msg {
            Message::Text(t) => t.to_string(),
            Message::Binary(data) => {
                debug!(len = data.len(), "ignoring binary frame");
                continue;
            }
            Message::Close(_) => {
                info!(client_id = %client_id, "client sent close frame");
                break;
            }
            Message::Ping(_) | Message::Pong(_) => continue,
        };

        match serde_json::from_str::<OpsFrame>(&text) {
            Ok(OpsFrame::Request {
                request_id,
                command,
                params,
                ops_session_id,
                lease_id,
            }) => {
                let request = CommandRequest {
                    request_id: request_id.clone(),
                    command,
                    params,
                    ops_session_id,
                    lease_id,
                };
                match state.commands.dispatch(request, &ctx).await {
                    Ok(payload) => chunker::send_response(
                        &conn,
                        request_id,
                        &payload,
                        state.config.chunk_bytes,
                    ),
                    Err(body) => {
                        let _ = conn.send(OpsFrame::request_error(request_id, body));
                    }
                }
            }
            Ok(OpsFrame::Pong { id }) => {
                debug!(id, "pong");
                conn.reset_missed_pongs();
            }
            Ok(OpsFrame::Ping { id }) => {
                let _ = conn.send(OpsFrame::Pong { id });
            }
            Ok(frame) => {
                warn!(client_id = %client_id, ?frame, "unexpected frame from client");
            }
            Err(err) => {
                let _ = conn.send(OpsFrame::Error {
                    request_id: None,
                    error: OpsErrorBody {
                        code: codes::PARSE_ERROR.to_owned(),
                        message: err.to_string(),
                        retryable: false,
                        details: None,
                    },
                });
            }
        }
    }

    // Sessions do not outlive their owning client.
    let owned: Vec<_> = state
        .registry
        .sessions()
        .into_iter()
        .filter(|s| s.owner_client_id == client_id)
        .collect();
    for session in owned {
        let reason = if shutting_down {
            "relay_shutdown"
        } else {
            "client_disconnected"
        };
        info!(client_id = %client_id, ops_session_id = %session.id, reason, "closing owned session");
        if shutting_down {
            // The socket is still up; tell the client before tearing down.
            let _ = conn.send(OpsFrame::Event {
                event: "ops_session_closed".to_owned(),
                payload: Some(json!({ "opsSessionId": session.id, "reason": reason })),
                ops_session_id: Some(session.id.clone()),
            });
        }
        if state.registry.close_session(&session.id).is_ok() {
            counter!(SESSIONS_CLOSED_TOTAL).increment(1);
        }
        let _ = state.drivers.stop(&session.id).await;
    }
    gauge!(SESSIONS_ACTIVE).set(state.registry.session_count() as f64);

    info!(client_id = %client_id, age = ?conn.age(), dropped = conn.drop_count(), "ops client disconnected");
    counter!(OPS_DISCONNECTIONS_TOTAL).increment(1);
    gauge!(OPS_CONNECTIONS_ACTIVE).decrement(1.0);
    writer.abort();
    state.connections.remove(&client_id);
}

/// Read frames until one parses, the peer closes, or the stream ends.
/// Transport pings/pongs and binary noise are skipped, not fatal.
async fn next_frame(ws_rx: &mut SplitStream<WebSocket>) -> Option<OpsFrame> {
    while let Some(Ok(msg)) = ws_rx.next().await {
        match msg {
            Message::Text(text) => match serde_json::from_str::<OpsFrame>(&text) {
                Ok(frame) => return Some(frame),
                Err(err) => {
                    debug!(%err, "unparseable frame during handshake");
                    return None;
                }
            },
            Message::Close(_) => return None,
            Message::Binary(_) | Message::Ping(_) | Message::Pong(_) => {}
        }
    }
    None
}

async fn send_direct<S>(ws_tx: &mut S, frame: &OpsFrame) -> Result<(), ()>
where
    S: SinkExt<Message> + Unpin,
{
    let text = serde_json::to_string(frame).map_err(|_| ())?;
    ws_tx.send(Message::Text(text.into())).await.map_err(|_| ())
}

/// Send a connection-level `ops_error` and close the socket.
async fn reject<S>(ws_tx: &mut S, code: &str, message: &str, details: Option<serde_json::Value>)
where
    S: SinkExt<Message> + Unpin,
{
    let frame = OpsFrame::Error {
        request_id: None,
        error: OpsErrorBody {
            code: code.to_owned(),
            message: message.to_owned(),
            retryable: false,
            details,
        },
    };
    let _ = send_direct(ws_tx, &frame).await;
    let close = CloseFrame {
        code: codes::CLOSE_NORMAL,
        reason: code.to_owned().into(),
    };
    let _ = ws_tx.send(Message::Close(Some(close))).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    // The full socket lifecycle is exercised end to end in
    // tests/integration.rs; these pin the handshake constants.

    #[test]
    fn server_capabilities_cover_chunking_and_heartbeat() {
        assert!(SERVER_CAPABILITIES.contains(&"chunking"));
        assert!(SERVER_CAPABILITIES.contains(&"heartbeat"));
    }

    #[test]
    fn rejection_details_name_supported_versions() {
        let details = json!({ "supported": [PROTOCOL_VERSION] });
        assert_eq!(details["supported"][0], PROTOCOL_VERSION);
    }
}
