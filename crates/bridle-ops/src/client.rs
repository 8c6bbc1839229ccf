//! Websocket ops client: dial, handshake, frame pumps, heartbeat, reconnect.

use std::sync::Arc;
use std::time::Duration;

use bridle_core::{ClientId, LeaseId, OpsSessionId, ReconnectPolicy};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::codes;
use crate::conn::{OpsConnection, PushEvent};
use crate::error::OpsError;
use crate::frames::OpsFrame;
use crate::heartbeat::{HeartbeatConfig, HeartbeatOutcome, run_heartbeat};
use crate::reconnect::Reconnector;

/// Default handshake deadline in milliseconds.
pub const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 5_000;
/// Default per-request deadline in milliseconds.
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;
/// Local payload bound before the handshake negotiates one.
pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 16 * 1024 * 1024;
/// Protocol version this client speaks.
pub const PROTOCOL_VERSION: u32 = 1;

/// Client configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpsClientConfig {
    /// Websocket URL of the relay's ops endpoint.
    pub url: String,
    /// Protocol version to offer (default: 1).
    #[serde(default = "default_version")]
    pub version: u32,
    /// Capabilities to offer.
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Handshake deadline in ms (default: 5000).
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    /// Per-request deadline in ms (default: 30000).
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Pre-negotiation payload bound in bytes (default: 16 MiB).
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: usize,
    /// Heartbeat parameters.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    /// Reconnect backoff parameters.
    #[serde(default)]
    pub reconnect: ReconnectPolicy,
}

fn default_version() -> u32 {
    PROTOCOL_VERSION
}
fn default_handshake_timeout_ms() -> u64 {
    DEFAULT_HANDSHAKE_TIMEOUT_MS
}
fn default_request_timeout_ms() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_MS
}
fn default_max_payload_bytes() -> usize {
    DEFAULT_MAX_PAYLOAD_BYTES
}

impl OpsClientConfig {
    /// Config with defaults for the given endpoint URL.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            version: PROTOCOL_VERSION,
            capabilities: vec!["chunking".into(), "heartbeat".into()],
            handshake_timeout_ms: DEFAULT_HANDSHAKE_TIMEOUT_MS,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
            heartbeat: HeartbeatConfig::default(),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

/// Why the socket closed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CloseReason {
    /// Websocket close code.
    pub code: u16,
    /// Close reason text.
    pub reason: String,
}

impl CloseReason {
    /// Whether the reconnect loop should re-arm for this closure.
    #[must_use]
    pub fn reconnect_eligible(&self) -> bool {
        codes::close_code_reconnect_eligible(self.code)
    }
}

enum WriterCmd {
    Frame(OpsFrame),
    Close(CloseReason),
}

/// A connected ops client.
///
/// Owns the writer/reader/heartbeat tasks for one physical connection.
/// Reconnection is explicit: await [`OpsClient::closed`], check
/// [`CloseReason::reconnect_eligible`], and dial again via
/// [`OpsClient::connect_with_retry`].
pub struct OpsClient {
    conn: Arc<OpsConnection>,
    config: OpsClientConfig,
    cancel: CancellationToken,
    close_tx: mpsc::Sender<WriterCmd>,
    closed_rx: watch::Receiver<Option<CloseReason>>,
    tasks: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for OpsClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpsClient").finish_non_exhaustive()
    }
}

impl OpsClient {
    /// Dial, handshake, and start the frame pumps.
    ///
    /// Returns the client plus the receiver of server pushes. Handshake
    /// failures are distinct: [`OpsError::HandshakeTimeout`] when no ack
    /// arrives in time, [`OpsError::HandshakeRejected`] on an error frame,
    /// [`OpsError::HandshakeFailed`] when the socket closes before the ack.
    pub async fn connect(
        config: OpsClientConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<PushEvent>), OpsError> {
        let (ws, _resp) =
            connect_async(&config.url)
                .await
                .map_err(|e| OpsError::ConnectFailed {
                    message: e.to_string(),
                })?;
        let (mut sink, mut stream) = ws.split();

        let (frame_tx, mut frame_rx) = mpsc::channel::<WriterCmd>(256);

        // The connection writes plain frames; wrap them for the writer task.
        let (raw_tx, mut raw_rx) = mpsc::channel::<OpsFrame>(256);
        let conn = Arc::new(OpsConnection::new(raw_tx, config.max_payload_bytes));
        let bridge_tx = frame_tx.clone();
        let bridge = tokio::spawn(async move {
            while let Some(frame) = raw_rx.recv().await {
                if bridge_tx.send(WriterCmd::Frame(frame)).await.is_err() {
                    break;
                }
            }
        });

        // Handshake before any pump starts.
        conn.begin_handshake();
        let hello = OpsFrame::Hello {
            version: config.version,
            capabilities: config.capabilities.clone(),
        };
        let text = serde_json::to_string(&hello).map_err(|e| OpsError::Parse {
            message: e.to_string(),
        })?;
        sink.send(Message::Text(text.into()))
            .await
            .map_err(|e| OpsError::HandshakeFailed {
                message: e.to_string(),
            })?;

        let deadline = Duration::from_millis(config.handshake_timeout_ms.max(1));
        let ack = tokio::time::timeout(deadline, async {
            loop {
                match stream.next().await {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<OpsFrame>(text.as_ref()) {
                            Ok(OpsFrame::HelloAck {
                                client_id,
                                max_payload_bytes,
                                ..
                            }) => return Ok((client_id, max_payload_bytes)),
                            Ok(OpsFrame::Error { error, .. }) => {
                                return Err(OpsError::HandshakeRejected {
                                    code: error.code,
                                    message: error.message,
                                    details: error.details,
                                });
                            }
                            Ok(_) | Err(_) => {}
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        return Err(OpsError::HandshakeFailed {
                            message: "socket closed before ack".into(),
                        });
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        return Err(OpsError::HandshakeFailed {
                            message: e.to_string(),
                        });
                    }
                }
            }
        })
        .await
        .map_err(|_| OpsError::HandshakeTimeout)??;

        let (client_id, max_payload_bytes) = ack;
        conn.complete_handshake(client_id.clone(), max_payload_bytes);
        info!(client_id = %client_id, max_payload_bytes, "ops handshake complete");

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        conn.set_event_sink(event_tx);

        let (closed_tx, closed_rx) = watch::channel(None);
        let cancel = CancellationToken::new();

        // Writer: drains frames and close commands onto the socket.
        let writer_cancel = cancel.clone();
        let writer = tokio::spawn(async move {
            loop {
                tokio::select! {
                    cmd = frame_rx.recv() => match cmd {
                        Some(WriterCmd::Frame(frame)) => {
                            let Ok(text) = serde_json::to_string(&frame) else {
                                continue;
                            };
                            if sink.send(Message::Text(text.into())).await.is_err() {
                                break;
                            }
                        }
                        Some(WriterCmd::Close(reason)) => {
                            let frame = CloseFrame {
                                code: CloseCode::from(reason.code),
                                reason: reason.reason.into(),
                            };
                            let _ = sink.send(Message::Close(Some(frame))).await;
                            break;
                        }
                        None => break,
                    },
                    () = writer_cancel.cancelled() => {
                        let frame = CloseFrame {
                            code: CloseCode::from(codes::CLOSE_NORMAL),
                            reason: "client closing".into(),
                        };
                        let _ = sink.send(Message::Close(Some(frame))).await;
                        break;
                    }
                }
            }
        });

        // Reader: feeds inbound frames into the connection.
        let reader_conn = conn.clone();
        let reader = tokio::spawn(async move {
            let mut close_reason = CloseReason {
                code: 1006,
                reason: "connection dropped".into(),
            };
            while let Some(message) = stream.next().await {
                match message {
                    Ok(Message::Text(text)) => match serde_json::from_str::<OpsFrame>(text.as_ref())
                    {
                        Ok(frame) => reader_conn.handle_frame(frame),
                        Err(e) => debug!(error = %e, "dropping unparseable frame"),
                    },
                    Ok(Message::Close(frame)) => {
                        if let Some(frame) = frame {
                            close_reason = CloseReason {
                                code: frame.code.into(),
                                reason: frame.reason.to_string(),
                            };
                        }
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        debug!(error = %e, "websocket read error");
                        break;
                    }
                }
            }
            reader_conn.close();
            let _ = closed_tx.send(Some(close_reason));
        });

        // Heartbeat: force-closes a silently-dead transport.
        let hb_conn = conn.clone();
        let hb_cancel = cancel.clone();
        let hb_close_tx = frame_tx.clone();
        let hb_config = config.heartbeat.clone();
        let heartbeat = tokio::spawn(async move {
            let outcome = run_heartbeat(hb_conn.clone(), hb_config, hb_cancel).await;
            if outcome == HeartbeatOutcome::Dead {
                warn!("heartbeat declared the transport dead, forcing close");
                let _ = hb_close_tx
                    .send(WriterCmd::Close(CloseReason {
                        code: codes::CLOSE_RECONNECT,
                        reason: codes::HEARTBEAT_TIMEOUT.into(),
                    }))
                    .await;
                hb_conn.close();
            }
        });

        Ok((
            Self {
                conn,
                config,
                cancel,
                close_tx: frame_tx,
                closed_rx,
                tasks: vec![bridge, writer, reader, heartbeat],
            },
            event_rx,
        ))
    }

    /// Dial with capped exponential backoff until connected or a
    /// non-retryable error occurs.
    pub async fn connect_with_retry(
        config: OpsClientConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<PushEvent>), OpsError> {
        let reconnector = Reconnector::new(config.reconnect.clone());
        loop {
            match Self::connect(config.clone()).await {
                Ok(connected) => {
                    reconnector.succeeded();
                    return Ok(connected);
                }
                Err(err) if err.retryable() => {
                    let Some(armed) = reconnector.try_schedule() else {
                        return Err(err);
                    };
                    warn!(
                        attempt = armed.attempt,
                        delay_ms = armed.delay.as_millis() as u64,
                        error = %err,
                        "connect failed, backing off"
                    );
                    tokio::time::sleep(armed.delay).await;
                    reconnector.begin();
                    reconnector.failed();
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Issue a correlated request.
    pub async fn request(&self, command: &str, params: Option<Value>) -> Result<Value, OpsError> {
        self.conn
            .request(
                command,
                params,
                None,
                None,
                Duration::from_millis(self.config.request_timeout_ms.max(1)),
            )
            .await
    }

    /// Issue a session-scoped request carrying a lease.
    pub async fn request_scoped(
        &self,
        command: &str,
        params: Option<Value>,
        ops_session_id: OpsSessionId,
        lease_id: Option<LeaseId>,
    ) -> Result<Value, OpsError> {
        self.conn
            .request(
                command,
                params,
                Some(ops_session_id),
                lease_id,
                Duration::from_millis(self.config.request_timeout_ms.max(1)),
            )
            .await
    }

    /// Server-assigned client id.
    pub fn client_id(&self) -> Option<ClientId> {
        self.conn.client_id()
    }

    /// Negotiated maximum serialized frame size.
    pub fn max_payload_bytes(&self) -> usize {
        self.conn.max_payload_bytes()
    }

    /// Underlying connection (for heartbeat/state inspection).
    pub fn connection(&self) -> &Arc<OpsConnection> {
        &self.conn
    }

    /// Await the socket's close reason.
    pub async fn closed(&self) -> CloseReason {
        let mut rx = self.closed_rx.clone();
        loop {
            if let Some(reason) = rx.borrow().clone() {
                return reason;
            }
            if rx.changed().await.is_err() {
                return CloseReason {
                    code: 1006,
                    reason: "connection dropped".into(),
                };
            }
        }
    }

    /// Deliberate local close (normal close code, not reconnect-eligible).
    pub async fn close(&self) {
        self.conn.begin_close();
        let _ = self
            .close_tx
            .send(WriterCmd::Close(CloseReason {
                code: codes::CLOSE_NORMAL,
                reason: "client closing".into(),
            }))
            .await;
        self.cancel.cancel();
        self.conn.close();
    }
}

impl Drop for OpsClient {
    fn drop(&mut self) {
        self.cancel.cancel();
        for task in &self.tasks {
            task.abort();
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
