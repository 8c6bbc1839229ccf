//! Client-side ops connection: handshake state, request/response
//! correlation, chunk reassembly routing, and ping bookkeeping.
//!
//! The connection owns no socket. It writes frames into an outbound channel
//! (drained by the transport's writer task) and is fed inbound frames via
//! [`OpsConnection::handle_frame`]. All suspension happens in the caller;
//! internal locks are short parking_lot sections never held across awaits.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use bridle_core::{ClientId, LeaseId, OpsSessionId, PayloadId, RequestId};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::chunk::ChunkAssembly;
use crate::error::OpsError;
use crate::frames::OpsFrame;

/// Connection lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnState {
    /// Socket dialing in progress.
    Connecting,
    /// Hello sent, ack outstanding.
    Handshaking,
    /// Handshake complete; requests flow.
    Ready,
    /// Local close initiated.
    Closing,
    /// Socket gone; all pending work rejected.
    Closed,
}

/// A server push delivered to the registered event sink.
#[derive(Clone, Debug, PartialEq)]
pub struct PushEvent {
    /// Event name.
    pub event: String,
    /// Event payload.
    pub payload: Option<Value>,
    /// Session scope, when session-scoped.
    pub ops_session_id: Option<OpsSessionId>,
}

struct PendingRequest {
    tx: oneshot::Sender<Result<Value, OpsError>>,
    command: String,
}

struct ChunkRoute {
    assembly: ChunkAssembly,
    request_id: RequestId,
}

/// One ops websocket connection.
pub struct OpsConnection {
    state: Mutex<ConnState>,
    client_id: Mutex<Option<ClientId>>,
    max_payload_bytes: AtomicUsize,
    outbound: mpsc::Sender<OpsFrame>,
    pending: Mutex<HashMap<RequestId, PendingRequest>>,
    chunks: Mutex<HashMap<PayloadId, ChunkRoute>>,
    pending_pings: Mutex<HashMap<u64, oneshot::Sender<()>>>,
    next_ping_id: AtomicU64,
    missed_pongs: AtomicU32,
    events: Mutex<Option<mpsc::UnboundedSender<PushEvent>>>,
}

impl OpsConnection {
    /// Create a connection writing frames into `outbound`.
    ///
    /// `max_payload_bytes` starts at the given local bound and is replaced
    /// by the negotiated value when the handshake completes.
    #[must_use]
    pub fn new(outbound: mpsc::Sender<OpsFrame>, max_payload_bytes: usize) -> Self {
        Self {
            state: Mutex::new(ConnState::Connecting),
            client_id: Mutex::new(None),
            max_payload_bytes: AtomicUsize::new(max_payload_bytes),
            outbound,
            pending: Mutex::new(HashMap::new()),
            chunks: Mutex::new(HashMap::new()),
            pending_pings: Mutex::new(HashMap::new()),
            next_ping_id: AtomicU64::new(1),
            missed_pongs: AtomicU32::new(0),
            events: Mutex::new(None),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnState {
        *self.state.lock()
    }

    /// Mark the hello as sent.
    pub fn begin_handshake(&self) {
        *self.state.lock() = ConnState::Handshaking;
    }

    /// Apply a handshake ack: negotiated limit, assigned client id, ready.
    pub fn complete_handshake(&self, client_id: ClientId, max_payload_bytes: usize) {
        *self.client_id.lock() = Some(client_id);
        self.max_payload_bytes
            .store(max_payload_bytes, Ordering::Relaxed);
        *self.state.lock() = ConnState::Ready;
    }

    /// Server-assigned client id, once acked.
    pub fn client_id(&self) -> Option<ClientId> {
        self.client_id.lock().clone()
    }

    /// Negotiated maximum serialized frame size.
    pub fn max_payload_bytes(&self) -> usize {
        self.max_payload_bytes.load(Ordering::Relaxed)
    }

    /// Register the sink receiving server pushes. Absence of a sink is not
    /// an error; pushes are dropped.
    pub fn set_event_sink(&self, sink: mpsc::UnboundedSender<PushEvent>) {
        *self.events.lock() = Some(sink);
    }

    /// Issue a correlated request and await its reply.
    ///
    /// Oversized requests are rejected locally before send. On timeout only
    /// this pending entry is rejected and removed; unrelated pending work on
    /// the connection is untouched.
    pub async fn request(
        &self,
        command: &str,
        params: Option<Value>,
        ops_session_id: Option<OpsSessionId>,
        lease_id: Option<LeaseId>,
        timeout: Duration,
    ) -> Result<Value, OpsError> {
        match self.state() {
            ConnState::Ready => {}
            ConnState::Closing | ConnState::Closed => return Err(OpsError::SocketClosed),
            ConnState::Connecting | ConnState::Handshaking => {
                return Err(OpsError::Internal {
                    message: "connection not ready".into(),
                });
            }
        }

        let request_id = RequestId::new();
        let frame = OpsFrame::Request {
            request_id: request_id.clone(),
            command: command.to_owned(),
            params,
            ops_session_id,
            lease_id,
        };

        let serialized = serde_json::to_string(&frame).map_err(|e| OpsError::Parse {
            message: e.to_string(),
        })?;
        let max = self.max_payload_bytes();
        if serialized.len() > max {
            return Err(OpsError::OversizedPayload {
                size: serialized.len(),
                max,
            });
        }

        let (tx, rx) = oneshot::channel();
        let _ = self.pending.lock().insert(
            request_id.clone(),
            PendingRequest {
                tx,
                command: command.to_owned(),
            },
        );

        if self.outbound.send(frame).await.is_err() {
            let _ = self.pending.lock().remove(&request_id);
            return Err(OpsError::SendFailed {
                message: "outbound channel closed".into(),
            });
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(OpsError::SocketClosed),
            Err(_) => {
                let _ = self.pending.lock().remove(&request_id);
                self.chunks
                    .lock()
                    .retain(|_, route| route.request_id != request_id);
                Err(OpsError::RequestTimeout {
                    command: command.to_owned(),
                })
            }
        }
    }

    /// Route one inbound frame.
    pub fn handle_frame(&self, frame: OpsFrame) {
        match frame {
            OpsFrame::Response {
                request_id,
                payload,
                payload_id,
                total_chunks,
                chunked,
            } => {
                if chunked {
                    self.handle_chunked_announcement(request_id, payload_id, total_chunks);
                } else {
                    self.resolve(&request_id, Ok(payload.unwrap_or(Value::Null)));
                }
            }
            OpsFrame::Chunk {
                payload_id,
                chunk_index,
                data,
                ..
            } => self.handle_chunk(&payload_id, chunk_index, &data),
            OpsFrame::Error { request_id, error } => {
                if let Some(id) = request_id {
                    self.resolve(&id, Err(OpsError::from_error_body(error)));
                } else {
                    debug!(code = %error.code, "connection-level error frame");
                }
            }
            OpsFrame::Pong { id } => {
                if let Some(tx) = self.pending_pings.lock().remove(&id) {
                    let _ = tx.send(());
                }
            }
            OpsFrame::Ping { id } => {
                // The server may probe too; answer without blocking.
                let _ = self.outbound.try_send(OpsFrame::Pong { id });
            }
            OpsFrame::Event {
                event,
                payload,
                ops_session_id,
            } => {
                let sink = self.events.lock().clone();
                if let Some(sink) = sink {
                    let _ = sink.send(PushEvent {
                        event,
                        payload,
                        ops_session_id,
                    });
                }
            }
            // Handshake frames are consumed by the transport before the
            // frame pump starts; anything arriving here is ignored.
            OpsFrame::Hello { .. } | OpsFrame::HelloAck { .. } | OpsFrame::Request { .. } => {}
        }
    }

    fn handle_chunked_announcement(
        &self,
        request_id: RequestId,
        payload_id: Option<PayloadId>,
        total_chunks: Option<u32>,
    ) {
        if !self.pending.lock().contains_key(&request_id) {
            // Raced with cancellation or disconnect; not an error.
            return;
        }
        let (Some(payload_id), Some(total)) = (payload_id, total_chunks) else {
            self.resolve(
                &request_id,
                Err(OpsError::Parse {
                    message: "chunked response missing payloadId/totalChunks".into(),
                }),
            );
            return;
        };
        if total == 0 {
            self.resolve(&request_id, Ok(Value::Null));
            return;
        }
        let _ = self.chunks.lock().insert(
            payload_id,
            ChunkRoute {
                assembly: ChunkAssembly::new(total),
                request_id,
            },
        );
    }

    fn handle_chunk(&self, payload_id: &PayloadId, index: u32, data: &str) {
        let mut chunks = self.chunks.lock();
        let Some(route) = chunks.get_mut(payload_id) else {
            // Unknown payloadId: ignored defensively.
            return;
        };
        match route.assembly.insert(index, data) {
            Ok(None) => {}
            Ok(Some(buffer)) => {
                let route = chunks.remove(payload_id).unwrap_or_else(|| unreachable!());
                drop(chunks);
                let result = serde_json::from_slice::<Value>(&buffer).map_err(|e| {
                    OpsError::Parse {
                        message: format!("reassembled payload is not valid JSON: {e}"),
                    }
                });
                self.resolve(&route.request_id, result);
            }
            Err(err) => {
                let route = chunks.remove(payload_id).unwrap_or_else(|| unreachable!());
                drop(chunks);
                warn!(payload_id = %payload_id, error = %err, "chunk reassembly failed");
                self.resolve(
                    &route.request_id,
                    Err(OpsError::Parse {
                        message: err.to_string(),
                    }),
                );
            }
        }
    }

    /// Resolve a pending request exactly once; a second reply is a no-op.
    fn resolve(&self, request_id: &RequestId, result: Result<Value, OpsError>) {
        if let Some(pending) = self.pending.lock().remove(request_id) {
            let _ = pending.tx.send(result);
        }
    }

    /// Send one heartbeat ping and await its pong.
    ///
    /// Returns `false` on timeout or transport failure; the specific pending
    /// ping is removed either way.
    pub async fn ping(&self, timeout: Duration) -> bool {
        let id = self.next_ping_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        let _ = self.pending_pings.lock().insert(id, tx);

        if self.outbound.send(OpsFrame::Ping { id }).await.is_err() {
            let _ = self.pending_pings.lock().remove(&id);
            return false;
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(())) => true,
            _ => {
                let _ = self.pending_pings.lock().remove(&id);
                false
            }
        }
    }

    /// Bump the consecutive missed-pong counter; returns the new count.
    pub fn record_missed_pong(&self) -> u32 {
        self.missed_pongs.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Reset the consecutive missed-pong counter.
    pub fn reset_missed_pongs(&self) {
        self.missed_pongs.store(0, Ordering::Relaxed);
    }

    /// Current consecutive missed-pong count.
    pub fn missed_pongs(&self) -> u32 {
        self.missed_pongs.load(Ordering::Relaxed)
    }

    /// Begin a deliberate local close.
    pub fn begin_close(&self) {
        let mut state = self.state.lock();
        if matches!(*state, ConnState::Closed) {
            return;
        }
        *state = ConnState::Closing;
    }

    /// The socket is gone: reject every pending request and ping with a
    /// closed-socket error, distinct from a timeout.
    pub fn close(&self) {
        *self.state.lock() = ConnState::Closed;
        let pending: Vec<PendingRequest> = {
            let mut map = self.pending.lock();
            map.drain().map(|(_, p)| p).collect()
        };
        for p in pending {
            debug!(command = %p.command, "rejecting pending request: socket closed");
            let _ = p.tx.send(Err(OpsError::SocketClosed));
        }
        self.pending_pings.lock().clear();
        self.chunks.lock().clear();
    }

    /// Whether the connection is closed.
    pub fn is_closed(&self) -> bool {
        matches!(self.state(), ConnState::Closed)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
