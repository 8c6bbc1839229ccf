//! Ops wire frames (JSON over a message-framed websocket).
//!
//! Every frame carries a `type` tag (`ops_hello`, `ops_request`, ...) and
//! camelCase fields. The handshake pair (`ops_hello` / `ops_hello_ack`)
//! negotiates `maxPayloadBytes`; requests and responses correlate by
//! `requestId`; a response over the negotiated size declares itself chunked
//! and is followed by `ops_chunk` frames addressed by `payloadId`.

use bridle_core::{ClientId, LeaseId, OpsSessionId, PayloadId, RequestId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Structured error body carried by `ops_error` frames.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpsErrorBody {
    /// Machine-readable snake_case code (e.g. `not_supported`).
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Whether the caller may reasonably retry. Advisory, never forcing.
    #[serde(default)]
    pub retryable: bool,
    /// Optional structured details (e.g. `{"supported": [...]}`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

/// One frame of the ops protocol.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum OpsFrame {
    /// Client greeting; opens the handshake.
    #[serde(rename = "ops_hello", rename_all = "camelCase")]
    Hello {
        /// Protocol version the client speaks.
        version: u32,
        /// Capabilities the client offers.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        capabilities: Vec<String>,
    },

    /// Server acknowledgment completing the handshake.
    #[serde(rename = "ops_hello_ack", rename_all = "camelCase")]
    HelloAck {
        /// Protocol version the server speaks.
        version: u32,
        /// Server-assigned client id.
        client_id: ClientId,
        /// Negotiated maximum serialized frame size in bytes.
        max_payload_bytes: usize,
        /// Capabilities the server offers.
        capabilities: Vec<String>,
    },

    /// Correlated request.
    #[serde(rename = "ops_request", rename_all = "camelCase")]
    Request {
        /// Correlation id, unique while pending.
        request_id: RequestId,
        /// Command name (e.g. `forwardCDPCommand`, `session.open`).
        command: String,
        /// Command parameters.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        params: Option<Value>,
        /// Session scope, when the command targets a session.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ops_session_id: Option<OpsSessionId>,
        /// Opaque lease token; forwarded, never validated by the relay.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        lease_id: Option<LeaseId>,
    },

    /// Correlated reply. Either an inline `payload` or, when `chunked`,
    /// a `payloadId`/`totalChunks` announcement followed by chunk frames.
    #[serde(rename = "ops_response", rename_all = "camelCase")]
    Response {
        /// Echoed correlation id.
        request_id: RequestId,
        /// Inline payload for non-chunked replies.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
        /// Reassembly key for chunked replies.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload_id: Option<PayloadId>,
        /// Declared chunk count for chunked replies.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        total_chunks: Option<u32>,
        /// Whether chunk frames follow.
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        chunked: bool,
    },

    /// One slice of a chunked payload, ordered by declared index.
    #[serde(rename = "ops_chunk", rename_all = "camelCase")]
    Chunk {
        /// Reassembly key from the announcing response.
        payload_id: PayloadId,
        /// Zero-based position of this slice.
        chunk_index: u32,
        /// Declared total, repeated on every chunk.
        total_chunks: u32,
        /// Base64-encoded slice bytes.
        data: String,
    },

    /// Failure frame, correlated when `requestId` is present.
    #[serde(rename = "ops_error", rename_all = "camelCase")]
    Error {
        /// Correlation id of the failed request, absent for
        /// connection-level errors (e.g. handshake rejection).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<RequestId>,
        /// Structured error body.
        error: OpsErrorBody,
    },

    /// Heartbeat probe.
    #[serde(rename = "ops_ping", rename_all = "camelCase")]
    Ping {
        /// Probe id echoed by the pong.
        id: u64,
    },

    /// Heartbeat acknowledgment.
    #[serde(rename = "ops_pong", rename_all = "camelCase")]
    Pong {
        /// Echoed probe id.
        id: u64,
    },

    /// Unsolicited server push. Carries no correlation id.
    #[serde(rename = "ops_event", rename_all = "camelCase")]
    Event {
        /// Event name (e.g. `forwardCDPEvent`, `ops_session_closed`).
        event: String,
        /// Event payload.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
        /// Session scope, when the event is session-scoped.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ops_session_id: Option<OpsSessionId>,
    },
}

impl OpsFrame {
    /// Build a plain (non-chunked) response.
    #[must_use]
    pub fn response(request_id: RequestId, payload: Value) -> Self {
        Self::Response {
            request_id,
            payload: Some(payload),
            payload_id: None,
            total_chunks: None,
            chunked: false,
        }
    }

    /// Build the announcement frame of a chunked response.
    #[must_use]
    pub fn chunked_response(request_id: RequestId, payload_id: PayloadId, total_chunks: u32) -> Self {
        Self::Response {
            request_id,
            payload: None,
            payload_id: Some(payload_id),
            total_chunks: Some(total_chunks),
            chunked: true,
        }
    }

    /// Build a correlated error frame.
    #[must_use]
    pub fn request_error(request_id: RequestId, error: OpsErrorBody) -> Self {
        Self::Error {
            request_id: Some(request_id),
            error,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // Fixtures use raw JSON strings to pin the wire shape.

    #[test]
    fn hello_roundtrip() {
        let raw = r#"{"type":"ops_hello","version":1,"capabilities":["chunking"]}"#;
        let frame: OpsFrame = serde_json::from_str(raw).unwrap();
        assert_eq!(
            frame,
            OpsFrame::Hello {
                version: 1,
                capabilities: vec!["chunking".into()],
            }
        );
        let back = serde_json::to_string(&frame).unwrap();
        assert_eq!(back, raw);
    }

    #[test]
    fn hello_without_capabilities() {
        let frame: OpsFrame = serde_json::from_str(r#"{"type":"ops_hello","version":2}"#).unwrap();
        assert_eq!(
            frame,
            OpsFrame::Hello {
                version: 2,
                capabilities: vec![],
            }
        );
        // Empty capabilities are omitted on the wire.
        let json = serde_json::to_string(&frame).unwrap();
        assert!(!json.contains("capabilities"));
    }

    #[test]
    fn hello_ack_fields_are_camel_case() {
        let frame = OpsFrame::HelloAck {
            version: 1,
            client_id: ClientId::from("client-1"),
            max_payload_bytes: 1_048_576,
            capabilities: vec!["chunking".into(), "heartbeat".into()],
        };
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains(r#""type":"ops_hello_ack""#));
        assert!(json.contains(r#""clientId":"client-1""#));
        assert!(json.contains(r#""maxPayloadBytes":1048576"#));
    }

    #[test]
    fn request_roundtrip_with_session_scope() {
        let raw = r#"{"type":"ops_request","requestId":"r1","command":"forwardCDPCommand","params":{"method":"Page.enable"},"opsSessionId":"s1","leaseId":"lease-9"}"#;
        let frame: OpsFrame = serde_json::from_str(raw).unwrap();
        let OpsFrame::Request {
            request_id,
            command,
            params,
            ops_session_id,
            lease_id,
        } = &frame
        else {
            panic!("expected request frame");
        };
        assert_eq!(request_id.as_str(), "r1");
        assert_eq!(command, "forwardCDPCommand");
        assert_eq!(params.as_ref().unwrap()["method"], "Page.enable");
        assert_eq!(ops_session_id.as_ref().unwrap().as_str(), "s1");
        assert_eq!(lease_id.as_ref().unwrap().as_str(), "lease-9");
        assert_eq!(serde_json::to_string(&frame).unwrap(), raw);
    }

    #[test]
    fn request_optional_fields_omitted() {
        let frame = OpsFrame::Request {
            request_id: RequestId::from("r2"),
            command: "session.status".into(),
            params: None,
            ops_session_id: None,
            lease_id: None,
        };
        let json = serde_json::to_string(&frame).unwrap();
        assert!(!json.contains("params"));
        assert!(!json.contains("opsSessionId"));
        assert!(!json.contains("leaseId"));
    }

    #[test]
    fn plain_response_omits_chunk_fields() {
        let frame = OpsFrame::response(RequestId::from("r3"), json!({"ok": true}));
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains(r#""payload":{"ok":true}"#));
        assert!(!json.contains("chunked"));
        assert!(!json.contains("payloadId"));
        assert!(!json.contains("totalChunks"));
    }

    #[test]
    fn chunked_response_announcement() {
        let frame = OpsFrame::chunked_response(RequestId::from("r4"), PayloadId::from("p1"), 3);
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains(r#""payloadId":"p1""#));
        assert!(json.contains(r#""totalChunks":3"#));
        assert!(json.contains(r#""chunked":true"#));
        assert!(!json.contains("payload\":"));
    }

    #[test]
    fn chunk_roundtrip() {
        let raw = r#"{"type":"ops_chunk","payloadId":"p1","chunkIndex":0,"totalChunks":2,"data":"aGVsbG8="}"#;
        let frame: OpsFrame = serde_json::from_str(raw).unwrap();
        assert_eq!(serde_json::to_string(&frame).unwrap(), raw);
    }

    #[test]
    fn error_frame_without_request_id() {
        let raw = r#"{"type":"ops_error","error":{"code":"not_supported","message":"version 9 unsupported","retryable":false,"details":{"supported":[1]}}}"#;
        let frame: OpsFrame = serde_json::from_str(raw).unwrap();
        let OpsFrame::Error { request_id, error } = &frame else {
            panic!("expected error frame");
        };
        assert!(request_id.is_none());
        assert_eq!(error.code, "not_supported");
        assert!(!error.retryable);
        assert_eq!(error.details.as_ref().unwrap()["supported"][0], 1);
    }

    #[test]
    fn error_body_retryable_defaults_false() {
        let body: OpsErrorBody =
            serde_json::from_str(r#"{"code":"internal_error","message":"boom"}"#).unwrap();
        assert!(!body.retryable);
        assert!(body.details.is_none());
    }

    #[test]
    fn ping_pong_roundtrip() {
        let ping: OpsFrame = serde_json::from_str(r#"{"type":"ops_ping","id":7}"#).unwrap();
        assert_eq!(ping, OpsFrame::Ping { id: 7 });
        let pong = serde_json::to_string(&OpsFrame::Pong { id: 7 }).unwrap();
        assert_eq!(pong, r#"{"type":"ops_pong","id":7}"#);
    }

    #[test]
    fn event_with_session_scope() {
        let raw = r#"{"type":"ops_event","event":"ops_session_closed","opsSessionId":"s1"}"#;
        let frame: OpsFrame = serde_json::from_str(raw).unwrap();
        let OpsFrame::Event {
            event,
            payload,
            ops_session_id,
        } = &frame
        else {
            panic!("expected event frame");
        };
        assert_eq!(event, "ops_session_closed");
        assert!(payload.is_none());
        assert_eq!(ops_session_id.as_ref().unwrap().as_str(), "s1");
    }

    #[test]
    fn unknown_type_tag_fails_to_parse() {
        let err = serde_json::from_str::<OpsFrame>(r#"{"type":"ops_mystery"}"#);
        assert!(err.is_err());
    }
}
