//! Transport and protocol error type.

use serde_json::Value;

use crate::codes;
use crate::frames::OpsErrorBody;

/// Errors surfaced by the ops transport and the relay's command surface.
///
/// Transport variants fail the specific in-flight operation and are never
/// retried by the transport itself; [`OpsError::Protocol`] carries a remote
/// error body verbatim, its `retryable` flag advising (not forcing) a
/// caller-side retry.
#[derive(Debug, Clone, thiserror::Error)]
pub enum OpsError {
    /// Dialing the remote endpoint failed.
    #[error("connect failed: {message}")]
    ConnectFailed {
        /// Underlying transport description.
        message: String,
    },

    /// No handshake ack within the deadline.
    #[error("handshake timed out")]
    HandshakeTimeout,

    /// Socket closed before the handshake completed.
    #[error("handshake failed: {message}")]
    HandshakeFailed {
        /// What interrupted the handshake.
        message: String,
    },

    /// The server refused the handshake with an error frame.
    #[error("handshake rejected ({code}): {message}")]
    HandshakeRejected {
        /// Server-sent code (e.g. `not_supported`).
        code: String,
        /// Server-sent message.
        message: String,
        /// Server-sent details (e.g. supported versions).
        details: Option<Value>,
    },

    /// Socket closed while the operation was pending. Distinct from a
    /// timeout: the whole connection is gone, not just this request.
    #[error("socket closed")]
    SocketClosed,

    /// Serialized request exceeds the negotiated limit; never transmitted.
    #[error("payload of {size} bytes exceeds negotiated maximum of {max}")]
    OversizedPayload {
        /// Serialized request size.
        size: usize,
        /// Negotiated `maxPayloadBytes`.
        max: usize,
    },

    /// The specific pending request hit its deadline.
    #[error("request '{command}' timed out")]
    RequestTimeout {
        /// Command that timed out.
        command: String,
    },

    /// A frame or reassembled payload failed to parse.
    #[error("parse error: {message}")]
    Parse {
        /// Parser description.
        message: String,
    },

    /// Writing onto the transport failed.
    #[error("send failed: {message}")]
    SendFailed {
        /// Underlying transport description.
        message: String,
    },

    /// Missing or malformed parameters.
    #[error("{message}")]
    InvalidParams {
        /// What is wrong.
        message: String,
    },

    /// Command name not registered.
    #[error("command '{command}' not found")]
    CommandNotFound {
        /// Requested command.
        command: String,
    },

    /// Structured remote error, code carried verbatim.
    #[error("{message}")]
    Protocol {
        /// Remote code, forwarded unchanged.
        code: String,
        /// Remote message.
        message: String,
        /// Remote retry advice.
        retryable: bool,
        /// Remote structured details.
        details: Option<Value>,
    },

    /// Unexpected internal failure.
    #[error("{message}")]
    Internal {
        /// Description.
        message: String,
    },
}

impl OpsError {
    /// Machine-readable snake_case code for this variant.
    #[must_use]
    pub fn code(&self) -> &str {
        match self {
            Self::ConnectFailed { .. } => codes::CONNECT_FAILED,
            Self::HandshakeTimeout => codes::HANDSHAKE_TIMEOUT,
            Self::HandshakeFailed { .. } => codes::HANDSHAKE_FAILED,
            Self::HandshakeRejected { code, .. } | Self::Protocol { code, .. } => code,
            Self::SocketClosed => codes::SOCKET_CLOSED,
            Self::OversizedPayload { .. } => codes::OVERSIZED_PAYLOAD,
            Self::RequestTimeout { .. } => codes::REQUEST_TIMEOUT,
            Self::Parse { .. } => codes::PARSE_ERROR,
            Self::SendFailed { .. } => codes::SEND_FAILED,
            Self::InvalidParams { .. } => codes::INVALID_PARAMS,
            Self::CommandNotFound { .. } => codes::COMMAND_NOT_FOUND,
            Self::Internal { .. } => codes::INTERNAL_ERROR,
        }
    }

    /// Whether a retry may reasonably succeed.
    #[must_use]
    pub fn retryable(&self) -> bool {
        match self {
            Self::ConnectFailed { .. }
            | Self::HandshakeTimeout
            | Self::SocketClosed
            | Self::RequestTimeout { .. }
            | Self::SendFailed { .. } => true,
            Self::Protocol { retryable, .. } => *retryable,
            Self::HandshakeFailed { .. }
            | Self::HandshakeRejected { .. }
            | Self::OversizedPayload { .. }
            | Self::Parse { .. }
            | Self::InvalidParams { .. }
            | Self::CommandNotFound { .. }
            | Self::Internal { .. } => false,
        }
    }

    /// Convert to the wire error body.
    #[must_use]
    pub fn to_error_body(&self) -> OpsErrorBody {
        OpsErrorBody {
            code: self.code().to_owned(),
            message: self.to_string(),
            retryable: self.retryable(),
            details: match self {
                Self::HandshakeRejected { details, .. } | Self::Protocol { details, .. } => {
                    details.clone()
                }
                _ => None,
            },
        }
    }

    /// Wrap a received error body, carrying the remote code verbatim.
    #[must_use]
    pub fn from_error_body(body: OpsErrorBody) -> Self {
        Self::Protocol {
            code: body.code,
            message: body.message,
            retryable: body.retryable,
            details: body.details,
        }
    }
}
