//! Wire error-code constants.
//!
//! Codes are snake_case because the handshake fixes `not_supported` on the
//! wire; everything else follows suit. Upstream lease-error codes are
//! forwarded verbatim and are not enumerated here.

/// Protocol version or capability mismatch during the handshake.
pub const NOT_SUPPORTED: &str = "not_supported";
/// No ack arrived within the handshake deadline.
pub const HANDSHAKE_TIMEOUT: &str = "handshake_timeout";
/// Socket closed before the handshake completed.
pub const HANDSHAKE_FAILED: &str = "handshake_failed";
/// Dialing the remote endpoint failed.
pub const CONNECT_FAILED: &str = "connect_failed";
/// Socket closed while the operation was in flight.
pub const SOCKET_CLOSED: &str = "socket_closed";
/// Serialized request exceeds the negotiated `maxPayloadBytes`.
pub const OVERSIZED_PAYLOAD: &str = "oversized_payload";
/// No reply within the per-request deadline.
pub const REQUEST_TIMEOUT: &str = "request_timeout";
/// Frame or reassembled payload failed to parse.
pub const PARSE_ERROR: &str = "parse_error";
/// Write onto the transport failed.
pub const SEND_FAILED: &str = "send_failed";
/// Missing or malformed command parameters.
pub const INVALID_PARAMS: &str = "invalid_params";
/// Command name not registered.
pub const COMMAND_NOT_FOUND: &str = "command_not_found";
/// Unexpected internal failure.
pub const INTERNAL_ERROR: &str = "internal_error";
/// The platform lacks flat (session-id-addressed) command routing.
pub const CAPABILITY_REQUIRED: &str = "capability_required";
/// Attach retries and fallbacks were exhausted.
pub const ATTACH_FAILED: &str = "attach_failed";
/// Referenced ops session does not exist.
pub const SESSION_NOT_FOUND: &str = "session_not_found";
/// Referenced ops session was recently closed.
pub const SESSION_CLOSED: &str = "session_closed";
/// Admission refused: the governor's effective cap is reached.
pub const MAX_SESSIONS_REACHED: &str = "max_sessions_reached";
/// The session requires a lease on session-scoped requests.
pub const LEASE_REQUIRED: &str = "lease_required";
/// Element reference did not resolve against the session's ref store.
pub const REF_NOT_FOUND: &str = "ref_not_found";
/// Too many consecutive unacknowledged heartbeat pings.
pub const HEARTBEAT_TIMEOUT: &str = "heartbeat_timeout";

/// Websocket close code signalling a reconnect-eligible closure.
pub const CLOSE_RECONNECT: u16 = 4001;
/// Websocket close code for a deliberate local close.
pub const CLOSE_NORMAL: u16 = 1000;

/// Whether a websocket close code invites a reconnect attempt.
#[must_use]
pub fn close_code_reconnect_eligible(code: u16) -> bool {
    code == CLOSE_RECONNECT || code == 1006 || code == 1001 || code == 1012
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_snake_case() {
        let codes = [
            NOT_SUPPORTED,
            HANDSHAKE_TIMEOUT,
            HANDSHAKE_FAILED,
            CONNECT_FAILED,
            SOCKET_CLOSED,
            OVERSIZED_PAYLOAD,
            REQUEST_TIMEOUT,
            PARSE_ERROR,
            SEND_FAILED,
            INVALID_PARAMS,
            COMMAND_NOT_FOUND,
            INTERNAL_ERROR,
            CAPABILITY_REQUIRED,
            ATTACH_FAILED,
            SESSION_NOT_FOUND,
            SESSION_CLOSED,
            MAX_SESSIONS_REACHED,
            LEASE_REQUIRED,
            REF_NOT_FOUND,
            HEARTBEAT_TIMEOUT,
        ];
        for code in codes {
            assert!(
                code.chars().all(|c| c.is_ascii_lowercase() || c == '_'),
                "code '{code}' must be snake_case"
            );
        }
    }

    #[test]
    fn reconnect_eligibility() {
        assert!(close_code_reconnect_eligible(CLOSE_RECONNECT));
        assert!(close_code_reconnect_eligible(1006));
        assert!(!close_code_reconnect_eligible(CLOSE_NORMAL));
        assert!(!close_code_reconnect_eligible(1002));
    }
}
