//! Decoder for the protocol-within-protocol envelope.
//!
//! Commands tunnelled through `Target.sendMessageToTarget` come back inside
//! a native `Target.receivedMessageFromTarget` event whose `message` field
//! is a JSON *string* containing either an inner response (`id` +
//! `result`/`error`) or an inner event (`method` + `params`). Decoding is a
//! three-arm tagged result so "forward the raw event" is an explicit
//! fallback, not a silent default.

use serde_json::Value;

/// Result of decoding a nested message payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Nested {
    /// Inner reply to a tunnelled command, matched by inner id.
    Response {
        /// The tunnelled command's id.
        id: u64,
        /// Success payload, absent on error.
        result: Option<Value>,
        /// CDP error object, absent on success.
        error: Option<Value>,
    },
    /// Inner unsolicited event from the sub-target.
    Event {
        /// CDP event method.
        method: String,
        /// CDP event params.
        params: Value,
    },
    /// Not a recognizable nested shape; caller forwards the raw event.
    Unparseable,
}

/// Decode the `message` field of a target-relay envelope.
///
/// `params` is the outer event's params object; the inner message is the
/// JSON string at `params.message`.
#[must_use]
pub fn decode_nested(params: &Value) -> Nested {
    let Some(raw) = params.get("message").and_then(Value::as_str) else {
        return Nested::Unparseable;
    };
    let Ok(inner) = serde_json::from_str::<Value>(raw) else {
        return Nested::Unparseable;
    };

    if let Some(id) = inner.get("id").and_then(Value::as_u64) {
        return Nested::Response {
            id,
            result: inner.get("result").cloned(),
            error: inner.get("error").cloned(),
        };
    }
    if let Some(method) = inner.get("method").and_then(Value::as_str) {
        return Nested::Event {
            method: method.to_owned(),
            params: inner.get("params").cloned().unwrap_or(Value::Null),
        };
    }
    Nested::Unparseable
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    #[test]
    fn inner_response_with_result() {
        let params = json!({
            "sessionId": "child-1",
            "message": r#"{"id":4,"result":{"frameId":"F1"}}"#,
        });
        let decoded = decode_nested(&params);
        assert_matches!(decoded, Nested::Response { id: 4, result: Some(r), error: None }
            if r["frameId"] == "F1");
    }

    #[test]
    fn inner_response_with_error() {
        let params = json!({
            "message": r#"{"id":9,"error":{"code":-32000,"message":"nope"}}"#,
        });
        let decoded = decode_nested(&params);
        assert_matches!(decoded, Nested::Response { id: 9, result: None, error: Some(e) }
            if e["message"] == "nope");
    }

    #[test]
    fn inner_event() {
        let params = json!({
            "message": r#"{"method":"Runtime.consoleAPICalled","params":{"type":"log"}}"#,
        });
        let decoded = decode_nested(&params);
        assert_matches!(decoded, Nested::Event { method, params }
            if method == "Runtime.consoleAPICalled" && params["type"] == "log");
    }

    #[test]
    fn missing_message_is_unparseable() {
        assert_eq!(decode_nested(&json!({"sessionId": "x"})), Nested::Unparseable);
    }

    #[test]
    fn non_json_message_is_unparseable() {
        let params = json!({"message": "not json at all"});
        assert_eq!(decode_nested(&params), Nested::Unparseable);
    }

    #[test]
    fn json_without_id_or_method_is_unparseable() {
        let params = json!({"message": r#"{"neither":"shape"}"#});
        assert_eq!(decode_nested(&params), Nested::Unparseable);
    }
}
