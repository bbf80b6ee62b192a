//! SocketCluster wire envelopes and inbound classification.
//!
//! Envelopes are plain JSON objects with optional `event`, `data`, `cid`,
//! `rid` and `error` members. Absent members stay absent on the wire,
//! which is how "no ack requested" is distinguished from "ack with null".

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde_json::{Value, json};

use crate::error::{ScError, ScResult};

/// Client-assigned call identifier; echoed back by the server as `rid`.
pub type CallId = u64;

/// In-band SocketCluster ping, sent by the server as a bare 2-byte message.
pub const PING_FRAME: &[u8] = b"#1";
/// In-band reply to [`PING_FRAME`].
pub const PONG_FRAME: &[u8] = b"#2";

/// The `#handshake` envelope, first thing sent after the WebSocket upgrade.
pub fn handshake(cid: CallId) -> Value {
    json!({ "event": "#handshake", "data": null, "cid": cid })
}

/// An application `emit` envelope; `cid` is present only when a response
/// is requested.
pub fn emit(event: &str, data: Value, cid: Option<CallId>) -> Value {
    let mut envelope = json!({ "event": event, "data": data });
    if let Some(cid) = cid {
        envelope["cid"] = cid.into();
    }
    envelope
}

/// A `#subscribe` request for one channel, with optional subscriber data.
pub fn subscribe(channel: &str, data: Option<Value>, cid: CallId) -> Value {
    let mut sub = json!({ "channel": channel });
    if let Some(data) = data {
        sub["data"] = data;
    }
    json!({ "event": "#subscribe", "data": sub, "cid": cid })
}

/// A `#unsubscribe` notification; no ack is requested.
pub fn unsubscribe(channel: &str) -> Value {
    json!({ "event": "#unsubscribe", "data": channel })
}

/// A response to a server-initiated event that carried a `cid`.
pub fn response(rid: CallId, data: Value) -> Value {
    json!({ "rid": rid, "data": data })
}

/// Classification of one inbound envelope.
///
/// Exactly one class applies per envelope. `rid == 1` with no `event` is
/// the handshake ack: the first cid spent on a connection is always the
/// handshake's, so the distinguished marker is reliable.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProtocolEvent {
    /// Handshake ack; marks the socket fully usable.
    IsAuthenticated,
    /// `#publish` fan-out for a channel.
    Publish,
    /// `#removeAuthToken` from the server.
    RemoveToken,
    /// `#setAuthToken` carrying a signed JWT.
    SetToken,
    /// Any other named event.
    Event,
    /// Ack for an outstanding call.
    AckReceive,
    /// Not an object, or neither `event` nor `rid` present.
    Malformed,
}

/// Classify an inbound envelope into its [`ProtocolEvent`].
pub fn classify(payload: &Value) -> ProtocolEvent {
    let Some(object) = payload.as_object() else {
        return ProtocolEvent::Malformed;
    };

    if let Some(event) = object.get("event").and_then(Value::as_str) {
        return match event {
            "#publish" => ProtocolEvent::Publish,
            "#removeAuthToken" => ProtocolEvent::RemoveToken,
            "#setAuthToken" => ProtocolEvent::SetToken,
            _ => ProtocolEvent::Event,
        };
    }

    match object.get("rid").and_then(Value::as_u64) {
        Some(1) => ProtocolEvent::IsAuthenticated,
        Some(_) => ProtocolEvent::AckReceive,
        None => ProtocolEvent::Malformed,
    }
}

/// Decode the payload segment of a signed JWT.
///
/// Returns `Ok(None)` when the token is not in `header.payload.signature`
/// form (such tokens are ignored, not errors). Invalid base64 or JSON in
/// the payload segment is a protocol error.
pub fn decode_jwt_payload(token: &str) -> ScResult<Option<Value>> {
    let parts: Vec<&str> = token.split('.').collect();
    if parts.len() != 3 {
        return Ok(None);
    }

    let raw = URL_SAFE_NO_PAD
        .decode(parts[1])
        .map_err(|e| ScError::protocol(format!("auth token payload is not base64: {e}")))?;
    let decoded = serde_json::from_slice(&raw)
        .map_err(|e| ScError::protocol(format!("auth token payload is not JSON: {e}")))?;
    Ok(Some(decoded))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_table() {
        assert_eq!(
            classify(&json!({ "rid": 1, "data": { "id": "x" } })),
            ProtocolEvent::IsAuthenticated
        );
        assert_eq!(
            classify(&json!({ "event": "#publish", "data": {} })),
            ProtocolEvent::Publish
        );
        assert_eq!(
            classify(&json!({ "event": "#removeAuthToken" })),
            ProtocolEvent::RemoveToken
        );
        assert_eq!(
            classify(&json!({ "event": "#setAuthToken", "data": {} })),
            ProtocolEvent::SetToken
        );
        assert_eq!(
            classify(&json!({ "event": "chat.message", "data": 1 })),
            ProtocolEvent::Event
        );
        assert_eq!(classify(&json!({ "rid": 7 })), ProtocolEvent::AckReceive);
    }

    #[test]
    fn classify_rejects_non_envelopes() {
        assert_eq!(classify(&json!([1, 2])), ProtocolEvent::Malformed);
        assert_eq!(classify(&json!("#1")), ProtocolEvent::Malformed);
        assert_eq!(classify(&json!({ "data": 1 })), ProtocolEvent::Malformed);
    }

    #[test]
    fn event_name_takes_priority_over_rid() {
        // A named event with rid 1 is still an event, not a handshake ack.
        assert_eq!(
            classify(&json!({ "event": "x", "rid": 1 })),
            ProtocolEvent::Event
        );
    }

    #[test]
    fn envelope_constructors() {
        assert_eq!(
            handshake(1),
            json!({ "event": "#handshake", "data": null, "cid": 1 })
        );
        assert_eq!(
            emit("login", json!({ "user": "a" }), Some(2)),
            json!({ "event": "login", "data": { "user": "a" }, "cid": 2 })
        );
        assert_eq!(
            emit("notice", json!(1), None),
            json!({ "event": "notice", "data": 1 })
        );
        assert_eq!(
            subscribe("chat", None, 2),
            json!({ "event": "#subscribe", "data": { "channel": "chat" }, "cid": 2 })
        );
        assert_eq!(
            subscribe("chat", Some(json!({ "k": true })), 3),
            json!({
                "event": "#subscribe",
                "data": { "channel": "chat", "data": { "k": true } },
                "cid": 3
            })
        );
        assert_eq!(
            unsubscribe("chat"),
            json!({ "event": "#unsubscribe", "data": "chat" })
        );
        assert_eq!(response(5, json!("ok")), json!({ "rid": 5, "data": "ok" }));
    }

    #[test]
    fn jwt_payload_roundtrip() {
        let payload = json!({ "username": "ada", "exp": 4102444800u64 });
        let encoded = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&payload).unwrap());
        let token = format!("hdr.{encoded}.sig");

        let decoded = decode_jwt_payload(&token).unwrap();
        assert_eq!(decoded, Some(payload));
    }

    #[test]
    fn jwt_wrong_part_count_is_ignored() {
        assert_eq!(decode_jwt_payload("only.two").unwrap(), None);
        assert_eq!(decode_jwt_payload("a.b.c.d").unwrap(), None);
    }

    #[test]
    fn jwt_bad_payload_is_protocol_error() {
        assert!(decode_jwt_payload("hdr.!!!.sig").is_err());

        let not_json = URL_SAFE_NO_PAD.encode(b"not json at all");
        assert!(decode_jwt_payload(&format!("hdr.{not_json}.sig")).is_err());
    }
}
