//! Wire codecs: plain JSON text and the MinBin MessagePack codec.
//!
//! MinBin rewrites the three most common envelope shapes into short
//! array-keyed forms before MessagePack-encoding them:
//!
//! | Shape | Compressed form |
//! |-------|-----------------|
//! | publish (`event == "#publish"`) | `"p": [channel, inner, cid?]` |
//! | emit (any other `event` with `data`) | `"e": [event, data, cid?]` |
//! | response (has `rid`, `error`, `data`) | `"r": [rid, error, data]` |
//!
//! Missing members mean "not this shape" and the envelope passes through
//! unchanged, so the codec is total over well-formed JSON values.

use serde_json::{Map, Value, json};

use crate::error::{ScError, ScResult};

/// Envelope codec selected at socket construction.
///
/// A codec instance may be shared read-only between sockets.
pub trait CodecEngine: Send + Sync {
    /// Encode one envelope (or an array of envelopes) to wire bytes.
    fn encode(&self, envelope: &Value) -> ScResult<Vec<u8>>;
    /// Decode wire bytes back into an envelope.
    ///
    /// Malformed input is reported as [`ScError::Parse`], never a panic.
    fn decode(&self, payload: &[u8]) -> ScResult<Value>;
    /// `true` when the wire frames are binary rather than text.
    fn is_binary(&self) -> bool;
}

/// The default wire form: envelopes as JSON text frames.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonCodec;

impl CodecEngine for JsonCodec {
    fn encode(&self, envelope: &Value) -> ScResult<Vec<u8>> {
        serde_json::to_vec(envelope).map_err(|e| ScError::parse(e.to_string()))
    }

    fn decode(&self, payload: &[u8]) -> ScResult<Value> {
        serde_json::from_slice(payload).map_err(|e| ScError::parse(e.to_string()))
    }

    fn is_binary(&self) -> bool {
        false
    }
}

/// MessagePack codec with SocketCluster field compression, wire-compatible
/// with `sc-codec-min-bin`. Frames are binary.
#[derive(Clone, Copy, Debug, Default)]
pub struct MinBinCodec;

impl CodecEngine for MinBinCodec {
    fn encode(&self, envelope: &Value) -> ScResult<Vec<u8>> {
        let compressed = match envelope {
            Value::Array(items) => Value::Array(items.iter().map(compress_packet).collect()),
            other if is_compressible(other) => compress_packet(other),
            other => other.clone(),
        };

        rmp_serde::to_vec(&compressed).map_err(|e| ScError::parse(e.to_string()))
    }

    fn decode(&self, payload: &[u8]) -> ScResult<Value> {
        let mut value: Value =
            rmp_serde::from_slice(payload).map_err(|e| ScError::parse(e.to_string()))?;

        match &mut value {
            Value::Array(items) => {
                for item in items {
                    decompress_packet(item);
                }
            }
            Value::Object(_) => decompress_packet(&mut value),
            _ => {}
        }

        Ok(value)
    }

    fn is_binary(&self) -> bool {
        true
    }
}

fn is_compressible(envelope: &Value) -> bool {
    let has_event = envelope
        .get("event")
        .and_then(Value::as_str)
        .is_some_and(|e| !e.is_empty());
    let has_rid = envelope
        .get("rid")
        .and_then(Value::as_u64)
        .is_some_and(|r| r != 0);
    has_event || has_rid
}

fn compress_packet(envelope: &Value) -> Value {
    let mut out = envelope.clone();
    compress_publish(&mut out);
    compress_emit(&mut out);
    compress_response(&mut out);
    out
}

fn decompress_packet(envelope: &mut Value) {
    decompress_emit(envelope);
    decompress_publish(envelope);
    decompress_response(envelope);
}

fn compress_publish(envelope: &mut Value) {
    let Some(object) = envelope.as_object_mut() else {
        return;
    };
    if object.get("event").and_then(Value::as_str) != Some("#publish") {
        return;
    }
    let Some(data) = object.get("data").and_then(Value::as_object) else {
        return;
    };
    let (Some(channel), Some(inner)) = (data.get("channel"), data.get("data")) else {
        return;
    };

    let mut packed = vec![channel.clone(), inner.clone()];
    if let Some(cid) = object.get("cid").and_then(Value::as_u64).filter(|c| *c != 0) {
        packed.push(cid.into());
    }

    object.insert("p".into(), Value::Array(packed));
    erase_members(object, &["event", "data", "cid"]);
}

fn decompress_publish(envelope: &mut Value) {
    let Some(object) = envelope.as_object_mut() else {
        return;
    };
    let Some(packed) = object.get("p").and_then(Value::as_array) else {
        return;
    };
    if packed.len() < 2 {
        return;
    }

    let data = json!({ "channel": packed[0], "data": packed[1] });
    let cid = packed.get(2).cloned();

    object.insert("event".into(), "#publish".into());
    object.insert("data".into(), data);
    if let Some(cid) = cid {
        object.insert("cid".into(), cid);
    }
    object.remove("p");
}

fn compress_emit(envelope: &mut Value) {
    let Some(object) = envelope.as_object_mut() else {
        return;
    };
    let (Some(event), Some(data)) = (object.get("event"), object.get("data")) else {
        return;
    };
    if !event.is_string() {
        return;
    }

    let mut packed = vec![event.clone(), data.clone()];
    if let Some(cid) = object.get("cid").and_then(Value::as_u64).filter(|c| *c != 0) {
        packed.push(cid.into());
    }

    object.insert("e".into(), Value::Array(packed));
    erase_members(object, &["event", "data", "cid"]);
}

fn decompress_emit(envelope: &mut Value) {
    let Some(object) = envelope.as_object_mut() else {
        return;
    };
    let Some(packed) = object.get("e").and_then(Value::as_array) else {
        return;
    };
    if packed.len() < 2 {
        return;
    }

    let event = packed[0].clone();
    let data = packed[1].clone();
    let cid = packed.get(2).cloned();

    object.insert("event".into(), event);
    object.insert("data".into(), data);
    if let Some(cid) = cid {
        object.insert("cid".into(), cid);
    }
    object.remove("e");
}

fn compress_response(envelope: &mut Value) {
    let Some(object) = envelope.as_object_mut() else {
        return;
    };
    let (Some(rid), Some(error), Some(data)) =
        (object.get("rid"), object.get("error"), object.get("data"))
    else {
        return;
    };

    let packed = vec![rid.clone(), error.clone(), data.clone()];

    object.insert("r".into(), Value::Array(packed));
    erase_members(object, &["rid", "error", "data"]);
}

fn decompress_response(envelope: &mut Value) {
    let Some(object) = envelope.as_object_mut() else {
        return;
    };
    let Some(packed) = object.get("r").and_then(Value::as_array) else {
        return;
    };
    if packed.len() < 3 {
        return;
    }

    let rid = packed[0].clone();
    let error = packed[1].clone();
    let data = packed[2].clone();

    object.insert("rid".into(), rid);
    if !error.is_null() {
        object.insert("error".into(), error);
    }
    if !data.is_null() {
        object.insert("data".into(), data);
    }
    object.remove("r");
}

fn erase_members(object: &mut Map<String, Value>, names: &[&str]) {
    for name in names {
        object.remove(*name);
    }
}
