//! Codec for ledger node messages
//!
//! Outbound: a caller's command body plus a correlation id, rendered as a
//! compact JSON string.
//!
//! Inbound: a text frame parsed and classified into an [`InboundMessage`].
//! Classification looks only at `type` and `error`; everything else is left
//! to the consumer.
//!
//! | Shape | Result |
//! |---|---|
//! | `"type": "response"` | [`InboundMessage::Response`] |
//! | `"type"` is any other string | [`InboundMessage::Push`] |
//! | no `type`, `error` present | [`InboundMessage::ServerError`] |
//! | any other object | [`InboundMessage::Unrecognized`] |
//!
//! Text that is not a JSON object is a decode error.
//!
//! # Examples
//!
//! ```rust
//! use ledgerws_core::{codec, InboundMessage, RequestId};
//! use serde_json::json;
//!
//! let text = codec::encode_request(&json!({"command": "ping"}), &RequestId::Number(1)).unwrap();
//! assert_eq!(text, r#"{"command":"ping","id":1}"#);
//!
//! let msg = codec::decode(r#"{"type":"ledgerClosed","ledger_index":5}"#).unwrap();
//! assert_eq!(msg.event_name(), Some("ledgerClosed"));
//! ```

use crate::error::{Error, Result};
use crate::types::{InboundMessage, RequestId, RESPONSE_TYPE};
use serde_json::Value;

/// Merge `id` into a command body.
///
/// The body must be a JSON object; an existing `id` is overwritten.
pub fn with_id(body: &Value, id: &RequestId) -> Result<Value> {
    let mut object = body
        .as_object()
        .cloned()
        .ok_or_else(|| Error::InvalidRequest(format!("request body must be a JSON object, got {}", body)))?;
    object.insert("id".to_string(), id.to_value());
    Ok(Value::Object(object))
}

/// Encode a command body with its correlation id.
pub fn encode_request(body: &Value, id: &RequestId) -> Result<String> {
    encode(&with_id(body, id)?)
}

/// Encode any JSON value compactly.
pub fn encode(value: &Value) -> Result<String> {
    serde_json::to_string(value).map_err(|e| Error::Serialization(e.to_string()))
}

/// Parse and classify an inbound text frame.
///
/// # Errors
///
/// `Error::Serialization` if the text is not JSON or not a JSON object.
pub fn decode(text: &str) -> Result<InboundMessage> {
    let value: Value = serde_json::from_str(text)?;
    if !value.is_object() {
        return Err(Error::Serialization(format!(
            "expected a JSON object, got {}",
            json_kind(&value)
        )));
    }
    Ok(classify(value))
}

/// Classify an already-parsed JSON object.
pub fn classify(value: Value) -> InboundMessage {
    match value.get("type") {
        Some(Value::String(kind)) if kind == RESPONSE_TYPE => InboundMessage::Response(value),
        Some(Value::String(kind)) => {
            let kind = kind.clone();
            InboundMessage::Push {
                kind,
                payload: value,
            }
        }
        Some(_) => InboundMessage::Unrecognized(value),
        None => match value.get("error") {
            Some(error) if !error.is_null() => {
                let error = match error {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                let message = value
                    .get("error_message")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                InboundMessage::ServerError {
                    error,
                    message,
                    raw: value,
                }
            }
            _ => InboundMessage::Unrecognized(value),
        },
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
