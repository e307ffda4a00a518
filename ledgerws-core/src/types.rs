//! Wire types for the ledger node protocol
//!
//! The protocol is plain JSON over a WebSocket. Outbound messages are JSON
//! objects naming a `command` plus an `id` used for correlation. Inbound
//! messages are either responses (`"type": "response"`), server-push stream
//! messages (`"type": "ledgerClosed"`, `"transaction"`, ...), or bare
//! transport-level errors with no `type` at all.
//!
//! # Request IDs
//!
//! An id is either a non-negative integer (assigned by the client from a
//! counter) or a string (supplied by the caller). Pending requests are keyed
//! by [`RequestId::key`], which renders both forms as plain strings.

use serde::{Deserialize, Serialize};
use std::fmt;

/// `type` value of a correlated response message
pub const RESPONSE_TYPE: &str = "response";

/// `type` value of a ledger stream message
pub const LEDGER_CLOSED_TYPE: &str = "ledgerClosed";

/// Correlation id carried in the `id` field of requests and responses
///
/// # Examples
///
/// ```rust
/// use ledgerws_core::RequestId;
/// use serde_json::json;
///
/// let id: RequestId = 7u64.into();
/// assert_eq!(id.key(), "7");
///
/// assert_eq!(RequestId::from_value(&json!("sub-1")), Some("sub-1".into()));
/// assert_eq!(RequestId::from_value(&json!(-1)), None);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    /// Counter-assigned identifier
    Number(u64),
    /// Caller-supplied identifier
    String(String),
}

impl RequestId {
    /// Parse an id from a JSON value.
    ///
    /// Accepts strings and non-negative integers. Negative numbers, floats,
    /// booleans, null, arrays and objects yield `None`.
    pub fn from_value(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::String(s) => Some(RequestId::String(s.clone())),
            serde_json::Value::Number(n) => n.as_u64().map(RequestId::Number),
            _ => None,
        }
    }

    /// Normalized map key for the pending request table
    pub fn key(&self) -> String {
        match self {
            RequestId::Number(n) => n.to_string(),
            RequestId::String(s) => s.clone(),
        }
    }

    /// JSON form of the id, as written into outbound messages
    pub fn to_value(&self) -> serde_json::Value {
        match self {
            RequestId::Number(n) => serde_json::Value::from(*n),
            RequestId::String(s) => serde_json::Value::from(s.as_str()),
        }
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{}", n),
            RequestId::String(s) => write!(f, "\"{}\"", s),
        }
    }
}

impl From<u64> for RequestId {
    fn from(n: u64) -> Self {
        RequestId::Number(n)
    }
}

impl From<String> for RequestId {
    fn from(s: String) -> Self {
        RequestId::String(s)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        RequestId::String(s.to_string())
    }
}

/// A classified inbound frame
///
/// Produced by [`crate::codec::decode`]. The variants mirror how the
/// connection routes each message.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    /// `"type": "response"`, to be correlated with a pending request
    Response(serde_json::Value),

    /// Any other `type`: an unsolicited stream message
    Push {
        /// The `type` field, used as the event name
        kind: String,
        /// The whole message
        payload: serde_json::Value,
    },

    /// No `type` but an `error` field, e.g. a `slowDown` signal
    ServerError {
        /// The `error` token
        error: String,
        /// The `error_message` field, if any
        message: Option<String>,
        /// The whole message
        raw: serde_json::Value,
    },

    /// A JSON object matching none of the shapes above
    Unrecognized(serde_json::Value),
}

impl InboundMessage {
    /// Event name the message is published under, if it is published by name
    pub fn event_name(&self) -> Option<&str> {
        match self {
            InboundMessage::Response(_) => Some(RESPONSE_TYPE),
            InboundMessage::Push { kind, .. } => Some(kind),
            _ => None,
        }
    }
}

/// Payload of a `ledgerClosed` stream message, also the `result` of a
/// `subscribe` request for the `ledger` stream
///
/// Every field is optional on the wire; nodes without validated history omit
/// most of them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LedgerStream {
    /// Base transaction cost in drops
    #[serde(default)]
    pub fee_base: Option<u64>,
    /// Reference transaction cost in fee units
    #[serde(default)]
    pub fee_ref: Option<u64>,
    /// Hash of the closed ledger
    #[serde(default)]
    pub ledger_hash: Option<String>,
    /// Sequence number of the closed ledger
    #[serde(default)]
    pub ledger_index: Option<u64>,
    /// Close time, seconds since the ledger epoch
    #[serde(default)]
    pub ledger_time: Option<u64>,
    /// Minimum account reserve in drops
    #[serde(default)]
    pub reserve_base: Option<u64>,
    /// Owner reserve increment in drops
    #[serde(default)]
    pub reserve_inc: Option<u64>,
    /// Number of transactions in the ledger
    #[serde(default)]
    pub txn_count: Option<u64>,
    /// Available validated history, e.g. `"32570-32580,32590"`
    #[serde(default)]
    pub validated_ledgers: Option<String>,
}
