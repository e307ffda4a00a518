//! Error types for ledgerws
//!
//! Every failure the connection layer can report is a variant of [`Error`].
//! The variants fall into three groups:
//!
//! - **Session errors**: `Connection`, `NotConnected`, `Disconnected`
//! - **Request errors**: `Timeout`, `ResponseFormat`, `Remote`, `Cancelled`
//! - **Local faults**: `InvalidRequest`, `NoPendingRequest`, `Serialization`,
//!   `WebSocket`, `Internal`
//!
//! Errors that belong to one outstanding request are delivered through that
//! request's future. Errors with no caller (a bad frame, a failed background
//! reconnect) are published as `error` events by the connection instead.
//!
//! # Examples
//!
//! ```rust
//! use ledgerws_core::{Error, RemoteErrorData};
//! use serde_json::json;
//!
//! let raw = json!({
//!     "id": 3,
//!     "status": "error",
//!     "error": "noNetwork",
//!     "error_message": "overloaded"
//! });
//! let error = Error::Remote(RemoteErrorData::from_response(&raw));
//! assert_eq!(error.to_string(), "Remote error: overloaded");
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for ledgerws operations
pub type Result<T> = std::result::Result<T, Error>;

/// Application-level error type for ledgerws operations
///
/// The type is `Clone` so that a single disconnect can fail every pending
/// request with the same value.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// The handshake failed or timed out, or `connect()` was misused
    /// (no URL configured, previous socket never torn down).
    #[error("Connection error: {0}")]
    Connection(String),

    /// An operation needed a live session and there was none.
    #[error("Not connected: {0}")]
    NotConnected(String),

    /// The socket closed while the operation was outstanding.
    #[error("Disconnected: {0}")]
    Disconnected(String),

    /// No correlated response arrived within the configured window.
    #[error("Request timeout: {0}")]
    Timeout(String),

    /// An inbound message had an invalid id or an unrecognized status.
    #[error("Response format error: {0}")]
    ResponseFormat(String),

    /// The node answered with `status: "error"`.
    #[error("Remote error: {0}")]
    Remote(RemoteErrorData),

    /// The pending entry was cancelled before any response arrived.
    #[error("Request cancelled: {0}")]
    Cancelled(String),

    /// The request body cannot be sent as given (not an object, bad or
    /// duplicate id).
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// A settlement primitive named an id that is not pending.
    #[error("No pending request with id {0}")]
    NoPendingRequest(String),

    /// Serialization or deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// WebSocket transport layer error
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// Invariant violation inside the client
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Short machine-readable name, used as the `error` event kind and as a
    /// metrics attribute.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Connection(_) => "connection",
            Error::NotConnected(_) => "notConnected",
            Error::Disconnected(_) => "disconnected",
            Error::Timeout(_) => "timeout",
            Error::ResponseFormat(_) => "responseFormat",
            Error::Remote(_) => "remote",
            Error::Cancelled(_) => "cancelled",
            Error::InvalidRequest(_) => "invalidRequest",
            Error::NoPendingRequest(_) => "noPendingRequest",
            Error::Serialization(_) => "serialization",
            Error::WebSocket(_) => "websocket",
            Error::Internal(_) => "internal",
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

/// Error details reported by the node in a `status: "error"` response
///
/// Nodes identify failures by a short token (`error`, e.g. `"noNetwork"`),
/// sometimes with a numeric `error_code` and a human readable
/// `error_message`. The full response is kept in `raw` for callers that need
/// fields this layer does not model.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RemoteErrorData {
    /// Error token, e.g. `"actNotFound"`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Numeric error code, when the node sends one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<i64>,

    /// Human-readable description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,

    /// Echo of the request that failed, when the node includes it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<serde_json::Value>,

    /// The complete response message
    #[serde(skip)]
    pub raw: serde_json::Value,
}

impl RemoteErrorData {
    /// Extract error details from a raw response message.
    ///
    /// Missing or mistyped fields are left as `None`; this never fails.
    pub fn from_response(response: &serde_json::Value) -> Self {
        let text = |key: &str| {
            response
                .get(key)
                .and_then(serde_json::Value::as_str)
                .map(str::to_string)
        };
        Self {
            error: text("error"),
            error_code: response.get("error_code").and_then(serde_json::Value::as_i64),
            error_message: text("error_message"),
            request: response.get("request").cloned(),
            raw: response.clone(),
        }
    }

    /// The best description available: `error_message`, then `error`.
    pub fn message(&self) -> &str {
        self.error_message
            .as_deref()
            .or(self.error.as_deref())
            .unwrap_or("unknown error")
    }
}

impl std::fmt::Display for RemoteErrorData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.message())
    }
}

impl std::error::Error for RemoteErrorData {}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_remote_error_prefers_message() {
        let data = RemoteErrorData::from_response(&json!({
            "error": "noNetwork",
            "error_message": "overloaded",
        }));
        assert_eq!(data.message(), "overloaded");
        assert_eq!(data.error.as_deref(), Some("noNetwork"));
    }

    #[test]
    fn test_remote_error_falls_back_to_token() {
        let data = RemoteErrorData::from_response(&json!({
            "error": "actNotFound",
            "error_code": 19,
            "request": {"command": "account_info"},
        }));
        assert_eq!(data.message(), "actNotFound");
        assert_eq!(data.error_code, Some(19));
        assert_eq!(data.request, Some(json!({"command": "account_info"})));
    }

    #[test]
    fn test_remote_error_without_details() {
        let data = RemoteErrorData::from_response(&json!({"status": "error"}));
        assert_eq!(data.to_string(), "unknown error");
    }

    #[test]
    fn test_error_display() {
        let error = Error::Timeout("request 4".into());
        assert_eq!(error.to_string(), "Request timeout: request 4");

        let error = Error::NoPendingRequest("9".into());
        assert_eq!(error.to_string(), "No pending request with id 9");
    }

    #[test]
    fn test_error_kind() {
        assert_eq!(Error::Disconnected(String::new()).kind(), "disconnected");
        assert_eq!(
            Error::Remote(RemoteErrorData::default()).kind(),
            "remote"
        );
    }

    #[test]
    fn test_serde_error_conversion() {
        let parse = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let error: Error = parse.into();
        assert!(matches!(error, Error::Serialization(_)));
    }
}
