//! Core types and codec for ledgerws
//!
//! This crate holds everything about the ledger node protocol that does not
//! need a socket:
//!
//! - **Types**: request ids, classified inbound messages, ledger stream payloads
//! - **Codec**: merging correlation ids into command bodies, classifying frames
//! - **Error handling**: the error taxonomy shared by every ledgerws crate
//! - **Observability**: OpenTelemetry and `tracing` subscriber setup
//!
//! The `ledgerws-client` crate builds the WebSocket connection on top of it.
//!
//! # Example
//!
//! ```rust
//! use ledgerws_core::{codec, InboundMessage, RequestId};
//! use serde_json::json;
//!
//! let frame = codec::encode_request(&json!({"command": "ping"}), &RequestId::Number(0)).unwrap();
//! assert!(frame.contains("\"id\":0"));
//!
//! let reply = codec::decode(r#"{"type":"response","id":0,"status":"success","result":{}}"#).unwrap();
//! assert!(matches!(reply, InboundMessage::Response(_)));
//! ```

pub mod codec;
pub mod error;
pub mod observability;
pub mod types;

pub use error::{Error, RemoteErrorData, Result};
pub use observability::{init_observability, shutdown_observability, LogFormat, ObservabilityConfig};
pub use types::{InboundMessage, LedgerStream, RequestId, LEDGER_CLOSED_TYPE, RESPONSE_TYPE};
