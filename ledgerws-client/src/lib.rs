//! Reconnecting WebSocket client for ledger nodes
//!
//! This crate owns the socket side of talking to a ledger node: one
//! persistent WebSocket, any number of concurrent requests correlated by
//! `id`, server push messages published as events, a heartbeat, and
//! automatic reconnection with exponential backoff after unexpected closes.
//!
//! # Core Features
//!
//! - **Request-Response**: send JSON commands and await their responses,
//!   each with its own timeout
//! - **Push events**: `ledgerClosed`, `transaction` and every other stream
//!   message, by name
//! - **Connect fan-in**: concurrent `connect()` calls share one attempt
//! - **Auto-Reconnection**: exponential backoff, reset on every open;
//!   `disconnect()` closes with code 4000 and never reconnects
//! - **Heartbeat**: periodic `ping`, reconnecting when it fails
//! - **Transport**: `wss://` over rustls with custom roots and client
//!   certificates, optionally through an HTTP `CONNECT` proxy
//! - **Ledger tracking**: optional [`LedgerTracker`]
//! - **Observability**: OpenTelemetry metrics and `tracing` spans
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use ledgerws_client::Connection;
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let connection = Connection::builder("wss://s1.ripple.com").connect().await?;
//!
//!     let response = connection.request(json!({"command": "server_info"}), None).await?;
//!     println!("Result: {}", response["result"]);
//!
//!     connection.on("ledgerClosed", |event| {
//!         println!("Ledger closed: {:?}", event);
//!     });
//!     connection
//!         .request(json!({"command": "subscribe", "streams": ["ledger"]}), None)
//!         .await?;
//!
//!     connection.disconnect().await;
//!     Ok(())
//! }
//! ```

mod builder;
mod config;
mod connection;
mod connection_state;
mod events;
mod ledger;
mod metrics;
mod reconnect;
mod request;
mod transport;

pub use builder::ConnectionBuilder;
pub use config::{
    ConnectionConfig, ConnectionOptions, LogTraceSink, TlsOptions, TraceSink, TransportOptions,
    DEFAULT_CONNECT_TIMEOUT, DEFAULT_REQUEST_TIMEOUT,
};
pub use connection::{Connection, WeakConnection, INTENTIONAL_DISCONNECT_CODE};
pub use connection_state::{ConnectWaiters, ConnectionState};
pub use events::{ConnectionEvent, EventBus, EventHandler, SubscriptionToken};
pub use ledger::{LedgerHistory, LedgerTracker, RangeSet};
pub use metrics::ClientMetrics;
pub use reconnect::{ExponentialBackoff, FixedDelay, ReconnectionStrategy};
pub use request::{RequestManager, ResponseFuture};
