//! ledgerws - WebSocket client for ledger nodes
//!
//! This is the convenience crate that re-exports the ledgerws sub-crates.
//! Use it if you want a single dependency for the connection layer.
//!
//! # Architecture
//!
//! - **ledgerws-core**: wire types, inbound message classification, error
//!   taxonomy, observability setup
//! - **ledgerws-client**: the reconnecting connection, request table,
//!   event bus and ledger tracker
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use ledgerws::Connection;
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let connection = Connection::builder("ws://localhost:6006")
//!         .request_timeout(std::time::Duration::from_secs(10))
//!         .connect()
//!         .await?;
//!
//!     let info = connection.request(json!({"command": "server_info"}), None).await?;
//!     println!("{}", info["result"]);
//!
//!     connection.disconnect().await;
//!     Ok(())
//! }
//! ```

pub use ledgerws_client as client;
pub use ledgerws_core as core;

pub use ledgerws_client::{Connection, ConnectionBuilder, ConnectionEvent, LedgerTracker};
pub use ledgerws_core::{Error, Result};
