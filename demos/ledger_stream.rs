//! Ledger stream example
//!
//! Connects to a ledger node, follows closed ledgers and prints fee and
//! history changes as they arrive.
//!
//! Usage:
//!   cargo run --example ledger_stream -- wss://s.altnet.rippletest.net:51233
//!
//! Kill the network link while it runs to watch the client reconnect and
//! resubscribe.

use ledgerws::client::FixedDelay;
use ledgerws::{Connection, ConnectionEvent, LedgerTracker};
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let url = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "ws://127.0.0.1:6006".to_string());

    let connection = Connection::builder(url.clone())
        .request_timeout(Duration::from_secs(10))
        .with_backoff(Box::new(FixedDelay::new(Duration::from_secs(2))))
        .with_trace()
        .build()?;

    connection.on("disconnected", |event| {
        if let ConnectionEvent::Disconnected { code } = event {
            println!("Disconnected with code {}", code);
        }
    });
    connection.on("reconnecting", |event| {
        if let ConnectionEvent::Reconnecting { attempt } = event {
            println!("Reconnect attempt {} scheduled", attempt);
        }
    });
    connection.on("error", |event| println!("Error event: {:?}", event));

    let tracker = LedgerTracker::attach(&connection).await;
    connection.connect().await?;
    println!("Connected to {}", url);

    let latest = tracker.wait_until_ready().await;
    println!("Following ledgers from {}", latest);

    let info = connection
        .request(serde_json::json!({"command": "server_info"}), None)
        .await?;
    println!("Server state: {}", info["result"]["info"]["server_state"]);

    let mut ticker = tokio::time::interval(Duration::from_secs(4));
    for _ in 0..15 {
        ticker.tick().await;
        tracing::info!(
            latest = ?tracker.latest_version(),
            fee_base = ?tracker.fee_base(),
            reserve_base = ?tracker.reserve_base(),
            "Ledger status"
        );
    }

    let code = connection.disconnect().await;
    println!("Closed with code {:?}", code);
    Ok(())
}
