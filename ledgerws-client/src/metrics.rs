//! Client metrics definitions
//!
//! OpenTelemetry instruments describing connection health. They record into
//! the global meter provider installed by
//! [`init_observability`](ledgerws_core::init_observability), or into any
//! meter passed to [`ClientMetrics::new_with_meter`].
//!
//! # Metrics Collected
//!
//! - **connection.state**: current [`ConnectionState`] (gauge)
//! - **requests.total**: requests settled, by command and status (counter)
//! - **request.duration**: request latency in seconds (histogram)
//! - **errors.total**: faults published as `error` events (counter)
//! - **reconnection.attempts**: reconnects scheduled (counter)
//! - **reconnection.success**: sockets opened after a scheduled reconnect (counter)
//! - **push.received**: server push messages, by type (counter)
//!
//! # Examples
//!
//! ```rust,no_run
//! use ledgerws_client::Connection;
//!
//! # async fn example() -> ledgerws_core::Result<()> {
//! let connection = Connection::builder("wss://s1.ripple.com")
//!     .with_metrics("ledger-watcher")
//!     .connect()
//!     .await?;
//! # Ok(())
//! # }
//! ```

use crate::connection_state::ConnectionState;
use opentelemetry::{
    global,
    metrics::{Counter, Gauge, Histogram, Meter},
    InstrumentationScope, KeyValue,
};

/// Connection health instruments
pub struct ClientMetrics {
    connection_state: Gauge<i64>,
    requests_total: Counter<u64>,
    request_duration: Histogram<f64>,
    errors_total: Counter<u64>,
    reconnection_attempts: Counter<u64>,
    reconnection_success: Counter<u64>,
    push_received: Counter<u64>,
}

impl ClientMetrics {
    /// Create metrics on the global meter named `service_name`
    pub fn new(service_name: impl Into<String>) -> Self {
        let scope = InstrumentationScope::builder(service_name.into()).build();
        Self::new_with_meter(&global::meter_with_scope(scope))
    }

    /// Create metrics on a caller-provided meter
    pub fn new_with_meter(meter: &Meter) -> Self {
        Self {
            connection_state: meter
                .i64_gauge("ledgerws.client.connection.state")
                .with_description("Connection state (0=idle, 1=connecting, 2=open, 3=closing)")
                .build(),
            requests_total: meter
                .u64_counter("ledgerws.client.requests.total")
                .with_description("Requests settled, by command and outcome")
                .build(),
            request_duration: meter
                .f64_histogram("ledgerws.client.request.duration")
                .with_description("Time from send to settlement")
                .with_unit("s")
                .build(),
            errors_total: meter
                .u64_counter("ledgerws.client.errors.total")
                .with_description("Faults published as error events")
                .build(),
            reconnection_attempts: meter
                .u64_counter("ledgerws.client.reconnection.attempts")
                .with_description("Reconnects scheduled after an unexpected close")
                .build(),
            reconnection_success: meter
                .u64_counter("ledgerws.client.reconnection.success")
                .with_description("Scheduled reconnects that opened a socket")
                .build(),
            push_received: meter
                .u64_counter("ledgerws.client.push.received")
                .with_description("Server push messages, by type")
                .build(),
        }
    }

    pub fn update_connection_state(&self, state: ConnectionState) {
        self.connection_state.record(state.as_gauge(), &[]);
    }

    /// Record a settled request
    pub fn record_request(&self, command: &str, status: &str, duration_secs: f64) {
        let attributes = &[
            KeyValue::new("command", command.to_string()),
            KeyValue::new("status", status.to_string()),
        ];
        self.requests_total.add(1, attributes);
        self.request_duration.record(duration_secs, attributes);
    }

    pub fn record_error(&self, kind: &str) {
        let attributes = &[KeyValue::new("error_type", kind.to_string())];
        self.errors_total.add(1, attributes);
    }

    pub fn record_reconnection_attempt(&self) {
        self.reconnection_attempts.add(1, &[]);
    }

    pub fn record_reconnection_success(&self) {
        self.reconnection_success.add(1, &[]);
    }

    pub fn record_push(&self, kind: &str) {
        let attributes = &[KeyValue::new("type", kind.to_string())];
        self.push_received.add(1, attributes);
    }
}
