//! Connection builder
//!
//! The `ConnectionBuilder` provides a fluent API for configuring a
//! [`Connection`] before its first connect. It allows you to:
//! - Tune request, connect and heartbeat timing
//! - Add handshake headers and basic authorization
//! - Trust private certificate authorities and present a client certificate
//! - Tunnel through an HTTP proxy
//! - Trace every frame
//! - Replace the reconnection backoff
//! - Configure observability (OpenTelemetry)
//!
//! # Examples
//!
//! ```rust,no_run
//! use ledgerws_client::{ConnectionBuilder, ExponentialBackoff};
//! use std::time::Duration;
//!
//! # async fn example() -> ledgerws_core::Result<()> {
//! let connection = ConnectionBuilder::new("wss://s1.ripple.com")
//!     .request_timeout(Duration::from_secs(10))
//!     .with_backoff(Box::new(ExponentialBackoff::default().with_jitter()))
//!     .connect()
//!     .await?;
//!
//! // With observability
//! let observed = ConnectionBuilder::new("wss://s2.ripple.com")
//!     .with_default_observability()
//!     .service_name("ledger-watcher")
//!     .connect()
//!     .await?;
//! # Ok(())
//! # }
//! ```

use crate::config::{ConnectionConfig, ConnectionOptions, LogTraceSink, TraceSink};
use crate::reconnect::{ExponentialBackoff, ReconnectionStrategy};
use crate::{ClientMetrics, Connection};
use ledgerws_core::{Error, ObservabilityConfig, Result};
use std::sync::Arc;
use std::time::Duration;

/// Builder for configuring and creating a [`Connection`]
pub struct ConnectionBuilder {
    url: String,
    config: ConnectionConfig,
    backoff: Option<Box<dyn ReconnectionStrategy>>,
    observability_config: Option<ObservabilityConfig>,
    metrics_service: Option<String>,
    service_name: Option<String>,
}

impl ConnectionBuilder {
    /// Create a new connection builder
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            config: ConnectionConfig::default(),
            backoff: None,
            observability_config: None,
            metrics_service: None,
            service_name: None,
        }
    }

    /// Start from serialized options
    pub fn with_options(mut self, options: ConnectionOptions) -> Self {
        self.config = options.into();
        self
    }

    /// Default per-request timeout
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    /// Handshake timeout
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// Heartbeat period (defaults to the request timeout)
    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.config.heartbeat_interval = Some(interval);
        self
    }

    /// Add a handshake header
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.transport.headers.insert(name.into(), value.into());
        self
    }

    /// Send `user:password` as HTTP basic authorization
    pub fn authorization(mut self, credentials: impl Into<String>) -> Self {
        self.config.transport.authorization = Some(credentials.into());
        self
    }

    /// Largest accepted inbound message, in bytes
    pub fn max_message_size(mut self, bytes: usize) -> Self {
        self.config.transport.max_message_size = Some(bytes);
        self
    }

    /// Set `TCP_NODELAY` on the socket
    pub fn disable_nagle(mut self, disable: bool) -> Self {
        self.config.transport.disable_nagle = disable;
        self
    }

    /// Trust this PEM certificate authority for `wss://`.
    ///
    /// Once any is added the bundled web PKI roots are no longer used.
    pub fn trusted_certificate(mut self, pem: impl Into<String>) -> Self {
        self.config.transport.tls.trusted_certificates.push(pem.into());
        self
    }

    /// Present a PEM client certificate chain and its private key
    pub fn client_certificate(mut self, certificate: impl Into<String>, key: impl Into<String>) -> Self {
        self.config.transport.tls.certificate = Some(certificate.into());
        self.config.transport.tls.key = Some(key.into());
        self
    }

    /// Passphrase for an encrypted PKCS#8 client key
    pub fn key_passphrase(mut self, passphrase: impl Into<String>) -> Self {
        self.config.transport.tls.passphrase = Some(passphrase.into());
        self
    }

    /// Tunnel through an HTTP proxy, e.g. `http://proxy.internal:3128`
    pub fn proxy(mut self, url: impl Into<String>) -> Self {
        self.config.transport.proxy = Some(url.into());
        self
    }

    /// Send `user:password` to the proxy as basic authorization
    pub fn proxy_authorization(mut self, credentials: impl Into<String>) -> Self {
        self.config.transport.proxy_authorization = Some(credentials.into());
        self
    }

    /// Log every frame at trace level
    pub fn with_trace(mut self) -> Self {
        self.config.trace = Some(Arc::new(LogTraceSink));
        self
    }

    /// Send every frame to a custom sink
    pub fn with_trace_sink(mut self, sink: Arc<dyn TraceSink>) -> Self {
        self.config.trace = Some(sink);
        self
    }

    /// Replace the default exponential backoff
    pub fn with_backoff(mut self, strategy: Box<dyn ReconnectionStrategy>) -> Self {
        self.backoff = Some(strategy);
        self
    }

    /// Enable OpenTelemetry observability with custom configuration
    pub fn with_observability(mut self, config: ObservabilityConfig) -> Self {
        self.observability_config = Some(config);
        self
    }

    /// Enable OpenTelemetry observability with default configuration
    pub fn with_default_observability(mut self) -> Self {
        self.observability_config = Some(ObservabilityConfig::default());
        self
    }

    /// Record metrics on the global meter provider without installing one
    pub fn with_metrics(mut self, service_name: impl Into<String>) -> Self {
        self.metrics_service = Some(service_name.into());
        self
    }

    /// Set service name for observability (used if observability is enabled)
    pub fn service_name(mut self, name: impl Into<String>) -> Self {
        self.service_name = Some(name.into());
        self
    }

    /// Build an idle connection
    pub fn build(self) -> Result<Connection> {
        let metrics = match self.observability_config {
            Some(mut config) => {
                if let Some(name) = self.service_name {
                    config.service_name = name;
                }
                ledgerws_core::init_observability(config.clone()).map_err(|e| {
                    Error::Internal(format!("Failed to initialize observability: {}", e))
                })?;
                Some(Arc::new(ClientMetrics::new(config.service_name)))
            }
            None => self
                .metrics_service
                .map(|name| Arc::new(ClientMetrics::new(name))),
        };

        let backoff = self
            .backoff
            .unwrap_or_else(|| Box::new(ExponentialBackoff::default()));

        Ok(Connection::with_parts(
            Some(self.url),
            self.config,
            backoff,
            metrics,
        ))
    }

    /// Build and connect
    pub async fn connect(self) -> Result<Connection> {
        let connection = self.build()?;
        connection.connect().await?;
        Ok(connection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconnect::FixedDelay;

    #[test]
    fn test_builder_defaults() {
        let builder = ConnectionBuilder::new("ws://localhost:6006");

        assert_eq!(builder.url, "ws://localhost:6006");
        assert!(builder.backoff.is_none());
        assert!(builder.observability_config.is_none());
        assert!(builder.metrics_service.is_none());
        assert!(builder.service_name.is_none());
        assert_eq!(builder.config.request_timeout, Duration::from_secs(20));
    }

    #[test]
    fn test_builder_timing() {
        let builder = ConnectionBuilder::new("ws://localhost:6006")
            .request_timeout(Duration::from_secs(3))
            .connect_timeout(Duration::from_millis(250))
            .heartbeat_interval(Duration::from_secs(1));

        assert_eq!(builder.config.request_timeout, Duration::from_secs(3));
        assert_eq!(builder.config.connect_timeout, Duration::from_millis(250));
        assert_eq!(builder.config.heartbeat_interval(), Duration::from_secs(1));
    }

    #[test]
    fn test_builder_transport() {
        let builder = ConnectionBuilder::new("ws://localhost:6006")
            .header("X-Client", "watcher")
            .authorization("user:secret")
            .max_message_size(1 << 20)
            .disable_nagle(true)
            .with_trace();

        let transport = &builder.config.transport;
        assert_eq!(transport.headers.get("X-Client").map(String::as_str), Some("watcher"));
        assert_eq!(transport.authorization.as_deref(), Some("user:secret"));
        assert_eq!(transport.max_message_size, Some(1 << 20));
        assert!(transport.disable_nagle);
        assert!(builder.config.trace.is_some());
    }

    #[test]
    fn test_builder_tls_and_proxy() {
        let builder = ConnectionBuilder::new("wss://localhost:6006")
            .trusted_certificate("CA ONE")
            .trusted_certificate("CA TWO")
            .client_certificate("CERT", "KEY")
            .key_passphrase("hunter2")
            .proxy("http://127.0.0.1:3128")
            .proxy_authorization("me:pw");

        let transport = &builder.config.transport;
        assert_eq!(transport.tls.trusted_certificates, vec!["CA ONE", "CA TWO"]);
        assert_eq!(transport.tls.certificate.as_deref(), Some("CERT"));
        assert_eq!(transport.tls.key.as_deref(), Some("KEY"));
        assert_eq!(transport.tls.passphrase.as_deref(), Some("hunter2"));
        assert_eq!(transport.proxy.as_deref(), Some("http://127.0.0.1:3128"));
        assert_eq!(transport.proxy_authorization.as_deref(), Some("me:pw"));
    }

    #[test]
    fn test_builder_with_options() {
        let options = ConnectionOptions {
            request_timeout_ms: Some(1000),
            trace: true,
            ..Default::default()
        };
        let builder = ConnectionBuilder::new("ws://localhost:6006").with_options(options);
        assert_eq!(builder.config.request_timeout, Duration::from_secs(1));
        assert!(builder.config.trace.is_some());
    }

    #[test]
    fn test_builder_with_backoff() {
        let builder = ConnectionBuilder::new("ws://localhost:6006")
            .with_backoff(Box::new(FixedDelay::new(Duration::from_millis(500))));
        assert!(builder.backoff.is_some());
    }

    #[test]
    fn test_builder_observability_config() {
        let config = ObservabilityConfig::new("test-client")
            .with_collector("http://localhost:4317")
            .with_log_filter("debug");

        let builder = ConnectionBuilder::new("ws://localhost:6006")
            .with_observability(config)
            .service_name("renamed");

        let obs_config = builder.observability_config.as_ref().unwrap();
        assert_eq!(obs_config.service_name, "test-client");
        assert_eq!(obs_config.log_filter, "debug");
        assert_eq!(builder.service_name.as_deref(), Some("renamed"));
    }

    #[test]
    fn test_builder_default_observability() {
        let builder = ConnectionBuilder::new("ws://localhost:6006").with_default_observability();
        assert_eq!(builder.observability_config.unwrap().service_name, "ledgerws");
    }

    #[tokio::test]
    async fn test_build_is_idle() {
        let connection = ConnectionBuilder::new("ws://localhost:6006")
            .with_metrics("test-builder")
            .build()
            .unwrap();

        assert_eq!(connection.url(), Some("ws://localhost:6006"));
        assert!(!connection.is_connected().await);
    }
}
