//! Connection configuration
//!
//! [`ConnectionConfig`] is the typed form a [`Connection`](crate::Connection)
//! is built from. [`ConnectionOptions`] is the serde form, with camelCase
//! millisecond fields, for configuration files:
//!
//! ```json
//! {
//!   "requestTimeoutMs": 20000,
//!   "connectTimeoutMs": 5000,
//!   "trace": true,
//!   "headers": {"X-Client": "watcher"},
//!   "authorization": "user:secret",
//!   "proxy": "http://proxy.internal:3128",
//!   "trustedCertificates": ["-----BEGIN CERTIFICATE-----\n..."]
//! }
//! ```
//!
//! Certificates and keys are PEM text. `trustedCertificates` replaces the
//! bundled web PKI roots rather than adding to them.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ledgerws_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::{header, HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;

/// Default time to wait for a response
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(20);

/// Default time to wait for the handshake
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Receives every frame sent or received, with its direction
/// (`"send"` or `"receive"`)
pub trait TraceSink: Send + Sync {
    fn trace(&self, direction: &str, message: &str);
}

impl<F> TraceSink for F
where
    F: Fn(&str, &str) + Send + Sync,
{
    fn trace(&self, direction: &str, message: &str) {
        self(direction, message)
    }
}

/// Trace sink writing frames to `tracing` at trace level
#[derive(Debug, Clone, Copy, Default)]
pub struct LogTraceSink;

impl TraceSink for LogTraceSink {
    fn trace(&self, direction: &str, message: &str) {
        tracing::trace!(target: "ledgerws_client::frames", direction, message);
    }
}

/// TLS settings for `wss://` urls
#[derive(Clone, Default, PartialEq)]
pub struct TlsOptions {
    /// PEM certificate authorities; empty means the web PKI roots
    pub trusted_certificates: Vec<String>,
    /// PEM client certificate chain
    pub certificate: Option<String>,
    /// PEM client private key, PKCS#8, PKCS#1 or SEC1
    pub key: Option<String>,
    /// Decrypts `key` when it is an encrypted PKCS#8 key
    pub passphrase: Option<String>,
}

impl fmt::Debug for TlsOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsOptions")
            .field("trusted_certificates", &self.trusted_certificates.len())
            .field("certificate", &self.certificate.is_some())
            .field("key", &self.key.as_ref().map(|_| "<redacted>"))
            .field("passphrase", &self.passphrase.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Socket-level options
#[derive(Debug, Clone, Default)]
pub struct TransportOptions {
    /// Extra handshake headers
    pub headers: BTreeMap<String, String>,
    /// `user:password` sent as HTTP basic authorization
    pub authorization: Option<String>,
    /// Largest accepted inbound message, in bytes
    pub max_message_size: Option<usize>,
    /// Set `TCP_NODELAY` on the socket
    pub disable_nagle: bool,
    /// HTTP proxy tunnelled through with `CONNECT`, e.g. `http://host:3128`
    pub proxy: Option<String>,
    /// `user:password` for the proxy
    pub proxy_authorization: Option<String>,
    pub tls: TlsOptions,
}

impl TransportOptions {
    /// Build the handshake request for `url`
    pub(crate) fn client_request(&self, url: &str) -> Result<Request> {
        let mut request = url
            .into_client_request()
            .map_err(|e| Error::Connection(format!("invalid url {}: {}", url, e)))?;

        let headers = request.headers_mut();
        for (name, value) in &self.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| Error::Connection(format!("invalid header name {}: {}", name, e)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| Error::Connection(format!("invalid value for header {}: {}", name, e)))?;
            headers.insert(name, value);
        }

        if let Some(credentials) = &self.authorization {
            let value = format!("Basic {}", BASE64.encode(credentials));
            let value = HeaderValue::from_str(&value)
                .map_err(|e| Error::Connection(format!("invalid authorization: {}", e)))?;
            headers.insert(header::AUTHORIZATION, value);
        }

        Ok(request)
    }

    pub(crate) fn websocket_config(&self) -> Option<WebSocketConfig> {
        self.max_message_size.map(|size| WebSocketConfig {
            max_message_size: Some(size),
            ..Default::default()
        })
    }
}

/// Typed connection configuration
#[derive(Clone)]
pub struct ConnectionConfig {
    /// Default per-request timeout, also used for heartbeat pings
    pub request_timeout: Duration,
    /// Handshake timeout
    pub connect_timeout: Duration,
    /// Heartbeat period; `None` uses `request_timeout`
    pub heartbeat_interval: Option<Duration>,
    pub transport: TransportOptions,
    /// Frame trace sink
    pub trace: Option<Arc<dyn TraceSink>>,
}

impl ConnectionConfig {
    /// Effective heartbeat period
    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval.unwrap_or(self.request_timeout)
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            heartbeat_interval: None,
            transport: TransportOptions::default(),
            trace: None,
        }
    }
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("request_timeout", &self.request_timeout)
            .field("connect_timeout", &self.connect_timeout)
            .field("heartbeat_interval", &self.heartbeat_interval)
            .field("transport", &self.transport)
            .field("trace", &self.trace.is_some())
            .finish()
    }
}

/// Serializable connection options
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectionOptions {
    pub request_timeout_ms: Option<u64>,
    pub connect_timeout_ms: Option<u64>,
    pub heartbeat_interval_ms: Option<u64>,
    /// Log every frame through [`LogTraceSink`]
    pub trace: bool,
    pub headers: BTreeMap<String, String>,
    pub authorization: Option<String>,
    pub max_message_size: Option<usize>,
    pub proxy: Option<String>,
    pub proxy_authorization: Option<String>,
    pub trusted_certificates: Vec<String>,
    pub certificate: Option<String>,
    pub key: Option<String>,
    pub passphrase: Option<String>,
}

impl From<ConnectionOptions> for ConnectionConfig {
    fn from(options: ConnectionOptions) -> Self {
        let trace: Option<Arc<dyn TraceSink>> = if options.trace {
            Some(Arc::new(LogTraceSink))
        } else {
            None
        };
        Self {
            request_timeout: options
                .request_timeout_ms
                .map_or(DEFAULT_REQUEST_TIMEOUT, Duration::from_millis),
            connect_timeout: options
                .connect_timeout_ms
                .map_or(DEFAULT_CONNECT_TIMEOUT, Duration::from_millis),
            heartbeat_interval: options.heartbeat_interval_ms.map(Duration::from_millis),
            transport: TransportOptions {
                headers: options.headers,
                authorization: options.authorization,
                max_message_size: options.max_message_size,
                disable_nagle: false,
                proxy: options.proxy,
                proxy_authorization: options.proxy_authorization,
                tls: TlsOptions {
                    trusted_certificates: options.trusted_certificates,
                    certificate: options.certificate,
                    key: options.key,
                    passphrase: options.passphrase,
                },
            },
            trace,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_defaults() {
        let config = ConnectionConfig::default();
        assert_eq!(config.request_timeout, Duration::from_secs(20));
        assert_eq!(config.connect_timeout, Duration::from_secs(5));
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(20));
        assert!(config.trace.is_none());
    }

    #[test]
    fn test_options_from_json() {
        let options: ConnectionOptions = serde_json::from_str(
            r#"{"requestTimeoutMs": 1500, "heartbeatIntervalMs": 500, "trace": true,
                "headers": {"X-Client": "watcher"}, "authorization": "user:secret"}"#,
        )
        .unwrap();

        let config = ConnectionConfig::from(options);
        assert_eq!(config.request_timeout, Duration::from_millis(1500));
        assert_eq!(config.connect_timeout, DEFAULT_CONNECT_TIMEOUT);
        assert_eq!(config.heartbeat_interval(), Duration::from_millis(500));
        assert!(config.trace.is_some());
        assert_eq!(config.transport.headers.get("X-Client").map(String::as_str), Some("watcher"));
    }

    #[test]
    fn test_transport_security_options_from_json() {
        let options: ConnectionOptions = serde_json::from_str(
            r#"{"proxy": "http://127.0.0.1:3128", "proxyAuthorization": "me:pw",
                "trustedCertificates": ["CA PEM"], "certificate": "CERT PEM",
                "key": "KEY PEM", "passphrase": "hunter2"}"#,
        )
        .unwrap();

        let transport = ConnectionConfig::from(options).transport;
        assert_eq!(transport.proxy.as_deref(), Some("http://127.0.0.1:3128"));
        assert_eq!(transport.proxy_authorization.as_deref(), Some("me:pw"));
        assert_eq!(transport.tls.trusted_certificates, vec!["CA PEM".to_string()]);
        assert_eq!(transport.tls.certificate.as_deref(), Some("CERT PEM"));
        assert_eq!(transport.tls.passphrase.as_deref(), Some("hunter2"));

        let debug = format!("{:?}", transport.tls);
        assert!(!debug.contains("KEY PEM"));
        assert!(!debug.contains("hunter2"));
    }

    #[test]
    fn test_empty_options() {
        let options: ConnectionOptions = serde_json::from_str("{}").unwrap();
        assert_eq!(options, ConnectionOptions::default());
        let config = ConnectionConfig::from(options);
        assert_eq!(config.request_timeout, DEFAULT_REQUEST_TIMEOUT);
        assert!(config.trace.is_none());
    }

    #[test]
    fn test_client_request_headers() {
        let mut transport = TransportOptions::default();
        transport.headers.insert("X-Client".into(), "watcher".into());
        transport.authorization = Some("user:secret".into());

        let request = transport.client_request("ws://localhost:6006").unwrap();
        assert_eq!(request.headers()["x-client"], "watcher");
        assert_eq!(request.headers()["authorization"], "Basic dXNlcjpzZWNyZXQ=");
    }

    #[test]
    fn test_client_request_errors() {
        let transport = TransportOptions::default();
        assert!(matches!(transport.client_request("not a url"), Err(Error::Connection(_))));

        let mut bad_header = TransportOptions::default();
        bad_header.headers.insert("bad header".into(), "x".into());
        assert!(matches!(
            bad_header.client_request("ws://localhost:6006"),
            Err(Error::Connection(_))
        ));
    }

    #[test]
    fn test_websocket_config() {
        assert!(TransportOptions::default().websocket_config().is_none());
        let transport = TransportOptions {
            max_message_size: Some(1024),
            ..Default::default()
        };
        assert_eq!(transport.websocket_config().unwrap().max_message_size, Some(1024));
    }

    #[test]
    fn test_closure_trace_sink() {
        let frames = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&frames);
        let trace: Arc<dyn TraceSink> = Arc::new(move |direction: &str, message: &str| {
            sink.lock().unwrap().push(format!("{} {}", direction, message));
        });

        trace.trace("send", "{\"command\":\"ping\"}");
        assert_eq!(frames.lock().unwrap().as_slice(), &["send {\"command\":\"ping\"}".to_string()]);
    }
}
