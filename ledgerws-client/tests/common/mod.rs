//! Common test utilities for ledgerws-client integration tests
//!
//! This module provides a mock ledger node, optionally behind TLS, a mock
//! HTTP `CONNECT` proxy, and helpers for testing connection behavior
//! without a real server.

#![allow(dead_code)]

use futures::{SinkExt, StreamExt};
use ledgerws_client::{Connection, ConnectionEvent};
use rustls::pki_types::CertificateDer;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;

pub const CA_PEM: &str = include_str!("../fixtures/ca.pem");
pub const SERVER_CERT_PEM: &str = include_str!("../fixtures/server.pem");
pub const SERVER_KEY_PEM: &str = include_str!("../fixtures/server.key");
pub const CLIENT_CERT_PEM: &str = include_str!("../fixtures/client.pem");
pub const CLIENT_KEY_PEM: &str = include_str!("../fixtures/client.key");
/// Encrypted with [`CLIENT_KEY_PASSPHRASE`]
pub const CLIENT_KEY_ENCRYPTED_PEM: &str = include_str!("../fixtures/client-encrypted.key");
pub const CLIENT_KEY_PASSPHRASE: &str = "hunter2";

/// Instructions fanned out to every open server-side socket
#[derive(Debug, Clone)]
enum Control {
    /// Send this text frame
    Push(String),
    /// Drop the TCP stream without a close frame
    Kill,
}

type Handler = Arc<dyn Fn(&Value) -> Option<Value> + Send + Sync>;

/// TLS mode of a [`MockWsServer`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerTls {
    /// Server certificate signed by the fixture CA
    ServerAuth,
    /// As `ServerAuth`, and the client must present a certificate signed by
    /// the fixture CA
    MutualAuth,
}

/// State shared by every socket a server accepts
#[derive(Clone)]
struct Shared {
    handler: Handler,
    control_tx: broadcast::Sender<Control>,
    msg_tx: mpsc::UnboundedSender<Value>,
    connections: Arc<AtomicUsize>,
    authorizations: Arc<Mutex<Vec<String>>>,
}

/// Mock ledger node
///
/// Accepts WebSocket connections, answers each inbound JSON message with
/// whatever the handler returns, and can push messages or drop every
/// connection on demand.
pub struct MockWsServer {
    addr: SocketAddr,
    tls: bool,
    shutdown_tx: mpsc::Sender<()>,
    control_tx: broadcast::Sender<Control>,
    message_rx: mpsc::UnboundedReceiver<Value>,
    connections: Arc<AtomicUsize>,
    authorizations: Arc<Mutex<Vec<String>>>,
}

impl MockWsServer {
    /// Start a server that answers every command with an empty success
    pub async fn new() -> Self {
        Self::with_handler(success_for).await
    }

    /// Start a server with a custom handler
    ///
    /// The handler receives each parsed inbound message and returns the
    /// response to send, or `None` to stay silent.
    pub async fn with_handler<F>(handler: F) -> Self
    where
        F: Fn(&Value) -> Option<Value> + Send + Sync + 'static,
    {
        Self::start(Arc::new(handler), None).await
    }

    /// Start a `wss://` server answering every command with an empty success
    pub async fn with_tls(mode: ServerTls) -> Self {
        Self::start(Arc::new(success_for), Some(tls_acceptor(mode))).await
    }

    async fn start(handler: Handler, acceptor: Option<TlsAcceptor>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        let (control_tx, _) = broadcast::channel::<Control>(64);
        let (msg_tx, message_rx) = mpsc::unbounded_channel::<Value>();
        let connections = Arc::new(AtomicUsize::new(0));
        let authorizations = Arc::new(Mutex::new(Vec::new()));

        let shared = Shared {
            handler,
            control_tx: control_tx.clone(),
            msg_tx,
            connections: Arc::clone(&connections),
            authorizations: Arc::clone(&authorizations),
        };
        let tls = acceptor.is_some();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        let _ = shared.control_tx.send(Control::Kill);
                        break;
                    }
                    accept_result = listener.accept() => {
                        let Ok((stream, _)) = accept_result else { continue };
                        let shared = shared.clone();
                        let acceptor = acceptor.clone();
                        tokio::spawn(async move {
                            match acceptor {
                                None => serve_socket(stream, shared).await,
                                Some(acceptor) => {
                                    if let Ok(stream) = acceptor.accept(stream).await {
                                        serve_socket(stream, shared).await;
                                    }
                                }
                            }
                        });
                    }
                }
            }
        });

        Self {
            addr,
            tls,
            shutdown_tx,
            control_tx,
            message_rx,
            connections,
            authorizations,
        }
    }

    /// Get the WebSocket URL for connecting to this server
    pub fn url(&self) -> String {
        let scheme = if self.tls { "wss" } else { "ws" };
        format!("{}://{}", scheme, self.addr)
    }

    /// Number of WebSocket handshakes completed so far
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Authorization headers seen during handshakes
    pub fn authorizations(&self) -> Vec<String> {
        self.authorizations.lock().unwrap().clone()
    }

    /// Push a JSON message to every open connection
    pub fn push(&self, message: Value) {
        self.push_raw(message.to_string());
    }

    /// Push raw text to every open connection
    pub fn push_raw(&self, text: impl Into<String>) {
        let _ = self.control_tx.send(Control::Push(text.into()));
    }

    /// Drop every open connection without a close frame
    pub fn kill_connections(&self) {
        let _ = self.control_tx.send(Control::Kill);
    }

    /// Wait for the next message the server received
    pub async fn wait_for_message(&mut self) -> Option<Value> {
        tokio::time::timeout(Duration::from_secs(5), self.message_rx.recv())
            .await
            .ok()
            .flatten()
    }

    /// Stop accepting and drop every connection
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(()).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// Run the WebSocket handshake and answer messages until the socket ends
async fn serve_socket<S>(stream: S, shared: Shared)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut control_rx = shared.control_tx.subscribe();
    let authorizations = Arc::clone(&shared.authorizations);
    let record_auth = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        if let Some(value) = request.headers().get("authorization") {
            if let Ok(value) = value.to_str() {
                authorizations.lock().unwrap().push(value.to_string());
            }
        }
        Ok(response)
    };
    let Ok(ws_stream) = accept_hdr_async(stream, record_auth).await else {
        return;
    };
    shared.connections.fetch_add(1, Ordering::SeqCst);
    let (mut write, mut read) = ws_stream.split();

    loop {
        tokio::select! {
            control = control_rx.recv() => match control {
                Ok(Control::Push(text)) => {
                    let _ = write.send(Message::Text(text)).await;
                }
                Ok(Control::Kill) | Err(_) => break,
            },
            frame = read.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    let Ok(value) = serde_json::from_str::<Value>(&text) else {
                        continue;
                    };
                    let _ = shared.msg_tx.send(value.clone());
                    if let Some(response) = (shared.handler)(&value) {
                        let _ = write.send(Message::Text(response.to_string())).await;
                    }
                }
                // keep reading so the close reply is flushed
                Some(Ok(_)) => {}
                Some(Err(_)) | None => break,
            },
        }
    }
}

pub fn pem_certificates(pem: &str) -> Vec<CertificateDer<'static>> {
    rustls_pemfile::certs(&mut pem.as_bytes())
        .collect::<Result<Vec<_>, _>>()
        .unwrap()
}

fn tls_acceptor(mode: ServerTls) -> TlsAcceptor {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let key = rustls_pemfile::private_key(&mut SERVER_KEY_PEM.as_bytes())
        .unwrap()
        .unwrap();

    let builder = rustls::ServerConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()
        .unwrap();
    let builder = match mode {
        ServerTls::ServerAuth => builder.with_no_client_auth(),
        ServerTls::MutualAuth => {
            let mut roots = rustls::RootCertStore::empty();
            for certificate in pem_certificates(CA_PEM) {
                roots.add(certificate).unwrap();
            }
            let verifier =
                rustls::server::WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider)
                    .build()
                    .unwrap();
            builder.with_client_cert_verifier(verifier)
        }
    };
    let config = builder
        .with_single_cert(pem_certificates(SERVER_CERT_PEM), key)
        .unwrap();
    TlsAcceptor::from(Arc::new(config))
}

/// Mock HTTP proxy that answers `CONNECT` and splices the tunnel
///
/// Every request head is recorded. A proxy built with [`MockProxy::refusing`]
/// answers with that status and closes instead.
pub struct MockProxy {
    addr: SocketAddr,
    requests: Arc<Mutex<Vec<String>>>,
}

impl MockProxy {
    pub async fn start() -> Self {
        Self::with_status(None).await
    }

    /// Answer every `CONNECT` with `status`, e.g. `"407 Proxy Authentication Required"`
    pub async fn refusing(status: &'static str) -> Self {
        Self::with_status(Some(status)).await
    }

    async fn with_status(refusal: Option<&'static str>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));

        let recorded = Arc::clone(&requests);
        tokio::spawn(async move {
            while let Ok((mut client, _)) = listener.accept().await {
                let recorded = Arc::clone(&recorded);
                tokio::spawn(async move {
                    let Some(head) = read_head(&mut client).await else {
                        return;
                    };
                    recorded.lock().unwrap().push(head.clone());

                    if let Some(status) = refusal {
                        let reply = format!("HTTP/1.1 {}\r\nContent-Length: 0\r\n\r\n", status);
                        let _ = client.write_all(reply.as_bytes()).await;
                        return;
                    }
                    let Some(target) = head.split_whitespace().nth(1) else {
                        return;
                    };
                    let Ok(mut upstream) = TcpStream::connect(target).await else {
                        let _ = client.write_all(b"HTTP/1.1 502 Bad Gateway\r\n\r\n").await;
                        return;
                    };
                    if client
                        .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
                        .await
                        .is_err()
                    {
                        return;
                    }
                    let _ = tokio::io::copy_bidirectional(&mut client, &mut upstream).await;
                });
            }
        });

        Self { addr, requests }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Request heads received so far
    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }
}

async fn read_head(stream: &mut TcpStream) -> Option<String> {
    let mut head = Vec::new();
    while !head.ends_with(b"\r\n\r\n") {
        head.push(stream.read_u8().await.ok()?);
    }
    String::from_utf8(head).ok()
}

/// `{"type":"response","status":"success"}` for any message with an id
pub fn success_for(request: &Value) -> Option<Value> {
    let id = request.get("id")?.clone();
    Some(success_response(id, json!({})))
}

/// Build a success response
pub fn success_response(id: Value, result: Value) -> Value {
    json!({
        "type": "response",
        "id": id,
        "status": "success",
        "result": result
    })
}

/// Build an error response
pub fn error_response(id: Value, error: &str, message: &str) -> Value {
    json!({
        "type": "response",
        "id": id,
        "status": "error",
        "error": error,
        "error_message": message,
        "request": {"command": "submit", "id": id}
    })
}

/// Collects events published under the given names
pub fn record_events(connection: &Connection, names: &[&str]) -> Arc<Mutex<Vec<ConnectionEvent>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    for name in names {
        let sink = Arc::clone(&events);
        connection.on(*name, move |event| sink.lock().unwrap().push(event.clone()));
    }
    events
}

/// Events in `events` with the given name
pub fn named(events: &Arc<Mutex<Vec<ConnectionEvent>>>, name: &str) -> Vec<ConnectionEvent> {
    events
        .lock()
        .unwrap()
        .iter()
        .filter(|event| event.name() == name)
        .cloned()
        .collect()
}

/// Route client logs to the test writer; `RUST_LOG` narrows them.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("ledgerws_client=debug")),
        )
        .with_test_writer()
        .try_init();
}

/// Poll `check` every 10ms for up to 5s
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..500 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_server_creation() {
        let server = MockWsServer::new().await;
        assert!(server.url().starts_with("ws://127.0.0.1:"));
        assert_eq!(server.connection_count(), 0);
        server.shutdown().await;
    }

    #[test]
    fn test_response_helpers() {
        let ok = success_for(&json!({"command": "ping", "id": 3})).unwrap();
        assert_eq!(ok["type"], "response");
        assert_eq!(ok["id"], 3);
        assert_eq!(ok["status"], "success");
        assert!(success_for(&json!({"command": "ping"})).is_none());

        let err = error_response(json!(4), "tooBusy", "overloaded");
        assert_eq!(err["status"], "error");
        assert_eq!(err["error_message"], "overloaded");
    }
}
