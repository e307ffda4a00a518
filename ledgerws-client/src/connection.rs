//! WebSocket connection to a ledger node
//!
//! A [`Connection`] owns at most one socket at a time and multiplexes any
//! number of concurrent requests over it. Responses are matched to requests
//! by `id`; everything else the node sends is published on the connection's
//! [`EventBus`].
//!
//! # Connection Lifecycle
//!
//! 1. **Connect**: `connect()` spawns a socket driver task that performs the
//!    handshake. Concurrent callers share the same attempt.
//! 2. **Open**: backoff is reset, the heartbeat starts, `connected` is
//!    published.
//! 3. **Close**: pending requests fail with `Disconnected` and
//!    `disconnected(code)` is published. Unless the close was requested with
//!    `disconnect()`, a reconnect is scheduled after a backoff delay.
//!
//! # Cloning
//!
//! `Connection` is cheaply cloneable; all clones share one session. Spawned
//! tasks (socket driver, heartbeat, timers) only hold a [`WeakConnection`],
//! so dropping the last clone tears everything down.

use crate::config::ConnectionConfig;
use crate::connection_state::{ConnectWaiters, ConnectionState};
use crate::events::{ConnectionEvent, EventBus, SubscriptionToken};
use crate::metrics::ClientMetrics;
use crate::reconnect::{ExponentialBackoff, ReconnectionStrategy};
use crate::request::{RequestManager, ResponseFuture};
use crate::transport::Dialer;
use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use ledgerws_core::{codec, Error, InboundMessage, RequestId, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

/// Close code sent by `disconnect()`; a close with this code never triggers
/// a reconnect.
pub const INTENTIONAL_DISCONNECT_CODE: u16 = 4000;

/// Reported when the socket ends without a close frame
const ABNORMAL_CLOSE_CODE: u16 = 1006;

/// Reported when a close frame carries no code
const NO_STATUS_CODE: u16 = 1005;

/// Commands handed to the socket driver
enum Outbound {
    Text(String, oneshot::Sender<Result<()>>),
    Close(u16),
}

struct SocketHandle {
    generation: u64,
    tx: mpsc::UnboundedSender<Outbound>,
    driver: JoinHandle<()>,
}

/// A connection attempt that was torn down before opening
struct AbandonedAttempt {
    socket: SocketHandle,
    connect_timer: Option<JoinHandle<()>>,
}

struct Session {
    state: ConnectionState,
    socket: Option<SocketHandle>,
    generation: u64,
    waiters: ConnectWaiters,
    close_waiters: Vec<oneshot::Sender<u16>>,
    heartbeat: Option<JoinHandle<()>>,
    reconnect_timer: Option<JoinHandle<()>>,
    connect_timer: Option<JoinHandle<()>>,
    /// Bumped by every `disconnect()`; a scheduled reconnect that sees a
    /// different value stops retrying.
    reconnect_epoch: u64,
}

impl Session {
    fn new() -> Self {
        Self {
            state: ConnectionState::Idle,
            socket: None,
            generation: 0,
            waiters: ConnectWaiters::new(),
            close_waiters: Vec::new(),
            heartbeat: None,
            reconnect_timer: None,
            connect_timer: None,
            reconnect_epoch: 0,
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.socket.as_ref().is_some_and(|s| s.generation == generation)
    }

    fn abort_timers(&mut self) {
        for handle in [
            self.heartbeat.take(),
            self.reconnect_timer.take(),
            self.connect_timer.take(),
        ]
        .into_iter()
        .flatten()
        {
            handle.abort();
        }
    }
}

struct Inner {
    url: Option<String>,
    config: ConnectionConfig,
    session: Mutex<Session>,
    backoff: Mutex<Box<dyn ReconnectionStrategy>>,
    requests: RequestManager,
    events: EventBus,
    metrics: Option<Arc<ClientMetrics>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        let session = self.session.get_mut();
        session.abort_timers();
        if let Some(socket) = session.socket.take() {
            socket.driver.abort();
        }
    }
}

/// Reconnecting WebSocket connection to a ledger node
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

/// Non-owning handle to a [`Connection`]
#[derive(Clone)]
pub struct WeakConnection {
    inner: Weak<Inner>,
}

impl WeakConnection {
    /// The connection, if any clone of it is still alive
    pub fn upgrade(&self) -> Option<Connection> {
        self.inner.upgrade().map(|inner| Connection { inner })
    }
}

impl Connection {
    /// Create an idle connection. Nothing happens until `connect()`.
    pub fn new(url: Option<String>, config: ConnectionConfig) -> Self {
        Self::with_parts(url, config, Box::new(ExponentialBackoff::default()), None)
    }

    /// Start configuring a connection to `url`
    pub fn builder(url: impl Into<String>) -> crate::ConnectionBuilder {
        crate::ConnectionBuilder::new(url)
    }

    pub(crate) fn with_parts(
        url: Option<String>,
        config: ConnectionConfig,
        backoff: Box<dyn ReconnectionStrategy>,
        metrics: Option<Arc<ClientMetrics>>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                url,
                config,
                session: Mutex::new(Session::new()),
                backoff: Mutex::new(backoff),
                requests: RequestManager::new(),
                events: EventBus::new(),
                metrics,
            }),
        }
    }

    /// Open the socket, or wait for the attempt already in flight.
    ///
    /// Returns immediately when already open.
    ///
    /// # Errors
    ///
    /// - `Error::Connection` if no URL is configured, the TLS or proxy
    ///   settings are unusable, or a previous socket was never torn down
    /// - `Error::NotConnected` if the handshake fails, times out or the
    ///   attempt is abandoned by `disconnect()`
    #[tracing::instrument(skip(self), fields(url = ?self.inner.url))]
    pub async fn connect(&self) -> Result<()> {
        self.connect_in_epoch(None).await
    }

    /// `connect()`, refused when `expected_epoch` is given and a
    /// `disconnect()` has bumped the epoch since it was read.
    async fn connect_in_epoch(&self, expected_epoch: Option<u64>) -> Result<()> {
        let rx = {
            let mut session = self.inner.session.lock().await;
            if expected_epoch.is_some_and(|epoch| epoch != session.reconnect_epoch) {
                return Err(Error::NotConnected(
                    "reconnect was cancelled by disconnect".to_string(),
                ));
            }
            match session.state {
                ConnectionState::Open => return Ok(()),
                ConnectionState::Connecting => session.waiters.await_connection(),
                ConnectionState::Idle | ConnectionState::Closing => {
                    let url = self.inner.url.as_deref().ok_or_else(|| {
                        Error::Connection("cannot connect because no server was specified".to_string())
                    })?;
                    if session.socket.is_some() {
                        return Err(Error::Connection(
                            "previous websocket connection was never cleaned up".to_string(),
                        ));
                    }
                    let dialer = Dialer::new(&self.inner.config.transport, url)?;

                    session.generation += 1;
                    let generation = session.generation;
                    let (tx, outbound) = mpsc::unbounded_channel();
                    let driver = tokio::spawn(run_socket(
                        self.downgrade(),
                        generation,
                        dialer,
                        self.inner.config.connect_timeout,
                        outbound,
                    ));
                    session.socket = Some(SocketHandle {
                        generation,
                        tx,
                        driver,
                    });
                    session.connect_timer = Some(self.spawn_connect_timer(generation));
                    session.state = ConnectionState::Connecting;
                    self.record_state(ConnectionState::Connecting);
                    tracing::info!(generation, "Connecting");
                    session.waiters.await_connection()
                }
            }
        };

        rx.await
            .unwrap_or_else(|_| Err(Error::NotConnected("connection attempt was dropped".to_string())))
    }

    /// Close the socket deliberately and cancel any scheduled reconnect.
    ///
    /// Returns the close code once the close completes, or `None` if there
    /// was nothing to close. Never fails.
    #[tracing::instrument(skip(self))]
    pub async fn disconnect(&self) -> Option<u16> {
        self.close_socket(true).await.0
    }

    /// Disconnect, then connect again.
    ///
    /// A `disconnect()` issued while this runs wins; the connect half is
    /// then refused with `Error::NotConnected`.
    #[tracing::instrument(skip(self))]
    pub async fn reconnect(&self) -> Result<()> {
        tracing::info!("Reconnecting");
        self.inner.events.publish(&ConnectionEvent::Reconnect);
        let (_, epoch) = self.close_socket(true).await;
        self.connect_in_epoch(Some(epoch)).await
    }

    /// Send a command and wait for its correlated response.
    ///
    /// The body must be a JSON object; an `id` is added unless the caller
    /// supplied one. `timeout` defaults to the configured request timeout.
    ///
    /// # Errors
    ///
    /// - `Error::NotConnected` if there is no socket
    /// - `Error::Timeout`, `Error::Disconnected`, `Error::Remote` or
    ///   `Error::ResponseFormat` from settlement
    #[tracing::instrument(
        skip(self, body),
        fields(command = body.get("command").and_then(serde_json::Value::as_str).unwrap_or("unknown"))
    )]
    pub async fn request(&self, body: Value, timeout: Option<Duration>) -> Result<Value> {
        let start = Instant::now();
        let command = body
            .get("command")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();

        let dispatched = self.dispatch(&body, timeout).await?;
        let id = dispatched.id.clone();
        let result = dispatched.settle().await;

        let duration = start.elapsed().as_secs_f64();
        match &result {
            Ok(_) => {
                tracing::debug!(id = %id, duration_secs = duration, "Request completed");
                if let Some(m) = &self.inner.metrics {
                    m.record_request(&command, "success", duration);
                }
            }
            Err(error) => {
                tracing::debug!(id = %id, error = %error, "Request failed");
                if let Some(m) = &self.inner.metrics {
                    m.record_request(&command, error.kind(), duration);
                }
            }
        }
        result
    }

    /// Register the request and hand it to the socket driver.
    ///
    /// The returned [`Dispatched`] holds no reference to the connection.
    async fn dispatch(&self, body: &Value, timeout: Option<Duration>) -> Result<Dispatched> {
        let tx = {
            let session = self.inner.session.lock().await;
            session.socket.as_ref().map(|socket| socket.tx.clone())
        }
        .ok_or_else(|| Error::NotConnected("websocket is not open".to_string()))?;

        let timeout = timeout.unwrap_or(self.inner.config.request_timeout);
        let (id, message, response) = self.inner.requests.create_request(body, timeout).await?;
        self.trace("send", &message);

        let (ack_tx, ack_rx) = oneshot::channel();
        let ack = if tx.send(Outbound::Text(message, ack_tx)).is_err() {
            let _ = self
                .inner
                .requests
                .reject(&id, Error::Disconnected("websocket closed before the request was sent".to_string()))
                .await;
            None
        } else {
            Some(ack_rx)
        };

        Ok(Dispatched {
            id,
            response,
            ack,
            requests: self.inner.requests.clone(),
        })
    }

    /// Issue `command` with `params` merged into the body and deserialize
    /// the `result` field of the response.
    pub async fn call<R>(&self, command: &str, params: impl Serialize) -> Result<R>
    where
        R: DeserializeOwned,
    {
        let mut body = match serde_json::to_value(params)? {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                return Err(Error::InvalidRequest(format!(
                    "params for {} must serialize to an object, got {}",
                    command, other
                )))
            }
        };
        body.insert("command".to_string(), Value::String(command.to_string()));

        let mut response = self.request(Value::Object(body), None).await?;
        let result = response
            .get_mut("result")
            .map(Value::take)
            .ok_or_else(|| Error::ResponseFormat(format!("response to {} has no result", command)))?;
        Ok(serde_json::from_value(result)?)
    }

    /// Subscribe to events named `name`
    pub fn on<F>(&self, name: impl Into<String>, handler: F) -> SubscriptionToken
    where
        F: Fn(&ConnectionEvent) + Send + Sync + 'static,
    {
        self.inner.events.subscribe(name, handler)
    }

    /// Remove a subscription
    pub fn off(&self, token: SubscriptionToken) -> bool {
        self.inner.events.unsubscribe(token)
    }

    /// The connection's event bus
    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub async fn state(&self) -> ConnectionState {
        self.inner.session.lock().await.state
    }

    pub async fn is_connected(&self) -> bool {
        self.state().await == ConnectionState::Open
    }

    pub fn url(&self) -> Option<&str> {
        self.inner.url.as_deref()
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    /// Number of requests waiting for a response
    pub async fn pending_requests(&self) -> usize {
        self.inner.requests.pending_count().await
    }

    pub fn downgrade(&self) -> WeakConnection {
        WeakConnection {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Returns the close code and the reconnect epoch read under the same
    /// lock, after any bump.
    async fn close_socket(&self, cancel_reconnect: bool) -> (Option<u16>, u64) {
        let (rx, epoch) = {
            let mut session = self.inner.session.lock().await;
            if cancel_reconnect {
                session.reconnect_epoch += 1;
                if let Some(timer) = session.reconnect_timer.take() {
                    tracing::debug!("Cancelled scheduled reconnect");
                    timer.abort();
                }
            }
            let epoch = session.reconnect_epoch;
            if let Some(heartbeat) = session.heartbeat.take() {
                heartbeat.abort();
            }

            match session.state {
                ConnectionState::Idle => return (None, epoch),
                ConnectionState::Connecting => {
                    if let Some(timer) = session.connect_timer.take() {
                        timer.abort();
                    }
                    if let Some(socket) = session.socket.take() {
                        socket.driver.abort();
                    }
                    session.waiters.reject_all(Error::NotConnected(
                        "connection attempt was abandoned by disconnect".to_string(),
                    ));
                    session.state = ConnectionState::Idle;
                    self.record_state(ConnectionState::Idle);
                    tracing::info!("Connection attempt abandoned");
                    return (Some(INTENTIONAL_DISCONNECT_CODE), epoch);
                }
                ConnectionState::Open => {
                    session.state = ConnectionState::Closing;
                    self.record_state(ConnectionState::Closing);
                    if let Some(socket) = &session.socket {
                        // a dead driver still reports through the close handler
                        let _ = socket.tx.send(Outbound::Close(INTENTIONAL_DISCONNECT_CODE));
                    }
                }
                ConnectionState::Closing => {}
            }

            let (tx, rx) = oneshot::channel();
            session.close_waiters.push(tx);
            (rx, epoch)
        };
        (rx.await.ok(), epoch)
    }

    /// Handshake finished. Returns false if the socket is stale.
    async fn opened(&self, generation: u64) -> bool {
        {
            let mut session = self.inner.session.lock().await;
            if !session.is_current(generation) || session.state != ConnectionState::Connecting {
                return false;
            }
            if let Some(timer) = session.connect_timer.take() {
                timer.abort();
            }
            self.inner.backoff.lock().await.reset();
            session.heartbeat = Some(self.spawn_heartbeat());
            session.state = ConnectionState::Open;
            session.waiters.resolve_all();
        }

        self.record_state(ConnectionState::Open);
        tracing::info!(generation, "Connected");
        self.inner.events.publish(&ConnectionEvent::Connected);
        true
    }

    /// Handshake failed or timed out before the socket opened.
    async fn connect_failed(&self, generation: u64, error: Error) -> Option<AbandonedAttempt> {
        let attempt = {
            let mut session = self.inner.session.lock().await;
            if !session.is_current(generation) || session.state != ConnectionState::Connecting {
                return None;
            }
            let socket = session.socket.take()?;
            let connect_timer = session.connect_timer.take();
            session.state = ConnectionState::Idle;
            session.waiters.reject_all(error.clone());
            AbandonedAttempt {
                socket,
                connect_timer,
            }
        };

        self.record_state(ConnectionState::Idle);
        tracing::warn!(generation, error = %error, "Connection attempt failed");
        Some(attempt)
    }

    /// Socket closed after opening.
    async fn on_closed(&self, generation: u64, code: u16, reason: String) {
        let close_waiters = {
            let mut session = self.inner.session.lock().await;
            if !session.is_current(generation) {
                return;
            }
            if let Some(heartbeat) = session.heartbeat.take() {
                heartbeat.abort();
            }
            session.socket = None;
            session.state = ConnectionState::Idle;
            std::mem::take(&mut session.close_waiters)
        };

        self.record_state(ConnectionState::Idle);
        tracing::info!(generation, code, reason = %reason, "Connection closed");

        self.inner
            .requests
            .reject_all(Error::Disconnected(format!("websocket was closed, {}", reason)))
            .await;
        self.inner.events.publish(&ConnectionEvent::Disconnected { code });

        if code != INTENTIONAL_DISCONNECT_CODE {
            self.schedule_reconnect().await;
        }
        for waiter in close_waiters {
            let _ = waiter.send(code);
        }
    }

    async fn on_message(&self, text: &str) {
        self.trace("receive", text);

        match codec::decode(text) {
            Err(e) => self.publish_error("badMessage", e.to_string(), Value::String(text.to_string())),
            Ok(InboundMessage::Response(value)) => {
                self.inner.events.publish(&ConnectionEvent::Push {
                    kind: ledgerws_core::RESPONSE_TYPE.to_string(),
                    payload: value.clone(),
                });
                let raw = Value::String(text.to_string());
                if let Err(e) = self.inner.requests.handle_response(value).await {
                    self.publish_error("badMessage", e.to_string(), raw);
                }
            }
            Ok(InboundMessage::Push { kind, payload }) => {
                tracing::debug!(kind = %kind, "Push message received");
                if let Some(m) = &self.inner.metrics {
                    m.record_push(&kind);
                }
                self.inner.events.publish(&ConnectionEvent::Push { kind, payload });
            }
            Ok(InboundMessage::ServerError { error, message, raw }) => {
                tracing::warn!(error = %error, message = ?message, "Server reported an error");
                if let Some(m) = &self.inner.metrics {
                    m.record_error(&error);
                }
                self.inner.events.publish(&ConnectionEvent::Error {
                    kind: error,
                    message,
                    raw,
                });
            }
            Ok(InboundMessage::Unrecognized(_)) => {
                self.publish_error(
                    "badMessage",
                    "unrecognized message",
                    Value::String(text.to_string()),
                );
            }
        }
    }

    async fn schedule_reconnect(&self) {
        let (delay, attempt) = {
            let mut backoff = self.inner.backoff.lock().await;
            let delay = backoff.next_delay();
            (delay, backoff.attempts())
        };

        tracing::warn!(attempt, delay_ms = delay.as_millis() as u64, "Scheduling reconnect");
        if let Some(m) = &self.inner.metrics {
            m.record_reconnection_attempt();
        }
        self.inner
            .events
            .publish(&ConnectionEvent::Reconnecting { attempt });

        let mut session = self.inner.session.lock().await;
        let epoch = session.reconnect_epoch;
        let timer = tokio::spawn(run_scheduled_reconnect(self.downgrade(), delay, epoch));
        if let Some(previous) = session.reconnect_timer.replace(timer) {
            previous.abort();
        }
    }

    fn spawn_connect_timer(&self, generation: u64) -> JoinHandle<()> {
        let weak = self.downgrade();
        let timeout = self.inner.config.connect_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(connection) = weak.upgrade() else {
                return;
            };
            let error = Error::NotConnected(format!(
                "connection timed out after {} ms",
                timeout.as_millis()
            ));
            if let Some(attempt) = connection.connect_failed(generation, error).await {
                attempt.socket.driver.abort();
            }
        })
    }

    fn spawn_heartbeat(&self) -> JoinHandle<()> {
        let weak = self.downgrade();
        let period = self.inner.config.heartbeat_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                ticker.tick().await;
                // the connection is only borrowed while the ping is queued
                let ping = {
                    let Some(connection) = weak.upgrade() else {
                        break;
                    };
                    let dispatched = connection.dispatch(&json!({"command": "ping"}), None).await;
                    dispatched
                };
                let result = match ping {
                    Ok(dispatched) => dispatched.settle().await.map(|_| ()),
                    Err(e) => Err(e),
                };
                if let Err(e) = result {
                    tracing::warn!(error = %e, "Heartbeat failed, reconnecting");
                    let weak = weak.clone();
                    tokio::spawn(async move {
                        let Some(connection) = weak.upgrade() else {
                            return;
                        };
                        if let Err(e) = connection.reconnect().await {
                            connection.publish_error("reconnect", e.to_string(), Value::Null);
                        }
                    });
                    break;
                }
            }
        })
    }

    fn publish_error(&self, kind: &str, message: impl Into<String>, raw: Value) {
        let message = message.into();
        tracing::warn!(kind, message = %message, "Connection error");
        if let Some(m) = &self.inner.metrics {
            m.record_error(kind);
        }
        self.inner
            .events
            .publish(&ConnectionEvent::error(kind, message, raw));
    }

    fn trace(&self, direction: &str, message: &str) {
        if let Some(sink) = &self.inner.config.trace {
            sink.trace(direction, message);
        }
    }

    fn record_state(&self, state: ConnectionState) {
        if let Some(m) = &self.inner.metrics {
            m.update_connection_state(state);
        }
    }
}

fn run_scheduled_reconnect(weak: WeakConnection, delay: Duration, epoch: u64) -> BoxFuture<'static, ()> {
    Box::pin(async move {
        tokio::time::sleep(delay).await;
        let Some(connection) = weak.upgrade() else {
            return;
        };
        {
            let mut session = connection.inner.session.lock().await;
            if session.reconnect_epoch != epoch {
                return;
            }
            // from here on only a disconnect() epoch bump stops this attempt
            session.reconnect_timer.take();
        }

        tracing::info!("Reconnecting after backoff");
        connection.inner.events.publish(&ConnectionEvent::Reconnect);
        connection.close_socket(false).await;

        // refused under the session lock if disconnect() ran since the check above
        match connection.connect_in_epoch(Some(epoch)).await {
            Ok(()) => {
                if let Some(m) = &connection.inner.metrics {
                    m.record_reconnection_success();
                }
            }
            Err(e) => {
                let still_wanted = connection.inner.session.lock().await.reconnect_epoch == epoch;
                if still_wanted {
                    connection.publish_error("reconnect", e.to_string(), Value::Null);
                    connection.schedule_reconnect().await;
                } else {
                    tracing::debug!(error = %e, "Reconnect abandoned by disconnect");
                }
            }
        }
    })
}

/// A request queued on the socket, awaiting settlement
struct Dispatched {
    id: RequestId,
    response: ResponseFuture,
    /// Write acknowledgement from the driver; `None` when the queue was
    /// already closed and the request rejected
    ack: Option<oneshot::Receiver<Result<()>>>,
    requests: RequestManager,
}

impl Dispatched {
    async fn settle(self) -> Result<Value> {
        let Dispatched {
            id,
            response,
            ack,
            requests,
        } = self;
        let Some(ack) = ack else {
            return response.await;
        };

        tokio::pin!(response);
        tokio::select! {
            result = &mut response => result,
            ack = ack => {
                let failure = match ack {
                    Ok(Ok(())) => None,
                    Ok(Err(e)) => Some(format!("failed to send request: {}", e)),
                    Err(_) => Some("websocket closed before the request was sent".to_string()),
                };
                if let Some(message) = failure {
                    let _ = requests.reject(&id, Error::Disconnected(message)).await;
                }
                response.await
            }
        }
    }
}

/// Owns one socket from handshake to close.
async fn run_socket(
    weak: WeakConnection,
    generation: u64,
    dialer: Dialer,
    close_timeout: Duration,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
) {
    let stream = match dialer.dial().await {
        Ok(stream) => stream,
        Err(e) => {
            if let Some(connection) = weak.upgrade() {
                let error = Error::NotConnected(e);
                if let Some(attempt) = connection.connect_failed(generation, error).await {
                    if let Some(timer) = attempt.connect_timer {
                        timer.abort();
                    }
                }
            }
            return;
        }
    };

    let is_current = match weak.upgrade() {
        Some(connection) => connection.opened(generation).await,
        None => false,
    };
    if !is_current {
        let mut stream = stream;
        let _ = stream.close(None).await;
        return;
    }

    let (mut write, mut read) = stream.split();
    let close_deadline = tokio::time::sleep(close_timeout);
    tokio::pin!(close_deadline);
    let mut close_sent: Option<u16> = None;

    let (code, reason) = loop {
        tokio::select! {
            command = outbound.recv() => match command {
                Some(Outbound::Text(text, ack)) => {
                    let result = write
                        .send(Message::Text(text))
                        .await
                        .map_err(|e| Error::WebSocket(e.to_string()));
                    let _ = ack.send(result);
                }
                Some(Outbound::Close(code)) => {
                    if close_sent.is_some() {
                        continue;
                    }
                    close_sent = Some(code);
                    close_deadline
                        .as_mut()
                        .reset(tokio::time::Instant::now() + close_timeout);
                    let frame = CloseFrame {
                        code: CloseCode::from(code),
                        reason: "".into(),
                    };
                    if let Err(e) = write.send(Message::Close(Some(frame))).await {
                        break (code, e.to_string());
                    }
                }
                None => break (close_sent.unwrap_or(INTENTIONAL_DISCONNECT_CODE), "connection dropped".to_string()),
            },
            frame = read.next() => match frame {
                Some(Ok(Message::Text(text))) => match weak.upgrade() {
                    Some(connection) => connection.on_message(&text).await,
                    None => break (INTENTIONAL_DISCONNECT_CODE, "connection dropped".to_string()),
                },
                Some(Ok(Message::Binary(data))) => match (weak.upgrade(), String::from_utf8(data)) {
                    (Some(connection), Ok(text)) => connection.on_message(&text).await,
                    (Some(connection), Err(e)) => {
                        connection.publish_error("badMessage", e.to_string(), Value::Null)
                    }
                    (None, _) => break (INTENTIONAL_DISCONNECT_CODE, "connection dropped".to_string()),
                },
                Some(Ok(Message::Close(frame))) => {
                    let (peer_code, reason) = frame
                        .map(|f| (u16::from(f.code), f.reason.to_string()))
                        .unwrap_or((NO_STATUS_CODE, String::new()));
                    // a deliberate close keeps its own code whatever the peer echoes
                    break (close_sent.unwrap_or(peer_code), reason);
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => break (close_sent.unwrap_or(ABNORMAL_CLOSE_CODE), e.to_string()),
                None => break (close_sent.unwrap_or(ABNORMAL_CLOSE_CODE), "connection ended".to_string()),
            },
            () = &mut close_deadline, if close_sent.is_some() => {
                break (close_sent.unwrap_or(INTENTIONAL_DISCONNECT_CODE), "close handshake timed out".to_string());
            }
        }
    };

    let _ = write.close().await;
    if let Some(connection) = weak.upgrade() {
        connection.on_closed(generation, code, reason).await;
    }
}
