//! Event subscriptions for a connection
//!
//! The connection publishes lifecycle events (`connected`, `disconnected`,
//! `reconnecting`, `reconnect`, `error`) and every server push message under
//! the push's `type` (`ledgerClosed`, `transaction`, `response`, ...).
//!
//! Handlers are plain synchronous closures. They run on the publishing task,
//! in registration order, with no lock held, so a handler may subscribe,
//! unsubscribe or spawn work on the connection. Long work belongs in a
//! spawned task.
//!
//! # Examples
//!
//! ```rust
//! use ledgerws_client::{ConnectionEvent, EventBus};
//! use std::sync::atomic::{AtomicU32, Ordering};
//! use std::sync::Arc;
//!
//! let bus = EventBus::new();
//! let seen = Arc::new(AtomicU32::new(0));
//! let counter = Arc::clone(&seen);
//! let token = bus.subscribe("connected", move |_| {
//!     counter.fetch_add(1, Ordering::SeqCst);
//! });
//!
//! bus.publish(&ConnectionEvent::Connected);
//! bus.unsubscribe(token);
//! bus.publish(&ConnectionEvent::Connected);
//! assert_eq!(seen.load(Ordering::SeqCst), 1);
//! ```

use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Event published by a connection
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// Socket opened
    Connected,
    /// Socket closed with this code
    Disconnected { code: u16 },
    /// A reconnect was scheduled after an unexpected close
    Reconnecting { attempt: u32 },
    /// A reconnect cycle is starting
    Reconnect,
    /// A fault with no caller to report to
    Error {
        kind: String,
        message: Option<String>,
        raw: Value,
    },
    /// Server push message, published under its `type`
    Push { kind: String, payload: Value },
}

impl ConnectionEvent {
    /// Name handlers subscribe to
    pub fn name(&self) -> &str {
        match self {
            ConnectionEvent::Connected => "connected",
            ConnectionEvent::Disconnected { .. } => "disconnected",
            ConnectionEvent::Reconnecting { .. } => "reconnecting",
            ConnectionEvent::Reconnect => "reconnect",
            ConnectionEvent::Error { .. } => "error",
            ConnectionEvent::Push { kind, .. } => kind,
        }
    }

    pub(crate) fn error(kind: impl Into<String>, message: impl Into<String>, raw: Value) -> Self {
        ConnectionEvent::Error {
            kind: kind.into(),
            message: Some(message.into()),
            raw,
        }
    }
}

/// Handler function type
pub type EventHandler = Arc<dyn Fn(&ConnectionEvent) + Send + Sync>;

/// Handle returned by [`EventBus::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionToken(u64);

#[derive(Default)]
struct Registry {
    by_name: HashMap<String, Vec<(u64, EventHandler)>>,
}

/// Named pub/sub registry for connection events
#[derive(Clone, Default)]
pub struct EventBus {
    registry: Arc<Mutex<Registry>>,
    next_token: Arc<AtomicU64>,
}

impl EventBus {
    /// Create an empty bus
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for events named `name`
    pub fn subscribe<F>(&self, name: impl Into<String>, handler: F) -> SubscriptionToken
    where
        F: Fn(&ConnectionEvent) + Send + Sync + 'static,
    {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let handler: EventHandler = Arc::new(handler);
        self.lock().by_name.entry(name.into()).or_default().push((token, handler));
        SubscriptionToken(token)
    }

    /// Remove a handler; returns whether it was registered
    pub fn unsubscribe(&self, token: SubscriptionToken) -> bool {
        let mut registry = self.lock();
        let mut removed = false;
        registry.by_name.retain(|_, handlers| {
            let before = handlers.len();
            handlers.retain(|(id, _)| *id != token.0);
            removed |= handlers.len() != before;
            !handlers.is_empty()
        });
        removed
    }

    /// Deliver `event` to every handler subscribed to its name
    pub fn publish(&self, event: &ConnectionEvent) {
        let handlers: Vec<EventHandler> = match self.lock().by_name.get(event.name()) {
            Some(handlers) => handlers.iter().map(|(_, h)| Arc::clone(h)).collect(),
            None => {
                tracing::trace!(event = event.name(), "No subscribers for event");
                return;
            }
        };
        for handler in handlers {
            handler(event);
        }
    }

    /// Number of handlers registered for `name`
    pub fn subscriber_count(&self, name: &str) -> usize {
        self.lock().by_name.get(name).map_or(0, Vec::len)
    }

    /// Names that currently have at least one handler
    pub fn names(&self) -> Vec<String> {
        self.lock().by_name.keys().cloned().collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
