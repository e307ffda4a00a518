//! Connection state and connect waiters
//!
//! # Connection States
//!
//! - **Idle**: no socket; initial state and the state after every close
//! - **Connecting**: handshake in flight, callers queue as waiters
//! - **Open**: socket usable, heartbeat running
//! - **Closing**: a deliberate close frame was sent, waiting for the peer
//!
//! # State Transitions
//!
//! ```text
//! Idle → Connecting → Open → Closing
//!  ↑         |          |        |
//!  └─────────┴──────────┴────────┘
//! ```
//!
//! There is no terminal state; an idle connection can always connect again.

use ledgerws_core::{Error, Result};
use tokio::sync::oneshot;

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected
    Idle,
    /// Handshake in progress
    Connecting,
    /// Connected and operational
    Open,
    /// Deliberate close in progress
    Closing,
}

impl ConnectionState {
    /// Numeric form recorded by the connection state gauge
    pub fn as_gauge(&self) -> i64 {
        match self {
            ConnectionState::Idle => 0,
            ConnectionState::Connecting => 1,
            ConnectionState::Open => 2,
            ConnectionState::Closing => 3,
        }
    }
}

/// Callers waiting for an in-flight connection attempt
///
/// Every waiter is settled by the same `resolve_all` or `reject_all` call,
/// which leaves the queue empty for the next attempt.
#[derive(Default)]
pub struct ConnectWaiters {
    waiters: Vec<oneshot::Sender<Result<()>>>,
}

impl ConnectWaiters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a waiter and return the receiving end
    pub fn await_connection(&mut self) -> oneshot::Receiver<Result<()>> {
        let (tx, rx) = oneshot::channel();
        self.waiters.push(tx);
        rx
    }

    /// Succeed every queued waiter
    pub fn resolve_all(&mut self) {
        for tx in self.waiters.drain(..) {
            let _ = tx.send(Ok(()));
        }
    }

    /// Fail every queued waiter with `error`
    pub fn reject_all(&mut self, error: Error) {
        for tx in self.waiters.drain(..) {
            let _ = tx.send(Err(error.clone()));
        }
    }

    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }
}
