//! Request tracking for the ledger connection
//!
//! This module correlates outgoing commands with the responses that arrive
//! later, out of order, on the same socket.
//!
//! # Request Lifecycle
//!
//! 1. **Create**: reuse the caller's `id` or take the next free counter value,
//!    register a oneshot channel and start the timeout timer
//! 2. **Send**: the connection writes the serialized body to the socket
//! 3. **Settle**: exactly one of response, timeout, cancel or disconnect
//!    removes the entry, aborts its timer and then wakes the caller
//!
//! Removal happens under the table lock before the caller is woken, so a
//! late timer or a duplicate response finds nothing to settle.

use futures::FutureExt;
use ledgerws_core::{codec, Error, RemoteErrorData, RequestId, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;

/// Pending request waiting for a response
struct PendingRequest {
    /// Channel to deliver the outcome
    tx: oneshot::Sender<Result<Value>>,
    /// Timeout timer, aborted at settlement
    timer: JoinHandle<()>,
}

#[derive(Default)]
struct Table {
    pending: HashMap<String, PendingRequest>,
    next_id: u64,
}

impl Table {
    /// Next counter value not currently pending
    fn allocate_id(&mut self) -> RequestId {
        loop {
            let id = self.next_id;
            self.next_id = self.next_id.wrapping_add(1);
            if !self.pending.contains_key(&id.to_string()) {
                return RequestId::Number(id);
            }
        }
    }

    /// Remove an entry and stop its timer
    fn take(&mut self, key: &str) -> Option<oneshot::Sender<Result<Value>>> {
        self.pending.remove(key).map(|entry| {
            entry.timer.abort();
            entry.tx
        })
    }
}

/// Future returned by [`RequestManager::create_request`]
///
/// Resolves with the response message once the request is settled. A
/// cancelled request resolves with [`Error::Cancelled`].
pub struct ResponseFuture {
    id: RequestId,
    rx: oneshot::Receiver<Result<Value>>,
}

impl ResponseFuture {
    /// The id this future is waiting on
    pub fn id(&self) -> &RequestId {
        &self.id
    }
}

impl Future for ResponseFuture {
    type Output = Result<Value>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match this.rx.poll_unpin(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(Error::Cancelled(format!(
                "request {} was cancelled",
                this.id
            )))),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Manager for tracking pending requests
#[derive(Clone, Default)]
pub struct RequestManager {
    table: Arc<Mutex<Table>>,
}

impl RequestManager {
    /// Create a new request manager
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a request and start its timeout.
    ///
    /// Returns the id used, the serialized message to send and the future
    /// to await.
    ///
    /// # Errors
    ///
    /// `Error::InvalidRequest` if the body is not a JSON object, carries an
    /// id that is neither a string nor a non-negative integer, or carries an
    /// id that is already pending.
    pub async fn create_request(
        &self,
        body: &Value,
        timeout: Duration,
    ) -> Result<(RequestId, String, ResponseFuture)> {
        let mut table = self.table.lock().await;

        let id = match body.get("id") {
            None | Some(Value::Null) => table.allocate_id(),
            Some(value) => RequestId::from_value(value).ok_or_else(|| {
                Error::InvalidRequest(format!("unsupported request id {}", value))
            })?,
        };
        let key = id.key();
        if table.pending.contains_key(&key) {
            return Err(Error::InvalidRequest(format!(
                "request with id {} is already pending",
                id
            )));
        }

        let message = codec::encode_request(body, &id)?;

        let (tx, rx) = oneshot::channel();
        let timer = {
            let manager = self.clone();
            let id = id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                tracing::debug!(id = %id, timeout_ms = timeout.as_millis() as u64, "Request timed out");
                let error = Error::Timeout(format!(
                    "no response for request {} within {} ms",
                    id,
                    timeout.as_millis()
                ));
                let _ = manager.reject(&id, error).await;
            })
        };
        table.pending.insert(key, PendingRequest { tx, timer });

        Ok((id.clone(), message, ResponseFuture { id, rx }))
    }

    /// Route a `type: "response"` message to its pending request.
    ///
    /// # Errors
    ///
    /// `Error::ResponseFormat` if the message has no usable `id`. No entry
    /// is touched in that case. An id with no pending entry is not an error.
    pub async fn handle_response(&self, mut response: Value) -> Result<()> {
        let id = response
            .get("id")
            .and_then(RequestId::from_value)
            .ok_or_else(|| Error::ResponseFormat(format!("valid id not found in response: {}", response)))?;

        let mut table = self.table.lock().await;
        let Some(tx) = table.take(&id.key()) else {
            tracing::debug!(id = %id, "Response for unknown or settled request ignored");
            return Ok(());
        };
        drop(table);

        let outcome = match response.get("status").and_then(Value::as_str) {
            Some("success") => {
                if let Some(object) = response.as_object_mut() {
                    object.remove("status");
                }
                Ok(response)
            }
            Some("error") => Err(Error::Remote(RemoteErrorData::from_response(&response))),
            Some(other) => Err(Error::ResponseFormat(format!("unrecognized response status: {}", other))),
            None => Err(Error::ResponseFormat("response has no status".to_string())),
        };
        let _ = tx.send(outcome);
        Ok(())
    }

    /// Fulfil a pending request
    pub async fn resolve(&self, id: &RequestId, value: Value) -> Result<()> {
        self.settle(id, Ok(value)).await
    }

    /// Fail a pending request
    pub async fn reject(&self, id: &RequestId, error: Error) -> Result<()> {
        self.settle(id, Err(error)).await
    }

    /// Drop a pending request without a response; its future yields
    /// `Error::Cancelled`.
    pub async fn cancel(&self, id: &RequestId) -> Result<()> {
        let mut table = self.table.lock().await;
        match table.take(&id.key()) {
            Some(_tx) => Ok(()),
            None => Err(Error::NoPendingRequest(id.key())),
        }
    }

    /// Fail every pending request with `error`
    pub async fn reject_all(&self, error: Error) {
        let drained: Vec<_> = {
            let mut table = self.table.lock().await;
            let keys: Vec<String> = table.pending.keys().cloned().collect();
            keys.iter().filter_map(|key| table.take(key)).collect()
        };
        if !drained.is_empty() {
            tracing::debug!(count = drained.len(), error = %error, "Failing all pending requests");
        }
        for tx in drained {
            let _ = tx.send(Err(error.clone()));
        }
    }

    /// Get the number of pending requests
    pub async fn pending_count(&self) -> usize {
        self.table.lock().await.pending.len()
    }

    async fn settle(&self, id: &RequestId, outcome: Result<Value>) -> Result<()> {
        let tx = self.table.lock().await.take(&id.key());
        match tx {
            Some(tx) => {
                let _ = tx.send(outcome);
                Ok(())
            }
            None => Err(Error::NoPendingRequest(id.key())),
        }
    }
}
