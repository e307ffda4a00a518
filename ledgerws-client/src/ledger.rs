//! Ledger tracking
//!
//! [`LedgerTracker`] is an opt-in layer over a [`Connection`]. On every
//! `connected` event it subscribes to the node's `ledger` stream, and every
//! `ledgerClosed` push updates a [`LedgerHistory`]: the latest validated
//! ledger, current fees and reserves, and the set of ledger versions the
//! node has available.
//!
//! ```rust,no_run
//! use ledgerws_client::{Connection, LedgerTracker};
//!
//! # async fn example() -> ledgerws_core::Result<()> {
//! let connection = Connection::builder("wss://s1.ripple.com").build()?;
//! let tracker = LedgerTracker::attach(&connection).await;
//! connection.connect().await?;
//!
//! let latest = tracker.wait_until_ready().await;
//! assert!(tracker.has_version(latest));
//! # Ok(())
//! # }
//! ```

use crate::events::{ConnectionEvent, SubscriptionToken};
use crate::{Connection, WeakConnection};
use ledgerws_core::{Error, LedgerStream, Result, LEDGER_CLOSED_TYPE};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;

/// Set of `u64` values stored as merged, inclusive ranges
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RangeSet {
    /// start -> end, disjoint and never adjacent
    ranges: BTreeMap<u64, u64>,
}

impl RangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.ranges.clear();
    }

    pub fn add_value(&mut self, value: u64) {
        self.add_range(value, value);
    }

    /// Add `start..=end`; bounds may be given in either order.
    pub fn add_range(&mut self, start: u64, end: u64) {
        let (mut start, mut end) = if start <= end { (start, end) } else { (end, start) };

        let overlapping: Vec<(u64, u64)> = self
            .ranges
            .range(..=end.saturating_add(1))
            .rev()
            .take_while(|&(_, &r_end)| r_end.saturating_add(1) >= start)
            .map(|(&s, &e)| (s, e))
            .collect();

        for (s, e) in overlapping {
            self.ranges.remove(&s);
            start = start.min(s);
            end = end.max(e);
        }
        self.ranges.insert(start, end);
    }

    /// Parse a range string such as `"32570-32580,32590"` and add every
    /// range in it. `"empty"` adds nothing.
    pub fn parse_and_add_ranges(&mut self, ranges: &str) -> Result<()> {
        let ranges = ranges.trim();
        if ranges.is_empty() || ranges == "empty" {
            return Ok(());
        }

        let mut parsed = Vec::new();
        for part in ranges.split(',') {
            let part = part.trim();
            let bounds = match part.split_once('-') {
                Some((start, end)) => (parse_bound(start, part)?, parse_bound(end, part)?),
                None => {
                    let value = parse_bound(part, part)?;
                    (value, value)
                }
            };
            parsed.push(bounds);
        }
        for (start, end) in parsed {
            self.add_range(start, end);
        }
        Ok(())
    }

    pub fn contains_value(&self, value: u64) -> bool {
        self.contains_range(value, value)
    }

    /// True if every value in `start..=end` is present
    pub fn contains_range(&self, start: u64, end: u64) -> bool {
        if start > end {
            return false;
        }
        self.ranges
            .range(..=start)
            .next_back()
            .is_some_and(|(_, &r_end)| r_end >= end)
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}

fn parse_bound(text: &str, part: &str) -> Result<u64> {
    text.trim()
        .parse()
        .map_err(|_| Error::ResponseFormat(format!("invalid ledger range: {}", part)))
}

impl fmt::Display for RangeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (start, end)) in self.ranges.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            if start == end {
                write!(f, "{}", start)?;
            } else {
                write!(f, "{}-{}", start, end)?;
            }
        }
        Ok(())
    }
}

/// What the node has told us about its ledgers
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LedgerHistory {
    pub latest_version: Option<u64>,
    pub fee_base: Option<u64>,
    pub fee_ref: Option<u64>,
    pub reserve_base: Option<u64>,
    pub available_versions: RangeSet,
}

impl LedgerHistory {
    /// Apply a `ledgerClosed` message or a ledger `subscribe` result
    pub fn update(&mut self, data: &LedgerStream) -> Result<()> {
        if let Some(index) = data.ledger_index {
            self.latest_version = Some(index);
        }
        match &data.validated_ledgers {
            Some(ranges) => {
                let mut available = RangeSet::new();
                available.parse_and_add_ranges(ranges)?;
                self.available_versions = available;
            }
            None => {
                if let Some(index) = data.ledger_index {
                    self.available_versions.add_value(index);
                }
            }
        }
        if data.fee_base.is_some() {
            self.fee_base = data.fee_base;
        }
        if data.fee_ref.is_some() {
            self.fee_ref = data.fee_ref;
        }
        if data.reserve_base.is_some() {
            self.reserve_base = data.reserve_base;
        }
        Ok(())
    }

    pub fn has_version(&self, version: u64) -> bool {
        self.available_versions.contains_value(version)
    }

    /// `high` of `None` only checks `low`
    pub fn has_versions(&self, low: u64, high: Option<u64>) -> bool {
        match high {
            Some(high) => self.available_versions.contains_range(low, high),
            None => self.has_version(low),
        }
    }
}

/// Keeps a [`LedgerHistory`] current for one connection
pub struct LedgerTracker {
    history: Arc<watch::Sender<LedgerHistory>>,
    connection: WeakConnection,
    tokens: Vec<SubscriptionToken>,
}

impl LedgerTracker {
    /// Start tracking; subscribes right away if the connection is open.
    pub async fn attach(connection: &Connection) -> Self {
        let (tx, _rx) = watch::channel(LedgerHistory::default());
        let history = Arc::new(tx);
        let weak = connection.downgrade();

        let on_connected = {
            let history = Arc::clone(&history);
            let weak = weak.clone();
            connection.on("connected", move |_| {
                spawn_subscribe(weak.clone(), Arc::clone(&history));
            })
        };
        let on_ledger = {
            let history = Arc::clone(&history);
            connection.on(LEDGER_CLOSED_TYPE, move |event| {
                if let ConnectionEvent::Push { payload, .. } = event {
                    apply(&history, payload);
                }
            })
        };

        if connection.is_connected().await {
            spawn_subscribe(weak.clone(), Arc::clone(&history));
        }

        Self {
            history,
            connection: weak,
            tokens: vec![on_connected, on_ledger],
        }
    }

    /// Snapshot of the current history
    pub fn history(&self) -> LedgerHistory {
        self.history.borrow().clone()
    }

    pub fn latest_version(&self) -> Option<u64> {
        self.history.borrow().latest_version
    }

    pub fn fee_base(&self) -> Option<u64> {
        self.history.borrow().fee_base
    }

    pub fn fee_ref(&self) -> Option<u64> {
        self.history.borrow().fee_ref
    }

    pub fn reserve_base(&self) -> Option<u64> {
        self.history.borrow().reserve_base
    }

    pub fn has_version(&self, version: u64) -> bool {
        self.history.borrow().has_version(version)
    }

    pub fn has_versions(&self, low: u64, high: Option<u64>) -> bool {
        self.history.borrow().has_versions(low, high)
    }

    /// Wait until a ledger version is known and return it
    pub async fn wait_until_ready(&self) -> u64 {
        let mut rx = self.history.subscribe();
        loop {
            if let Some(version) = rx.borrow_and_update().latest_version {
                return version;
            }
            // the sender lives in self, so changed() cannot fail here
            if rx.changed().await.is_err() {
                return 0;
            }
        }
    }
}

impl Drop for LedgerTracker {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.upgrade() {
            for token in self.tokens.drain(..) {
                connection.off(token);
            }
        }
    }
}

fn apply(history: &watch::Sender<LedgerHistory>, data: &Value) {
    let stream = match serde_json::from_value::<LedgerStream>(data.clone()) {
        Ok(stream) => stream,
        Err(e) => {
            tracing::warn!(error = %e, "Ignoring malformed ledger message");
            return;
        }
    };
    history.send_modify(|h| {
        if let Err(e) = h.update(&stream) {
            tracing::warn!(error = %e, "Ignoring malformed ledger ranges");
        }
    });
    tracing::debug!(ledger_index = ?stream.ledger_index, "Ledger history updated");
}

fn spawn_subscribe(weak: WeakConnection, history: Arc<watch::Sender<LedgerHistory>>) {
    tokio::spawn(async move {
        let Some(connection) = weak.upgrade() else {
            return;
        };
        let request = json!({"command": "subscribe", "streams": ["ledger"]});
        match connection.request(request, None).await {
            Ok(response) => {
                if let Some(result) = response.get("result") {
                    apply(&history, result);
                }
            }
            Err(e) => tracing::warn!(error = %e, "Ledger stream subscription failed"),
        }
    });
}
