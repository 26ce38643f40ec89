//! Request/response correlation for one transport instance
//!
//! [`PendingTable`] hands out monotonically increasing request ids and keeps
//! one oneshot sender per in-flight request. Every transport owns exactly one
//! table, so ids only need to be unique within that transport.
//!
//! An entry leaves the table in exactly one of four ways: a matching reply
//! (or JSON-RPC error) settles it, its timer fires, the transport closes and
//! rejects everything still pending, or the waiting [`PendingRequest`] is
//! dropped. Removal happens under the table lock, so no entry is ever
//! settled twice. A reply that arrives after its entry is gone is reported
//! back to the caller as unmatched.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::oneshot;

use crate::error::{McpHubError, Result};
use crate::mcp::types::JsonRpcError;

/// How a pending request was settled.
#[derive(Debug, Clone, PartialEq)]
pub enum Settlement {
    /// The `result` member of a successful reply.
    Reply(serde_json::Value),
    /// The `error` member of an error reply.
    Remote(JsonRpcError),
    /// The transport closed before a reply arrived.
    Closed(String),
}

#[derive(Debug)]
struct PendingEntry {
    method: String,
    tx: oneshot::Sender<Settlement>,
}

#[derive(Debug)]
struct TableInner {
    endpoint: String,
    next_id: AtomicU64,
    entries: Mutex<HashMap<u64, PendingEntry>>,
}

/// The pending-request table of one transport.
///
/// Cheap to clone; clones share the same table.
///
/// # Examples
///
/// ```
/// use mcphub::mcp::correlation::{PendingTable, Settlement};
///
/// let table = PendingTable::new("files");
/// let first = table.register("tools/list", std::time::Duration::from_secs(5));
/// let second = table.register("tools/list", std::time::Duration::from_secs(5));
/// assert_eq!(first.id(), 1);
/// assert_eq!(second.id(), 2);
/// assert!(table.settle(2, Settlement::Reply(serde_json::json!({}))));
/// assert_eq!(table.len(), 1);
/// ```
#[derive(Debug, Clone)]
pub struct PendingTable {
    inner: Arc<TableInner>,
}

impl PendingTable {
    /// Create an empty table for `endpoint`. Ids start at 1.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(TableInner {
                endpoint: endpoint.into(),
                next_id: AtomicU64::new(1),
                entries: Mutex::new(HashMap::new()),
            }),
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<u64, PendingEntry>> {
        // A panic while holding the lock cannot leave the map half-updated;
        // every critical section is a single insert or remove.
        self.inner
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Endpoint id this table belongs to.
    pub fn endpoint(&self) -> &str {
        &self.inner.endpoint
    }

    /// Allocate the next id and register a waiter for it.
    ///
    /// The entry is registered before the caller writes the request, so a
    /// reply can never arrive before there is somewhere to deliver it.
    pub fn register(&self, method: &str, timeout: Duration) -> PendingRequest {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.entries().insert(
            id,
            PendingEntry {
                method: method.to_string(),
                tx,
            },
        );
        PendingRequest {
            id,
            method: method.to_string(),
            timeout,
            rx,
            table: self.clone(),
        }
    }

    /// Settle the entry for `id`.
    ///
    /// Returns `false` when no entry exists (already settled, timed out, or
    /// never issued by this transport).
    pub fn settle(&self, id: u64, settlement: Settlement) -> bool {
        let entry = self.entries().remove(&id);
        match entry {
            Some(entry) => {
                tracing::trace!(
                    endpoint = %self.inner.endpoint,
                    request_id = id,
                    method = %entry.method,
                    "settled pending request"
                );
                // The waiter may have been dropped in the meantime; the entry
                // is gone either way.
                let _ = entry.tx.send(settlement);
                true
            }
            None => false,
        }
    }

    /// Reject every pending entry with a closed-connection settlement.
    ///
    /// Returns the number of rejected entries.
    pub fn reject_all(&self, reason: &str) -> usize {
        let drained: Vec<(u64, PendingEntry)> = self.entries().drain().collect();
        let count = drained.len();
        for (id, entry) in drained {
            tracing::debug!(
                endpoint = %self.inner.endpoint,
                request_id = id,
                method = %entry.method,
                "rejecting pending request: {reason}"
            );
            let _ = entry.tx.send(Settlement::Closed(reason.to_string()));
        }
        count
    }

    /// Remove an entry without settling it. Used by timeouts and drops.
    fn remove(&self, id: u64) -> bool {
        self.entries().remove(&id).is_some()
    }

    /// Number of requests currently awaiting a reply.
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    /// `true` when no request is pending.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `true` when a request with `id` is pending.
    pub fn contains(&self, id: u64) -> bool {
        self.entries().contains_key(&id)
    }
}

/// Parse a JSON-RPC id into the numeric form this crate issues.
///
/// Accepts integers and decimal strings; anything else cannot correlate with
/// one of our requests.
///
/// # Examples
///
/// ```
/// use mcphub::mcp::correlation::parse_request_id;
///
/// assert_eq!(parse_request_id(&serde_json::json!(7)), Some(7));
/// assert_eq!(parse_request_id(&serde_json::json!("7")), Some(7));
/// assert_eq!(parse_request_id(&serde_json::json!("abc")), None);
/// assert_eq!(parse_request_id(&serde_json::Value::Null), None);
/// ```
pub fn parse_request_id(id: &serde_json::Value) -> Option<u64> {
    if let Some(n) = id.as_u64() {
        Some(n)
    } else {
        id.as_str().and_then(|s| s.parse::<u64>().ok())
    }
}

/// A caller waiting for the reply to one request.
///
/// Dropping it removes the entry from the table, so an abandoned request
/// never lingers and a late reply is treated as unmatched.
#[derive(Debug)]
pub struct PendingRequest {
    id: u64,
    method: String,
    timeout: Duration,
    rx: oneshot::Receiver<Settlement>,
    table: PendingTable,
}

impl PendingRequest {
    /// The id written on the wire for this request.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The method of this request.
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Wait for the reply, failing once the request timeout elapses.
    ///
    /// # Errors
    ///
    /// - [`McpHubError::RequestTimeout`] when no reply arrives in time. The
    ///   entry is removed before this returns.
    /// - [`McpHubError::Remote`] when the endpoint replied with an error.
    /// - [`McpHubError::Closed`] when the transport closed first.
    pub async fn wait(mut self) -> Result<serde_json::Value> {
        let endpoint = self.table.endpoint().to_string();
        match tokio::time::timeout(self.timeout, &mut self.rx).await {
            Err(_) => {
                self.table.remove(self.id);
                tracing::warn!(
                    endpoint = %endpoint,
                    request_id = self.id,
                    method = %self.method,
                    "request timed out after {:?}",
                    self.timeout
                );
                Err(McpHubError::RequestTimeout {
                    endpoint,
                    method: self.method.clone(),
                    timeout: self.timeout,
                }
                .into())
            }
            Ok(Err(_)) => Err(McpHubError::closed(endpoint, "pending request abandoned").into()),
            Ok(Ok(Settlement::Reply(value))) => Ok(value),
            Ok(Ok(Settlement::Remote(error))) => Err(McpHubError::Remote {
                endpoint,
                code: error.code,
                message: error.message,
                data: error.data,
            }
            .into()),
            Ok(Ok(Settlement::Closed(reason))) => Err(McpHubError::closed(endpoint, reason).into()),
        }
    }
}

impl Drop for PendingRequest {
    fn drop(&mut self) {
        self.table.remove(self.id);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
