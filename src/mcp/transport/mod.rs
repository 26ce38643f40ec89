//! MCP transport abstraction and implementations
//!
//! This module defines the [`Transport`] trait that every channel kind
//! satisfies. Concrete implementations live in submodules:
//!
//! - [`process::ProcessTransport`] -- spawns a child process and exchanges
//!   newline-delimited JSON over its stdin/stdout pipes.
//! - [`stream::StreamTransport`] -- server-sent event subscription for
//!   inbound traffic plus HTTP POST to a sibling endpoint for outbound.
//! - [`socket::SocketTransport`] -- persistent WebSocket with bounded
//!   backoff reconnection after abnormal closure.
//! - `fake::FakeTransport` -- in-process fake used in tests (cfg(test)
//!   only).
//!
//! # Design
//!
//! Request/response correlation is implemented once, in [`TransportCore`],
//! and embedded by every implementation. Each transport owns one
//! [`PendingTable`], so ids are unique per transport and no cross-transport
//! locking exists. Inbound traffic that does not settle a pending request
//! (notifications, server-initiated requests, late or unknown replies) is
//! published to observers as [`TransportEvent::Message`]; nothing is
//! silently dropped.
//!
//! Transports are selected through [`TransportFactory`], which matches
//! exhaustively over [`TransportConfig`].

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use crate::error::{McpHubError, Result};
use crate::mcp::config::{EndpointDefinition, TransportConfig};
use crate::mcp::correlation::{parse_request_id, PendingRequest, PendingTable, Settlement};
use crate::mcp::types::{JsonRpcError, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};

pub use crate::mcp::config::TransportKind;

pub mod process;
pub mod socket;
pub mod stream;

#[cfg(test)]
pub mod fake;

/// Capacity of each transport's observer channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Reason given to requests rejected by a closing transport.
pub const CONNECTION_CLOSED: &str = "connection closed";

// ---------------------------------------------------------------------------
// Messages and events
// ---------------------------------------------------------------------------

/// One outbound protocol message.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundMessage {
    /// A request expecting a correlated reply. The id is assigned on send.
    Request {
        /// Method name.
        method: String,
        /// Optional parameters.
        params: Option<serde_json::Value>,
    },
    /// A fire-and-forget notification.
    Notification {
        /// Method name.
        method: String,
        /// Optional parameters.
        params: Option<serde_json::Value>,
    },
    /// A reply to a request the endpoint sent us.
    Reply {
        /// The id of the endpoint's request, echoed verbatim.
        id: serde_json::Value,
        /// Result or structured error.
        outcome: std::result::Result<serde_json::Value, JsonRpcError>,
    },
}

/// Who closed a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The caller invoked `disconnect()`.
    Local,
    /// The endpoint, process, or network ended the channel.
    Remote,
}

/// Transport-level problems reported to observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// An inbound frame was not valid JSON. The connection stays open.
    Parse,
    /// The child process exited with a non-zero status.
    ProcessExit(Option<i32>),
    /// Channel I/O failed.
    Io,
}

/// Events published by a transport to its observers.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// An inbound message that did not settle a pending request.
    Message(serde_json::Value),
    /// A transport-level error.
    Error {
        /// What kind of error.
        kind: TransportErrorKind,
        /// Human-readable detail.
        message: String,
    },
    /// The socket transport is about to make reconnect attempt `attempt`.
    Reconnecting {
        /// One-based attempt number.
        attempt: u32,
        /// Delay before this attempt.
        delay: Duration,
    },
    /// The socket transport re-established its channel.
    Reconnected,
    /// The channel is closed for good.
    Closed(CloseReason),
}

// ---------------------------------------------------------------------------
// Shared correlation core
// ---------------------------------------------------------------------------

/// Correlation, connection flag, and observer fan-out shared by every
/// transport implementation.
#[derive(Debug)]
pub struct TransportCore {
    endpoint: String,
    pending: PendingTable,
    events: broadcast::Sender<TransportEvent>,
    connected: AtomicBool,
    request_timeout: Duration,
}

impl TransportCore {
    /// Create the core for `endpoint` with the given per-request timeout.
    pub fn new(endpoint: impl Into<String>, request_timeout: Duration) -> Self {
        let endpoint = endpoint.into();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            pending: PendingTable::new(endpoint.clone()),
            endpoint,
            events,
            connected: AtomicBool::new(false),
            request_timeout,
        }
    }

    /// Endpoint id.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// The pending-request table.
    pub fn pending(&self) -> &PendingTable {
        &self.pending
    }

    /// Per-request timeout.
    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Register a new observer.
    pub fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    /// Publish an event. Having no observers is not an error.
    pub fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    /// `true` while the channel is open.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Mark the channel open.
    pub fn set_connected(&self) {
        self.connected.store(true, Ordering::SeqCst);
    }

    /// Fail fast when the channel is not open.
    ///
    /// # Errors
    ///
    /// Returns [`McpHubError::Closed`] when not connected.
    pub fn ensure_connected(&self) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(McpHubError::closed(&self.endpoint, "transport is not connected").into())
        }
    }

    /// Mark the channel closed, reject all pending requests, and publish
    /// [`TransportEvent::Closed`].
    ///
    /// Only the first call after a connect has any effect; the return value
    /// says whether this call performed the transition.
    pub fn mark_closed(&self, reason: CloseReason) -> bool {
        let was_connected = self.connected.swap(false, Ordering::SeqCst);
        let rejected = self.pending.reject_all(CONNECTION_CLOSED);
        if was_connected {
            tracing::info!(
                endpoint = %self.endpoint,
                ?reason,
                rejected,
                "transport closed"
            );
            self.emit(TransportEvent::Closed(reason));
        }
        was_connected
    }

    /// Mark the channel interrupted: not connected, every pending request
    /// rejected, but no [`TransportEvent::Closed`] published.
    ///
    /// Used by transports that are about to try reconnecting.
    pub fn mark_interrupted(&self) -> usize {
        self.connected.store(false, Ordering::SeqCst);
        self.pending.reject_all(CONNECTION_CLOSED)
    }

    /// Serialize `message`, registering a pending entry for requests.
    ///
    /// Returns the wire frame (no trailing newline) and, for requests, the
    /// waiter for its reply.
    ///
    /// # Errors
    ///
    /// Returns [`McpHubError::Serialization`] if the message cannot be
    /// serialized.
    pub fn encode(&self, message: OutboundMessage) -> Result<(String, Option<PendingRequest>)> {
        match message {
            OutboundMessage::Request { method, params } => {
                let pending = self.pending.register(&method, self.request_timeout);
                let frame = serde_json::to_string(&JsonRpcRequest {
                    jsonrpc: "2.0".to_string(),
                    id: Some(serde_json::json!(pending.id())),
                    method,
                    params,
                })
                .map_err(McpHubError::Serialization)?;
                Ok((frame, Some(pending)))
            }
            OutboundMessage::Notification { method, params } => {
                let frame = serde_json::to_string(&JsonRpcNotification {
                    jsonrpc: "2.0".to_string(),
                    method,
                    params,
                })
                .map_err(McpHubError::Serialization)?;
                Ok((frame, None))
            }
            OutboundMessage::Reply { id, outcome } => {
                let (result, error) = match outcome {
                    Ok(value) => (Some(value), None),
                    Err(error) => (None, Some(error)),
                };
                let frame = serde_json::to_string(&JsonRpcResponse {
                    jsonrpc: "2.0".to_string(),
                    id: Some(id),
                    result,
                    error,
                })
                .map_err(McpHubError::Serialization)?;
                Ok((frame, None))
            }
        }
    }

    /// Handle one inbound frame.
    ///
    /// A frame that is not valid JSON is logged, reported as a
    /// [`TransportErrorKind::Parse`] event, and skipped.
    pub fn handle_inbound(&self, raw: &str) {
        let raw = raw.trim();
        if raw.is_empty() {
            return;
        }
        match serde_json::from_str::<serde_json::Value>(raw) {
            Ok(value) => self.dispatch(value),
            Err(e) => {
                tracing::warn!(
                    endpoint = %self.endpoint,
                    "skipping malformed frame: {e}"
                );
                self.emit(TransportEvent::Error {
                    kind: TransportErrorKind::Parse,
                    message: format!("invalid JSON frame: {e}"),
                });
            }
        }
    }

    /// Route a parsed inbound message.
    ///
    /// A reply whose id matches a pending request settles it. Everything
    /// else is published as [`TransportEvent::Message`].
    pub fn dispatch(&self, value: serde_json::Value) {
        if let serde_json::Value::Array(batch) = value {
            for item in batch {
                self.dispatch(item);
            }
            return;
        }

        let is_reply = value.get("method").is_none()
            && (value.get("result").is_some() || value.get("error").is_some());
        if is_reply {
            if let Some(id) = value.get("id").and_then(parse_request_id) {
                let settlement = match value.get("error") {
                    Some(error_val) => Settlement::Remote(
                        serde_json::from_value::<JsonRpcError>(error_val.clone()).unwrap_or_else(
                            |_| JsonRpcError {
                                code: crate::mcp::types::INTERNAL_ERROR,
                                message: format!("malformed error object: {error_val}"),
                                data: None,
                            },
                        ),
                    ),
                    None => Settlement::Reply(
                        value
                            .get("result")
                            .cloned()
                            .unwrap_or(serde_json::Value::Null),
                    ),
                };
                if self.pending.settle(id, settlement) {
                    return;
                }
                tracing::debug!(
                    endpoint = %self.endpoint,
                    request_id = id,
                    "reply for unknown or expired request id"
                );
            }
        }
        self.emit(TransportEvent::Message(value));
    }
}

// ---------------------------------------------------------------------------
// Transport trait
// ---------------------------------------------------------------------------

/// Exchanges protocol messages with exactly one endpoint over one channel.
///
/// All methods are `async` or non-blocking so that implementations can
/// drive I/O without blocking the Tokio executor. Implementations are used
/// through `Arc<dyn Transport>`.
#[async_trait::async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    /// Which channel kind this is.
    fn kind(&self) -> TransportKind;

    /// The endpoint id this transport serves.
    fn endpoint_id(&self) -> &str;

    /// Open the channel.
    ///
    /// Calling `connect` on an already-open transport is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`McpHubError::Connection`] on spawn or dial failure.
    async fn connect(&self) -> Result<()>;

    /// Close the channel. Idempotent and best-effort.
    ///
    /// Attempts a polite shutdown first and forces the channel closed if the
    /// endpoint does not comply within a grace period. Every pending request
    /// is rejected with a closed-connection error.
    async fn disconnect(&self) -> Result<()>;

    /// Tear down whatever a failed or cancelled connect left behind.
    ///
    /// Unlike [`Transport::disconnect`] this leaves the transport usable for
    /// a later `connect()` with its normal behaviour intact, including the
    /// socket transport's automatic reconnection.
    async fn abort(&self) -> Result<()> {
        self.disconnect().await
    }

    /// Transmit one message.
    ///
    /// For [`OutboundMessage::Request`] the returned [`PendingRequest`] is
    /// settled by the correlated reply.
    ///
    /// # Errors
    ///
    /// Returns [`McpHubError::Closed`] when the channel is not open, or a
    /// connection error when the write fails.
    async fn send(&self, message: OutboundMessage) -> Result<Option<PendingRequest>>;

    /// Register an observer for notifications, errors, and closure.
    fn subscribe(&self) -> broadcast::Receiver<TransportEvent>;

    /// `true` while the channel is open.
    fn is_connected(&self) -> bool;

    /// Number of requests awaiting a reply.
    fn pending_requests(&self) -> usize;

    /// Send a request and wait for its reply's `result`.
    ///
    /// # Errors
    ///
    /// Any error from [`Transport::send`] or [`PendingRequest::wait`].
    async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value> {
        let pending = self
            .send(OutboundMessage::Request {
                method: method.to_string(),
                params,
            })
            .await?
            .ok_or_else(|| McpHubError::Protocol(format!("no waiter registered for '{method}'")))?;
        pending.wait().await
    }

    /// Send a notification.
    async fn notify(&self, method: &str, params: Option<serde_json::Value>) -> Result<()> {
        self.send(OutboundMessage::Notification {
            method: method.to_string(),
            params,
        })
        .await?;
        Ok(())
    }

    /// Answer a request the endpoint sent.
    async fn reply(
        &self,
        id: serde_json::Value,
        outcome: std::result::Result<serde_json::Value, JsonRpcError>,
    ) -> Result<()> {
        self.send(OutboundMessage::Reply { id, outcome }).await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Factory
// ---------------------------------------------------------------------------

/// Builds the transport for an endpoint definition.
pub trait TransportFactory: Send + Sync + fmt::Debug {
    /// Create an unconnected transport for `definition`.
    ///
    /// # Errors
    ///
    /// Returns [`McpHubError::Config`] when the parameters cannot be turned
    /// into a transport (for example an unparseable URL).
    fn create(&self, definition: &EndpointDefinition) -> Result<Arc<dyn Transport>>;
}

/// The production factory: one transport type per [`TransportConfig`] variant.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultTransportFactory;

impl TransportFactory for DefaultTransportFactory {
    fn create(&self, definition: &EndpointDefinition) -> Result<Arc<dyn Transport>> {
        let timeout = definition.request_timeout();
        let transport: Arc<dyn Transport> = match &definition.transport {
            TransportConfig::Process(params) => Arc::new(process::ProcessTransport::new(
                &definition.id,
                params.clone(),
                timeout,
            )),
            TransportConfig::Stream(params) => Arc::new(stream::StreamTransport::new(
                &definition.id,
                params.clone(),
                timeout,
            )?),
            TransportConfig::Socket(params) => Arc::new(socket::SocketTransport::new(
                &definition.id,
                params.clone(),
                timeout,
            )?),
        };
        Ok(transport)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
