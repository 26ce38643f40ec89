//! Per-endpoint MCP client
//!
//! [`McpClient`] owns exactly one [`Transport`] for one configured endpoint.
//! It performs the handshake, caches the endpoint's tool/resource/prompt
//! catalog, answers server-initiated requests, and reports lifecycle and
//! catalog changes as [`ClientEvent`]s on a channel supplied at construction.
//!
//! `connect()` is idempotent under concurrency: while an attempt is in
//! flight every caller awaits that same attempt, so at most one channel is
//! ever opened per client.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, RwLock, Weak};

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{McpHubError, Result};
use crate::mcp::config::{EndpointDefinition, NAMESPACE_SEPARATOR};
use crate::mcp::protocol::{InitializedMcpProtocol, McpProtocol, ServerCapabilityFlag};
use crate::mcp::transport::{CloseReason, Transport, TransportErrorKind, TransportEvent};
use crate::mcp::types::{
    CallToolResponse, CatalogPart, ClientCapabilities, GetPromptResponse, Implementation,
    JsonRpcError, McpTool, Prompt, Resource, ResourceContents, METHOD_NOT_FOUND, METHOD_PING,
};

// ---------------------------------------------------------------------------
// State and events
// ---------------------------------------------------------------------------

/// Lifecycle status of one endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    /// Not connected and not trying.
    Disconnected,
    /// A connect (or reconnect) is in progress.
    Connecting,
    /// Handshake complete; catalog cached.
    Connected,
    /// The last connect failed or the channel was lost.
    Error,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// Status snapshot of one endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionState {
    /// Current status.
    pub status: ConnectionStatus,
    /// Most recent error, kept until the next successful connect.
    pub last_error: Option<String>,
    /// Time of the last successful exchange with the endpoint.
    pub last_activity: Option<DateTime<Utc>>,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            last_error: None,
            last_activity: None,
        }
    }
}

/// What changed on a client.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEventKind {
    /// The connection state changed.
    StatusChanged(ConnectionState),
    /// The cached catalog changed.
    CatalogUpdated,
}

/// A notification from one client.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientEvent {
    /// Endpoint the event belongs to.
    pub endpoint_id: String,
    /// What happened.
    pub kind: ClientEventKind,
}

/// Cached catalog of one endpoint, in the endpoint's own (unqualified) names.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Catalog {
    /// Tools.
    pub tools: Vec<McpTool>,
    /// Resources.
    pub resources: Vec<Resource>,
    /// Prompt templates.
    pub prompts: Vec<Prompt>,
}

/// Remove a leading `"{endpoint}__"` from `name`, if present.
///
/// # Examples
///
/// ```
/// use mcphub::mcp::client::strip_namespace;
///
/// assert_eq!(strip_namespace("files", "files__read"), "read");
/// assert_eq!(strip_namespace("files", "read"), "read");
/// assert_eq!(strip_namespace("files", "other__read"), "other__read");
/// ```
pub fn strip_namespace<'a>(endpoint: &str, name: &'a str) -> &'a str {
    name.strip_prefix(endpoint)
        .and_then(|rest| rest.strip_prefix(NAMESPACE_SEPARATOR))
        .unwrap_or(name)
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

type ConnectAttempt = Shared<BoxFuture<'static, std::result::Result<(), String>>>;

struct ClientInner {
    definition: EndpointDefinition,
    transport: Arc<dyn Transport>,
    client_info: Implementation,
    events: mpsc::UnboundedSender<ClientEvent>,
    state: RwLock<ConnectionState>,
    session: RwLock<Option<InitializedMcpProtocol>>,
    catalog: RwLock<Catalog>,
    listener: Mutex<Option<JoinHandle<()>>>,
    /// Fired by `disconnect()` to abandon an attempt still in flight.
    cancel: Mutex<CancellationToken>,
}

fn read<T: Clone>(lock: &RwLock<T>) -> T {
    lock.read()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .clone()
}

fn write<T>(lock: &RwLock<T>, value: T) {
    *lock.write().unwrap_or_else(|poisoned| poisoned.into_inner()) = value;
}

impl ClientInner {
    fn id(&self) -> &str {
        &self.definition.id
    }

    fn emit(&self, kind: ClientEventKind) {
        let _ = self.events.send(ClientEvent {
            endpoint_id: self.id().to_string(),
            kind,
        });
    }

    fn set_status(&self, status: ConnectionStatus, error: Option<String>) {
        let snapshot = {
            let mut state = self
                .state
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if state.status == status && error.is_none() {
                return;
            }
            state.status = status;
            match (status, error) {
                (_, Some(e)) => state.last_error = Some(e),
                (ConnectionStatus::Connected, None) => state.last_error = None,
                _ => {}
            }
            if status == ConnectionStatus::Connected {
                state.last_activity = Some(Utc::now());
            }
            state.clone()
        };
        tracing::info!(endpoint = %self.id(), status = %snapshot.status, "status changed");
        self.emit(ClientEventKind::StatusChanged(snapshot));
    }

    fn record_error(&self, error: String) {
        self.state
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .last_error = Some(error);
    }

    fn touch(&self) {
        self.state
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .last_activity = Some(Utc::now());
    }

    fn session(&self) -> Option<InitializedMcpProtocol> {
        read(&self.session)
    }

    fn stop_listener(&self) {
        if let Some(listener) = self
            .listener
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
        {
            listener.abort();
        }
    }

    fn cancel_token(&self) -> CancellationToken {
        self.cancel
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Cancel the current attempt, if any, and arm a fresh token.
    fn cancel_attempt(&self) {
        let mut token = self
            .cancel
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        token.cancel();
        *token = CancellationToken::new();
    }

    fn clear_catalog(&self) {
        let had_entries = {
            let catalog = self
                .catalog
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            !catalog.tools.is_empty() || !catalog.resources.is_empty() || !catalog.prompts.is_empty()
        };
        write(&self.session, None);
        write(&self.catalog, Catalog::default());
        if had_entries {
            self.emit(ClientEventKind::CatalogUpdated);
        }
    }

    /// Handshake and catalog query over an already-open transport.
    async fn establish(&self) -> Result<()> {
        let session = McpProtocol::new(Arc::clone(&self.transport))
            .initialize(self.client_info.clone(), ClientCapabilities::default())
            .await?;

        let tools = if session.capable(ServerCapabilityFlag::Tools) {
            session.list_tools().await.map_err(|e| {
                McpHubError::connection(self.id(), format!("tools/list failed: {e}"))
            })?
        } else {
            Vec::new()
        };
        let resources = if session.capable(ServerCapabilityFlag::Resources) {
            session.list_resources().await.unwrap_or_else(|e| {
                tracing::warn!(endpoint = %self.id(), "resources/list failed: {e}");
                Vec::new()
            })
        } else {
            Vec::new()
        };
        let prompts = if session.capable(ServerCapabilityFlag::Prompts) {
            session.list_prompts().await.unwrap_or_else(|e| {
                tracing::warn!(endpoint = %self.id(), "prompts/list failed: {e}");
                Vec::new()
            })
        } else {
            Vec::new()
        };

        tracing::info!(
            endpoint = %self.id(),
            tools = tools.len(),
            resources = resources.len(),
            prompts = prompts.len(),
            "catalog loaded"
        );
        write(&self.session, Some(session));
        write(
            &self.catalog,
            Catalog {
                tools,
                resources,
                prompts,
            },
        );
        self.set_status(ConnectionStatus::Connected, None);
        self.emit(ClientEventKind::CatalogUpdated);
        Ok(())
    }

    async fn refresh(&self, part: CatalogPart) {
        let Some(session) = self.session() else {
            return;
        };
        let id = self.id();
        let outcome = match part {
            CatalogPart::Tools => session.list_tools().await.map(|tools| {
                self.catalog
                    .write()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .tools = tools;
            }),
            CatalogPart::Resources => session.list_resources().await.map(|resources| {
                self.catalog
                    .write()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .resources = resources;
            }),
            CatalogPart::Prompts => session.list_prompts().await.map(|prompts| {
                self.catalog
                    .write()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .prompts = prompts;
            }),
        };
        match outcome {
            Ok(()) => {
                tracing::debug!(endpoint = %id, ?part, "catalog refreshed");
                self.touch();
                self.emit(ClientEventKind::CatalogUpdated);
            }
            Err(e) => tracing::warn!(endpoint = %id, ?part, "catalog refresh failed: {e}"),
        }
    }

    async fn answer_server_request(&self, id: serde_json::Value, method: &str) {
        let outcome = if method == METHOD_PING {
            Ok(serde_json::json!({}))
        } else {
            tracing::debug!(endpoint = %self.id(), method, "rejecting unsupported server request");
            Err(JsonRpcError {
                code: METHOD_NOT_FOUND,
                message: format!("Method not found: {method}"),
                data: None,
            })
        };
        if let Err(e) = self.transport.reply(id, outcome).await {
            tracing::debug!(endpoint = %self.id(), "failed to answer server request: {e}");
        }
    }
}

/// Route one transport event. Returns `false` once the listener should stop.
async fn handle_event(inner: &Arc<ClientInner>, event: TransportEvent) -> bool {
    match event {
        TransportEvent::Message(message) => {
            let method = message.get("method").and_then(|m| m.as_str());
            match (method, message.get("id")) {
                (Some(method), Some(id)) => {
                    let inner = Arc::clone(inner);
                    let (id, method) = (id.clone(), method.to_string());
                    tokio::spawn(async move { inner.answer_server_request(id, &method).await });
                }
                (Some(method), None) => match CatalogPart::from_notification(method) {
                    Some(part) => {
                        let inner = Arc::clone(inner);
                        tokio::spawn(async move { inner.refresh(part).await });
                    }
                    None => tracing::debug!(endpoint = %inner.id(), method, "notification"),
                },
                (None, _) => {
                    tracing::debug!(endpoint = %inner.id(), "unmatched reply: {message}");
                }
            }
            true
        }
        TransportEvent::Error { kind, message } => {
            let detail = match kind {
                TransportErrorKind::ProcessExit(code) => {
                    format!("process exited with code {code:?}: {message}")
                }
                _ => message,
            };
            inner.record_error(detail);
            true
        }
        TransportEvent::Reconnecting { attempt, delay } => {
            inner.set_status(
                ConnectionStatus::Connecting,
                Some(format!("connection lost; reconnect attempt {attempt} in {delay:?}")),
            );
            true
        }
        TransportEvent::Reconnected => {
            let inner = Arc::clone(inner);
            tokio::spawn(async move {
                if let Err(e) = inner.establish().await {
                    tracing::warn!(endpoint = %inner.id(), "re-handshake failed: {e}");
                    inner.clear_catalog();
                    inner.set_status(ConnectionStatus::Error, Some(e.to_string()));
                }
            });
            true
        }
        TransportEvent::Closed(reason) => {
            inner.clear_catalog();
            match reason {
                CloseReason::Local => inner.set_status(ConnectionStatus::Disconnected, None),
                CloseReason::Remote => {
                    let error = read(&inner.state)
                        .last_error
                        .filter(|e| e.starts_with("process exited"))
                        .unwrap_or_else(|| "connection closed by endpoint".to_string());
                    inner.set_status(ConnectionStatus::Error, Some(error));
                }
            }
            false
        }
    }
}

async fn listen(inner: Weak<ClientInner>, mut rx: broadcast::Receiver<TransportEvent>) {
    loop {
        let event = match rx.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!("client listener lagged; {skipped} transport events dropped");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => return,
        };
        let Some(inner) = inner.upgrade() else {
            return;
        };
        if !handle_event(&inner, event).await {
            return;
        }
    }
}

/// Client for one endpoint.
pub struct McpClient {
    inner: Arc<ClientInner>,
    inflight: Mutex<Option<ConnectAttempt>>,
}

impl fmt::Debug for McpClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("McpClient")
            .field("endpoint", &self.inner.definition.id)
            .field("kind", &self.inner.definition.kind())
            .field("state", &self.state())
            .finish()
    }
}

impl McpClient {
    /// Create a disconnected client.
    ///
    /// `events` receives every [`ClientEvent`] this client produces.
    pub fn new(
        definition: EndpointDefinition,
        transport: Arc<dyn Transport>,
        client_info: Implementation,
        events: mpsc::UnboundedSender<ClientEvent>,
    ) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                definition,
                transport,
                client_info,
                events,
                state: RwLock::new(ConnectionState::default()),
                session: RwLock::new(None),
                catalog: RwLock::new(Catalog::default()),
                listener: Mutex::new(None),
                cancel: Mutex::new(CancellationToken::new()),
            }),
            inflight: Mutex::new(None),
        }
    }

    /// Endpoint id.
    pub fn id(&self) -> &str {
        self.inner.id()
    }

    /// The definition this client was built from.
    pub fn definition(&self) -> &EndpointDefinition {
        &self.inner.definition
    }

    /// Current state snapshot.
    pub fn state(&self) -> ConnectionState {
        read(&self.inner.state)
    }

    /// `true` when the handshake has completed and the channel is open.
    pub fn is_connected(&self) -> bool {
        self.state().status == ConnectionStatus::Connected && self.inner.transport.is_connected()
    }

    /// Requests currently awaiting a reply on this client's transport.
    pub fn pending_requests(&self) -> usize {
        self.inner.transport.pending_requests()
    }

    /// Server name and version from the handshake, when connected.
    pub fn server_info(&self) -> Option<Implementation> {
        self.inner.session().map(|s| s.server_info().clone())
    }

    /// Cached catalog.
    pub fn catalog(&self) -> Catalog {
        read(&self.inner.catalog)
    }

    /// Cached tools.
    pub fn tools(&self) -> Vec<McpTool> {
        self.catalog().tools
    }

    /// Cached resources.
    pub fn resources(&self) -> Vec<Resource> {
        self.catalog().resources
    }

    /// Cached prompts.
    pub fn prompts(&self) -> Vec<Prompt> {
        self.catalog().prompts
    }

    /// Connect, handshake, and load the catalog.
    ///
    /// Returns immediately when already connected. Concurrent callers share
    /// one attempt.
    ///
    /// # Errors
    ///
    /// Returns [`McpHubError::Connection`] when the channel cannot be opened
    /// or the handshake fails.
    pub async fn connect(&self) -> Result<()> {
        let attempt = {
            let mut slot = self
                .inflight
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if self.is_connected() {
                return Ok(());
            }
            match slot.as_ref() {
                Some(attempt) => attempt.clone(),
                None => {
                    let token = self.inner.cancel_token();
                    let attempt = Self::attempt(Arc::clone(&self.inner), token)
                        .boxed()
                        .shared();
                    *slot = Some(attempt.clone());
                    attempt
                }
            }
        };

        let outcome = attempt.clone().await;

        {
            let mut slot = self
                .inflight
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if slot.as_ref().map_or(false, |current| current.ptr_eq(&attempt)) {
                *slot = None;
            }
        }

        outcome.map_err(|message| McpHubError::connection(self.id(), message).into())
    }

    async fn attempt(
        inner: Arc<ClientInner>,
        token: CancellationToken,
    ) -> std::result::Result<(), String> {
        inner.set_status(ConnectionStatus::Connecting, None);
        tracing::info!(
            endpoint = %inner.id(),
            kind = %inner.definition.kind(),
            target = %inner.definition.transport.target(),
            "connecting"
        );

        // Subscribe before opening so nothing emitted during the handshake is missed.
        let rx = inner.transport.subscribe();
        let listener = tokio::spawn(listen(Arc::downgrade(&inner), rx));
        if let Some(old) = inner
            .listener
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .replace(listener)
        {
            old.abort();
        }

        let open = async {
            inner.transport.connect().await?;
            inner.establish().await
        };
        let result = tokio::select! {
            biased;
            _ = token.cancelled() => None,
            result = open => Some(result),
        };

        match result {
            Some(Ok(())) => Ok(()),
            // `disconnect()` owns the status from here on.
            None => {
                tracing::info!(endpoint = %inner.id(), "connect cancelled");
                inner.stop_listener();
                if let Err(e) = inner.transport.abort().await {
                    tracing::debug!(endpoint = %inner.id(), "abort after cancel failed: {e}");
                }
                inner.clear_catalog();
                Err("connect cancelled".to_string())
            }
            Some(Err(e)) => {
                let message = match e.downcast_ref::<McpHubError>() {
                    Some(McpHubError::Connection { message, .. }) => message.clone(),
                    _ => e.to_string(),
                };
                tracing::warn!(endpoint = %inner.id(), "connect failed: {message}");
                inner.stop_listener();
                if let Err(e) = inner.transport.abort().await {
                    tracing::debug!(endpoint = %inner.id(), "abort after failed connect: {e}");
                }
                inner.clear_catalog();
                inner.set_status(ConnectionStatus::Error, Some(message.clone()));
                Err(message)
            }
        }
    }

    /// Close the transport and clear the cached catalog. Idempotent.
    ///
    /// A connect still in flight is abandoned and fails with
    /// [`McpHubError::Connection`].
    pub async fn disconnect(&self) -> Result<()> {
        self.inner.cancel_attempt();
        self.inner.stop_listener();
        let result = self.inner.transport.disconnect().await;
        self.inner.clear_catalog();
        self.inner.set_status(ConnectionStatus::Disconnected, None);
        result
    }

    fn live_session(&self) -> Result<InitializedMcpProtocol> {
        if !self.is_connected() {
            return Err(McpHubError::closed(self.id(), "endpoint is not connected").into());
        }
        self.inner
            .session()
            .ok_or_else(|| McpHubError::closed(self.id(), "endpoint is not connected").into())
    }

    /// Call a tool. A namespace prefix for this endpoint is stripped first.
    ///
    /// # Errors
    ///
    /// Fails with [`McpHubError::Closed`] without touching the channel when
    /// not connected; otherwise timeout, remote, or closed errors.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Option<serde_json::Value>,
    ) -> Result<CallToolResponse> {
        let session = self.live_session()?;
        let local = strip_namespace(self.id(), name);
        let response = session.call_tool(local, arguments).await?;
        self.inner.touch();
        Ok(response)
    }

    /// Read a resource by URI.
    pub async fn read_resource(&self, uri: &str) -> Result<Vec<ResourceContents>> {
        let session = self.live_session()?;
        let contents = session.read_resource(uri).await?;
        self.inner.touch();
        Ok(contents)
    }

    /// Render a prompt. A namespace prefix for this endpoint is stripped first.
    pub async fn get_prompt(
        &self,
        name: &str,
        arguments: Option<HashMap<String, String>>,
    ) -> Result<GetPromptResponse> {
        let session = self.live_session()?;
        let local = strip_namespace(self.id(), name);
        let response = session.get_prompt(local, arguments).await?;
        self.inner.touch();
        Ok(response)
    }

    /// Round-trip a `ping`.
    pub async fn ping(&self) -> Result<()> {
        self.live_session()?.ping().await?;
        self.inner.touch();
        Ok(())
    }
}

impl Drop for McpClient {
    fn drop(&mut self) {
        self.inner.stop_listener();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
