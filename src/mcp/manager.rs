//! Lifecycle manager for every configured MCP endpoint
//!
//! [`McpManager`] owns one [`McpClient`] per active endpoint. It reconciles
//! that set against the latest endpoint definitions, connects endpoints
//! concurrently with failures isolated per endpoint, keeps an aggregate
//! [`Registry`] rebuilt from the connected clients, routes calls by
//! namespaced name, and reports status.
//!
//! Construct one explicitly at startup and share it by cloning; clones refer
//! to the same manager. Independent managers can coexist.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use mcphub::config::{Config, FileConfigProvider};
//! use mcphub::mcp::manager::McpManager;
//! use mcphub::mcp::transport::DefaultTransportFactory;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let config = Config::load("config/mcphub.yaml")?;
//! let manager = McpManager::new(Arc::new(DefaultTransportFactory), config.client_info());
//! manager.reconcile(config.endpoints()).await;
//!
//! for tool in manager.list_tools() {
//!     println!("{}", tool.name);
//! }
//! manager.shutdown(config.shutdown_grace()).await;
//! # Ok(())
//! # }
//! ```

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::{Duration, Instant};

use futures::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::ConfigProvider;
use crate::error::{McpHubError, Result};
use crate::mcp::client::{
    ClientEvent, ClientEventKind, ConnectionState, ConnectionStatus, McpClient,
};
use crate::mcp::config::{dedupe_first_wins, EndpointDefinition, TransportKind};
use crate::mcp::metrics::{record_connect_failure, CallMetrics};
use crate::mcp::registry::{
    split_qualified, PromptDescriptor, Registry, ResourceDescriptor, ToolDescriptor,
};
use crate::mcp::transport::TransportFactory;
use crate::mcp::types::{CallToolResponse, GetPromptResponse, Implementation, ResourceContents};

const EVENT_CAPACITY: usize = 256;

// ---------------------------------------------------------------------------
// Structured call failures
// ---------------------------------------------------------------------------

/// Category of a failed routed call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// No connected endpoint owns the name or URI.
    UnknownTarget,
    /// The owning endpoint exists but is not connected.
    NotConnected,
    /// No reply within the request timeout.
    Timeout,
    /// The endpoint answered with a JSON-RPC error.
    Remote,
    /// The channel closed while the call was outstanding.
    Closed,
    /// The reply could not be understood.
    Protocol,
    /// The channel failed underneath the call.
    Connection,
    /// Anything else.
    Internal,
}

impl FailureKind {
    /// Stable label used in logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UnknownTarget => "unknown_target",
            Self::NotConnected => "not_connected",
            Self::Timeout => "timeout",
            Self::Remote => "remote",
            Self::Closed => "closed",
            Self::Protocol => "protocol",
            Self::Connection => "connection",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A routed call that did not produce a result.
///
/// Returned as a value so the caller can decide whether to retry, report,
/// or pick another tool.
#[derive(Debug, Clone, PartialEq, Serialize, Error)]
#[error("{kind} failure{}: {message}", .endpoint.as_ref().map(|e| format!(" [{e}]")).unwrap_or_default())]
pub struct CallFailure {
    /// Category.
    pub kind: FailureKind,
    /// Endpoint the call was routed to, when routing got that far.
    pub endpoint: Option<String>,
    /// Human-readable detail.
    pub message: String,
    /// JSON-RPC error code for [`FailureKind::Remote`].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<i64>,
}

impl CallFailure {
    fn new(kind: FailureKind, endpoint: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            kind,
            endpoint: endpoint.map(str::to_string),
            message: message.into(),
            code: None,
        }
    }

    fn unknown(target: &str) -> Self {
        Self::new(
            FailureKind::UnknownTarget,
            None,
            format!("no connected endpoint provides '{target}'"),
        )
    }

    fn not_connected(endpoint: &str) -> Self {
        Self::new(
            FailureKind::NotConnected,
            Some(endpoint),
            format!("endpoint '{endpoint}' is not connected"),
        )
    }

    /// Classify an error returned by a client call.
    pub fn from_error(endpoint: &str, error: &anyhow::Error) -> Self {
        let message = error.to_string();
        let Some(hub) = error.downcast_ref::<McpHubError>() else {
            return Self::new(FailureKind::Internal, Some(endpoint), message);
        };
        let kind = match hub {
            McpHubError::RequestTimeout { .. } => FailureKind::Timeout,
            McpHubError::Remote { code, message, .. } => {
                return Self {
                    kind: FailureKind::Remote,
                    endpoint: Some(endpoint.to_string()),
                    message: message.clone(),
                    code: Some(*code),
                };
            }
            McpHubError::Closed { .. } => FailureKind::Closed,
            McpHubError::Protocol(_) | McpHubError::Serialization(_) => FailureKind::Protocol,
            McpHubError::Connection { .. }
            | McpHubError::ProcessExit { .. }
            | McpHubError::Io(_)
            | McpHubError::Http(_)
            | McpHubError::WebSocket(_) => FailureKind::Connection,
            McpHubError::NotFound(_) => FailureKind::UnknownTarget,
            McpHubError::Config(_) | McpHubError::Yaml(_) => FailureKind::Internal,
        };
        Self::new(kind, Some(endpoint), message)
    }

    /// `true` for failures that may succeed when retried unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            FailureKind::Timeout | FailureKind::Closed | FailureKind::Connection
        )
    }
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

/// Notification for UIs observing the manager.
#[derive(Debug, Clone, PartialEq)]
pub enum ManagerEvent {
    /// An endpoint changed state.
    StatusChanged {
        /// Endpoint id.
        endpoint: String,
        /// New state.
        state: ConnectionState,
    },
    /// The aggregate registry was rebuilt.
    RegistryRebuilt {
        /// Tool count.
        tools: usize,
        /// Resource count.
        resources: usize,
        /// Prompt count.
        prompts: usize,
    },
}

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReconcileReport {
    /// Endpoints connected by this pass.
    pub connected: Vec<String>,
    /// Endpoints disconnected and removed by this pass.
    pub disconnected: Vec<String>,
    /// Endpoints whose connect failed, with the error.
    pub failed: Vec<(String, String)>,
    /// Definitions rejected by validation.
    pub invalid: Vec<String>,
    /// Endpoints that were already connected with the same definition.
    pub unchanged: Vec<String>,
}

/// Aggregate counts for display.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusSummary {
    pub configured: usize,
    pub enabled: usize,
    pub connected: usize,
    pub connecting: usize,
    pub errored: usize,
    pub tools: usize,
    pub resources: usize,
    pub prompts: usize,
}

/// Status of one configured endpoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EndpointStatus {
    /// Endpoint id.
    pub id: String,
    /// Transport kind.
    pub kind: TransportKind,
    /// Whether the definition is enabled.
    pub enabled: bool,
    /// Connection state.
    pub state: ConnectionState,
    /// Cached tool count.
    pub tools: usize,
    /// Cached resource count.
    pub resources: usize,
    /// Cached prompt count.
    pub prompts: usize,
}

/// Result of a throwaway diagnostic connection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TestConnectionReport {
    /// Endpoint id.
    pub endpoint: String,
    /// `true` when connect and catalog listing succeeded.
    pub success: bool,
    /// Server name and version from the handshake.
    pub server: Option<Implementation>,
    /// Unqualified tool names.
    pub tools: Vec<String>,
    /// Resource URIs.
    pub resources: Vec<String>,
    /// Unqualified prompt names.
    pub prompts: Vec<String>,
    /// Round trip of a `ping` after the handshake, when the endpoint answered.
    pub ping_ms: Option<u64>,
    /// Why the test failed.
    pub error: Option<String>,
    /// Wall time of the whole cycle.
    #[serde(with = "duration_millis")]
    pub elapsed: Duration,
}

mod duration_millis {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

#[derive(Default)]
struct ManagerState {
    definitions: Vec<EndpointDefinition>,
    clients: HashMap<String, Arc<McpClient>>,
    /// Ids of connected clients, oldest connection first.
    order: Vec<String>,
    /// Endpoints whose transport could not even be constructed.
    failures: HashMap<String, String>,
}

struct ManagerInner {
    factory: Arc<dyn TransportFactory>,
    client_info: Implementation,
    state: RwLock<ManagerState>,
    registry: RwLock<Arc<Registry>>,
    events: broadcast::Sender<ManagerEvent>,
    client_tx: mpsc::UnboundedSender<ClientEvent>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
        for task in self
            .tasks
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .drain(..)
        {
            task.abort();
        }
    }
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ManagerInner {
    fn client(&self, id: &str) -> Option<Arc<McpClient>> {
        read(&self.state).clients.get(id).cloned()
    }

    fn connected_ids(&self) -> HashSet<String> {
        read(&self.state)
            .clients
            .iter()
            .filter(|(_, c)| c.is_connected())
            .map(|(id, _)| id.clone())
            .collect()
    }

    fn registry(&self) -> Arc<Registry> {
        Arc::clone(&read(&self.registry))
    }

    fn emit(&self, event: ManagerEvent) {
        let _ = self.events.send(event);
    }

    /// `true` while `client` is still the active client for its endpoint.
    fn is_current(&self, client: &Arc<McpClient>) -> bool {
        read(&self.state)
            .clients
            .get(client.id())
            .map_or(false, |c| Arc::ptr_eq(c, client))
    }

    /// Record that `client` finished connecting, unless it has since been replaced.
    fn note_connected(&self, client: &Arc<McpClient>) {
        let mut state = write(&self.state);
        let current = state
            .clients
            .get(client.id())
            .map_or(false, |c| Arc::ptr_eq(c, client));
        if current && client.is_connected() && !state.order.iter().any(|id| id == client.id()) {
            state.order.push(client.id().to_string());
        }
    }

    /// Rebuild the registry from the connected clients, in connection order.
    fn rebuild(&self) {
        let clients: Vec<Arc<McpClient>> = {
            let state = read(&self.state);
            let mut ordered: Vec<Arc<McpClient>> = state
                .order
                .iter()
                .filter_map(|id| state.clients.get(id))
                .filter(|c| c.is_connected())
                .cloned()
                .collect();
            let mut late: Vec<&Arc<McpClient>> = state
                .clients
                .iter()
                .filter(|(id, c)| c.is_connected() && !state.order.iter().any(|o| o == *id))
                .map(|(_, c)| c)
                .collect();
            late.sort_by(|a, b| a.id().cmp(b.id()));
            ordered.extend(late.into_iter().cloned());
            ordered
        };

        let catalogs: Vec<(String, _)> = clients
            .iter()
            .map(|c| (c.id().to_string(), c.catalog()))
            .collect();
        let registry = Registry::build(catalogs.iter().map(|(id, cat)| (id.as_str(), cat)));
        let (tools, resources, prompts) = registry.counts();
        *write(&self.registry) = Arc::new(registry);

        tracing::debug!(tools, resources, prompts, "registry rebuilt");
        self.emit(ManagerEvent::RegistryRebuilt {
            tools,
            resources,
            prompts,
        });
    }

    fn handle_client_event(&self, event: ClientEvent) {
        match event.kind {
            ClientEventKind::StatusChanged(state) => {
                {
                    let mut guard = write(&self.state);
                    let current = guard.clients.get(&event.endpoint_id).cloned();
                    match (state.status, current) {
                        (ConnectionStatus::Connected, Some(client)) if client.is_connected() => {
                            if !guard.order.contains(&event.endpoint_id) {
                                guard.order.push(event.endpoint_id.clone());
                            }
                        }
                        (ConnectionStatus::Connected, _) => {}
                        (_, Some(client)) if client.is_connected() => {}
                        _ => guard.order.retain(|id| id != &event.endpoint_id),
                    }
                }
                tracing::debug!(
                    endpoint = %event.endpoint_id,
                    status = %state.status,
                    "endpoint status changed"
                );
                self.emit(ManagerEvent::StatusChanged {
                    endpoint: event.endpoint_id,
                    state,
                });
                self.rebuild();
            }
            ClientEventKind::CatalogUpdated => self.rebuild(),
        }
    }
}

async fn drain_client_events(
    inner: Weak<ManagerInner>,
    mut rx: mpsc::UnboundedReceiver<ClientEvent>,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => return,
            event = rx.recv() => match event {
                Some(event) => event,
                None => return,
            },
        };
        let Some(inner) = inner.upgrade() else {
            return;
        };
        inner.handle_client_event(event);
    }
}

/// Owner of every active endpoint client.
#[derive(Clone)]
pub struct McpManager {
    inner: Arc<ManagerInner>,
}

impl fmt::Debug for McpManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = read(&self.inner.state);
        f.debug_struct("McpManager")
            .field("configured", &state.definitions.len())
            .field("active", &state.clients.len())
            .field("factory", &self.inner.factory)
            .finish()
    }
}

impl McpManager {
    /// Create a manager with no endpoints.
    ///
    /// Must be called inside a Tokio runtime; a background task drains
    /// client events.
    pub fn new(factory: Arc<dyn TransportFactory>, client_info: Implementation) -> Self {
        let (client_tx, client_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let shutdown = CancellationToken::new();
        let inner = Arc::new(ManagerInner {
            factory,
            client_info,
            state: RwLock::new(ManagerState::default()),
            registry: RwLock::new(Arc::new(Registry::new())),
            events,
            client_tx,
            shutdown: shutdown.clone(),
            tasks: Mutex::new(Vec::new()),
        });

        let drain = tokio::spawn(drain_client_events(
            Arc::downgrade(&inner),
            client_rx,
            shutdown,
        ));
        inner
            .tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(drain);

        Self { inner }
    }

    /// Receive [`ManagerEvent`]s from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ManagerEvent> {
        self.inner.events.subscribe()
    }

    /// The current endpoint definitions, as last reconciled.
    pub fn definitions(&self) -> Vec<EndpointDefinition> {
        read(&self.inner.state).definitions.clone()
    }

    /// Ids with an active client (connected, connecting, or errored).
    pub fn active_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = read(&self.inner.state).clients.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// The active client for `id`.
    pub fn client(&self, id: &str) -> Option<Arc<McpClient>> {
        self.inner.client(id)
    }

    fn new_client(&self, definition: &EndpointDefinition) -> Result<Arc<McpClient>> {
        let transport = self.inner.factory.create(definition)?;
        Ok(Arc::new(McpClient::new(
            definition.clone(),
            transport,
            self.inner.client_info.clone(),
            self.inner.client_tx.clone(),
        )))
    }

    /// Bring the active set in line with `definitions`.
    ///
    /// Disabled, removed, and changed endpoints are disconnected; enabled
    /// endpoints without a live client are connected concurrently. One
    /// endpoint failing never affects the others, and the pass itself never
    /// fails.
    ///
    /// The plan is computed atomically; connects run without holding any
    /// manager-wide lock, so overlapping passes and manual connects proceed
    /// independently and share attempts already in flight.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::sync::Arc;
    /// use mcphub::mcp::config::EndpointDefinition;
    /// use mcphub::mcp::manager::McpManager;
    /// use mcphub::mcp::transport::DefaultTransportFactory;
    /// use mcphub::mcp::types::Implementation;
    ///
    /// # tokio_test::block_on(async {
    /// let manager = McpManager::new(
    ///     Arc::new(DefaultTransportFactory),
    ///     Implementation { name: "host".into(), version: "1.0".into(), description: None },
    /// );
    /// let off = EndpointDefinition::process("off", "cat", Vec::<String>::new()).with_enabled(false);
    /// let report = manager.reconcile(vec![off]).await;
    /// assert!(report.connected.is_empty());
    /// assert!(manager.active_ids().is_empty());
    /// # });
    /// ```
    pub async fn reconcile(&self, definitions: Vec<EndpointDefinition>) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        if self.inner.shutdown.is_cancelled() {
            tracing::warn!("reconcile requested after shutdown; ignoring");
            return report;
        }

        let mut valid = Vec::new();
        for definition in dedupe_first_wins(definitions) {
            match definition.validate() {
                Ok(()) => valid.push(definition),
                Err(e) => {
                    tracing::warn!(endpoint = %definition.id, "invalid endpoint definition: {e}");
                    report.invalid.push(definition.id.clone());
                }
            }
        }
        let desired: Vec<&EndpointDefinition> = valid.iter().filter(|d| d.enabled).collect();

        let (to_stop, to_start) = {
            let mut state = write(&self.inner.state);
            // Checked under the state lock so a concurrent shutdown either
            // sees the clients created here or this pass sees the shutdown.
            if self.inner.shutdown.is_cancelled() {
                tracing::warn!("reconcile raced shutdown; ignoring");
                return report;
            }

            let mut to_stop = Vec::new();
            let active: Vec<String> = state.clients.keys().cloned().collect();
            for id in active {
                let keep = desired.iter().any(|d| {
                    d.id == id
                        && state
                            .clients
                            .get(&id)
                            .map_or(false, |c| c.definition() == *d)
                });
                if !keep {
                    if let Some(client) = state.clients.remove(&id) {
                        state.order.retain(|o| o != &id);
                        to_stop.push(client);
                    }
                }
            }

            let mut to_start = Vec::new();
            for definition in &desired {
                if let Some(client) = state.clients.get(&definition.id) {
                    if client.is_connected() {
                        report.unchanged.push(definition.id.clone());
                    } else {
                        to_start.push(Arc::clone(client));
                    }
                    continue;
                }
                match self.new_client(definition) {
                    Ok(client) => {
                        state.failures.remove(&definition.id);
                        state
                            .clients
                            .insert(definition.id.clone(), Arc::clone(&client));
                        to_start.push(client);
                    }
                    Err(e) => {
                        tracing::warn!(endpoint = %definition.id, "cannot create transport: {e}");
                        record_connect_failure(&definition.id);
                        state
                            .failures
                            .insert(definition.id.clone(), e.to_string());
                        report.failed.push((definition.id.clone(), e.to_string()));
                    }
                }
            }

            let known: HashSet<&str> = valid.iter().map(|d| d.id.as_str()).collect();
            state.failures.retain(|id, _| known.contains(id.as_str()));
            state.definitions = valid.clone();
            (to_stop, to_start)
        };

        let stops = to_stop.iter().map(|client| async move {
            if let Err(e) = client.disconnect().await {
                tracing::warn!(endpoint = %client.id(), "disconnect failed: {e}");
            }
            tracing::info!(endpoint = %client.id(), "endpoint stopped");
            client.id().to_string()
        });
        report.disconnected = futures::future::join_all(stops).await;

        let mut connects: FuturesUnordered<_> = to_start
            .into_iter()
            .map(|client| async move {
                let result = client.connect().await;
                (client, result)
            })
            .collect();
        while let Some((client, result)) = connects.next().await {
            let superseded = self.inner.shutdown.is_cancelled() || !self.inner.is_current(&client);
            match result {
                Ok(()) if superseded => {
                    tracing::debug!(endpoint = %client.id(), "connected after removal; closing");
                    if let Err(e) = client.disconnect().await {
                        tracing::debug!(endpoint = %client.id(), "disconnect failed: {e}");
                    }
                }
                Ok(()) => {
                    self.inner.note_connected(&client);
                    report.connected.push(client.id().to_string());
                }
                Err(e) if superseded => {
                    tracing::debug!(endpoint = %client.id(), "abandoned connect: {e}");
                }
                Err(e) => {
                    record_connect_failure(client.id());
                    report.failed.push((client.id().to_string(), e.to_string()));
                }
            }
        }

        self.inner.rebuild();
        tracing::info!(
            connected = report.connected.len(),
            disconnected = report.disconnected.len(),
            failed = report.failed.len(),
            invalid = report.invalid.len(),
            unchanged = report.unchanged.len(),
            "reconciliation complete"
        );
        report
    }

    /// Load from `provider` and reconcile.
    ///
    /// # Errors
    ///
    /// Returns the provider's error when the definitions cannot be loaded.
    pub async fn start(&self, provider: &dyn ConfigProvider) -> Result<ReconcileReport> {
        let definitions = provider.load()?;
        Ok(self.reconcile(definitions).await)
    }

    /// Reconcile on every change from `provider` until shutdown.
    pub fn watch_config(&self, provider: Arc<dyn ConfigProvider>) {
        let weak = Arc::downgrade(&self.inner);
        let token = self.inner.shutdown.clone();
        let mut changes = provider.changes();
        let task = tokio::spawn(async move {
            loop {
                let definitions = tokio::select! {
                    _ = token.cancelled() => break,
                    next = changes.next() => match next {
                        Some(definitions) => definitions,
                        None => break,
                    },
                };
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                tracing::info!(endpoints = definitions.len(), "configuration changed; reconciling");
                McpManager { inner }.reconcile(definitions).await;
            }
            tracing::debug!("configuration watch stopped");
        });
        self.inner
            .tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(task);
    }

    /// Connect one configured endpoint on demand.
    ///
    /// Shares an attempt already in flight for the same endpoint.
    ///
    /// # Errors
    ///
    /// [`McpHubError::NotFound`] for an unknown id, [`McpHubError::Config`]
    /// for a disabled endpoint, otherwise the connect error.
    pub async fn connect_endpoint(&self, id: &str) -> Result<()> {
        let client = {
            let mut state = write(&self.inner.state);
            if self.inner.shutdown.is_cancelled() {
                return Err(McpHubError::closed(id, "manager is shut down").into());
            }
            let definition = state
                .definitions
                .iter()
                .find(|d| d.id == id)
                .cloned()
                .ok_or_else(|| McpHubError::NotFound(format!("endpoint '{id}'")))?;
            if !definition.enabled {
                return Err(
                    McpHubError::Config(format!("endpoint '{id}' is disabled")).into(),
                );
            }
            match state.clients.get(id) {
                Some(client) => Arc::clone(client),
                None => {
                    let client = self.new_client(&definition)?;
                    state.clients.insert(id.to_string(), Arc::clone(&client));
                    client
                }
            }
        };

        match client.connect().await {
            Ok(()) if self.inner.shutdown.is_cancelled() || !self.inner.is_current(&client) => {
                let _ = client.disconnect().await;
                Err(McpHubError::closed(id, "endpoint was removed while connecting").into())
            }
            Ok(()) => {
                self.inner.note_connected(&client);
                self.inner.rebuild();
                Ok(())
            }
            Err(e) => {
                record_connect_failure(id);
                Err(e)
            }
        }
    }

    /// Disconnect and remove one endpoint. Returns `false` if it was not active.
    pub async fn disconnect_endpoint(&self, id: &str) -> Result<bool> {
        let client = {
            let mut state = write(&self.inner.state);
            state.order.retain(|o| o != id);
            state.clients.remove(id)
        };
        let Some(client) = client else {
            return Ok(false);
        };
        let result = client.disconnect().await;
        self.inner.rebuild();
        result.map(|()| true)
    }

    // -- catalog -----------------------------------------------------------

    /// Aggregate tools of the connected endpoints, in connection order.
    pub fn list_tools(&self) -> Vec<ToolDescriptor> {
        let connected = self.inner.connected_ids();
        self.inner
            .registry()
            .tools()
            .iter()
            .filter(|t| connected.contains(&t.endpoint_id))
            .cloned()
            .collect()
    }

    /// Aggregate resources of the connected endpoints, in connection order.
    pub fn list_resources(&self) -> Vec<ResourceDescriptor> {
        let connected = self.inner.connected_ids();
        self.inner
            .registry()
            .resources()
            .iter()
            .filter(|r| connected.contains(&r.endpoint_id))
            .cloned()
            .collect()
    }

    /// Aggregate prompts of the connected endpoints, in connection order.
    pub fn list_prompts(&self) -> Vec<PromptDescriptor> {
        let connected = self.inner.connected_ids();
        self.inner
            .registry()
            .prompts()
            .iter()
            .filter(|p| connected.contains(&p.endpoint_id))
            .cloned()
            .collect()
    }

    // -- routing -----------------------------------------------------------

    fn route(&self, endpoint: &str) -> std::result::Result<Arc<McpClient>, CallFailure> {
        match self.inner.client(endpoint) {
            Some(client) if client.is_connected() => Ok(client),
            Some(_) => Err(CallFailure::not_connected(endpoint)),
            None => Err(CallFailure::unknown(endpoint)),
        }
    }

    /// Call a tool by namespaced name.
    ///
    /// A tool that reports `isError` is still `Ok`; the endpoint answered.
    pub async fn call_tool(
        &self,
        qualified_name: &str,
        arguments: Option<serde_json::Value>,
    ) -> std::result::Result<CallToolResponse, CallFailure> {
        let (endpoint, _) =
            split_qualified(qualified_name).ok_or_else(|| CallFailure::unknown(qualified_name))?;
        let client = self.route(endpoint)?;
        if self.inner.registry().tool(qualified_name).is_none() {
            return Err(CallFailure::unknown(qualified_name));
        }

        tracing::debug!(endpoint = %endpoint, tool = %qualified_name, "routing tool call");
        let metrics = CallMetrics::new(endpoint);
        match client.call_tool(qualified_name, arguments).await {
            Ok(response) => {
                metrics.record_success();
                Ok(response)
            }
            Err(e) => {
                let failure = CallFailure::from_error(endpoint, &e);
                metrics.record_failure(failure.kind.as_str());
                tracing::warn!(endpoint = %endpoint, tool = %qualified_name, "tool call failed: {failure}");
                Err(failure)
            }
        }
    }

    /// Read a resource.
    ///
    /// With `endpoint` set the request goes straight to that endpoint.
    /// Otherwise `target` is matched against the aggregate resources by URI
    /// (earliest-connected owner wins) and then by namespaced name.
    pub async fn read_resource(
        &self,
        target: &str,
        endpoint: Option<&str>,
    ) -> std::result::Result<Vec<ResourceContents>, CallFailure> {
        let (client, uri) = match endpoint {
            Some(id) => (self.route(id)?, target.to_string()),
            None => {
                let connected = self.inner.connected_ids();
                let registry = self.inner.registry();
                let owner = registry
                    .resource_by_uri(target, |r| connected.contains(&r.endpoint_id))
                    .or_else(|| {
                        registry
                            .resource(target)
                            .filter(|r| connected.contains(&r.endpoint_id))
                    })
                    .ok_or_else(|| CallFailure::unknown(target))?;
                (self.route(&owner.endpoint_id)?, owner.uri().to_string())
            }
        };

        let id = client.id().to_string();
        let metrics = CallMetrics::new(&id);
        match client.read_resource(&uri).await {
            Ok(contents) => {
                metrics.record_success();
                Ok(contents)
            }
            Err(e) => {
                let failure = CallFailure::from_error(&id, &e);
                metrics.record_failure(failure.kind.as_str());
                Err(failure)
            }
        }
    }

    /// Render a prompt by namespaced name.
    pub async fn get_prompt(
        &self,
        qualified_name: &str,
        arguments: Option<HashMap<String, String>>,
    ) -> std::result::Result<GetPromptResponse, CallFailure> {
        let (endpoint, _) =
            split_qualified(qualified_name).ok_or_else(|| CallFailure::unknown(qualified_name))?;
        let client = self.route(endpoint)?;
        if self.inner.registry().prompt(qualified_name).is_none() {
            return Err(CallFailure::unknown(qualified_name));
        }

        let metrics = CallMetrics::new(endpoint);
        match client.get_prompt(qualified_name, arguments).await {
            Ok(response) => {
                metrics.record_success();
                Ok(response)
            }
            Err(e) => {
                let failure = CallFailure::from_error(endpoint, &e);
                metrics.record_failure(failure.kind.as_str());
                Err(failure)
            }
        }
    }

    // -- diagnostics -------------------------------------------------------

    /// Connect, list, and disconnect a configured endpoint without touching
    /// the active set.
    ///
    /// # Errors
    ///
    /// [`McpHubError::NotFound`] when `id` is not configured. Connection
    /// problems are reported in the returned report instead.
    pub async fn test_connection(&self, id: &str) -> Result<TestConnectionReport> {
        let definition = read(&self.inner.state)
            .definitions
            .iter()
            .find(|d| d.id == id)
            .cloned()
            .ok_or_else(|| McpHubError::NotFound(format!("endpoint '{id}'")))?;
        Ok(self.test_definition(&definition).await)
    }

    /// [`McpManager::test_connection`] for an arbitrary definition.
    pub async fn test_definition(&self, definition: &EndpointDefinition) -> TestConnectionReport {
        let started = Instant::now();
        let mut report = TestConnectionReport {
            endpoint: definition.id.clone(),
            success: false,
            server: None,
            tools: Vec::new(),
            resources: Vec::new(),
            prompts: Vec::new(),
            ping_ms: None,
            error: None,
            elapsed: Duration::ZERO,
        };

        let outcome = async {
            definition.validate()?;
            let transport = self.inner.factory.create(definition)?;
            // Events from the throwaway client go nowhere.
            let (tx, _rx) = mpsc::unbounded_channel();
            let client = McpClient::new(
                definition.clone(),
                transport,
                self.inner.client_info.clone(),
                tx,
            );
            let connected = client.connect().await;
            if connected.is_ok() {
                let catalog = client.catalog();
                report.server = client.server_info();
                report.tools = catalog.tools.into_iter().map(|t| t.name).collect();
                report.resources = catalog.resources.into_iter().map(|r| r.uri).collect();
                report.prompts = catalog.prompts.into_iter().map(|p| p.name).collect();

                let sent = Instant::now();
                match client.ping().await {
                    Ok(()) => report.ping_ms = Some(sent.elapsed().as_millis() as u64),
                    Err(e) => tracing::debug!(endpoint = %definition.id, "ping failed: {e}"),
                }
            }
            if let Err(e) = client.disconnect().await {
                tracing::debug!(endpoint = %definition.id, "test disconnect failed: {e}");
            }
            connected
        }
        .await;

        match outcome {
            Ok(()) => report.success = true,
            Err(e) => report.error = Some(e.to_string()),
        }
        report.elapsed = started.elapsed();
        tracing::info!(
            endpoint = %definition.id,
            success = report.success,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "connection test finished"
        );
        report
    }

    fn status_of(state: &ManagerState, definition: &EndpointDefinition) -> EndpointStatus {
        let (connection, tools, resources, prompts) = match state.clients.get(&definition.id) {
            Some(client) => {
                let catalog = client.catalog();
                (
                    client.state(),
                    catalog.tools.len(),
                    catalog.resources.len(),
                    catalog.prompts.len(),
                )
            }
            None => {
                let connection = match state.failures.get(&definition.id) {
                    Some(error) if definition.enabled => ConnectionState {
                        status: ConnectionStatus::Error,
                        last_error: Some(error.clone()),
                        last_activity: None,
                    },
                    _ => ConnectionState::default(),
                };
                (connection, 0, 0, 0)
            }
        };
        EndpointStatus {
            id: definition.id.clone(),
            kind: definition.kind(),
            enabled: definition.enabled,
            state: connection,
            tools,
            resources,
            prompts,
        }
    }

    /// Status of one configured endpoint.
    pub fn get_status(&self, id: &str) -> Option<EndpointStatus> {
        let state = read(&self.inner.state);
        state
            .definitions
            .iter()
            .find(|d| d.id == id)
            .map(|d| Self::status_of(&state, d))
    }

    /// Status of every configured endpoint, in configuration order.
    pub fn get_all_statuses(&self) -> Vec<EndpointStatus> {
        let state = read(&self.inner.state);
        state
            .definitions
            .iter()
            .map(|d| Self::status_of(&state, d))
            .collect()
    }

    /// Aggregate counts.
    pub fn summary(&self) -> StatusSummary {
        let statuses = self.get_all_statuses();
        let count = |status: ConnectionStatus| {
            statuses
                .iter()
                .filter(|s| s.state.status == status)
                .count()
        };
        let tools = self.list_tools().len();
        let resources = self.list_resources().len();
        let prompts = self.list_prompts().len();
        StatusSummary {
            configured: statuses.len(),
            enabled: statuses.iter().filter(|s| s.enabled).count(),
            connected: count(ConnectionStatus::Connected),
            connecting: count(ConnectionStatus::Connecting),
            errored: count(ConnectionStatus::Error),
            tools,
            resources,
            prompts,
        }
    }

    // -- shutdown ----------------------------------------------------------

    /// Disconnect every endpoint and stop background tasks.
    ///
    /// Pending requests are rejected immediately and connects still in
    /// flight are abandoned. Waits up to `grace` for the channels to close;
    /// transports still closing afterwards finish (and force-terminate) in
    /// the background. Returns `true` when every endpoint closed within
    /// `grace`.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        self.inner.shutdown.cancel();
        for task in self
            .inner
            .tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .drain(..)
        {
            task.abort();
        }
        let clients: Vec<Arc<McpClient>> = {
            let mut state = write(&self.inner.state);
            state.order.clear();
            state.clients.drain().map(|(_, c)| c).collect()
        };
        tracing::info!(endpoints = clients.len(), "shutting down endpoints");

        let closing: Vec<JoinHandle<()>> = clients
            .into_iter()
            .map(|client| {
                tokio::spawn(async move {
                    if let Err(e) = client.disconnect().await {
                        tracing::warn!(endpoint = %client.id(), "disconnect failed: {e}");
                    }
                })
            })
            .collect();

        let graceful = tokio::time::timeout(grace, futures::future::join_all(closing))
            .await
            .is_ok();
        if !graceful {
            tracing::warn!("shutdown grace of {grace:?} elapsed; remaining endpoints closing in background");
        }

        self.inner.rebuild();
        graceful
    }
}
