//! In-process fake transport for unit tests
//!
//! [`FakeTransport`] answers protocol requests from an in-memory
//! [`FakeEndpoint`] description instead of doing real I/O. Replies travel
//! through the same [`TransportCore`] dispatch path real transports use, so
//! correlation, events, and closure behave identically.
//!
//! [`FakeTransportFactory`] hands out fakes per endpoint id and remembers
//! every transport it created, which lets manager tests count connects and
//! inject traffic after the fact.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::broadcast;

use crate::error::{McpHubError, Result};
use crate::mcp::config::EndpointDefinition;
use crate::mcp::correlation::PendingRequest;
use crate::mcp::transport::{
    CloseReason, OutboundMessage, Transport, TransportCore, TransportEvent, TransportFactory,
    TransportKind,
};
use crate::mcp::types::{
    JsonRpcError, McpTool, Prompt, Resource, INVALID_PARAMS, LATEST_PROTOCOL_VERSION,
    METHOD_NOT_FOUND,
};

/// Handler for `tools/call`: `(tool name, arguments) -> result or error`.
pub type CallHandler =
    Arc<dyn Fn(&str, &Value) -> std::result::Result<Value, JsonRpcError> + Send + Sync>;

/// Behaviour of a fake endpoint.
#[derive(Clone)]
pub struct FakeEndpoint {
    /// Protocol version returned from `initialize`.
    pub protocol_version: String,
    /// Advertised tools; `None` omits the tools capability.
    pub tools: Option<Vec<McpTool>>,
    /// Advertised resources; `None` omits the capability.
    pub resources: Option<Vec<Resource>>,
    /// Advertised prompts; `None` omits the capability.
    pub prompts: Option<Vec<Prompt>>,
    /// Text served by `resources/read`, keyed by URI.
    pub resource_text: HashMap<String, String>,
    /// Page size for list responses; `None` returns a single page.
    pub page_size: Option<usize>,
    /// Delay before `connect()` completes.
    pub connect_delay: Duration,
    /// Make `connect()` fail.
    pub fail_connect: bool,
    /// Methods that never get a reply.
    pub silent_methods: Vec<String>,
    /// Methods answered with an internal error.
    pub failing_methods: Vec<String>,
    /// `tools/call` behaviour. Defaults to echoing the arguments as text.
    pub on_call: CallHandler,
}

impl std::fmt::Debug for FakeEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FakeEndpoint")
            .field("protocol_version", &self.protocol_version)
            .field("tools", &self.tools.as_ref().map(Vec::len))
            .field("resources", &self.resources.as_ref().map(Vec::len))
            .field("prompts", &self.prompts.as_ref().map(Vec::len))
            .field("fail_connect", &self.fail_connect)
            .finish()
    }
}

impl Default for FakeEndpoint {
    fn default() -> Self {
        Self {
            protocol_version: LATEST_PROTOCOL_VERSION.to_string(),
            tools: Some(Vec::new()),
            resources: None,
            prompts: None,
            resource_text: HashMap::new(),
            page_size: None,
            connect_delay: Duration::ZERO,
            fail_connect: false,
            silent_methods: Vec::new(),
            failing_methods: Vec::new(),
            on_call: Arc::new(|name, args| {
                Ok(json!({
                    "content": [{ "type": "text", "text": format!("{name}:{args}") }]
                }))
            }),
        }
    }
}

impl FakeEndpoint {
    /// An endpoint exposing tools with the given names.
    pub fn with_tools(names: &[&str]) -> Self {
        Self {
            tools: Some(names.iter().map(|n| tool(n)).collect()),
            ..Self::default()
        }
    }

    /// Add resources with the given URIs; each reads back as `"text of {uri}"`.
    pub fn and_resources(mut self, uris: &[&str]) -> Self {
        let list: Vec<Resource> = uris
            .iter()
            .map(|uri| Resource {
                uri: uri.to_string(),
                name: uri.rsplit('/').next().unwrap_or(uri).to_string(),
                description: None,
                mime_type: Some("text/plain".into()),
            })
            .collect();
        for uri in uris {
            self.resource_text
                .insert(uri.to_string(), format!("text of {uri}"));
        }
        self.resources = Some(list);
        self
    }

    /// Add prompts with the given names, each taking one `topic` argument.
    pub fn and_prompts(mut self, names: &[&str]) -> Self {
        self.prompts = Some(
            names
                .iter()
                .map(|n| Prompt {
                    name: n.to_string(),
                    description: Some(format!("prompt {n}")),
                    arguments: Some(vec![crate::mcp::types::PromptArgument {
                        name: "topic".into(),
                        description: None,
                        required: Some(true),
                    }]),
                })
                .collect(),
        );
        self
    }

    fn respond(&self, method: &str, params: &Value) -> std::result::Result<Value, JsonRpcError> {
        if self.failing_methods.iter().any(|m| m == method) {
            return Err(JsonRpcError {
                code: crate::mcp::types::INTERNAL_ERROR,
                message: format!("{method} failed"),
                data: None,
            });
        }
        match method {
            "initialize" => {
                let mut caps = serde_json::Map::new();
                if self.tools.is_some() {
                    caps.insert("tools".into(), json!({ "listChanged": true }));
                }
                if self.resources.is_some() {
                    caps.insert("resources".into(), json!({}));
                }
                if self.prompts.is_some() {
                    caps.insert("prompts".into(), json!({}));
                }
                Ok(json!({
                    "protocolVersion": self.protocol_version,
                    "capabilities": caps,
                    "serverInfo": { "name": "fake", "version": "1.0.0" }
                }))
            }
            "ping" => Ok(json!({})),
            "tools/list" => Ok(self.page("tools", self.tools.as_deref().unwrap_or(&[]), params)),
            "resources/list" => Ok(self.page(
                "resources",
                self.resources.as_deref().unwrap_or(&[]),
                params,
            )),
            "prompts/list" => Ok(self.page(
                "prompts",
                self.prompts.as_deref().unwrap_or(&[]),
                params,
            )),
            "tools/call" => {
                let name = params["name"].as_str().unwrap_or_default();
                let args = params.get("arguments").cloned().unwrap_or(Value::Null);
                (self.on_call)(name, &args)
            }
            "resources/read" => {
                let uri = params["uri"].as_str().unwrap_or_default();
                match self.resource_text.get(uri) {
                    Some(text) => Ok(json!({
                        "contents": [{ "uri": uri, "mimeType": "text/plain", "text": text }]
                    })),
                    None => Err(JsonRpcError {
                        code: INVALID_PARAMS,
                        message: format!("unknown resource {uri}"),
                        data: None,
                    }),
                }
            }
            "prompts/get" => {
                let name = params["name"].as_str().unwrap_or_default();
                let topic = params["arguments"]["topic"].as_str().unwrap_or("nothing");
                Ok(json!({
                    "description": format!("prompt {name}"),
                    "messages": [{
                        "role": "user",
                        "content": { "type": "text", "text": format!("{name} about {topic}") }
                    }]
                }))
            }
            other => Err(JsonRpcError {
                code: METHOD_NOT_FOUND,
                message: format!("Method not found: {other}"),
                data: None,
            }),
        }
    }

    fn page<T: serde::Serialize>(&self, key: &str, items: &[T], params: &Value) -> Value {
        let start: usize = params["cursor"]
            .as_str()
            .and_then(|c| c.parse().ok())
            .unwrap_or(0);
        let size = self.page_size.unwrap_or(usize::MAX);
        let end = start.saturating_add(size).min(items.len());
        let mut body = serde_json::Map::new();
        body.insert(key.into(), json!(&items[start.min(end)..end]));
        if end < items.len() {
            body.insert("nextCursor".into(), json!(end.to_string()));
        }
        Value::Object(body)
    }
}

/// Build a tool with a trivial object schema.
pub fn tool(name: &str) -> McpTool {
    McpTool {
        name: name.to_string(),
        title: None,
        description: Some(format!("tool {name}")),
        input_schema: json!({ "type": "object" }),
        annotations: None,
    }
}

/// A transport whose endpoint lives in memory.
#[derive(Debug)]
pub struct FakeTransport {
    core: TransportCore,
    kind: TransportKind,
    endpoint: Mutex<FakeEndpoint>,
    connects: AtomicUsize,
    disconnects: AtomicUsize,
    aborts: AtomicUsize,
    sent: Mutex<Vec<Value>>,
}

impl FakeTransport {
    /// Create a fake for `id` behaving like `endpoint`.
    pub fn new(id: &str, endpoint: FakeEndpoint) -> Self {
        Self::with_kind(id, TransportKind::Process, endpoint, Duration::from_secs(5))
    }

    /// Create a fake reporting `kind` with the given request timeout.
    pub fn with_kind(
        id: &str,
        kind: TransportKind,
        endpoint: FakeEndpoint,
        request_timeout: Duration,
    ) -> Self {
        Self {
            core: TransportCore::new(id, request_timeout),
            kind,
            endpoint: Mutex::new(endpoint),
            connects: AtomicUsize::new(0),
            disconnects: AtomicUsize::new(0),
            aborts: AtomicUsize::new(0),
            sent: Mutex::new(Vec::new()),
        }
    }

    /// How many times `connect()` started.
    pub fn connect_calls(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// How many times `disconnect()` ran.
    pub fn disconnect_calls(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    /// How many times `abort()` ran.
    pub fn abort_calls(&self) -> usize {
        self.aborts.load(Ordering::SeqCst)
    }

    /// Every frame sent so far, parsed.
    pub fn sent(&self) -> Vec<Value> {
        self.sent.lock().unwrap().clone()
    }

    /// Replace the advertised tool list.
    pub fn set_tools(&self, names: &[&str]) {
        self.endpoint.lock().unwrap().tools = Some(names.iter().map(|n| tool(n)).collect());
    }

    /// Replace the whole endpoint behaviour.
    pub fn set_endpoint(&self, endpoint: FakeEndpoint) {
        *self.endpoint.lock().unwrap() = endpoint;
    }

    /// Deliver `message` as if the endpoint had sent it.
    pub fn inject(&self, message: Value) {
        self.core.dispatch(message);
    }

    /// Deliver a raw frame, valid JSON or not.
    pub fn inject_raw(&self, frame: &str) {
        self.core.handle_inbound(frame);
    }

    /// Simulate the endpoint dropping the channel.
    pub fn close_remote(&self) {
        self.core.mark_closed(CloseReason::Remote);
    }

    /// Simulate a socket coming back after an interruption.
    pub fn simulate_reconnect(&self) {
        self.core.mark_interrupted();
        self.core.emit(TransportEvent::Reconnecting {
            attempt: 1,
            delay: Duration::ZERO,
        });
        self.core.set_connected();
        self.core.emit(TransportEvent::Reconnected);
    }
}

#[async_trait::async_trait]
impl Transport for FakeTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn endpoint_id(&self) -> &str {
        self.core.endpoint()
    }

    async fn connect(&self) -> Result<()> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let (delay, fail) = {
            let ep = self.endpoint.lock().unwrap();
            (ep.connect_delay, ep.fail_connect)
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if fail {
            return Err(McpHubError::connection(self.core.endpoint(), "connection refused").into());
        }
        self.core.set_connected();
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        self.core.mark_closed(CloseReason::Local);
        Ok(())
    }

    async fn abort(&self) -> Result<()> {
        self.aborts.fetch_add(1, Ordering::SeqCst);
        self.core.mark_closed(CloseReason::Local);
        Ok(())
    }

    async fn send(&self, message: OutboundMessage) -> Result<Option<PendingRequest>> {
        self.core.ensure_connected()?;
        let (frame, pending) = self.core.encode(message)?;
        let value: Value = serde_json::from_str(&frame)?;
        self.sent.lock().unwrap().push(value.clone());

        if let (Some(id), Some(method)) = (value.get("id"), value["method"].as_str()) {
            let endpoint = self.endpoint.lock().unwrap().clone();
            if endpoint.silent_methods.iter().any(|m| m == method) {
                return Ok(pending);
            }
            let params = value.get("params").cloned().unwrap_or(Value::Null);
            let reply = match endpoint.respond(method, &params) {
                Ok(result) => json!({ "jsonrpc": "2.0", "id": id, "result": result }),
                Err(error) => json!({ "jsonrpc": "2.0", "id": id, "error": error }),
            };
            self.core.dispatch(reply);
        }
        Ok(pending)
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.core.subscribe()
    }

    fn is_connected(&self) -> bool {
        self.core.is_connected()
    }

    fn pending_requests(&self) -> usize {
        self.core.pending().len()
    }
}

/// Factory producing [`FakeTransport`]s from per-id behaviours.
#[derive(Debug, Default)]
pub struct FakeTransportFactory {
    endpoints: Mutex<HashMap<String, FakeEndpoint>>,
    created: Mutex<Vec<Arc<FakeTransport>>>,
}

impl FakeTransportFactory {
    /// Create an empty factory; unknown ids get [`FakeEndpoint::default`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the behaviour used for transports created for `id` from now on.
    pub fn set(&self, id: &str, endpoint: FakeEndpoint) {
        self.endpoints
            .lock()
            .unwrap()
            .insert(id.to_string(), endpoint);
    }

    /// Builder form of [`FakeTransportFactory::set`].
    pub fn with(self, id: &str, endpoint: FakeEndpoint) -> Self {
        self.set(id, endpoint);
        self
    }

    /// Every transport created for `id`, oldest first.
    pub fn created_for(&self, id: &str) -> Vec<Arc<FakeTransport>> {
        self.created
            .lock()
            .unwrap()
            .iter()
            .filter(|t| t.endpoint_id() == id)
            .cloned()
            .collect()
    }

    /// The most recent transport created for `id`.
    pub fn latest(&self, id: &str) -> Option<Arc<FakeTransport>> {
        self.created_for(id).pop()
    }

    /// Total `connect()` calls across every transport for `id`.
    pub fn connect_calls(&self, id: &str) -> usize {
        self.created_for(id).iter().map(|t| t.connect_calls()).sum()
    }
}

impl TransportFactory for FakeTransportFactory {
    fn create(&self, definition: &EndpointDefinition) -> Result<Arc<dyn Transport>> {
        let endpoint = self
            .endpoints
            .lock()
            .unwrap()
            .get(&definition.id)
            .cloned()
            .unwrap_or_default();
        let transport = Arc::new(FakeTransport::with_kind(
            &definition.id,
            definition.kind(),
            endpoint,
            definition.request_timeout(),
        ));
        self.created.lock().unwrap().push(Arc::clone(&transport));
        Ok(transport)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fake_answers_initialize_and_pages_lists() {
        let mut ep = FakeEndpoint::with_tools(&["a", "b", "c"]);
        ep.page_size = Some(2);
        let fake = FakeTransport::new("f", ep);
        fake.connect().await.unwrap();

        let init = fake.request("initialize", Some(json!({}))).await.unwrap();
        assert_eq!(init["protocolVersion"], LATEST_PROTOCOL_VERSION);

        let first = fake.request("tools/list", None).await.unwrap();
        assert_eq!(first["tools"].as_array().unwrap().len(), 2);
        assert_eq!(first["nextCursor"], "2");
        let second = fake
            .request("tools/list", Some(json!({ "cursor": "2" })))
            .await
            .unwrap();
        assert_eq!(second["tools"].as_array().unwrap().len(), 1);
        assert!(second.get("nextCursor").is_none());
    }

    #[tokio::test]
    async fn test_fake_records_sent_frames() {
        let fake = FakeTransport::new("f", FakeEndpoint::default());
        fake.connect().await.unwrap();
        fake.notify("notifications/initialized", None).await.unwrap();
        assert_eq!(fake.sent()[0]["method"], "notifications/initialized");
        assert_eq!(fake.pending_requests(), 0);
    }
}
