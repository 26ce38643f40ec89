//! Typed MCP lifecycle wrapper over a [`Transport`]
//!
//! This module provides two types that represent the two phases of an MCP
//! client session:
//!
//! - [`McpProtocol`] -- an uninitialized session. Call
//!   [`McpProtocol::initialize`] to perform the `initialize` /
//!   `notifications/initialized` handshake and receive an
//!   [`InitializedMcpProtocol`].
//! - [`InitializedMcpProtocol`] -- a negotiated session. `tools/*`,
//!   `resources/*`, `prompts/*` and `ping` are available as typed async
//!   methods.
//!
//! All pagination is handled internally: `list_tools`, `list_resources`, and
//! `list_prompts` follow `nextCursor` until the server stops returning one.

use std::collections::HashMap;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{McpHubError, Result};
use crate::mcp::transport::Transport;
use crate::mcp::types::{
    CallToolParams, CallToolResponse, ClientCapabilities, GetPromptParams, GetPromptResponse,
    Implementation, InitializeParams, InitializeResponse, McpTool, Page, PaginatedParams, Prompt,
    ReadResourceParams, ReadResourceResponse, Resource, ResourceContents,
    LATEST_PROTOCOL_VERSION, METHOD_INITIALIZE, METHOD_INITIALIZED, METHOD_PING,
    METHOD_PROMPTS_GET, METHOD_PROMPTS_LIST, METHOD_RESOURCES_LIST, METHOD_RESOURCES_READ,
    METHOD_TOOLS_CALL, METHOD_TOOLS_LIST, SUPPORTED_PROTOCOL_VERSIONS,
};

/// Upper bound on pages followed for one list call.
const MAX_PAGES: usize = 1_000;

/// Identifies a capability a server may advertise.
///
/// Used with [`InitializedMcpProtocol::capable`] to check whether the
/// negotiated server supports a feature before issuing requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerCapabilityFlag {
    /// `tools/list` and `tools/call`.
    Tools,
    /// `resources/list` and `resources/read`.
    Resources,
    /// `prompts/list` and `prompts/get`.
    Prompts,
    /// Log notifications.
    Logging,
}

async fn typed_request<P, R>(transport: &dyn Transport, method: &str, params: P) -> Result<R>
where
    P: Serialize,
    R: DeserializeOwned,
{
    let params = serde_json::to_value(params).map_err(McpHubError::Serialization)?;
    let value = transport.request(method, Some(params)).await?;
    serde_json::from_value(value).map_err(|e| {
        McpHubError::Protocol(format!(
            "[{}] unexpected '{method}' reply shape: {e}",
            transport.endpoint_id()
        ))
        .into()
    })
}

/// An uninitialized MCP session over a connected transport.
#[derive(Debug, Clone)]
pub struct McpProtocol {
    transport: Arc<dyn Transport>,
}

impl McpProtocol {
    /// Wrap a connected transport.
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    /// Perform the `initialize` / `notifications/initialized` handshake.
    ///
    /// Advertises [`LATEST_PROTOCOL_VERSION`] and accepts any version in
    /// [`SUPPORTED_PROTOCOL_VERSIONS`].
    ///
    /// # Errors
    ///
    /// Returns [`McpHubError::Connection`] if the server selects an
    /// unsupported protocol version or the `initialize` request fails.
    pub async fn initialize(
        self,
        client_info: Implementation,
        capabilities: ClientCapabilities,
    ) -> Result<InitializedMcpProtocol> {
        let endpoint = self.transport.endpoint_id().to_string();
        let response: InitializeResponse = typed_request(
            self.transport.as_ref(),
            METHOD_INITIALIZE,
            InitializeParams {
                protocol_version: LATEST_PROTOCOL_VERSION.to_string(),
                capabilities,
                client_info,
            },
        )
        .await
        .map_err(|e| {
            let already_classified = matches!(
                e.downcast_ref::<McpHubError>(),
                Some(McpHubError::Closed { .. }) | Some(McpHubError::Connection { .. })
            );
            if already_classified {
                e
            } else {
                McpHubError::connection(&endpoint, format!("handshake failed: {e}")).into()
            }
        })?;

        if !SUPPORTED_PROTOCOL_VERSIONS.contains(&response.protocol_version.as_str()) {
            return Err(McpHubError::connection(
                &endpoint,
                format!(
                    "unsupported protocol version '{}' (supported: {})",
                    response.protocol_version,
                    SUPPORTED_PROTOCOL_VERSIONS.join(", ")
                ),
            )
            .into());
        }

        self.transport
            .notify(METHOD_INITIALIZED, Some(serde_json::json!({})))
            .await?;

        tracing::debug!(
            endpoint = %endpoint,
            server = %response.server_info.name,
            server_version = %response.server_info.version,
            protocol_version = %response.protocol_version,
            "handshake complete"
        );

        Ok(InitializedMcpProtocol {
            transport: self.transport,
            initialize_response: response,
        })
    }
}

/// A negotiated MCP session.
#[derive(Debug, Clone)]
pub struct InitializedMcpProtocol {
    transport: Arc<dyn Transport>,
    /// The server's reply to `initialize`.
    pub initialize_response: InitializeResponse,
}

impl InitializedMcpProtocol {
    /// Check whether the server advertises `capability`.
    pub fn capable(&self, capability: ServerCapabilityFlag) -> bool {
        let caps = &self.initialize_response.capabilities;
        match capability {
            ServerCapabilityFlag::Tools => caps.tools.is_some(),
            ServerCapabilityFlag::Resources => caps.resources.is_some(),
            ServerCapabilityFlag::Prompts => caps.prompts.is_some(),
            ServerCapabilityFlag::Logging => caps.logging.is_some(),
        }
    }

    /// Name and version the server reported.
    pub fn server_info(&self) -> &Implementation {
        &self.initialize_response.server_info
    }

    /// The negotiated protocol version.
    pub fn protocol_version(&self) -> &str {
        &self.initialize_response.protocol_version
    }

    /// The underlying transport.
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    async fn paginate<T: DeserializeOwned>(&self, method: &str) -> Result<Vec<T>> {
        let mut items = Vec::new();
        let mut cursor: Option<String> = None;
        for _ in 0..MAX_PAGES {
            let page: Page<T> = typed_request(
                self.transport.as_ref(),
                method,
                PaginatedParams {
                    cursor: cursor.take(),
                },
            )
            .await?;
            items.extend(page.items);
            match page.next_cursor {
                Some(c) if !c.is_empty() => cursor = Some(c),
                _ => return Ok(items),
            }
        }
        tracing::warn!(
            endpoint = %self.transport.endpoint_id(),
            method,
            "stopped following pagination after {MAX_PAGES} pages"
        );
        Ok(items)
    }

    /// List all tools, following pagination.
    pub async fn list_tools(&self) -> Result<Vec<McpTool>> {
        self.paginate(METHOD_TOOLS_LIST).await
    }

    /// List all resources, following pagination.
    pub async fn list_resources(&self) -> Result<Vec<Resource>> {
        self.paginate(METHOD_RESOURCES_LIST).await
    }

    /// List all prompts, following pagination.
    pub async fn list_prompts(&self) -> Result<Vec<Prompt>> {
        self.paginate(METHOD_PROMPTS_LIST).await
    }

    /// Invoke a tool by its unqualified name.
    ///
    /// A response with `isError: true` is returned as `Ok`.
    ///
    /// # Errors
    ///
    /// Timeout, remote error, or closed transport.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Option<serde_json::Value>,
    ) -> Result<CallToolResponse> {
        typed_request(
            self.transport.as_ref(),
            METHOD_TOOLS_CALL,
            CallToolParams {
                name: name.to_string(),
                arguments,
                meta: None,
            },
        )
        .await
    }

    /// Read a resource by URI.
    pub async fn read_resource(&self, uri: &str) -> Result<Vec<ResourceContents>> {
        let response: ReadResourceResponse = typed_request(
            self.transport.as_ref(),
            METHOD_RESOURCES_READ,
            ReadResourceParams {
                uri: uri.to_string(),
            },
        )
        .await?;
        Ok(response.contents)
    }

    /// Render a prompt template.
    pub async fn get_prompt(
        &self,
        name: &str,
        arguments: Option<HashMap<String, String>>,
    ) -> Result<GetPromptResponse> {
        typed_request(
            self.transport.as_ref(),
            METHOD_PROMPTS_GET,
            GetPromptParams {
                name: name.to_string(),
                arguments,
            },
        )
        .await
    }

    /// Round-trip a `ping`.
    pub async fn ping(&self) -> Result<()> {
        self.transport
            .request(METHOD_PING, Some(serde_json::json!({})))
            .await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::transport::fake::{FakeEndpoint, FakeTransport};

    fn client_info() -> Implementation {
        Implementation {
            name: "mcphub".to_string(),
            version: "0.1.0".to_string(),
            description: None,
        }
    }

    async fn connected(endpoint: FakeEndpoint) -> Arc<FakeTransport> {
        let fake = Arc::new(FakeTransport::new("fake", endpoint));
        fake.connect().await.unwrap();
        fake
    }

    async fn session(endpoint: FakeEndpoint) -> (Arc<FakeTransport>, InitializedMcpProtocol) {
        let fake = connected(endpoint).await;
        let session = McpProtocol::new(fake.clone())
            .initialize(client_info(), ClientCapabilities::default())
            .await
            .unwrap();
        (fake, session)
    }

    #[tokio::test]
    async fn test_initialize_sends_handshake_then_initialized() {
        let (fake, session) = session(FakeEndpoint::with_tools(&["echo"])).await;
        let sent = fake.sent();
        assert_eq!(sent[0]["method"], "initialize");
        assert_eq!(sent[0]["params"]["protocolVersion"], LATEST_PROTOCOL_VERSION);
        assert_eq!(sent[0]["params"]["clientInfo"]["name"], "mcphub");
        assert_eq!(sent[1]["method"], "notifications/initialized");
        assert_eq!(session.server_info().name, "fake");
    }

    #[tokio::test]
    async fn test_initialize_accepts_older_supported_version() {
        let endpoint = FakeEndpoint {
            protocol_version: "2024-11-05".into(),
            ..FakeEndpoint::default()
        };
        let (_fake, session) = session(endpoint).await;
        assert_eq!(session.protocol_version(), "2024-11-05");
    }

    #[tokio::test]
    async fn test_initialize_rejects_unsupported_version() {
        let endpoint = FakeEndpoint {
            protocol_version: "1999-01-01".into(),
            ..FakeEndpoint::default()
        };
        let fake = connected(endpoint).await;
        let err = McpProtocol::new(fake)
            .initialize(client_info(), ClientCapabilities::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<McpHubError>(),
            Some(McpHubError::Connection { message, .. }) if message.contains("1999-01-01")
        ));
    }

    #[tokio::test]
    async fn test_initialize_remote_error_is_connection_error() {
        let endpoint = FakeEndpoint {
            failing_methods: vec!["initialize".into()],
            ..FakeEndpoint::default()
        };
        let fake = connected(endpoint).await;
        let err = McpProtocol::new(fake)
            .initialize(client_info(), ClientCapabilities::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<McpHubError>(),
            Some(McpHubError::Connection { .. })
        ));
    }

    #[tokio::test]
    async fn test_capabilities_reflect_server_advertisement() {
        let (_fake, session) =
            session(FakeEndpoint::with_tools(&["a"]).and_resources(&["file:///x"])).await;
        assert!(session.capable(ServerCapabilityFlag::Tools));
        assert!(session.capable(ServerCapabilityFlag::Resources));
        assert!(!session.capable(ServerCapabilityFlag::Prompts));
        assert!(!session.capable(ServerCapabilityFlag::Logging));
    }

    #[tokio::test]
    async fn test_list_tools_follows_pagination() {
        let mut endpoint = FakeEndpoint::with_tools(&["a", "b", "c", "d", "e"]);
        endpoint.page_size = Some(2);
        let (fake, session) = session(endpoint).await;
        let names: Vec<String> = session
            .list_tools()
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.name)
            .collect();
        assert_eq!(names, vec!["a", "b", "c", "d", "e"]);
        let list_calls = fake
            .sent()
            .iter()
            .filter(|m| m["method"] == "tools/list")
            .count();
        assert_eq!(list_calls, 3);
    }

    #[tokio::test]
    async fn test_call_tool_is_error_is_ok() {
        let endpoint = FakeEndpoint {
            on_call: Arc::new(|_, _| {
                Ok(serde_json::json!({
                    "content": [{ "type": "text", "text": "boom" }],
                    "isError": true
                }))
            }),
            ..FakeEndpoint::with_tools(&["fails"])
        };
        let (_fake, session) = session(endpoint).await;
        let response = session.call_tool("fails", None).await.unwrap();
        assert_eq!(response.is_error, Some(true));
        assert_eq!(response.text(), "boom");
    }

    #[tokio::test]
    async fn test_read_resource_and_get_prompt() {
        let endpoint = FakeEndpoint::default()
            .and_resources(&["file:///notes.txt"])
            .and_prompts(&["summarize"]);
        let (_fake, session) = session(endpoint).await;

        let contents = session.read_resource("file:///notes.txt").await.unwrap();
        assert_eq!(contents[0].uri(), "file:///notes.txt");

        let mut args = HashMap::new();
        args.insert("topic".to_string(), "rust".to_string());
        let prompt = session.get_prompt("summarize", Some(args)).await.unwrap();
        assert_eq!(prompt.messages.len(), 1);
    }

    #[tokio::test]
    async fn test_remote_error_propagates() {
        let (_fake, session) = session(FakeEndpoint::default()).await;
        let err = session.read_resource("file:///missing").await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<McpHubError>(),
            Some(McpHubError::Remote { code: -32602, .. })
        ));
    }

    #[tokio::test]
    async fn test_ping() {
        let (_fake, session) = session(FakeEndpoint::default()).await;
        session.ping().await.unwrap();
    }
}
