//! Wire types for the parts of MCP that mcphub speaks
//!
//! JSON-RPC 2.0 envelopes, the `initialize` exchange, and the catalog
//! objects (tools, resources, prompts) with their call/read/get payloads.
//! Field names follow the protocol's camelCase; optional fields are omitted
//! when `None`. Unknown fields sent by servers are ignored.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Revision sent in `initialize`.
pub const LATEST_PROTOCOL_VERSION: &str = "2025-11-25";

/// Revisions a server may answer with. Anything else fails the handshake.
pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] = &[
    LATEST_PROTOCOL_VERSION,
    "2025-06-18",
    "2025-03-26",
    "2024-11-05",
];

pub const METHOD_INITIALIZE: &str = "initialize";
pub const METHOD_INITIALIZED: &str = "notifications/initialized";
pub const METHOD_PING: &str = "ping";
pub const METHOD_TOOLS_LIST: &str = "tools/list";
pub const METHOD_TOOLS_CALL: &str = "tools/call";
pub const METHOD_RESOURCES_LIST: &str = "resources/list";
pub const METHOD_RESOURCES_READ: &str = "resources/read";
pub const METHOD_PROMPTS_LIST: &str = "prompts/list";
pub const METHOD_PROMPTS_GET: &str = "prompts/get";

/// JSON-RPC: unknown method.
pub const METHOD_NOT_FOUND: i64 = -32601;
/// JSON-RPC: bad parameters.
pub const INVALID_PARAMS: i64 = -32602;
/// JSON-RPC: server-side failure.
pub const INTERNAL_ERROR: i64 = -32603;

/// One of the three catalog lists an endpoint can expose.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatalogPart {
    Tools,
    Resources,
    Prompts,
}

impl CatalogPart {
    /// Map a `notifications/<part>/list_changed` method to its part.
    ///
    /// The camelCase `listChanged` spelling is accepted too.
    ///
    /// # Examples
    ///
    /// ```
    /// use mcphub::mcp::types::CatalogPart;
    ///
    /// assert_eq!(
    ///     CatalogPart::from_notification("notifications/tools/list_changed"),
    ///     Some(CatalogPart::Tools)
    /// );
    /// assert_eq!(
    ///     CatalogPart::from_notification("notifications/prompts/listChanged"),
    ///     Some(CatalogPart::Prompts)
    /// );
    /// assert_eq!(CatalogPart::from_notification("notifications/progress"), None);
    /// ```
    pub fn from_notification(method: &str) -> Option<Self> {
        let (part, event) = method.strip_prefix("notifications/")?.split_once('/')?;
        if !matches!(event, "list_changed" | "listChanged") {
            return None;
        }
        match part {
            "tools" => Some(Self::Tools),
            "resources" => Some(Self::Resources),
            "prompts" => Some(Self::Prompts),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// JSON-RPC envelopes
// ---------------------------------------------------------------------------

/// Outbound request. `id` is `None` when sent as a notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<serde_json::Value>,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

/// Outbound notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

/// Reply to a request; carries either `result` or `error`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

/// The `error` member of a reply.
///
/// # Examples
///
/// ```
/// use mcphub::mcp::types::JsonRpcError;
///
/// let e = JsonRpcError { code: -32600, message: "Invalid Request".to_string(), data: None };
/// assert_eq!(e.to_string(), "JSON-RPC error -32600: Invalid Request");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl fmt::Display for JsonRpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "JSON-RPC error {}: {}", self.code, self.message)
    }
}

// ---------------------------------------------------------------------------
// Handshake
// ---------------------------------------------------------------------------

/// Name and version of a client or server (`clientInfo` / `serverInfo`).
///
/// # Examples
///
/// ```
/// use mcphub::mcp::types::Implementation;
///
/// let info = Implementation {
///     name: "mcphub".to_string(),
///     version: "0.1.0".to_string(),
///     description: None,
/// };
/// let json = serde_json::to_string(&info).unwrap();
/// assert!(!json.contains("description"));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Implementation {
    pub name: String,
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// What mcphub offers a server. It only consumes, so the default is `{}`.
///
/// ```
/// use mcphub::mcp::types::ClientCapabilities;
///
/// let json = serde_json::to_value(ClientCapabilities::default()).unwrap();
/// assert_eq!(json, serde_json::json!({}));
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientCapabilities {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub experimental: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub roots: Option<serde_json::Value>,
}

/// What a server offers. A present key means the feature is available;
/// the object contents (`listChanged`, `subscribe`) are not interpreted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerCapabilities {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub experimental: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompts: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<serde_json::Value>,
}

/// `initialize` params.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    pub protocol_version: String,
    pub capabilities: ClientCapabilities,
    pub client_info: Implementation,
}

/// `initialize` result.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResponse {
    /// Revision the server picked; must be one of [`SUPPORTED_PROTOCOL_VERSIONS`].
    pub protocol_version: String,
    #[serde(default)]
    pub capabilities: ServerCapabilities,
    pub server_info: Implementation,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

// ---------------------------------------------------------------------------
// Catalog listing
// ---------------------------------------------------------------------------

/// Cursor sent with every `*/list` request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PaginatedParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
}

/// One page of a `tools/list`, `resources/list`, or `prompts/list` result.
///
/// The item array arrives under the list's own key; all three deserialize
/// into `items`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    #[serde(alias = "tools", alias = "resources", alias = "prompts", default = "Vec::new")]
    pub items: Vec<T>,
    #[serde(default)]
    pub next_cursor: Option<String>,
}

/// A tool as the endpoint describes it (unqualified name).
///
/// # Examples
///
/// ```
/// use mcphub::mcp::types::McpTool;
///
/// let tool: McpTool = serde_json::from_value(serde_json::json!({
///     "name": "search",
///     "description": "Search the web"
/// })).unwrap();
/// assert_eq!(tool.input_schema, serde_json::json!({ "type": "object" }));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct McpTool {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// JSON Schema of the arguments. Missing schemas become `{"type":"object"}`.
    #[serde(default = "object_schema")]
    pub input_schema: serde_json::Value,
    /// Display and safety hints, passed through untouched.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotations: Option<serde_json::Value>,
}

fn object_schema() -> serde_json::Value {
    serde_json::json!({ "type": "object" })
}

/// A resource as the endpoint describes it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Resource {
    pub uri: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

/// A prompt template as the endpoint describes it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Prompt {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Vec<PromptArgument>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PromptArgument {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub required: Option<bool>,
}

// ---------------------------------------------------------------------------
// Content
// ---------------------------------------------------------------------------

/// A content block in a tool result or prompt message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Content {
    Text {
        text: String,
    },
    /// Base64 image data.
    Image {
        data: String,
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
    /// Base64 audio data.
    Audio {
        data: String,
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
    Resource {
        resource: ResourceContents,
    },
    /// A reference to a resource the caller may read separately.
    ResourceLink {
        uri: String,
        #[serde(default)]
        name: Option<String>,
    },
}

/// Text body of a resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TextResourceContents {
    pub uri: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    pub text: String,
}

/// Binary body of a resource, base64 in `blob`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BlobResourceContents {
    pub uri: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    pub blob: String,
}

/// Resource body; told apart by whether `text` or `blob` is present.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ResourceContents {
    Text(TextResourceContents),
    Blob(BlobResourceContents),
}

impl ResourceContents {
    pub fn uri(&self) -> &str {
        match self {
            ResourceContents::Text(t) => &t.uri,
            ResourceContents::Blob(b) => &b.uri,
        }
    }
}

// ---------------------------------------------------------------------------
// Calls
// ---------------------------------------------------------------------------

/// `tools/call` params.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallToolParams {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<serde_json::Value>,
    #[serde(rename = "_meta", skip_serializing_if = "Option::is_none")]
    pub meta: Option<serde_json::Value>,
}

/// `tools/call` result.
///
/// `is_error: Some(true)` means the tool ran and reported a failure; that
/// is still a successful call at the protocol level.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CallToolResponse {
    #[serde(default)]
    pub content: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_error: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub structured_content: Option<serde_json::Value>,
}

impl CallToolResponse {
    /// The text blocks joined with newlines; other blocks are skipped.
    ///
    /// # Examples
    ///
    /// ```
    /// use mcphub::mcp::types::{CallToolResponse, Content};
    ///
    /// let resp = CallToolResponse {
    ///     content: vec![
    ///         Content::Text { text: "a".into() },
    ///         Content::Text { text: "b".into() },
    ///     ],
    ///     is_error: None,
    ///     structured_content: None,
    /// };
    /// assert_eq!(resp.text(), "a\nb");
    /// ```
    pub fn text(&self) -> String {
        let texts: Vec<&str> = self
            .content
            .iter()
            .filter_map(|c| match c {
                Content::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        texts.join("\n")
    }
}

/// `resources/read` params.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadResourceParams {
    pub uri: String,
}

/// `resources/read` result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadResourceResponse {
    pub contents: Vec<ResourceContents>,
}

/// `prompts/get` params.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetPromptParams {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<HashMap<String, String>>,
}

/// `prompts/get` result.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GetPromptResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub messages: Vec<PromptMessage>,
}

/// One message of a rendered prompt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PromptMessage {
    /// `user` or `assistant`.
    pub role: String,
    pub content: Content,
}
