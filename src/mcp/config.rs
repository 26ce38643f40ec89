//! Endpoint definitions
//!
//! An [`EndpointDefinition`] describes one MCP endpoint: its id, which of
//! the three channel kinds to use and that kind's parameters, whether it is
//! enabled, and its request timeout. Definitions are immutable values; a
//! configuration reload produces a whole new set.
//!
//! # Examples
//!
//! ```
//! use mcphub::mcp::config::{EndpointDefinition, TransportConfig};
//!
//! let yaml = r#"
//! id: files
//! type: process
//! command: npx
//! args: ["-y", "@modelcontextprotocol/server-filesystem", "/tmp"]
//! "#;
//! let def: EndpointDefinition = serde_yaml::from_str(yaml).unwrap();
//! assert!(def.enabled);
//! assert!(matches!(def.transport, TransportConfig::Process(_)));
//! def.validate().unwrap();
//! ```

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{McpHubError, Result};

/// Separator between an endpoint id and an item name in namespaced names.
pub const NAMESPACE_SEPARATOR: &str = "__";

/// Request timeout used when a definition does not set one.
pub const DEFAULT_REQUEST_TIMEOUT_SECONDS: u64 = 30;

/// Default socket reconnect attempts after an abnormal closure.
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;

/// Default delay before the first socket reconnect attempt.
pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 500;

/// Upper bound on the socket reconnect delay.
pub const DEFAULT_MAX_RECONNECT_DELAY_MS: u64 = 30_000;

/// The three channel kinds an endpoint can be reached over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Spawned local child process, newline-delimited JSON over stdio.
    Process,
    /// Server-sent event subscription plus HTTP POST side channel.
    Stream,
    /// Persistent WebSocket.
    Socket,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransportKind::Process => "process",
            TransportKind::Stream => "stream",
            TransportKind::Socket => "socket",
        };
        write!(f, "{s}")
    }
}

/// Parameters for a spawned child process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessParams {
    /// Executable to run. Resolved through `PATH`.
    pub command: String,
    /// Command-line arguments.
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment overrides merged over the ambient environment.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Working directory for the child.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
}

/// Parameters for the server-sent event channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamParams {
    /// Subscription URL (`http` or `https`).
    pub url: String,
    /// Extra headers sent on the subscription and on every POST.
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

/// Parameters for the WebSocket channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SocketParams {
    /// Socket URL (`ws` or `wss`).
    pub url: String,
    /// Extra headers sent with the upgrade request.
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Reconnect attempts after an abnormal closure. Zero disables reconnect.
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    /// Delay before the first reconnect attempt, in milliseconds.
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    /// Upper bound on the reconnect delay, in milliseconds.
    #[serde(default = "default_max_reconnect_delay_ms")]
    pub max_reconnect_delay_ms: u64,
}

fn default_max_reconnect_attempts() -> u32 {
    DEFAULT_MAX_RECONNECT_ATTEMPTS
}

fn default_reconnect_delay_ms() -> u64 {
    DEFAULT_RECONNECT_DELAY_MS
}

fn default_max_reconnect_delay_ms() -> u64 {
    DEFAULT_MAX_RECONNECT_DELAY_MS
}

/// Kind-specific transport parameters, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TransportConfig {
    /// `type: process` (alias `stdio`)
    #[serde(alias = "stdio")]
    Process(ProcessParams),
    /// `type: stream` (alias `sse`)
    #[serde(alias = "sse")]
    Stream(StreamParams),
    /// `type: socket` (aliases `websocket`, `ws`)
    #[serde(alias = "websocket", alias = "ws")]
    Socket(SocketParams),
}

impl TransportConfig {
    /// The channel kind these parameters describe.
    pub fn kind(&self) -> TransportKind {
        match self {
            TransportConfig::Process(_) => TransportKind::Process,
            TransportConfig::Stream(_) => TransportKind::Stream,
            TransportConfig::Socket(_) => TransportKind::Socket,
        }
    }

    /// Short human-readable target: the command line or the URL.
    pub fn target(&self) -> String {
        match self {
            TransportConfig::Process(p) if p.args.is_empty() => p.command.clone(),
            TransportConfig::Process(p) => format!("{} {}", p.command, p.args.join(" ")),
            TransportConfig::Stream(s) => s.url.clone(),
            TransportConfig::Socket(s) => s.url.clone(),
        }
    }
}

/// One configured MCP endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointDefinition {
    /// Unique endpoint id; also the namespace prefix for its catalog.
    pub id: String,
    /// Channel kind and its parameters.
    #[serde(flatten)]
    pub transport: TransportConfig,
    /// Disabled endpoints are never connected.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Per-request timeout in seconds. `None` uses the application default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
}

fn default_enabled() -> bool {
    true
}

fn id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9_-]+$").expect("static regex is valid"))
}

impl EndpointDefinition {
    /// Build an enabled process endpoint.
    ///
    /// # Examples
    ///
    /// ```
    /// use mcphub::mcp::config::{EndpointDefinition, TransportKind};
    ///
    /// let def = EndpointDefinition::process("echo", "cat", Vec::<String>::new());
    /// assert_eq!(def.kind(), TransportKind::Process);
    /// assert!(def.enabled);
    /// ```
    pub fn process(
        id: impl Into<String>,
        command: impl Into<String>,
        args: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            id: id.into(),
            transport: TransportConfig::Process(ProcessParams {
                command: command.into(),
                args: args.into_iter().map(Into::into).collect(),
                env: HashMap::new(),
                cwd: None,
            }),
            enabled: true,
            timeout_seconds: None,
        }
    }

    /// Build an enabled streaming endpoint.
    pub fn stream(id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            transport: TransportConfig::Stream(StreamParams {
                url: url.into(),
                headers: HashMap::new(),
            }),
            enabled: true,
            timeout_seconds: None,
        }
    }

    /// Build an enabled socket endpoint with default reconnect settings.
    pub fn socket(id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            transport: TransportConfig::Socket(SocketParams {
                url: url.into(),
                headers: HashMap::new(),
                max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
                reconnect_delay_ms: DEFAULT_RECONNECT_DELAY_MS,
                max_reconnect_delay_ms: DEFAULT_MAX_RECONNECT_DELAY_MS,
            }),
            enabled: true,
            timeout_seconds: None,
        }
    }

    /// Return a copy with `enabled` set.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Return a copy with the request timeout set.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_seconds = Some(timeout.as_secs().max(1));
        self
    }

    /// The channel kind of this endpoint.
    pub fn kind(&self) -> TransportKind {
        self.transport.kind()
    }

    /// Effective per-request timeout.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(
            self.timeout_seconds
                .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECONDS),
        )
    }

    /// Validate the definition.
    ///
    /// # Errors
    ///
    /// Returns [`McpHubError::Config`] when the id is empty, contains
    /// characters outside `[A-Za-z0-9_-]` or the namespace separator, the
    /// command is empty, the URL does not parse or has the wrong scheme for
    /// its kind, or the timeout is zero.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| -> anyhow::Error { McpHubError::Config(msg).into() };

        if self.id.is_empty() {
            return Err(invalid("endpoint id must not be empty".to_string()));
        }
        if !id_pattern().is_match(&self.id) {
            return Err(invalid(format!(
                "endpoint id '{}' may only contain letters, digits, '-' and '_'",
                self.id
            )));
        }
        if self.id.contains(NAMESPACE_SEPARATOR) {
            return Err(invalid(format!(
                "endpoint id '{}' must not contain '{}'",
                self.id, NAMESPACE_SEPARATOR
            )));
        }
        if self.timeout_seconds == Some(0) {
            return Err(invalid(format!(
                "endpoint '{}': timeout_seconds must be greater than 0",
                self.id
            )));
        }

        match &self.transport {
            TransportConfig::Process(p) => {
                if p.command.trim().is_empty() {
                    return Err(invalid(format!(
                        "endpoint '{}': command must not be empty",
                        self.id
                    )));
                }
            }
            TransportConfig::Stream(s) => {
                check_url(&self.id, &s.url, &["http", "https"])?;
            }
            TransportConfig::Socket(s) => {
                check_url(&self.id, &s.url, &["ws", "wss"])?;
                if s.reconnect_delay_ms > s.max_reconnect_delay_ms {
                    return Err(invalid(format!(
                        "endpoint '{}': reconnect_delay_ms exceeds max_reconnect_delay_ms",
                        self.id
                    )));
                }
            }
        }
        Ok(())
    }

    /// Expand `${VAR}` references from the ambient environment.
    ///
    /// Applies to process arguments and environment values, URLs, and header
    /// values. Unset variables are left verbatim.
    pub fn expand_env(&mut self) {
        match &mut self.transport {
            TransportConfig::Process(p) => {
                for arg in &mut p.args {
                    *arg = expand_env_vars(arg);
                }
                for value in p.env.values_mut() {
                    *value = expand_env_vars(value);
                }
            }
            TransportConfig::Stream(s) => {
                s.url = expand_env_vars(&s.url);
                for value in s.headers.values_mut() {
                    *value = expand_env_vars(value);
                }
            }
            TransportConfig::Socket(s) => {
                s.url = expand_env_vars(&s.url);
                for value in s.headers.values_mut() {
                    *value = expand_env_vars(value);
                }
            }
        }
    }
}

fn check_url(id: &str, raw: &str, schemes: &[&str]) -> Result<()> {
    let url = url::Url::parse(raw).map_err(|e| {
        McpHubError::Config(format!("endpoint '{id}': invalid url '{raw}': {e}"))
    })?;
    if !schemes.contains(&url.scheme()) {
        return Err(McpHubError::Config(format!(
            "endpoint '{id}': url scheme '{}' not allowed, expected one of {}",
            url.scheme(),
            schemes.join(", ")
        ))
        .into());
    }
    Ok(())
}

/// Replace `${VAR}` with the value of `VAR`; unset variables stay as written.
///
/// # Examples
///
/// ```
/// use mcphub::mcp::config::expand_env_vars;
///
/// std::env::set_var("MCPHUB_DOC_TOKEN", "abc");
/// assert_eq!(expand_env_vars("Bearer ${MCPHUB_DOC_TOKEN}"), "Bearer abc");
/// assert_eq!(expand_env_vars("${MCPHUB_DOC_UNSET_VAR}"), "${MCPHUB_DOC_UNSET_VAR}");
/// ```
pub fn expand_env_vars(input: &str) -> String {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let pattern = PATTERN
        .get_or_init(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("static regex is valid"));
    pattern
        .replace_all(input, |caps: &regex::Captures<'_>| {
            std::env::var(&caps[1]).unwrap_or_else(|_| caps[0].to_string())
        })
        .into_owned()
}

/// Drop later duplicates of an id, keeping the first occurrence.
///
/// # Examples
///
/// ```
/// use mcphub::mcp::config::{dedupe_first_wins, EndpointDefinition};
///
/// let defs = vec![
///     EndpointDefinition::process("a", "first", Vec::<String>::new()),
///     EndpointDefinition::process("a", "second", Vec::<String>::new()),
///     EndpointDefinition::process("b", "other", Vec::<String>::new()),
/// ];
/// let kept = dedupe_first_wins(defs);
/// assert_eq!(kept.len(), 2);
/// assert_eq!(kept[0].transport.target(), "first");
/// ```
pub fn dedupe_first_wins(definitions: Vec<EndpointDefinition>) -> Vec<EndpointDefinition> {
    let mut seen = std::collections::HashSet::new();
    definitions
        .into_iter()
        .filter(|def| {
            let fresh = seen.insert(def.id.clone());
            if !fresh {
                tracing::debug!(endpoint = %def.id, "ignoring duplicate endpoint definition");
            }
            fresh
        })
        .collect()
}
