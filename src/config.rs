//! Configuration management for mcphub
//!
//! This module handles loading, parsing, validating, and watching the
//! endpoint configuration from YAML files and environment variables, and
//! defines the [`ConfigProvider`] interface the manager consumes.

use std::path::{Path, PathBuf};
use std::time::Duration;

use futures::stream::{BoxStream, StreamExt};
use notify::{EventKind, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::WatchStream;

use crate::error::{McpHubError, Result};
use crate::mcp::config::{dedupe_first_wins, EndpointDefinition, DEFAULT_REQUEST_TIMEOUT_SECONDS};
use crate::mcp::types::Implementation;

/// Default location of the configuration file, relative to the working
/// directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/mcphub.yaml";

/// Default shutdown grace period in seconds.
pub const DEFAULT_SHUTDOWN_GRACE_SECONDS: u64 = 5;

/// Default poll interval of [`FileConfigProvider::changes`] on platforms
/// without native file notifications.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Default quiet period [`FileConfigProvider::changes`] waits for a burst
/// of file events to settle before reloading.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(250);

/// Main configuration structure for mcphub
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Identity advertised to endpoints during the handshake
    #[serde(default)]
    pub client: ClientInfoConfig,

    /// How long shutdown waits for endpoints to close before giving up
    #[serde(default = "default_shutdown_grace_seconds")]
    pub shutdown_grace_seconds: u64,

    /// Request timeout for endpoints that do not set their own
    #[serde(default = "default_timeout_seconds")]
    pub default_timeout_seconds: u64,

    /// Configured endpoints, in precedence order
    #[serde(default)]
    pub servers: Vec<EndpointDefinition>,
}

/// Client identity sent as `clientInfo`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInfoConfig {
    /// Client name
    #[serde(default = "default_client_name")]
    pub name: String,
    /// Client version
    #[serde(default = "default_client_version")]
    pub version: String,
}

impl Default for ClientInfoConfig {
    fn default() -> Self {
        Self {
            name: default_client_name(),
            version: default_client_version(),
        }
    }
}

impl From<&ClientInfoConfig> for Implementation {
    fn from(info: &ClientInfoConfig) -> Self {
        Implementation {
            name: info.name.clone(),
            version: info.version.clone(),
            description: None,
        }
    }
}

fn default_client_name() -> String {
    env!("CARGO_PKG_NAME").to_string()
}

fn default_client_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

fn default_shutdown_grace_seconds() -> u64 {
    DEFAULT_SHUTDOWN_GRACE_SECONDS
}

fn default_timeout_seconds() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_SECONDS
}

impl Default for Config {
    fn default() -> Self {
        Self {
            client: ClientInfoConfig::default(),
            shutdown_grace_seconds: DEFAULT_SHUTDOWN_GRACE_SECONDS,
            default_timeout_seconds: DEFAULT_REQUEST_TIMEOUT_SECONDS,
            servers: Vec::new(),
        }
    }
}

impl Config {
    /// Load configuration from file with environment overrides
    ///
    /// A missing file yields the defaults (no endpoints) with a warning.
    ///
    /// # Errors
    ///
    /// Returns [`McpHubError::Config`] if the file exists but cannot be read
    /// or parsed.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            Self::from_file(path)?
        } else {
            tracing::warn!("Config file not found at {}, using defaults", path.display());
            Self::default()
        };

        config.apply_env_vars();
        config.finalize_servers();
        Ok(config)
    }

    /// Parse a YAML document without applying overrides.
    ///
    /// # Errors
    ///
    /// Returns [`McpHubError::Config`] on invalid YAML.
    pub fn from_yaml(contents: &str) -> Result<Self> {
        serde_yaml::from_str(contents)
            .map_err(|e| McpHubError::Config(format!("Failed to parse config: {}", e)).into())
    }

    fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            McpHubError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_yaml(&contents)
    }

    fn apply_env_vars(&mut self) {
        if let Ok(grace) = std::env::var("MCPHUB_SHUTDOWN_GRACE_SECONDS") {
            if let Ok(value) = grace.parse() {
                self.shutdown_grace_seconds = value;
            } else {
                tracing::warn!("Invalid MCPHUB_SHUTDOWN_GRACE_SECONDS: {}", grace);
            }
        }

        if let Ok(timeout) = std::env::var("MCPHUB_DEFAULT_TIMEOUT_SECONDS") {
            if let Ok(value) = timeout.parse() {
                self.default_timeout_seconds = value;
            } else {
                tracing::warn!("Invalid MCPHUB_DEFAULT_TIMEOUT_SECONDS: {}", timeout);
            }
        }

        if let Ok(disabled) = std::env::var("MCPHUB_DISABLED_SERVERS") {
            let ids: Vec<&str> = disabled
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .collect();
            for server in &mut self.servers {
                if ids.contains(&server.id.as_str()) {
                    tracing::debug!(endpoint = %server.id, "disabled by MCPHUB_DISABLED_SERVERS");
                    server.enabled = false;
                }
            }
        }
    }

    /// Expand `${VAR}` references and fill in the default timeout.
    fn finalize_servers(&mut self) {
        for server in &mut self.servers {
            server.expand_env();
            if server.timeout_seconds.is_none() {
                server.timeout_seconds = Some(self.default_timeout_seconds);
            }
        }
    }

    /// The configured endpoints with duplicates removed (first wins).
    pub fn endpoints(&self) -> Vec<EndpointDefinition> {
        dedupe_first_wins(self.servers.clone())
    }

    /// The shutdown grace period.
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_seconds)
    }

    /// The client identity for the handshake.
    pub fn client_info(&self) -> Implementation {
        Implementation::from(&self.client)
    }

    /// Validate the configuration
    ///
    /// Duplicate endpoint ids are allowed; the first occurrence wins.
    ///
    /// # Errors
    ///
    /// Returns error if any validation check fails
    pub fn validate(&self) -> Result<()> {
        if self.shutdown_grace_seconds == 0 {
            return Err(McpHubError::Config(
                "shutdown_grace_seconds must be greater than 0".to_string(),
            )
            .into());
        }

        if self.default_timeout_seconds == 0 {
            return Err(McpHubError::Config(
                "default_timeout_seconds must be greater than 0".to_string(),
            )
            .into());
        }

        if self.client.name.trim().is_empty() {
            return Err(McpHubError::Config("client.name cannot be empty".to_string()).into());
        }

        for server in &self.servers {
            server.validate()?;
        }

        Ok(())
    }

    /// Default per-user config location, if the platform has one.
    pub fn user_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("dev", "mcphub", "mcphub")
            .map(|dirs| dirs.config_dir().join("config.yaml"))
    }

    /// Resolve the config path to use when none was given explicitly.
    ///
    /// Prefers [`DEFAULT_CONFIG_PATH`] in the working directory, then the
    /// per-user location.
    pub fn default_path() -> PathBuf {
        let local = PathBuf::from(DEFAULT_CONFIG_PATH);
        if local.exists() {
            return local;
        }
        match Self::user_config_path() {
            Some(user) if user.exists() => user,
            _ => local,
        }
    }
}

// ---------------------------------------------------------------------------
// Providers
// ---------------------------------------------------------------------------

/// Source of endpoint definitions for the manager.
pub trait ConfigProvider: Send + Sync {
    /// The current definitions, in precedence order.
    ///
    /// # Errors
    ///
    /// Returns [`McpHubError::Config`] when the source cannot be read.
    fn load(&self) -> Result<Vec<EndpointDefinition>>;

    /// Updated definition sets, one item per change.
    fn changes(&self) -> BoxStream<'static, Vec<EndpointDefinition>>;
}

/// In-memory provider; [`StaticConfigProvider::update`] publishes a new set.
///
/// # Examples
///
/// ```
/// use futures::StreamExt;
/// use mcphub::config::{ConfigProvider, StaticConfigProvider};
/// use mcphub::mcp::config::EndpointDefinition;
///
/// # tokio_test::block_on(async {
/// let provider = StaticConfigProvider::new(Vec::new());
/// let mut changes = provider.changes();
/// provider.update(vec![EndpointDefinition::socket("live", "ws://localhost:9000/mcp")]);
/// assert_eq!(changes.next().await.unwrap()[0].id, "live");
/// # });
/// ```
#[derive(Debug)]
pub struct StaticConfigProvider {
    tx: watch::Sender<Vec<EndpointDefinition>>,
}

impl StaticConfigProvider {
    /// Create a provider holding `definitions`.
    pub fn new(definitions: Vec<EndpointDefinition>) -> Self {
        let (tx, _rx) = watch::channel(definitions);
        Self { tx }
    }

    /// Replace the definition set and notify every `changes()` stream.
    pub fn update(&self, definitions: Vec<EndpointDefinition>) {
        self.tx.send_replace(definitions);
    }
}

impl ConfigProvider for StaticConfigProvider {
    fn load(&self) -> Result<Vec<EndpointDefinition>> {
        Ok(dedupe_first_wins(self.tx.borrow().clone()))
    }

    fn changes(&self) -> BoxStream<'static, Vec<EndpointDefinition>> {
        WatchStream::from_changes(self.tx.subscribe())
            .map(dedupe_first_wins)
            .boxed()
    }
}

/// Provider reading one or more YAML files in precedence order.
///
/// Endpoint lists are concatenated and de-duplicated, so an id defined in
/// an earlier file shadows the same id in later files.
#[derive(Debug, Clone)]
pub struct FileConfigProvider {
    paths: Vec<PathBuf>,
    poll_interval: Duration,
    debounce: Duration,
}

fn load_files(paths: &[PathBuf]) -> Result<Vec<EndpointDefinition>> {
    let mut all = Vec::new();
    for path in paths {
        if !path.exists() {
            tracing::debug!("Config file {} not present; skipping", path.display());
            continue;
        }
        all.extend(Config::load(path)?.servers);
    }
    Ok(dedupe_first_wins(all))
}

async fn load_files_blocking(paths: Vec<PathBuf>) -> Result<Vec<EndpointDefinition>> {
    tokio::task::spawn_blocking(move || load_files(&paths))
        .await
        .map_err(|e| McpHubError::Config(format!("configuration reload task failed: {e}")))?
}

/// Directory to watch for `path`; editors often replace files by rename,
/// which only the parent directory observes.
fn watch_dir(path: &Path) -> &Path {
    path.parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
}

fn touches(event: &notify::Event, paths: &[PathBuf]) -> bool {
    if matches!(event.kind, EventKind::Access(_)) {
        return false;
    }
    event.paths.iter().any(|changed| {
        paths.iter().any(|p| {
            changed == p || (changed.file_name().is_some() && changed.file_name() == p.file_name())
        })
    })
}

/// Start a watcher that sends `()` for every event touching `paths`.
///
/// Falls back to notify's polling watcher where native notifications are
/// unavailable.
fn spawn_watcher(
    paths: &[PathBuf],
    poll_interval: Duration,
    tx: mpsc::UnboundedSender<()>,
) -> notify::Result<Box<dyn Watcher + Send>> {
    let handler = {
        let paths = paths.to_vec();
        move |res: notify::Result<notify::Event>| match res {
            Ok(event) if touches(&event, &paths) => {
                let _ = tx.send(());
            }
            Ok(_) => {}
            Err(e) => tracing::warn!("configuration watcher error: {e}"),
        }
    };

    let mut watcher: Box<dyn Watcher + Send> = match notify::recommended_watcher(handler.clone()) {
        Ok(w) => Box::new(w),
        Err(e) => {
            tracing::debug!("native file watching unavailable ({e}); polling instead");
            let config = notify::Config::default().with_poll_interval(poll_interval);
            Box::new(notify::PollWatcher::new(handler, config)?)
        }
    };

    let mut dirs: Vec<&Path> = paths.iter().map(|p| watch_dir(p)).collect();
    dirs.dedup();
    for dir in dirs {
        if let Err(e) = watcher.watch(dir, RecursiveMode::NonRecursive) {
            tracing::warn!("Cannot watch {}: {e}", dir.display());
        }
    }
    Ok(watcher)
}

impl FileConfigProvider {
    /// Watch `paths`, highest precedence first.
    pub fn new(paths: Vec<PathBuf>) -> Self {
        Self {
            paths,
            poll_interval: DEFAULT_POLL_INTERVAL,
            debounce: DEFAULT_DEBOUNCE,
        }
    }

    /// Change how often files are checked where the platform has no
    /// native change notifications.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Change how long a burst of file events must stay quiet before the
    /// files are reloaded.
    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    /// The watched files.
    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }
}

struct WatchState {
    // dropping the watcher stops event delivery
    _watcher: Box<dyn Watcher + Send>,
    rx: mpsc::UnboundedReceiver<()>,
    paths: Vec<PathBuf>,
    last: Option<Vec<EndpointDefinition>>,
}

impl ConfigProvider for FileConfigProvider {
    fn load(&self) -> Result<Vec<EndpointDefinition>> {
        load_files(&self.paths)
    }

    /// Yields the reloaded definitions after each settled burst of file
    /// events. Reloads that fail validation are logged and skipped, as are
    /// reloads identical to the last set yielded.
    fn changes(&self) -> BoxStream<'static, Vec<EndpointDefinition>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let watcher = match spawn_watcher(&self.paths, self.poll_interval, tx) {
            Ok(w) => w,
            Err(e) => {
                tracing::warn!("Configuration changes will not be followed: {e}");
                return futures::stream::empty().boxed();
            }
        };
        let debounce = self.debounce;
        let state = WatchState {
            _watcher: watcher,
            rx,
            paths: self.paths.clone(),
            last: None,
        };
        futures::stream::unfold(state, move |mut state| async move {
            loop {
                state.rx.recv().await?;
                loop {
                    tokio::time::sleep(debounce).await;
                    let mut more = false;
                    while state.rx.try_recv().is_ok() {
                        more = true;
                    }
                    if !more {
                        break;
                    }
                }

                match load_files_blocking(state.paths.clone()).await {
                    Ok(definitions) if state.last.as_ref() == Some(&definitions) => {
                        tracing::debug!("configuration files touched without changes");
                    }
                    Ok(definitions) => {
                        tracing::info!(
                            endpoints = definitions.len(),
                            "configuration change detected"
                        );
                        state.last = Some(definitions.clone());
                        return Some((definitions, state));
                    }
                    Err(e) => tracing::warn!("Ignoring invalid configuration change: {e}"),
                }
            }
        })
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::config::{TransportConfig, TransportKind};
    use serial_test::serial;

    const SAMPLE: &str = r#"
client:
  name: test-host
  version: 9.9.9
shutdown_grace_seconds: 3
servers:
  - id: files
    type: stdio
    command: npx
    args: ["-y", "server-filesystem", "${MCPHUB_TEST_ROOT}"]
  - id: search
    type: sse
    url: http://localhost:8080/sse
    enabled: false
  - id: live
    type: websocket
    url: ws://localhost:9000/mcp
    timeout_seconds: 10
    max_reconnect_attempts: 2
  - id: files
    type: process
    command: shadowed
"#;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.shutdown_grace_seconds, 5);
        assert_eq!(config.default_timeout_seconds, 30);
        assert_eq!(config.client.name, "mcphub");
        assert!(config.servers.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_from_yaml_with_aliases() {
        let config = Config::from_yaml(SAMPLE).unwrap();
        assert_eq!(config.client.name, "test-host");
        assert_eq!(config.shutdown_grace_seconds, 3);
        assert_eq!(config.default_timeout_seconds, 30);
        assert_eq!(config.servers.len(), 4);
        assert_eq!(config.servers[0].kind(), TransportKind::Process);
        assert_eq!(config.servers[1].kind(), TransportKind::Stream);
        assert!(!config.servers[1].enabled);
        match &config.servers[2].transport {
            TransportConfig::Socket(p) => assert_eq!(p.max_reconnect_attempts, 2),
            other => panic!("unexpected transport: {other:?}"),
        }
    }

    #[test]
    fn test_endpoints_first_occurrence_wins() {
        let config = Config::from_yaml(SAMPLE).unwrap();
        let endpoints = config.endpoints();
        assert_eq!(endpoints.len(), 3);
        match &endpoints[0].transport {
            TransportConfig::Process(p) => assert_eq!(p.command, "npx"),
            other => panic!("unexpected transport: {other:?}"),
        }
    }

    #[test]
    fn test_config_validation_zero_grace() {
        let mut config = Config::default();
        config.shutdown_grace_seconds = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_bad_endpoint() {
        let mut config = Config::default();
        config
            .servers
            .push(EndpointDefinition::stream("bad__id", "http://x/sse"));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_invalid_yaml_is_config_error() {
        let err = Config::from_yaml("servers: [").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<McpHubError>(),
            Some(McpHubError::Config(_))
        ));
    }

    #[test]
    #[serial]
    fn test_load_missing_file_uses_defaults() {
        let config = Config::load("/nonexistent/mcphub.yaml").unwrap();
        assert_eq!(config, {
            let mut c = Config::default();
            c.finalize_servers();
            c
        });
    }

    #[test]
    #[serial]
    fn test_load_applies_env_overrides_and_expansion() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mcphub.yaml");
        std::fs::write(&path, SAMPLE).unwrap();

        std::env::set_var("MCPHUB_TEST_ROOT", "/srv/data");
        std::env::set_var("MCPHUB_DEFAULT_TIMEOUT_SECONDS", "12");
        std::env::set_var("MCPHUB_DISABLED_SERVERS", "files, live");
        std::env::set_var("MCPHUB_SHUTDOWN_GRACE_SECONDS", "not-a-number");
        let config = Config::load(&path).unwrap();
        for var in [
            "MCPHUB_TEST_ROOT",
            "MCPHUB_DEFAULT_TIMEOUT_SECONDS",
            "MCPHUB_DISABLED_SERVERS",
            "MCPHUB_SHUTDOWN_GRACE_SECONDS",
        ] {
            std::env::remove_var(var);
        }

        assert_eq!(config.default_timeout_seconds, 12);
        assert_eq!(config.shutdown_grace_seconds, 3);
        let files = &config.servers[0];
        assert!(!files.enabled);
        assert_eq!(files.timeout_seconds, Some(12));
        match &files.transport {
            TransportConfig::Process(p) => assert_eq!(p.args[2], "/srv/data"),
            other => panic!("unexpected transport: {other:?}"),
        }
        assert_eq!(config.servers[2].timeout_seconds, Some(10));
        assert!(!config.servers[2].enabled);
    }

    #[test]
    fn test_static_provider_load_dedupes() {
        let provider = StaticConfigProvider::new(vec![
            EndpointDefinition::process("a", "first", Vec::<String>::new()),
            EndpointDefinition::process("a", "second", Vec::<String>::new()),
        ]);
        let defs = provider.load().unwrap();
        assert_eq!(defs.len(), 1);
    }

    #[tokio::test]
    async fn test_static_provider_changes_yield_updates() {
        let provider = StaticConfigProvider::new(Vec::new());
        let mut changes = provider.changes();
        provider.update(vec![EndpointDefinition::socket("w", "ws://localhost/ws")]);
        let next = tokio::time::timeout(Duration::from_secs(1), changes.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(next[0].id, "w");
    }

    #[test]
    #[serial]
    fn test_file_provider_precedence_across_files() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("project.yaml");
        let second = dir.path().join("user.yaml");
        std::fs::write(
            &first,
            "servers:\n  - id: a\n    type: process\n    command: project-a\n",
        )
        .unwrap();
        std::fs::write(
            &second,
            "servers:\n  - id: a\n    type: process\n    command: user-a\n  - id: b\n    type: process\n    command: user-b\n",
        )
        .unwrap();

        let provider = FileConfigProvider::new(vec![first, second, dir.path().join("absent.yaml")]);
        let defs = provider.load().unwrap();
        assert_eq!(defs.len(), 2);
        match &defs[0].transport {
            TransportConfig::Process(p) => assert_eq!(p.command, "project-a"),
            other => panic!("unexpected transport: {other:?}"),
        }
    }

    #[tokio::test]
    #[serial]
    async fn test_file_provider_detects_modification() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mcphub.yaml");
        std::fs::write(&path, "servers: []\n").unwrap();

        let provider =
            FileConfigProvider::new(vec![path.clone()]).with_debounce(Duration::from_millis(50));
        let mut changes = provider.changes();

        std::fs::write(
            &path,
            "servers:\n  - id: fresh\n    type: process\n    command: cat\n",
        )
        .unwrap();

        let next = tokio::time::timeout(Duration::from_secs(3), changes.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].id, "fresh");
    }

    #[tokio::test]
    #[serial]
    async fn test_file_provider_coalesces_bursts_and_skips_unchanged_rewrites() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mcphub.yaml");
        let other = dir.path().join("unrelated.txt");
        std::fs::write(&path, "servers: []\n").unwrap();

        let provider =
            FileConfigProvider::new(vec![path.clone()]).with_debounce(Duration::from_millis(150));
        let mut changes = provider.changes();

        let yaml = "servers:\n  - id: burst\n    type: process\n    command: cat\n";
        for _ in 0..3 {
            std::fs::write(&path, yaml).unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let next = tokio::time::timeout(Duration::from_secs(3), changes.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(next[0].id, "burst");

        std::fs::write(&other, "noise").unwrap();
        std::fs::write(&path, yaml).unwrap();
        assert!(
            tokio::time::timeout(Duration::from_millis(600), changes.next())
                .await
                .is_err(),
            "identical content must not be yielded again"
        );

        std::fs::write(&path, "servers: []\n").unwrap();
        let next = tokio::time::timeout(Duration::from_secs(3), changes.next())
            .await
            .unwrap()
            .unwrap();
        assert!(next.is_empty());
    }

    #[test]
    fn test_watch_dir_of_bare_file_name_is_current_dir() {
        assert_eq!(watch_dir(Path::new("mcphub.yaml")), Path::new("."));
        assert_eq!(
            watch_dir(Path::new("config/mcphub.yaml")),
            Path::new("config")
        );
    }
}
