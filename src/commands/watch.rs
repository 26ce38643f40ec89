//! Long-running reconciliation mode
//!
//! Connects every enabled endpoint, then keeps reconciling whenever the
//! configuration file changes until interrupted with Ctrl-C.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{Config, ConfigProvider, FileConfigProvider};
use crate::error::Result;
use crate::mcp::manager::{ManagerEvent, McpManager};
use crate::mcp::transport::DefaultTransportFactory;

/// Run until Ctrl-C, reconciling on changes to `config_path`.
///
/// # Errors
///
/// Returns an error when the initial definitions cannot be loaded.
pub async fn run_watch(config: &Config, config_path: PathBuf, poll_seconds: u64) -> Result<()> {
    let provider: Arc<dyn ConfigProvider> = Arc::new(
        FileConfigProvider::new(vec![config_path])
            .with_poll_interval(Duration::from_secs(poll_seconds.max(1))),
    );
    let manager = McpManager::new(Arc::new(DefaultTransportFactory), config.client_info());

    let mut events = manager.subscribe();
    let printer = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                ManagerEvent::StatusChanged { endpoint, state } => match &state.last_error {
                    Some(error) => println!("{endpoint}: {} ({error})", state.status),
                    None => println!("{endpoint}: {}", state.status),
                },
                ManagerEvent::RegistryRebuilt {
                    tools,
                    resources,
                    prompts,
                } => println!("catalog: {tools} tools, {resources} resources, {prompts} prompts"),
            }
        }
    });

    let report = manager.start(provider.as_ref()).await?;
    tracing::info!(
        connected = report.connected.len(),
        failed = report.failed.len(),
        "watching configuration for changes"
    );
    manager.watch_config(provider);

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("Failed to listen for Ctrl-C: {e}");
    }
    tracing::info!("Interrupted; shutting down");
    manager.shutdown(config.shutdown_grace()).await;
    printer.abort();
    Ok(())
}
