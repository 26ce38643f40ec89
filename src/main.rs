//! mcphub - MCP multi-endpoint client
//!
#![doc = "Main entry point for the mcphub command-line client."]

use anyhow::Result;

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use mcphub::cli::{Cli, Commands};
use mcphub::commands;
use mcphub::config::Config;
use mcphub::mcp::metrics::init_metrics_exporter;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let cli = Cli::parse_args();

    init_tracing(cli.verbose, cli.json_logs);
    init_metrics_exporter();

    // Load configuration
    let config_path = cli.config.clone().unwrap_or_else(Config::default_path);
    tracing::debug!("Loading configuration from {}", config_path.display());
    let config = Config::load(&config_path)?;

    // Validate configuration
    config.validate()?;

    // Execute command
    match cli.command {
        Commands::Servers { json } => commands::mcp::list_servers(&config, json),
        Commands::Status { json } => commands::mcp::show_status(&config, json).await,
        Commands::Test { id, json } => commands::mcp::test_server(&config, &id, json).await,
        Commands::Tools { json } => commands::mcp::list_tools(&config, json).await,
        Commands::Resources { json } => commands::mcp::list_resources(&config, json).await,
        Commands::Prompts { json } => commands::mcp::list_prompts(&config, json).await,
        Commands::Call { tool, args } => {
            tracing::info!("Calling tool {}", tool);
            commands::mcp::call_tool(&config, &tool, args.as_deref()).await
        }
        Commands::Read { uri, server } => {
            commands::mcp::read_resource(&config, &uri, server.as_deref()).await
        }
        Commands::Watch { poll_seconds } => {
            tracing::info!("Starting watch mode");
            commands::watch::run_watch(&config, config_path, poll_seconds).await
        }
    }
}

/// Initialize tracing subscriber with environment filter
///
/// Logs go to stderr so command output on stdout stays machine-readable.
fn init_tracing(verbose: bool, json: bool) {
    let default_level = if verbose { "mcphub=debug" } else { "mcphub=info" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry
            .with(fmt::layer().json().with_current_span(true).with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
}
