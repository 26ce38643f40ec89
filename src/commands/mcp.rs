//! Endpoint subcommand handlers
//!
//! Each handler builds an [`McpManager`] from the loaded configuration,
//! performs one operation, and shuts the manager down before returning.
//! Tables are rendered with `prettytable`; `--json` prints the same data as
//! pretty JSON.

use std::sync::Arc;

use colored::Colorize;
use prettytable::{row, Table};
use serde::Serialize;

use crate::config::Config;
use crate::error::{McpHubError, Result};
use crate::mcp::client::ConnectionStatus;
use crate::mcp::manager::{EndpointStatus, McpManager, StatusSummary, TestConnectionReport};
use crate::mcp::transport::DefaultTransportFactory;
use crate::mcp::types::ResourceContents;

/// Build a manager and reconcile it against the configured endpoints.
///
/// Connection failures are reported through the manager's status rather
/// than as an error.
pub async fn connect_all(config: &Config) -> McpManager {
    let manager = McpManager::new(Arc::new(DefaultTransportFactory), config.client_info());
    let report = manager.reconcile(config.endpoints()).await;
    for (id, error) in &report.failed {
        tracing::warn!(endpoint = %id, "failed to connect: {error}");
    }
    manager
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).map_err(McpHubError::Serialization)?;
    println!("{}", json);
    Ok(())
}

fn colored_status(status: ConnectionStatus) -> String {
    let label = status.to_string();
    match status {
        ConnectionStatus::Connected => label.green().to_string(),
        ConnectionStatus::Connecting => label.yellow().to_string(),
        ConnectionStatus::Error => label.red().to_string(),
        ConnectionStatus::Disconnected => label.dimmed().to_string(),
    }
}

#[derive(Serialize)]
struct ServerRow<'a> {
    id: &'a str,
    kind: String,
    enabled: bool,
    target: String,
    timeout_seconds: u64,
}

/// List configured endpoints without connecting.
pub fn list_servers(config: &Config, json: bool) -> Result<()> {
    let endpoints = config.endpoints();
    let rows: Vec<ServerRow<'_>> = endpoints
        .iter()
        .map(|d| ServerRow {
            id: &d.id,
            kind: d.kind().to_string(),
            enabled: d.enabled,
            target: d.transport.target(),
            timeout_seconds: d.request_timeout().as_secs(),
        })
        .collect();

    if json {
        return print_json(&rows);
    }
    if rows.is_empty() {
        println!("No endpoints configured.");
        return Ok(());
    }

    let mut table = Table::new();
    table.add_row(row!["ID", "Kind", "Enabled", "Target", "Timeout"]);
    for r in &rows {
        let enabled = if r.enabled {
            "yes".green().to_string()
        } else {
            "no".dimmed().to_string()
        };
        table.add_row(row![r.id, r.kind, enabled, r.target, format!("{}s", r.timeout_seconds)]);
    }
    println!();
    table.printstd();
    println!();
    Ok(())
}

#[derive(Serialize)]
struct StatusOutput {
    endpoints: Vec<EndpointStatus>,
    summary: StatusSummary,
}

fn print_status_table(statuses: &[EndpointStatus], summary: &StatusSummary) {
    let mut table = Table::new();
    table.add_row(row!["ID", "Kind", "Status", "Tools", "Resources", "Prompts", "Error"]);
    for s in statuses {
        let status = if s.enabled {
            colored_status(s.state.status)
        } else {
            "disabled".dimmed().to_string()
        };
        table.add_row(row![
            s.id,
            s.kind,
            status,
            s.tools,
            s.resources,
            s.prompts,
            s.state.last_error.as_deref().unwrap_or("")
        ]);
    }
    println!();
    table.printstd();
    println!(
        "\n{} configured, {} enabled, {} connected, {} errored | {} tools, {} resources, {} prompts\n",
        summary.configured,
        summary.enabled,
        summary.connected,
        summary.errored,
        summary.tools,
        summary.resources,
        summary.prompts
    );
}

/// Connect every enabled endpoint and print the resulting status.
pub async fn show_status(config: &Config, json: bool) -> Result<()> {
    let manager = connect_all(config).await;
    let output = StatusOutput {
        endpoints: manager.get_all_statuses(),
        summary: manager.summary(),
    };
    manager.shutdown(config.shutdown_grace()).await;

    if json {
        print_json(&output)
    } else {
        print_status_table(&output.endpoints, &output.summary);
        Ok(())
    }
}

fn print_test_report(report: &TestConnectionReport) {
    if report.success {
        let server = report
            .server
            .as_ref()
            .map(|s| format!("{} {}", s.name, s.version))
            .unwrap_or_else(|| "unknown server".to_string());
        println!(
            "{} {} ({}) in {} ms",
            "OK".green().bold(),
            report.endpoint,
            server,
            report.elapsed.as_millis()
        );
        println!("  tools:     {}", report.tools.join(", "));
        println!("  resources: {}", report.resources.join(", "));
        println!("  prompts:   {}", report.prompts.join(", "));
        if let Some(ping) = report.ping_ms {
            println!("  ping:      {ping} ms");
        }
    } else {
        println!(
            "{} {}: {}",
            "FAILED".red().bold(),
            report.endpoint,
            report.error.as_deref().unwrap_or("unknown error")
        );
    }
}

/// Test one endpoint with a throwaway connection.
///
/// # Errors
///
/// Returns [`McpHubError::NotFound`] for an unknown id and
/// [`McpHubError::Connection`] when the test fails.
pub async fn test_server(config: &Config, id: &str, json: bool) -> Result<()> {
    let manager = McpManager::new(Arc::new(DefaultTransportFactory), config.client_info());
    let definition = config
        .endpoints()
        .into_iter()
        .find(|d| d.id == id)
        .ok_or_else(|| McpHubError::NotFound(format!("endpoint '{id}'")))?;
    let report = manager.test_definition(&definition).await;
    manager.shutdown(config.shutdown_grace()).await;

    if json {
        print_json(&report)?;
    } else {
        print_test_report(&report);
    }
    if report.success {
        Ok(())
    } else {
        Err(McpHubError::connection(
            id,
            report.error.unwrap_or_else(|| "test failed".to_string()),
        )
        .into())
    }
}

/// Print the aggregated tools.
pub async fn list_tools(config: &Config, json: bool) -> Result<()> {
    let manager = connect_all(config).await;
    let tools = manager.list_tools();
    manager.shutdown(config.shutdown_grace()).await;

    if json {
        return print_json(&tools);
    }
    let mut table = Table::new();
    table.add_row(row!["Name", "Endpoint", "Description"]);
    for t in &tools {
        table.add_row(row![t.name, t.endpoint_id, t.description().unwrap_or("")]);
    }
    println!("\n{} tools:\n", tools.len());
    table.printstd();
    println!();
    Ok(())
}

/// Print the aggregated resources.
pub async fn list_resources(config: &Config, json: bool) -> Result<()> {
    let manager = connect_all(config).await;
    let resources = manager.list_resources();
    manager.shutdown(config.shutdown_grace()).await;

    if json {
        return print_json(&resources);
    }
    let mut table = Table::new();
    table.add_row(row!["Name", "Endpoint", "URI", "MIME type"]);
    for r in &resources {
        table.add_row(row![
            r.name,
            r.endpoint_id,
            r.uri(),
            r.resource.mime_type.as_deref().unwrap_or("")
        ]);
    }
    println!("\n{} resources:\n", resources.len());
    table.printstd();
    println!();
    Ok(())
}

/// Print the aggregated prompts.
pub async fn list_prompts(config: &Config, json: bool) -> Result<()> {
    let manager = connect_all(config).await;
    let prompts = manager.list_prompts();
    manager.shutdown(config.shutdown_grace()).await;

    if json {
        return print_json(&prompts);
    }
    let mut table = Table::new();
    table.add_row(row!["Name", "Endpoint", "Arguments", "Description"]);
    for p in &prompts {
        let arguments = p
            .prompt
            .arguments
            .as_ref()
            .map(|args| {
                args.iter()
                    .map(|a| a.name.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            })
            .unwrap_or_default();
        table.add_row(row![
            p.name,
            p.endpoint_id,
            arguments,
            p.prompt.description.as_deref().unwrap_or("")
        ]);
    }
    println!("\n{} prompts:\n", prompts.len());
    table.printstd();
    println!();
    Ok(())
}

/// Parse `--args` into a JSON object.
///
/// # Errors
///
/// Returns [`McpHubError::Config`] when the text is not a JSON object.
pub fn parse_arguments(args: Option<&str>) -> Result<Option<serde_json::Value>> {
    let Some(raw) = args else {
        return Ok(None);
    };
    let value: serde_json::Value = serde_json::from_str(raw)
        .map_err(|e| McpHubError::Config(format!("--args is not valid JSON: {e}")))?;
    if !value.is_object() {
        return Err(McpHubError::Config("--args must be a JSON object".to_string()).into());
    }
    Ok(Some(value))
}

/// Call a tool and print its text output.
///
/// # Errors
///
/// Returns the structured call failure when routing or the call fails.
pub async fn call_tool(config: &Config, tool: &str, args: Option<&str>) -> Result<()> {
    let arguments = parse_arguments(args)?;
    let manager = connect_all(config).await;
    let outcome = manager.call_tool(tool, arguments).await;
    manager.shutdown(config.shutdown_grace()).await;

    let response = outcome?;
    if response.is_error.unwrap_or(false) {
        eprintln!("{}", "tool reported an error".red());
    }
    println!("{}", response.text());
    if let Some(structured) = &response.structured_content {
        print_json(structured)?;
    }
    Ok(())
}

/// Read a resource and print its contents.
pub async fn read_resource(config: &Config, uri: &str, server: Option<&str>) -> Result<()> {
    let manager = connect_all(config).await;
    let outcome = manager.read_resource(uri, server).await;
    manager.shutdown(config.shutdown_grace()).await;

    for contents in outcome? {
        match contents {
            ResourceContents::Text(text) => println!("{}", text.text),
            ResourceContents::Blob(blob) => println!(
                "<{} bytes of {} (base64)>",
                blob.blob.len(),
                blob.mime_type.as_deref().unwrap_or("binary data")
            ),
        }
    }
    Ok(())
}
