//! mcphub - MCP multi-endpoint client library
//!
//! This library connects to any number of Model Context Protocol servers,
//! keeps their tool, resource, and prompt catalogs cached, and exposes one
//! aggregated, namespaced view with call routing.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//!
//! - `mcp`: Transports, per-endpoint clients, the aggregate registry, and the manager
//! - `config`: Configuration loading, validation, and config providers
//! - `error`: Error types and result aliases
//! - `cli` and `commands`: The `mcphub` command-line interface
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use mcphub::mcp::transport::DefaultTransportFactory;
//! use mcphub::{Config, McpManager};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config/mcphub.yaml")?;
//!     config.validate()?;
//!
//!     let manager = McpManager::new(Arc::new(DefaultTransportFactory), config.client_info());
//!     manager.reconcile(config.endpoints()).await;
//!     let result = manager
//!         .call_tool("files__read_file", Some(serde_json::json!({ "path": "README.md" })))
//!         .await?;
//!     println!("{}", result.text());
//!     manager.shutdown(config.shutdown_grace()).await;
//!     Ok(())
//! }
//! ```

pub mod cli;
pub mod commands;
pub mod config;
pub mod error;
pub mod mcp;

// Re-export commonly used types
pub use config::{Config, ConfigProvider, FileConfigProvider, StaticConfigProvider};
pub use error::{McpHubError, Result};
pub use mcp::manager::{CallFailure, McpManager};
