//! Command-line interface definition for mcphub
//!
//! This module defines the CLI structure using clap's derive API. Every
//! command operates on the endpoints declared in the configuration file.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// mcphub - MCP multi-endpoint client
///
/// Connect to the configured MCP endpoints, inspect their aggregated
/// catalog, and route calls to them.
#[derive(Parser, Debug, Clone)]
#[command(name = "mcphub")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    ///
    /// Defaults to `config/mcphub.yaml`, falling back to the per-user
    /// config directory.
    #[arg(short, long, env = "MCPHUB_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    pub json_logs: bool,

    /// Command to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands for mcphub
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// List configured endpoints without connecting
    Servers {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Connect every enabled endpoint and report its status
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Connect to one endpoint, list its catalog, and disconnect
    Test {
        /// Endpoint id
        id: String,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// List the aggregated tools of all connected endpoints
    Tools {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// List the aggregated resources of all connected endpoints
    Resources {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// List the aggregated prompts of all connected endpoints
    Prompts {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Call a tool by namespaced name (`<endpoint>__<tool>`)
    Call {
        /// Namespaced tool name
        tool: String,

        /// Arguments as a JSON object
        #[arg(short, long)]
        args: Option<String>,
    },

    /// Read a resource by URI or namespaced name
    Read {
        /// Resource URI or namespaced name
        uri: String,

        /// Endpoint to read from instead of resolving the owner
        #[arg(short, long)]
        server: Option<String>,
    },

    /// Keep endpoints connected, reconciling on config changes until Ctrl-C
    Watch {
        /// Seconds between config file checks where the platform has no
        /// native file change notifications
        #[arg(long, default_value_t = 2)]
        poll_seconds: u64,
    },
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
