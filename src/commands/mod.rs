//! Command handlers for the CLI
//!
//! - `mcp`: one-shot endpoint commands (servers, status, test, listing, call, read)
//! - `watch`: long-running reconciliation against the config file

pub mod mcp;
pub mod watch;
