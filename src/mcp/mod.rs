//! MCP (Model Context Protocol) multi-endpoint client
//!
//! Connects to any number of MCP servers over three channel kinds, caches
//! each server's catalog, and exposes one aggregated, namespaced view.
//!
//! The client advertises protocol revision **2025-11-25** and accepts the
//! older revisions listed in [`types::SUPPORTED_PROTOCOL_VERSIONS`].
//!
//! # Module Layout
//!
//! - `types`       -- Protocol types and JSON-RPC primitives
//! - `config`      -- Endpoint definitions and per-kind transport parameters
//! - `correlation` -- Pending-request table shared by every transport
//! - `transport`   -- `Transport` trait, factory, and the process, stream, and
//!   socket implementations
//! - `protocol`    -- Handshake and typed MCP methods over any transport
//! - `client`      -- One endpoint: connect, catalog cache, calls, events
//! - `registry`    -- Aggregate namespaced catalog
//! - `manager`     -- Reconciliation, routing, status, and shutdown
//! - `metrics`     -- Call and connect counters

pub mod client;
pub mod config;
pub mod correlation;
pub mod manager;
pub mod metrics;
pub mod protocol;
pub mod registry;
pub mod transport;
pub mod types;

pub use client::{ConnectionState, ConnectionStatus, McpClient};
pub use config::{EndpointDefinition, TransportConfig, TransportKind};
pub use manager::{CallFailure, FailureKind, McpManager};
