//! Error types for mcphub
//!
//! This module defines all error types used throughout the crate, using
//! `thiserror` for ergonomic error handling. Internal functions return
//! [`Result`], an `anyhow` alias; callers that need to classify a failure
//! downcast to [`McpHubError`].

use std::time::Duration;

use thiserror::Error;

/// Main error type for mcphub operations
///
/// The first six variants form the endpoint error taxonomy: configuration,
/// connection, protocol, request timeout, remote, and closed. The remaining
/// variants wrap lower-level library errors.
#[derive(Error, Debug)]
pub enum McpHubError {
    /// Malformed or missing endpoint definition or application config
    #[error("Configuration error: {0}")]
    Config(String),

    /// Dial, spawn, or handshake failure (including handshake timeout)
    #[error("Connection error [{endpoint}]: {message}")]
    Connection {
        /// Endpoint id the failure belongs to
        endpoint: String,
        /// What went wrong
        message: String,
    },

    /// Malformed frame or a reply with an unexpected shape
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// No reply arrived within the request timeout
    #[error("Request timeout [{endpoint}]: '{method}' got no reply within {timeout:?}")]
    RequestTimeout {
        /// Endpoint id the request was sent to
        endpoint: String,
        /// Method of the request
        method: String,
        /// Timeout that elapsed
        timeout: Duration,
    },

    /// The endpoint answered with a structured JSON-RPC error
    #[error("Remote error [{endpoint}] {code}: {message}")]
    Remote {
        /// Endpoint id that returned the error
        endpoint: String,
        /// JSON-RPC error code
        code: i64,
        /// JSON-RPC error message
        message: String,
        /// Optional error data
        data: Option<serde_json::Value>,
    },

    /// Operation attempted on, or interrupted by, a closed connection
    #[error("Connection closed [{endpoint}]: {reason}")]
    Closed {
        /// Endpoint id whose connection is closed
        endpoint: String,
        /// Why the connection is closed
        reason: String,
    },

    /// A process transport's child exited with a non-zero status
    #[error("Process for [{endpoint}] exited with code {code:?}")]
    ProcessExit {
        /// Endpoint id the process belonged to
        endpoint: String,
        /// Exit code, if the process was not killed by a signal
        code: Option<i32>,
    },

    /// A namespaced tool, resource, prompt, or endpoint id was not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// HTTP request errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// WebSocket errors
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

impl McpHubError {
    /// Shorthand for a [`McpHubError::Connection`].
    pub fn connection(endpoint: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Connection {
            endpoint: endpoint.into(),
            message: message.into(),
        }
    }

    /// Shorthand for a [`McpHubError::Closed`].
    pub fn closed(endpoint: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Closed {
            endpoint: endpoint.into(),
            reason: reason.into(),
        }
    }
}

/// Result type alias for mcphub operations
///
/// This is a convenience alias that uses `anyhow::Error` as the error type,
/// allowing for rich error context and easy error propagation.
pub type Result<T> = anyhow::Result<T>;
