// ABOUTME: Error types for the upswarm-core crate.
// ABOUTME: Socket and codec failures, config file problems, spawn failures, bad topologies.

use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced by the supervisor engine and the worker runtime.
#[derive(Error, Debug)]
pub enum UpswarmError {
    /// Socket or filesystem I/O failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A message could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// Configuration file could not be read.
    #[error("failed to read config from {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Configuration file could not be parsed.
    #[error("failed to parse config from {path}: {message}")]
    ConfigParse { path: PathBuf, message: String },

    /// Configuration could not be serialized or written.
    #[error("failed to write config to {path}: {message}")]
    ConfigWrite { path: PathBuf, message: String },

    /// A child process for a service could not be created.
    #[error("failed to spawn '{service}': {source}")]
    Spawn {
        service: String,
        source: std::io::Error,
    },

    /// A topology document is not a map of service name to instance count.
    #[error("invalid topology: {0}")]
    Topology(String),

    /// The supervisor event loop is gone.
    #[error("supervisor unavailable")]
    SupervisorUnavailable,
}

/// Result alias for upswarm-core operations.
pub type Result<T> = std::result::Result<T, UpswarmError>;
