//! Error types for the reposcope core library.
//!
//! Each subsystem has its own error type derived with `thiserror`, and a
//! top-level [`CoreError`] enum unifies them all for callers that want a
//! single error type.

use thiserror::Error;

use crate::models::OperationId;

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

/// Unified error type for the entire core library.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

// ---------------------------------------------------------------------------
// Request channel errors
// ---------------------------------------------------------------------------

/// Errors from the request channel.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChannelError {
    /// The external process went away or the channel was shut down. Every
    /// outstanding wait fails with this error.
    #[error("request channel closed")]
    ChannelClosed,
}

// ---------------------------------------------------------------------------
// Orchestrator errors
// ---------------------------------------------------------------------------

/// Errors surfaced by the conflict orchestrator.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum OrchestratorError {
    /// The external process reported failure for continue, abort or resolve.
    /// The conflict set is left as-is so the user can retry.
    #[error("operation {operation_id} failed: {detail}")]
    OperationFailed {
        operation_id: OperationId,
        detail: String,
    },

    /// Continue was requested while at least one file is still unresolved.
    #[error("cannot continue: {remaining} file(s) still unresolved")]
    Unresolved { remaining: usize },

    /// The action needs an interrupted operation but none is active.
    #[error("no operation is in conflict")]
    NotInConflict,

    /// The path is not part of the active conflict set.
    #[error("'{0}' is not in the active conflict set")]
    UnknownPath(String),

    #[error(transparent)]
    Channel(#[from] ChannelError),
}

// ---------------------------------------------------------------------------
// Fetch errors
// ---------------------------------------------------------------------------

/// Failure of a cached server query.
///
/// Cloneable so a single settled failure can be handed to every caller that
/// shares the same single-flight entry.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error(transparent)]
    Channel(#[from] ChannelError),

    /// The server answered with an error payload.
    #[error("server error: {0}")]
    Server(String),

    /// The producer task panicked or was cancelled by the runtime.
    #[error("fetch task did not complete: {0}")]
    Aborted(String),

    /// The request was rejected before being sent.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

/// Errors from configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file not found.
    #[error("configuration file not found: {0}")]
    FileNotFound(String),

    /// TOML parse error.
    #[error("configuration parse error: {0}")]
    ParseError(String),

    /// A config value is invalid.
    #[error("invalid configuration value for '{field}': {detail}")]
    InvalidValue { field: String, detail: String },

    /// Generic I/O error reading the config file.
    #[error("configuration I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Transport errors
// ---------------------------------------------------------------------------

/// Errors from spawning or talking to the backend process.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The backend binary could not be started.
    #[error("failed to spawn backend '{command}': {source}")]
    SpawnFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// The child was started without a piped stdio handle.
    #[error("backend process has no {0} handle")]
    MissingPipe(&'static str),

    /// Generic I/O wrapper.
    #[error("transport I/O error: {0}")]
    IoError(#[from] std::io::Error),
}
