//! Error taxonomy for the hub, mirroring the boundary distinctions the
//! design calls out: transport, backend, hub, validation and resource
//! errors each carry different propagation policies.

use std::io;

use serde_json::Error as JsonError;
use thiserror::Error;
use toml_edit::de::Error as TomlDeError;

/// Errors surfaced by hub-internal APIs.
///
/// `Backend` errors are propagated verbatim to upstream callers; `Hub`
/// errors are logged in full but collapse to a generic message before
/// crossing the upstream boundary (see [`HubError::upstream_message`]).
#[derive(Debug, Error)]
pub enum HubError {
    #[error("transport closed")]
    TransportClosed,

    #[error("request timed out after {0}ms")]
    Timeout(u64),

    #[error("request cancelled")]
    Cancelled,

    #[error("backend '{backend}' returned an error: {message}")]
    Backend { backend: String, code: i32, message: String, data: Option<serde_json::Value> },

    #[error("backend '{0}' not found")]
    UnknownBackend(String),

    #[error("capability '{0}' not found")]
    UnknownCapability(String),

    #[error("internal invariant violated: {0}")]
    Internal(String),

    #[error("invalid parameters: {0}")]
    InvalidParams(String),

    #[error("resource limit exceeded: {0}")]
    ResourceExceeded(String),

    #[error("backend name '{0}' is empty")]
    BackendNameEmpty(String),

    #[error("backend '{id}' is missing a command for the stdio transport")]
    BackendCommandEmpty { id: String },

    #[error("backend '{id}' is missing a url for its transport")]
    BackendUrlMissing { id: String },

    #[error("invalid url '{url}' for backend '{id}'")]
    BackendUrlInvalid { id: String, url: String, #[source] source: url::ParseError },

    #[error("failed to create directory {path}")]
    CreateDirectory { path: std::path::PathBuf, #[source] source: io::Error },

    #[error("failed to read config file {path}")]
    ReadConfig { path: std::path::PathBuf, #[source] source: io::Error },

    #[error("failed to parse JSON config at {path}")]
    ParseJson { path: std::path::PathBuf, #[source] source: JsonError },

    #[error("failed to parse TOML config at {path}")]
    ParseToml { path: std::path::PathBuf, #[source] source: TomlDeError },

    #[error("unable to determine user home directory for MCP_HUB_ROOT")]
    HomeDirectoryUnknown,

    #[error("unresolved credential reference '{0}'")]
    UnresolvedCredential(String),
}

impl HubError {
    /// Message safe to hand to an upstream MCP client. `Hub` and other
    /// internal-invariant errors never leak their detail across the
    /// boundary; everything else is already client-safe.
    pub fn upstream_message(&self) -> String {
        match self {
            HubError::Internal(_) => "internal error".to_string(),
            other => other.to_string(),
        }
    }
}
