//! Streamable HTTP client transport: a single `POST /mcp` per message, with
//! long-poll responses for notifications. Construction lives in
//! `rmcp::transport::streamable_http_client`; this module only validates
//! the endpoint before a [`Connection`](crate::connection::Connection) hands
//! it to rmcp.

use crate::config::BackendConfig;
use crate::error::HubError;

pub fn endpoint(config: &BackendConfig) -> Result<&str, HubError> {
    config
        .url
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| HubError::BackendUrlMissing { id: config.name.clone() })
}
