//! HTTP+SSE client transport: a `GET` opens the server→client event stream,
//! a separate `POST` carries client→server messages. Session id assignment
//! and the read/write contract live in `rmcp::transport::sse_client`; this
//! module only validates the endpoint before a [`Connection`](crate::connection::Connection)
//! hands it to rmcp.

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
