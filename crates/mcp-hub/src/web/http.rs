//! Upstream transport: the axum router a client actually connects to. The
//! virtual MCP server is mounted at `/mcp` via `rmcp`'s own
//! `StreamableHttpService`, which owns per-session framing, SSE keep-alive
//! and backpressure — the hub only has to hand it a cheap-to-clone
//! `VirtualEndpoint` per session.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::{
    Json, Router,
    body::Body,
    extract::State,
    http::{HeaderMap, HeaderName, Method, Request, StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
};
use rmcp::transport::streamable_http_server::{
    StreamableHttpServerConfig, StreamableHttpService, session::local::LocalSessionManager,
};
use serde::Serialize;
use tokio::{net::TcpListener, task::JoinHandle};
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

use crate::virtual_endpoint::VirtualEndpoint;

const SSE_KEEP_ALIVE_SECS: u64 = 30;

#[derive(Clone)]
pub struct HttpState {
    pub endpoint: Arc<VirtualEndpoint>,
    pub auth: HttpAuth,
}

#[derive(Debug)]
pub struct HttpServerHandle {
    addr: SocketAddr,
    task: JoinHandle<()>,
}

impl HttpServerHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn shutdown(self) {
        self.task.abort();
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

/// The only failure mode this router produces itself — everything else
/// (unknown tool, bad chain definition, backend errors) is handled inside
/// the JSON-RPC envelope by `VirtualEndpoint` and never reaches axum as an
/// HTTP error.
#[derive(Debug)]
struct ApiError(String);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = (StatusCode::UNAUTHORIZED, self.0);
        let body = Json(ErrorResponse { error: message });
        (status, body).into_response()
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub enum ClientKind {
    #[default]
    Unknown,
    Web,
    Tauri,
}

impl ClientKind {
    fn from_headers(headers: &HeaderMap) -> Self {
        let value = headers.get("x-mcp-client").and_then(|val| val.to_str().ok());
        match value.map(|v| v.trim().to_ascii_lowercase()) {
            Some(ref value) if value == "web" => ClientKind::Web,
            Some(ref value) if value == "tauri" => ClientKind::Tauri,
            _ => ClientKind::Unknown,
        }
    }
}

async fn attach_client_kind(mut req: Request<Body>, next: Next) -> Response {
    let kind = ClientKind::from_headers(req.headers());
    req.extensions_mut().insert(kind);
    next.run(req).await
}

/// Shared-secret auth for the upstream endpoint: either an `Authorization:
/// Bearer <token>` header or the `x-mcp-token` header must match. No token
/// configured means no auth — a local-trust default for single-user setups.
#[derive(Clone, Default)]
pub struct HttpAuth {
    token: Option<String>,
}

impl HttpAuth {
    pub fn new(token: Option<String>) -> Self {
        Self { token: token.map(|t| t.trim().to_string()).filter(|t| !t.is_empty()) }
    }

    fn verify(&self, kind: ClientKind, req: &Request<Body>) -> Result<(), ApiError> {
        let Some(expected) = self.token.as_deref() else {
            return Ok(());
        };

        let matches_authorization = req
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.trim())
            .filter(|value| value.starts_with("Bearer "))
            .map(|value| value.trim_start_matches("Bearer ").trim())
            .map(|value| value == expected)
            .unwrap_or(false);

        let matches_custom = req
            .headers()
            .get("x-mcp-token")
            .and_then(|value| value.to_str().ok())
            .map(|value| value.trim())
            .map(|value| value == expected)
            .unwrap_or(false);

        if matches_authorization || matches_custom {
            return Ok(());
        }

        let client = match kind {
            ClientKind::Web => "Web",
            ClientKind::Tauri => "Tauri",
            ClientKind::Unknown => "Unknown",
        };

        Err(ApiError(format!("{client} client missing valid authentication token")))
    }
}

pub fn build_router(state: HttpState) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            header::ACCEPT,
            header::CONTENT_TYPE,
            HeaderName::from_static("x-mcp-client"),
            HeaderName::from_static("mcp-session-id"),
            header::AUTHORIZATION,
            HeaderName::from_static("x-mcp-token"),
        ])
        .allow_origin(Any);

    let auth_state = state.auth.clone();
    let mcp_service = streamable_http_service(state.endpoint.clone());

    Router::new()
        .route("/health", get(get_health))
        .nest_service("/mcp", mcp_service)
        .layer(middleware::from_fn_with_state(auth_state, authenticate))
        .layer(middleware::from_fn(attach_client_kind))
        .layer(cors)
}

fn streamable_http_service(
    endpoint: Arc<VirtualEndpoint>,
) -> StreamableHttpService<VirtualEndpoint, LocalSessionManager> {
    StreamableHttpService::new(
        move || Ok((*endpoint).clone()),
        LocalSessionManager::default().into(),
        StreamableHttpServerConfig {
            stateful_mode: true,
            sse_keep_alive: Some(Duration::from_secs(SSE_KEEP_ALIVE_SECS)),
        },
    )
}

async fn authenticate(State(auth): State<HttpAuth>, req: Request<Body>, next: Next) -> Result<Response, ApiError> {
    let kind = req.extensions().get::<ClientKind>().copied().unwrap_or_default();
    auth.verify(kind, &req)?;
    Ok(next.run(req).await)
}

pub async fn spawn_http_server(state: HttpState, addr: SocketAddr) -> Result<HttpServerHandle> {
    let router = build_router(state);
    let listener = TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?;
    info!("HTTP server listening on {}", local_addr);

    let task = tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, router).await {
            error!("HTTP server terminated with error: {err}");
        }
    });

    Ok(HttpServerHandle { addr: local_addr, task })
}

async fn get_health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}
