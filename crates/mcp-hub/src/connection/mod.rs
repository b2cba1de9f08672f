//! One backend's lifecycle: state machine, transport ownership, handshake
//! bookkeeping and typed forwarding calls, covering all three supported
//! transports with an explicit connection state machine.

pub mod manager;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use rmcp::ErrorData as McpError;
use rmcp::model::{
    CallToolRequestParam, CallToolResult, ClientResult, GetPromptRequestParam, GetPromptResult,
    Prompt, ReadResourceRequestParam, ReadResourceResult, Resource, ResourceTemplate,
    ServerNotification, ServerRequest, Tool, ToolListChangedNotification,
};
use rmcp::service::{RequestContext, RoleClient, RunningService, Service, ServiceExt};
use rmcp::transport::{SseClientTransport, StreamableHttpClientTransport};
use time::OffsetDateTime;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Duration;

use crate::clock::Clock;
use crate::config::{BackendConfig, TransportKind};
use crate::error::HubError;
use crate::events::{Event, EventKind, EventSink};
use crate::transport::{self, StderrRing, stdio as stdio_transport};

/// Name the hub reports as its own `serverInfo.name`. A backend whose
/// handshake echoes this name is looping back to the hub itself.
pub const HUB_INTERNAL_NAME: &str = "mcp-hub";

/// Hub-imposed deadline on a single forwarded call, independent of whatever
/// timeout the transport layer itself enforces. A backend that never
/// responds must not hang the caller forever.
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 300_000;

async fn with_deadline<T>(
    future: impl std::future::Future<Output = Result<T, HubError>>,
) -> Result<T, HubError> {
    match tokio::time::timeout(Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS), future).await {
        Ok(result) => result,
        Err(_) => Err(HubError::Timeout(DEFAULT_REQUEST_TIMEOUT_MS)),
    }
}

/// Backend lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disabled,
    Idle,
    Starting,
    Handshaking,
    Connected,
    Degraded,
    Reconnecting,
    Stopping,
    Failed,
}

/// Why a connection most recently left the `Connected` state.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectReason {
    TransportClosed,
    HandshakeFailed(String),
    SelfReference,
    Disabled,
    Removed,
}

/// Negotiated handshake facts, recorded once per successful `initialize`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct HandshakeInfo {
    pub protocol_version: String,
    pub server_name: String,
    pub server_version: String,
    pub tools_list_changed: bool,
    pub resources_list_changed: bool,
    pub prompts_list_changed: bool,
}

/// Point-in-time view of a connection, safe to hand out to callers that
/// must not hold the connection's internal locks.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ConnectionSnapshot {
    pub name: String,
    pub state: ConnectionState,
    pub disabled: bool,
    pub handshake: Option<HandshakeInfo>,
    pub tool_count: usize,
    pub resource_count: usize,
    pub prompt_count: usize,
    pub request_count: u64,
    pub last_disconnect_reason: Option<DisconnectReason>,
    #[serde(with = "time::serde::rfc3339")]
    pub state_changed_at: OffsetDateTime,
}

struct ClientHandle(RunningService<RoleClient, ConnectionAdapter>);

/// One backend's runtime state. Created once per `BackendConfig`, survives
/// reconnects; destroyed only by explicit `ConnectionManager::remove`.
pub struct Connection {
    name: String,
    config: RwLock<BackendConfig>,
    state: RwLock<ConnectionState>,
    handshake: RwLock<Option<HandshakeInfo>>,
    client: Mutex<Option<ClientHandle>>,
    tools: RwLock<Vec<Tool>>,
    resources: RwLock<Vec<Resource>>,
    resource_templates: RwLock<Vec<ResourceTemplate>>,
    prompts: RwLock<Vec<Prompt>>,
    needs_refresh: Arc<AtomicBool>,
    request_count: AtomicU64,
    last_disconnect_reason: RwLock<Option<DisconnectReason>>,
    state_changed_at: RwLock<OffsetDateTime>,
    stderr_ring: Arc<StderrRing>,
    sink: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
}

impl Connection {
    pub fn new(config: BackendConfig, sink: Arc<dyn EventSink>, clock: Arc<dyn Clock>) -> Self {
        let initial_state = if config.disabled { ConnectionState::Disabled } else { ConnectionState::Idle };
        let name = config.name.clone();
        let state_changed_at = clock.now();
        Self {
            name,
            config: RwLock::new(config),
            state: RwLock::new(initial_state),
            handshake: RwLock::new(None),
            client: Mutex::new(None),
            tools: RwLock::new(Vec::new()),
            resources: RwLock::new(Vec::new()),
            resource_templates: RwLock::new(Vec::new()),
            prompts: RwLock::new(Vec::new()),
            needs_refresh: Arc::new(AtomicBool::new(true)),
            request_count: AtomicU64::new(0),
            last_disconnect_reason: RwLock::new(None),
            state_changed_at: RwLock::new(state_changed_at),
            stderr_ring: Arc::new(StderrRing::default()),
            sink,
            clock,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn state(&self) -> ConnectionState {
        *self.state.read().await
    }

    async fn set_state(&self, next: ConnectionState) {
        let previous = {
            let mut guard = self.state.write().await;
            let previous = *guard;
            *guard = next;
            previous
        };
        if previous != next {
            *self.state_changed_at.write().await = self.clock.now();
            tracing::info!(backend = %self.name, from = ?previous, to = ?next, "connection state transition");
            self.sink.emit(
                Event::new(
                    EventKind::ConnectionState,
                    serde_json::json!({ "from": format!("{previous:?}"), "to": format!("{next:?}") }),
                )
                .with_backend(self.name.clone()),
            );
        }
    }

    pub async fn snapshot(&self) -> ConnectionSnapshot {
        ConnectionSnapshot {
            name: self.name.clone(),
            state: self.state().await,
            disabled: self.config.read().await.disabled,
            handshake: self.handshake.read().await.clone(),
            tool_count: self.tools.read().await.len(),
            resource_count: self.resources.read().await.len(),
            prompt_count: self.prompts.read().await.len(),
            request_count: self.request_count.load(Ordering::Relaxed),
            last_disconnect_reason: self.last_disconnect_reason.read().await.clone(),
            state_changed_at: *self.state_changed_at.read().await,
        }
    }

    pub async fn tools(&self) -> Vec<Tool> {
        self.tools.read().await.clone()
    }

    pub async fn resources(&self) -> Vec<Resource> {
        self.resources.read().await.clone()
    }

    pub async fn resource_templates(&self) -> Vec<ResourceTemplate> {
        self.resource_templates.read().await.clone()
    }

    pub async fn prompts(&self) -> Vec<Prompt> {
        self.prompts.read().await.clone()
    }

    pub fn needs_refresh(&self) -> bool {
        self.needs_refresh.load(Ordering::SeqCst)
    }

    pub async fn stderr_tail(&self) -> Vec<String> {
        self.stderr_ring.snapshot()
    }

    /// Drive `Idle -> Starting -> Handshaking -> Connected|Failed`. A
    /// `Disabled` connection refuses to start until re-enabled.
    pub async fn start(&self) -> Result<(), HubError> {
        if matches!(self.state().await, ConnectionState::Disabled) {
            return Err(HubError::Internal(format!("connection '{}' is disabled", self.name)));
        }
        self.set_state(ConnectionState::Starting).await;

        let config = self.config.read().await.clone();
        let adapter = ConnectionAdapter::new(self.needs_refresh.clone());

        let connect_result = match config.transport {
            TransportKind::Stdio => self.start_stdio(&config, adapter).await,
            TransportKind::HttpSse => self.start_sse(&config, adapter).await,
            TransportKind::StreamableHttp => self.start_streamable_http(&config, adapter).await,
        };

        let client = match connect_result {
            Ok(client) => client,
            Err(err) => {
                *self.last_disconnect_reason.write().await =
                    Some(DisconnectReason::HandshakeFailed(err.to_string()));
                self.set_state(ConnectionState::Failed).await;
                return Err(err);
            }
        };

        self.set_state(ConnectionState::Handshaking).await;

        let peer = client.0.peer().clone();
        let init = client.0.peer_info().cloned();
        if let Some(init) = init {
            let server_name = init.server_info.name.clone();
            if server_name == HUB_INTERNAL_NAME {
                *self.last_disconnect_reason.write().await = Some(DisconnectReason::SelfReference);
                self.set_state(ConnectionState::Failed).await;
                return Err(HubError::Internal(format!(
                    "backend '{}' is a self-reference to this hub",
                    self.name
                )));
            }
            let caps = init.capabilities;
            *self.handshake.write().await = Some(HandshakeInfo {
                protocol_version: init.protocol_version.to_string(),
                server_name,
                server_version: init.server_info.version.clone(),
                tools_list_changed: caps.tools.as_ref().and_then(|t| t.list_changed).unwrap_or(false),
                resources_list_changed: caps
                    .resources
                    .as_ref()
                    .and_then(|r| r.list_changed)
                    .unwrap_or(false),
                prompts_list_changed: caps
                    .prompts
                    .as_ref()
                    .and_then(|p| p.list_changed)
                    .unwrap_or(false),
            });
        }

        *self.client.lock().await = Some(client);

        if let Err(err) = self.refresh_all(&peer).await {
            self.set_state(ConnectionState::Degraded).await;
            return Err(err);
        }

        self.set_state(ConnectionState::Connected).await;
        Ok(())
    }

    async fn start_stdio(
        &self,
        config: &BackendConfig,
        adapter: ConnectionAdapter,
    ) -> Result<ClientHandle, HubError> {
        let spawned = stdio_transport::spawn(config, self.stderr_ring.clone(), self.sink.clone())?;
        let running = adapter
            .serve(spawned.transport)
            .await
            .map_err(|err| HubError::Internal(format!("stdio handshake failed: {err}")))?;
        // Keep the child alive for the lifetime of the connection by leaking
        // ownership into a detached task that waits on it; `kill_on_drop`
        // still applies if the hub process exits first.
        let mut child = spawned.child;
        tokio::spawn(async move {
            let _ = child.wait().await;
        });
        Ok(ClientHandle(running))
    }

    async fn start_sse(
        &self,
        config: &BackendConfig,
        adapter: ConnectionAdapter,
    ) -> Result<ClientHandle, HubError> {
        let endpoint = transport::http_sse::endpoint(config)?;
        let sse = SseClientTransport::start(endpoint.to_string())
            .await
            .map_err(|err| HubError::Internal(format!("SSE connect failed: {err}")))?;
        let running = adapter
            .serve(sse)
            .await
            .map_err(|err| HubError::Internal(format!("SSE handshake failed: {err}")))?;
        Ok(ClientHandle(running))
    }

    async fn start_streamable_http(
        &self,
        config: &BackendConfig,
        adapter: ConnectionAdapter,
    ) -> Result<ClientHandle, HubError> {
        let endpoint = transport::streamable_http::endpoint(config)?;
        let transport = StreamableHttpClientTransport::from_uri(endpoint.to_string());
        let running = adapter
            .serve(transport)
            .await
            .map_err(|err| HubError::Internal(format!("streamable HTTP handshake failed: {err}")))?;
        Ok(ClientHandle(running))
    }

    async fn refresh_all(&self, peer: &rmcp::service::Peer<RoleClient>) -> Result<(), HubError> {
        let (tools, resources, templates, prompts) = tokio::join!(
            peer.list_all_tools(),
            peer.list_all_resources(),
            peer.list_all_resource_templates(),
            peer.list_all_prompts(),
        );
        *self.tools.write().await =
            tools.map_err(|err| HubError::Internal(format!("tools/list failed: {err}")))?;
        *self.resources.write().await = resources.unwrap_or_default();
        *self.resource_templates.write().await = templates.unwrap_or_default();
        *self.prompts.write().await = prompts.unwrap_or_default();
        self.needs_refresh.store(false, Ordering::SeqCst);
        Ok(())
    }

    pub async fn refresh_if_needed(&self) -> Result<(), HubError> {
        if !self.needs_refresh() {
            return Ok(());
        }
        let peer = self.peer().await?;
        self.refresh_all(&peer).await
    }

    async fn peer(&self) -> Result<rmcp::service::Peer<RoleClient>, HubError> {
        let guard = self.client.lock().await;
        guard
            .as_ref()
            .map(|c| c.0.peer().clone())
            .ok_or(HubError::TransportClosed)
    }

    pub async fn call_tool(
        &self,
        params: CallToolRequestParam,
    ) -> Result<CallToolResult, HubError> {
        let peer = self.peer().await?;
        self.request_count.fetch_add(1, Ordering::Relaxed);
        let name = params.name.clone();
        let result = with_deadline(async { peer.call_tool(params).await.map_err(|err| to_backend_error(&self.name, err)) }).await;
        self.sink.emit(
            Event::new(
                EventKind::RequestComplete,
                serde_json::json!({ "tool": name.to_string(), "success": result.is_ok() }),
            )
            .with_backend(self.name.clone()),
        );
        result
    }

    pub async fn read_resource(
        &self,
        params: ReadResourceRequestParam,
    ) -> Result<ReadResourceResult, HubError> {
        let peer = self.peer().await?;
        with_deadline(async { peer.read_resource(params).await.map_err(|err| to_backend_error(&self.name, err)) }).await
    }

    pub async fn get_prompt(
        &self,
        params: GetPromptRequestParam,
    ) -> Result<GetPromptResult, HubError> {
        let peer = self.peer().await?;
        with_deadline(async { peer.get_prompt(params).await.map_err(|err| to_backend_error(&self.name, err)) }).await
    }

    /// `Connected|Degraded|Reconnecting -> Stopping -> Disabled`.
    pub async fn stop(&self, reason: DisconnectReason) -> Result<(), HubError> {
        self.set_state(ConnectionState::Stopping).await;
        if let Some(client) = self.client.lock().await.take() {
            let _ = client.0.cancel().await;
        }
        *self.tools.write().await = Vec::new();
        *self.resources.write().await = Vec::new();
        *self.resource_templates.write().await = Vec::new();
        *self.prompts.write().await = Vec::new();
        *self.last_disconnect_reason.write().await = Some(reason);
        let next = if self.config.read().await.disabled {
            ConnectionState::Disabled
        } else {
            ConnectionState::Idle
        };
        self.set_state(next).await;
        Ok(())
    }

    pub async fn mark_reconnecting(&self) {
        self.set_state(ConnectionState::Reconnecting).await;
    }

    pub async fn mark_failed(&self) {
        self.set_state(ConnectionState::Failed).await;
    }

    pub async fn set_disabled(&self, disabled: bool) {
        self.config.write().await.disabled = disabled;
    }

    pub async fn is_disabled(&self) -> bool {
        self.config.read().await.disabled
    }

    pub async fn config(&self) -> BackendConfig {
        self.config.read().await.clone()
    }
}

fn to_backend_error(backend: &str, err: rmcp::service::ServiceError) -> HubError {
    use rmcp::service::ServiceError;
    match err {
        ServiceError::McpError(data) => HubError::Backend {
            backend: backend.to_string(),
            code: data.code.0 as i32,
            message: data.message.to_string(),
            data: data.data.clone(),
        },
        ServiceError::TransportClosed => HubError::TransportClosed,
        ServiceError::Timeout { timeout } => HubError::Timeout(timeout.as_millis() as u64),
        ServiceError::Cancelled { .. } => HubError::Cancelled,
        other => HubError::Internal(other.to_string()),
    }
}

/// Handles server-initiated requests/notifications for one backend
/// connection. Tool/resource/prompt `list_changed` notifications flip
/// `needs_refresh`; the owning `ConnectionManager` polls this to decide
/// when to rebuild the `CapabilityIndex`.
#[derive(Clone)]
struct ConnectionAdapter {
    needs_refresh: Arc<AtomicBool>,
}

impl ConnectionAdapter {
    fn new(needs_refresh: Arc<AtomicBool>) -> Self {
        Self { needs_refresh }
    }
}

impl Service<RoleClient> for ConnectionAdapter {
    async fn handle_request(
        &self,
        request: <RoleClient as rmcp::service::ServiceRole>::PeerReq,
        _context: RequestContext<RoleClient>,
    ) -> Result<ClientResult, McpError> {
        match request {
            ServerRequest::PingRequest(_) => Ok(ClientResult::empty(())),
            other => {
                tracing::warn!(?other, "unsupported server-initiated request");
                Err(McpError::internal_error("unsupported server request", None))
            }
        }
    }

    async fn handle_notification(
        &self,
        notification: <RoleClient as rmcp::service::ServiceRole>::PeerNot,
        _context: rmcp::service::NotificationContext<RoleClient>,
    ) -> Result<(), McpError> {
        match notification {
            ServerNotification::ToolListChangedNotification(ToolListChangedNotification {
                ..
            })
            | ServerNotification::ResourceListChangedNotification(_)
            | ServerNotification::PromptListChangedNotification(_) => {
                self.needs_refresh.store(true, Ordering::SeqCst);
            }
            _ => {}
        }
        Ok(())
    }

    fn get_info(&self) -> <RoleClient as rmcp::service::ServiceRole>::Info {
        Default::default()
    }
}
