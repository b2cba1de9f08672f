//! The single virtual MCP server a client actually talks to. Forwards the
//! full method table — tools, resources, resource templates and prompts —
//! plus the seven always-present meta-tools, with an optional meta-only
//! mode that hides every backend-sourced capability.
//!
//! Served over HTTP via `rmcp`'s own `StreamableHttpService` (see
//! `web::http`), so per-session framing and backpressure come from the SDK
//! rather than a hand-rolled queue: `VirtualEndpoint` only needs to be
//! cheap to clone, one instance per session.

pub mod session;

use rmcp::ErrorData as McpError;
use rmcp::model::{
    CallToolRequest, CallToolRequestParam, ClientRequest, CompleteRequestMethod, GetPromptRequest,
    GetPromptResult, Implementation, InitializeResult, ListPromptsResult,
    ListResourceTemplatesResult, ListResourcesResult, ListToolsResult, Prompt, ProtocolVersion,
    ReadResourceRequest, ServerCapabilities, ServerResult, SetLevelRequestMethod,
    SubscribeRequestMethod, UnsubscribeRequestMethod,
};
use rmcp::service::{NotificationContext, RequestContext, RoleServer, Service};
use serde_json::json;
use uuid::Uuid;

use crate::capability::{CapabilityIndex, CapabilityKind};
use crate::connection::manager::ConnectionManager;
use crate::meta_tools::MetaToolHandler;

pub use session::SessionRegistry;

/// Bootstrap prompt exposed unconditionally, even in meta-only mode, so a
/// client that knows nothing about this hub yet has one guaranteed way to
/// learn how to proceed.
const START_HERE_PROMPT: &str = "start_here_readme.md";

/// When true, only the seven meta-tools are advertised; every
/// backend-sourced tool/resource/prompt is hidden from `list_*` and
/// `call_tool` rejects anything that isn't a meta-tool. Useful for a
/// client that should orchestrate exclusively through `Call_Tool_Chain`.
#[derive(Clone)]
pub struct VirtualEndpoint {
    index: std::sync::Arc<CapabilityIndex>,
    manager: std::sync::Arc<ConnectionManager>,
    meta_tools: std::sync::Arc<MetaToolHandler>,
    meta_only: bool,
    sessions: std::sync::Arc<SessionRegistry>,
}

impl VirtualEndpoint {
    pub fn new(
        index: std::sync::Arc<CapabilityIndex>,
        manager: std::sync::Arc<ConnectionManager>,
        meta_tools: std::sync::Arc<MetaToolHandler>,
        meta_only: bool,
        sessions: std::sync::Arc<SessionRegistry>,
    ) -> Self {
        Self { index, manager, meta_tools, meta_only, sessions }
    }

    fn start_here_prompt() -> Prompt {
        serde_json::from_value(json!({
            "name": START_HERE_PROMPT,
            "description": "Bootstrap guide: how to discover backends and call tools through this hub.",
        }))
        .expect("bootstrap prompt definition is statically valid")
    }

    fn start_here_prompt_result(&self) -> GetPromptResult {
        let text = if self.meta_only {
            "This hub is running in meta-only mode. Call Start_Mcp_Hub to check readiness, \
             List_All_Servers and List_Server_Tools to discover backends, then Call_Server_Tool \
             or Call_Tool_Chain to invoke them."
        } else {
            "Call List_All_Tools or Find_Tools to discover namespaced tools across every \
             connected backend, then call one directly by its namespaced name, or compose \
             several with Call_Tool_Chain."
        };
        serde_json::from_value(json!({
            "description": "How to use this hub",
            "messages": [
                { "role": "user", "content": { "type": "text", "text": text } }
            ],
        }))
        .expect("bootstrap prompt result is statically valid")
    }

    fn server_info(&self) -> InitializeResult {
        InitializeResult {
            protocol_version: ProtocolVersion::default(),
            capabilities: ServerCapabilities::builder()
                .enable_tools()
                .enable_resources()
                .enable_prompts()
                .build(),
            server_info: Implementation {
                name: crate::connection::HUB_INTERNAL_NAME.to_string(),
                title: Some("MCP Hub".to_string()),
                version: env!("CARGO_PKG_VERSION").to_string(),
                icons: None,
                website_url: None,
            },
            instructions: Some(self.instructions()),
        }
    }

    fn instructions(&self) -> String {
        if self.meta_only {
            "Virtual MCP hub running in meta-only mode: use the meta-tools to discover and invoke backend capabilities.".to_string()
        } else {
            "Virtual MCP hub aggregating multiple backend MCP servers under namespaced tool/resource/prompt names.".to_string()
        }
    }

    async fn list_tools(&self) -> Result<ListToolsResult, McpError> {
        let mut tools = MetaToolHandler::definitions();
        if !self.meta_only {
            let capabilities = self.index.list(Some(CapabilityKind::Tool)).await;
            tools.extend(capabilities.iter().filter_map(|c| c.as_tool()));
        }
        Ok(ListToolsResult::with_all_items(tools))
    }

    async fn call_tool(&self, params: CallToolRequestParam) -> Result<ServerResult, McpError> {
        let arguments = params.arguments.clone().map(serde_json::Value::Object).unwrap_or(serde_json::Value::Null);

        if crate::meta_tools::is_meta_tool(&params.name) {
            let result = self.meta_tools.call(&params.name, arguments).await?;
            return Ok(ServerResult::CallToolResult(result));
        }

        if self.meta_only {
            return Err(McpError::invalid_params(
                format!("tool '{}' is not available in meta-only mode", params.name),
                None,
            ));
        }

        let capability = self
            .index
            .lookup(&params.name)
            .await
            .ok_or_else(|| McpError::invalid_params(format!("unknown tool '{}'", params.name), None))?;
        let connection = self
            .manager
            .get(&capability.backend)
            .await
            .map_err(|err| McpError::internal_error(err.upstream_message(), None))?;
        let forwarded =
            CallToolRequestParam { name: capability.original_name.clone().into(), arguments: params.arguments };
        let result = connection.call_tool(forwarded).await.map_err(|err| McpError::internal_error(err.upstream_message(), None))?;
        Ok(ServerResult::CallToolResult(result))
    }

    async fn list_resources(&self) -> Result<ListResourcesResult, McpError> {
        if self.meta_only {
            return Ok(ListResourcesResult::with_all_items(Vec::new()));
        }
        let capabilities = self.index.list(Some(CapabilityKind::Resource)).await;
        let resources = capabilities.iter().filter_map(|c| c.as_resource()).collect();
        Ok(ListResourcesResult::with_all_items(resources))
    }

    async fn list_resource_templates(&self) -> Result<ListResourceTemplatesResult, McpError> {
        if self.meta_only {
            return Ok(ListResourceTemplatesResult::with_all_items(Vec::new()));
        }
        let capabilities = self.index.list(Some(CapabilityKind::ResourceTemplate)).await;
        let templates = capabilities.iter().filter_map(|c| c.as_resource_template()).collect();
        Ok(ListResourceTemplatesResult::with_all_items(templates))
    }

    async fn read_resource(&self, uri: &str) -> Result<ServerResult, McpError> {
        if self.meta_only {
            return Err(McpError::invalid_params("resources are not available in meta-only mode", None));
        }
        let capability = match self.index.find_resource_by_uri(uri).await {
            Some(capability) => capability,
            None => self
                .index
                .resolve_template_for_uri(uri)
                .await
                .ok_or_else(|| McpError::invalid_params(format!("unknown resource '{uri}'"), None))?,
        };
        let connection = self
            .manager
            .get(&capability.backend)
            .await
            .map_err(|err| McpError::internal_error(err.upstream_message(), None))?;
        let params = rmcp::model::ReadResourceRequestParam { uri: uri.to_string() };
        let result = connection.read_resource(params).await.map_err(|err| McpError::internal_error(err.upstream_message(), None))?;
        Ok(ServerResult::ReadResourceResult(result))
    }

    async fn list_prompts(&self) -> Result<ListPromptsResult, McpError> {
        let mut prompts = vec![Self::start_here_prompt()];
        if !self.meta_only {
            let capabilities = self.index.list(Some(CapabilityKind::Prompt)).await;
            prompts.extend(capabilities.iter().filter_map(|c| c.as_prompt()));
        }
        Ok(ListPromptsResult::with_all_items(prompts))
    }

    async fn get_prompt(&self, params: rmcp::model::GetPromptRequestParam) -> Result<ServerResult, McpError> {
        if params.name == START_HERE_PROMPT {
            return Ok(ServerResult::GetPromptResult(self.start_here_prompt_result()));
        }
        if self.meta_only {
            return Err(McpError::invalid_params("prompts are not available in meta-only mode", None));
        }
        let capability = self
            .index
            .lookup(&params.name)
            .await
            .ok_or_else(|| McpError::invalid_params(format!("unknown prompt '{}'", params.name), None))?;
        let connection = self
            .manager
            .get(&capability.backend)
            .await
            .map_err(|err| McpError::internal_error(err.upstream_message(), None))?;
        let forwarded = rmcp::model::GetPromptRequestParam { name: capability.original_name.clone(), arguments: params.arguments };
        let result = connection.get_prompt(forwarded).await.map_err(|err| McpError::internal_error(err.upstream_message(), None))?;
        Ok(ServerResult::GetPromptResult(result))
    }
}

impl Service<RoleServer> for VirtualEndpoint {
    async fn handle_request(
        &self,
        request: <RoleServer as rmcp::service::ServiceRole>::PeerReq,
        context: RequestContext<RoleServer>,
    ) -> Result<ServerResult, McpError> {
        match request {
            ClientRequest::InitializeRequest(_) => {
                self.sessions.register(Uuid::new_v4().to_string(), context.peer.clone()).await;
                Ok(ServerResult::InitializeResult(self.server_info()))
            }
            ClientRequest::PingRequest(_) => Ok(ServerResult::empty(())),
            ClientRequest::ListToolsRequest(_) => self.list_tools().await.map(ServerResult::ListToolsResult),
            ClientRequest::CallToolRequest(CallToolRequest { params, .. }) => self.call_tool(params).await,
            ClientRequest::ListResourcesRequest(_) => {
                self.list_resources().await.map(ServerResult::ListResourcesResult)
            }
            ClientRequest::ListResourceTemplatesRequest(_) => {
                self.list_resource_templates().await.map(ServerResult::ListResourceTemplatesResult)
            }
            ClientRequest::ReadResourceRequest(ReadResourceRequest { params, .. }) => {
                self.read_resource(&params.uri).await
            }
            ClientRequest::ListPromptsRequest(_) => self.list_prompts().await.map(ServerResult::ListPromptsResult),
            ClientRequest::GetPromptRequest(GetPromptRequest { params, .. }) => self.get_prompt(params).await,
            ClientRequest::CompleteRequest(_) => Err(McpError::method_not_found::<CompleteRequestMethod>()),
            ClientRequest::SetLevelRequest(_) => Err(McpError::method_not_found::<SetLevelRequestMethod>()),
            ClientRequest::SubscribeRequest(_) => Err(McpError::method_not_found::<SubscribeRequestMethod>()),
            ClientRequest::UnsubscribeRequest(_) => Err(McpError::method_not_found::<UnsubscribeRequestMethod>()),
        }
    }

    async fn handle_notification(
        &self,
        _notification: <RoleServer as rmcp::service::ServiceRole>::PeerNot,
        _context: NotificationContext<RoleServer>,
    ) -> Result<(), McpError> {
        Ok(())
    }

    fn get_info(&self) -> <RoleServer as rmcp::service::ServiceRole>::Info {
        self.server_info()
    }
}
