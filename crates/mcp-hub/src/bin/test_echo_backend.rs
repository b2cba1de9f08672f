//! Minimal stdio MCP server used only by integration tests: two tools that
//! echo their arguments back, one annotated read-only and one left
//! unannotated (and therefore treated as a write by the hub's approval
//! gate). Not part of the hub itself.

use rmcp::ErrorData as McpError;
use rmcp::model::{
    CallToolRequest, CallToolRequestParam, CallToolResult, ClientRequest, CompleteRequestMethod,
    Content, GetPromptRequest, Implementation, InitializeResult, ListPromptsResult,
    ListResourceTemplatesResult, ListResourcesResult, ListToolsResult, ProtocolVersion,
    ReadResourceRequest, ServerCapabilities, ServerResult, SetLevelRequestMethod,
    SubscribeRequestMethod, Tool, UnsubscribeRequestMethod,
};
use rmcp::service::{NotificationContext, RequestContext, RoleServer, Service, ServiceExt};
use rmcp::transport::stdio;
use serde_json::json;

#[derive(Clone)]
struct EchoBackend;

impl EchoBackend {
    fn tools() -> Vec<Tool> {
        vec![
            serde_json::from_value(json!({
                "name": "echo_read",
                "description": "Echoes its arguments back. Read-only.",
                "inputSchema": {"type": "object", "properties": {"message": {"type": "string"}}},
                "annotations": {"readOnlyHint": true},
            }))
            .expect("static tool definition"),
            serde_json::from_value(json!({
                "name": "echo_write",
                "description": "Echoes its arguments back. Not annotated as read-only.",
                "inputSchema": {"type": "object", "properties": {"message": {"type": "string"}}},
            }))
            .expect("static tool definition"),
        ]
    }

    fn server_info(&self) -> InitializeResult {
        InitializeResult {
            protocol_version: ProtocolVersion::default(),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: "test-echo-backend".to_string(),
                title: None,
                version: "0.1.0".to_string(),
                icons: None,
                website_url: None,
            },
            instructions: None,
        }
    }

    fn call_tool(&self, params: CallToolRequestParam) -> Result<CallToolResult, McpError> {
        let arguments = params.arguments.map(serde_json::Value::Object).unwrap_or(serde_json::Value::Null);
        let text = serde_json::to_string(&json!({ "tool": params.name, "echo": arguments }))
            .unwrap_or_default();
        Ok(CallToolResult::success(vec![Content::text(text)]))
    }
}

impl Service<RoleServer> for EchoBackend {
    async fn handle_request(
        &self,
        request: <RoleServer as rmcp::service::ServiceRole>::PeerReq,
        _context: RequestContext<RoleServer>,
    ) -> Result<ServerResult, McpError> {
        match request {
            ClientRequest::InitializeRequest(_) => Ok(ServerResult::InitializeResult(self.server_info())),
            ClientRequest::PingRequest(_) => Ok(ServerResult::empty(())),
            ClientRequest::ListToolsRequest(_) => {
                Ok(ServerResult::ListToolsResult(ListToolsResult::with_all_items(Self::tools())))
            }
            ClientRequest::CallToolRequest(CallToolRequest { params, .. }) => {
                self.call_tool(params).map(ServerResult::CallToolResult)
            }
            ClientRequest::ListResourcesRequest(_) => {
                Ok(ServerResult::ListResourcesResult(ListResourcesResult::with_all_items(Vec::new())))
            }
            ClientRequest::ListResourceTemplatesRequest(_) => Ok(ServerResult::ListResourceTemplatesResult(
                ListResourceTemplatesResult::with_all_items(Vec::new()),
            )),
            ClientRequest::ReadResourceRequest(ReadResourceRequest { params, .. }) => {
                Err(McpError::invalid_params(format!("unknown resource '{}'", params.uri), None))
            }
            ClientRequest::ListPromptsRequest(_) => {
                Ok(ServerResult::ListPromptsResult(ListPromptsResult::with_all_items(Vec::new())))
            }
            ClientRequest::GetPromptRequest(GetPromptRequest { params, .. }) => {
                Err(McpError::invalid_params(format!("unknown prompt '{}'", params.name), None))
            }
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

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let service = EchoBackend.serve(stdio()).await?;
    service.waiting().await?;
    Ok(())
}
