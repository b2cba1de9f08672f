//! The seven fixed meta-tools every virtual session sees regardless of
//! which backends are connected: discovery (`List_*`, `Find_Tools`),
//! dispatch (`Call_Server_Tool`, `Call_Tool_Chain`) and the
//! `Start_Mcp_Hub` readiness probe. A fixed registry since these tools
//! have no backend counterpart at all.

use std::sync::Arc;

use rmcp::ErrorData as McpError;
use rmcp::model::{CallToolResult, Content, Tool};
use serde_json::{Value, json};
use uuid::Uuid;

use crate::capability::{CapabilityIndex, CapabilityKind};
use crate::chain::{ChainDefinition, ChainExecutor};
use crate::connection::manager::ConnectionManager;
use crate::error::HubError;

pub const START_MCP_HUB: &str = "Start_Mcp_Hub";
pub const LIST_ALL_SERVERS: &str = "List_All_Servers";
pub const LIST_SERVER_TOOLS: &str = "List_Server_Tools";
pub const LIST_ALL_TOOLS: &str = "List_All_Tools";
pub const FIND_TOOLS: &str = "Find_Tools";
pub const CALL_SERVER_TOOL: &str = "Call_Server_Tool";
pub const CALL_TOOL_CHAIN: &str = "Call_Tool_Chain";

pub const META_TOOL_NAMES: [&str; 7] = [
    START_MCP_HUB,
    LIST_ALL_SERVERS,
    LIST_SERVER_TOOLS,
    LIST_ALL_TOOLS,
    FIND_TOOLS,
    CALL_SERVER_TOOL,
    CALL_TOOL_CHAIN,
];

pub fn is_meta_tool(name: &str) -> bool {
    META_TOOL_NAMES.contains(&name)
}

pub struct MetaToolHandler {
    manager: Arc<ConnectionManager>,
    index: Arc<CapabilityIndex>,
    executor: Arc<ChainExecutor>,
}

impl MetaToolHandler {
    pub fn new(manager: Arc<ConnectionManager>, index: Arc<CapabilityIndex>, executor: Arc<ChainExecutor>) -> Self {
        Self { manager, index, executor }
    }

    pub fn definitions() -> Vec<Tool> {
        vec![
            tool_def(START_MCP_HUB, "Reports hub readiness and a summary of connected backends.", json!({"type": "object", "properties": {}})),
            tool_def(LIST_ALL_SERVERS, "Lists every configured backend and its connection state.", json!({"type": "object", "properties": {}})),
            tool_def(
                LIST_SERVER_TOOLS,
                "Lists the tools exposed by one specific backend.",
                json!({"type": "object", "properties": {"server": {"type": "string"}}, "required": ["server"]}),
            ),
            tool_def(LIST_ALL_TOOLS, "Lists every namespaced tool across all connected backends.", json!({"type": "object", "properties": {}})),
            tool_def(
                FIND_TOOLS,
                "Searches tool names and descriptions across all backends.",
                json!({"type": "object", "properties": {"query": {"type": "string"}}, "required": ["query"]}),
            ),
            tool_def(
                CALL_SERVER_TOOL,
                "Calls one namespaced tool with the given arguments.",
                json!({
                    "type": "object",
                    "properties": {"tool": {"type": "string"}, "arguments": {"type": "object"}},
                    "required": ["tool"]
                }),
            ),
            tool_def(
                CALL_TOOL_CHAIN,
                "Executes a multi-step chain of tool calls across backends.",
                json!({
                    "type": "object",
                    "properties": {"variables": {"type": "object"}, "steps": {"type": "array"}},
                    "required": ["steps"]
                }),
            ),
        ]
    }

    /// Dispatches one meta-tool call. `Call_Tool_Chain` recursion is rejected
    /// earlier, at chain validation time, since chain steps never reach a
    /// meta-tool through this path at all — only through the virtual
    /// endpoint's own `tools/call`.
    pub async fn call(&self, name: &str, arguments: Value) -> Result<CallToolResult, McpError> {
        let result = match name {
            START_MCP_HUB => self.start_hub().await,
            LIST_ALL_SERVERS => self.list_all_servers().await,
            LIST_SERVER_TOOLS => self.list_server_tools(&arguments).await,
            LIST_ALL_TOOLS => self.list_all_tools().await,
            FIND_TOOLS => self.find_tools(&arguments).await,
            CALL_SERVER_TOOL => self.call_server_tool(&arguments).await,
            CALL_TOOL_CHAIN => self.call_tool_chain(&arguments).await,
            other => Err(HubError::UnknownCapability(other.to_string())),
        };
        result.map_err(|err| McpError::invalid_params(err.upstream_message(), None))
    }

    async fn start_hub(&self) -> Result<CallToolResult, HubError> {
        let snapshots = self.manager.list().await;
        let connected = snapshots.iter().filter(|s| s.state == crate::connection::ConnectionState::Connected).count();
        let payload = json!({
            "ready": true,
            "backends_total": snapshots.len(),
            "backends_connected": connected,
        });
        Ok(json_result(payload))
    }

    async fn list_all_servers(&self) -> Result<CallToolResult, HubError> {
        let snapshots = self.manager.list().await;
        Ok(json_result(json!(snapshots)))
    }

    async fn list_server_tools(&self, arguments: &Value) -> Result<CallToolResult, HubError> {
        let server = arguments.get("server").and_then(Value::as_str).ok_or_else(|| {
            HubError::InvalidParams("List_Server_Tools requires a 'server' argument".into())
        })?;
        let capabilities = self.index.list_for_backend(server).await;
        let tools: Vec<Tool> = capabilities.iter().filter_map(|c| c.as_tool()).collect();
        Ok(json_result(json!(tools)))
    }

    async fn list_all_tools(&self) -> Result<CallToolResult, HubError> {
        let capabilities = self.index.list(Some(CapabilityKind::Tool)).await;
        let tools: Vec<Tool> = capabilities.iter().filter_map(|c| c.as_tool()).collect();
        Ok(json_result(json!(tools)))
    }

    async fn find_tools(&self, arguments: &Value) -> Result<CallToolResult, HubError> {
        let query = arguments.get("query").and_then(Value::as_str).unwrap_or_default();
        let matches = self.index.find(query).await;
        let tools: Vec<Tool> = matches.into_iter().filter_map(|c| c.as_tool()).collect();
        Ok(json_result(json!(tools)))
    }

    async fn call_server_tool(&self, arguments: &Value) -> Result<CallToolResult, HubError> {
        let tool_name = arguments.get("tool").and_then(Value::as_str).ok_or_else(|| {
            HubError::InvalidParams("Call_Server_Tool requires a 'tool' argument".into())
        })?;
        let capability = self.index.lookup(tool_name).await.ok_or_else(|| HubError::UnknownCapability(tool_name.to_string()))?;
        let connection = self.manager.get(&capability.backend).await?;
        let call_args = arguments.get("arguments").and_then(Value::as_object).cloned();
        let params = rmcp::model::CallToolRequestParam { name: capability.original_name.clone().into(), arguments: call_args };
        connection.call_tool(params).await
    }

    async fn call_tool_chain(&self, arguments: &Value) -> Result<CallToolResult, HubError> {
        let definition: ChainDefinition = serde_json::from_value(arguments.clone())
            .map_err(|err| HubError::InvalidParams(format!("invalid chain definition: {err}")))?;
        let execution_id = Uuid::new_v4().to_string();
        let result = self.executor.execute(execution_id, definition).await?;
        Ok(json_result(json!(result)))
    }
}

fn tool_def(name: &str, description: &str, schema: Value) -> Tool {
    serde_json::from_value(json!({
        "name": name,
        "description": description,
        "inputSchema": schema,
    }))
    .expect("meta-tool schema is statically valid")
}

fn json_result(value: Value) -> CallToolResult {
    let text = serde_json::to_string_pretty(&value).unwrap_or_else(|_| value.to_string());
    CallToolResult::success(vec![Content::text(text)])
}
