use std::sync::Arc;
use std::time::Duration;

use mcp_hub::clock::{SystemClock, SystemRandom};
use mcp_hub::config::{BackendConfig, TransportKind};
use mcp_hub::connection::ConnectionState;
use mcp_hub::credential::EnvCredentialProvider;
use mcp_hub::events::InMemoryEventSink;
use mcp_hub::meta_tools::{CALL_TOOL_CHAIN, META_TOOL_NAMES, START_MCP_HUB};
use mcp_hub::web::http::{HttpAuth, HttpState, spawn_http_server};
use mcp_hub::Hub;
use mcp_hub_test_client::{StreamHttpConfig, TestClient};
use rmcp::model::CallToolResult;

fn echo_backend_config(name: &str) -> BackendConfig {
    BackendConfig {
        name: name.to_string(),
        transport: TransportKind::Stdio,
        command: Some(env!("CARGO_BIN_EXE_test-echo-backend").to_string()),
        args: Vec::new(),
        env: Default::default(),
        url: None,
        headers: Default::default(),
        disabled: false,
        auto_approve: Vec::new(),
        display_name: None,
        description: None,
    }
}

async fn wait_until_connected(hub: &Hub, name: &str) {
    for _ in 0..100 {
        if hub.manager.get(name).await.expect("backend registered").state().await == ConnectionState::Connected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("backend '{name}' never reached Connected");
}

fn result_text(result: &CallToolResult) -> String {
    result.content.first().and_then(|c| c.raw.as_text()).map(|t| t.text.clone()).unwrap_or_default()
}

async fn start_hub_with_http(meta_only: bool) -> (Hub, mcp_hub::web::http::HttpServerHandle) {
    let hub = Hub::start(
        Vec::new(),
        Arc::new(EnvCredentialProvider),
        Arc::new(InMemoryEventSink::new(None)),
        Arc::new(SystemClock::default()),
        Arc::new(SystemRandom),
        meta_only,
    )
    .await
    .expect("hub starts with no backends");

    let state = HttpState { endpoint: hub.endpoint.clone(), auth: HttpAuth::new(None) };
    let http = spawn_http_server(state, "127.0.0.1:0".parse().unwrap()).await.expect("http server binds");
    (hub, http)
}

#[tokio::test]
async fn lists_only_meta_tools_with_no_backends_connected() {
    let (hub, http) = start_hub_with_http(false).await;
    let endpoint = format!("http://{}/mcp", http.addr());

    let client = TestClient::connect_stream_http(StreamHttpConfig::new(endpoint))
        .await
        .expect("client connects over streamable http");

    let tools = client.list_all_tools().await.expect("list tools");
    let names: Vec<&str> = tools.iter().map(|t| t.name.as_ref()).collect();
    for meta_name in META_TOOL_NAMES {
        assert!(names.contains(&meta_name), "missing meta-tool {meta_name}");
    }
    assert_eq!(names.len(), META_TOOL_NAMES.len(), "no backend tools expected: {names:?}");

    client.shutdown().await.expect("client shuts down cleanly");
    http.shutdown();
    hub.shutdown().await;
}

#[tokio::test]
async fn start_mcp_hub_reports_zero_connected_backends() {
    let (hub, http) = start_hub_with_http(false).await;
    let endpoint = format!("http://{}/mcp", http.addr());

    let client = TestClient::connect_stream_http(StreamHttpConfig::new(endpoint))
        .await
        .expect("client connects over streamable http");

    let result =
        client.call_tool(START_MCP_HUB, Some(serde_json::json!({}))).await.expect("call meta-tool");
    assert_ne!(result.is_error, Some(true));

    client.shutdown().await.expect("client shuts down cleanly");
    http.shutdown();
    hub.shutdown().await;
}

#[tokio::test]
async fn call_tool_chain_rejects_a_step_that_recurses_into_itself() {
    let (hub, http) = start_hub_with_http(false).await;
    let endpoint = format!("http://{}/mcp", http.addr());

    let client = TestClient::connect_stream_http(StreamHttpConfig::new(endpoint))
        .await
        .expect("client connects over streamable http");

    let chain = serde_json::json!({
        "steps": [
            {"id": "recurse", "server_name": "meta", "tool_name": CALL_TOOL_CHAIN, "arguments": {"steps": []}}
        ]
    });
    let err = client
        .call_tool(CALL_TOOL_CHAIN, Some(chain))
        .await
        .expect_err("a chain step naming Call_Tool_Chain must be rejected");
    assert!(
        err.to_string().to_lowercase().contains("call_tool_chain")
            || err.to_string().to_lowercase().contains("invalid"),
        "unexpected error message: {err}"
    );

    client.shutdown().await.expect("client shuts down cleanly");
    http.shutdown();
    hub.shutdown().await;
}

#[tokio::test]
async fn call_tool_chain_requires_approval_for_an_unapproved_write_step() {
    let (hub, http) = start_hub_with_http(false).await;
    hub.manager.add(echo_backend_config("echo")).await.expect("backend registers");
    wait_until_connected(&hub, "echo").await;

    let endpoint = format!("http://{}/mcp", http.addr());
    let client = TestClient::connect_stream_http(StreamHttpConfig::new(endpoint))
        .await
        .expect("client connects over streamable http");

    let chain = serde_json::json!({
        "steps": [
            {"id": "write", "server_name": "echo", "tool_name": "echo_write", "arguments": {"message": "hi"}}
        ]
    });
    let result = client.call_tool(CALL_TOOL_CHAIN, Some(chain)).await.expect("call succeeds");
    assert_ne!(result.is_error, Some(true));
    let body: serde_json::Value = serde_json::from_str(&result_text(&result)).expect("json body");
    assert_eq!(body["status"], "requires_approval");
    assert_eq!(body["write_operations"], serde_json::json!(["echo:echo_write"]));

    client.shutdown().await.expect("client shuts down cleanly");
    http.shutdown();
    hub.shutdown().await;
}

#[tokio::test]
async fn call_tool_chain_runs_a_parallel_group_once_approval_is_granted() {
    let (hub, http) = start_hub_with_http(false).await;
    hub.manager.add(echo_backend_config("echo")).await.expect("backend registers");
    wait_until_connected(&hub, "echo").await;

    let endpoint = format!("http://{}/mcp", http.addr());
    let client = TestClient::connect_stream_http(StreamHttpConfig::new(endpoint))
        .await
        .expect("client connects over streamable http");

    let chain = serde_json::json!({
        "approval_granted": true,
        "steps": [
            {"id": "a", "server_name": "echo", "tool_name": "echo_read", "parallel_group": "g1", "arguments": {"message": "a"}},
            {"id": "b", "server_name": "echo", "tool_name": "echo_write", "parallel_group": "g1", "arguments": {"message": "b"}}
        ]
    });
    let result = client.call_tool(CALL_TOOL_CHAIN, Some(chain)).await.expect("call succeeds");
    assert_ne!(result.is_error, Some(true));
    let body: serde_json::Value = serde_json::from_str(&result_text(&result)).expect("json body");
    assert_eq!(body["status"], "completed");
    assert_eq!(body["aborted"], false);
    assert_eq!(body["steps"].as_array().expect("steps array").len(), 2);
    assert!(body["steps"].as_array().unwrap().iter().all(|s| s["success"] == true));

    client.shutdown().await.expect("client shuts down cleanly");
    http.shutdown();
    hub.shutdown().await;
}

#[tokio::test]
async fn meta_only_mode_hides_call_tool_chain_from_backend_dispatch_but_keeps_it_listed() {
    let (hub, http) = start_hub_with_http(true).await;
    let endpoint = format!("http://{}/mcp", http.addr());

    let client = TestClient::connect_stream_http(StreamHttpConfig::new(endpoint))
        .await
        .expect("client connects over streamable http");

    let tools = client.list_all_tools().await.expect("list tools");
    assert!(tools.iter().any(|t| t.name.as_ref() == CALL_TOOL_CHAIN));

    client.shutdown().await.expect("client shuts down cleanly");
    http.shutdown();
    hub.shutdown().await;
}
