//! End-to-end test through real MCP framing on both sides: an upstream MCP
//! client talks to the proxy server over one duplex pipe, and the proxy
//! forwards to a mock backend over another.
#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rmcp::model::{
    CallToolRequestParams, CallToolResult, Content, Implementation, ListToolsResult,
    PaginatedRequestParams, ReadResourceRequestParams, ReadResourceResult, ResourceContents,
    ServerCapabilities, ServerInfo, Tool,
};
use rmcp::service::{RequestContext, RoleServer};
use rmcp::{ErrorData as McpError, ServerHandler};
use serde_json::json;

use mcp_groups::client::ClientManager;
use mcp_groups::config::{GroupConfig, ResourceRef, ToolOverride};
use mcp_groups::groups::{BackendCatalog, CatalogMap, GroupRegistry};
use mcp_groups::proxy::ProxyService;
use mcp_groups::server::GroupProxyServer;

/// Backend with a single `add` tool that actually adds, and one readable
/// resource template.
#[derive(Clone)]
struct CalcBackend;

#[allow(clippy::manual_async_fn)]
impl ServerHandler for CalcBackend {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: rmcp::model::ProtocolVersion::default(),
            capabilities: ServerCapabilities::builder()
                .enable_tools()
                .enable_resources()
                .build(),
            server_info: Implementation {
                name: "calc".to_string(),
                title: None,
                version: "0.1.0".to_string(),
                description: None,
                icons: None,
                website_url: None,
            },
            instructions: None,
        }
    }

    fn list_tools(
        &self,
        _request: Option<PaginatedRequestParams>,
        _context: RequestContext<RoleServer>,
    ) -> impl Future<Output = Result<ListToolsResult, McpError>> + Send + '_ {
        std::future::ready(Ok(ListToolsResult {
            tools: vec![Tool::new(
                "add".to_string(),
                "Add two numbers".to_string(),
                rmcp::model::object(json!({
                    "type": "object",
                    "required": ["a", "b"],
                    "properties": {
                        "a": {"type": "number"},
                        "b": {"type": "number"}
                    }
                })),
            )],
            ..Default::default()
        }))
    }

    fn call_tool(
        &self,
        request: CallToolRequestParams,
        _context: RequestContext<RoleServer>,
    ) -> impl Future<Output = Result<CallToolResult, McpError>> + Send + '_ {
        let args = request.arguments.unwrap_or_default();
        let a = args.get("a").and_then(serde_json::Value::as_f64).unwrap_or(0.0);
        let b = args.get("b").and_then(serde_json::Value::as_f64).unwrap_or(0.0);
        std::future::ready(Ok(CallToolResult::success(vec![Content::text(
            (a + b).to_string(),
        )])))
    }

    fn read_resource(
        &self,
        request: ReadResourceRequestParams,
        _context: RequestContext<RoleServer>,
    ) -> impl Future<Output = Result<ReadResourceResult, McpError>> + Send + '_ {
        std::future::ready(Ok(ReadResourceResult {
            contents: vec![ResourceContents::text("42", request.uri.clone())],
        }))
    }
}

/// Wire up backend, proxy, and an upstream client, all in-process.
async fn start_stack() -> rmcp::service::RunningService<rmcp::service::RoleClient, ()> {
    // Backend side.
    let manager = Arc::new(ClientManager::new(HashMap::new(), true));
    let (backend_client_io, backend_server_io) = tokio::io::duplex(8192);
    tokio::spawn(async move {
        let (read, write) = tokio::io::split(backend_server_io);
        if let Ok(service) = rmcp::serve_server(CalcBackend, (read, write)).await {
            let _ = service.waiting().await;
        }
    });
    tokio::task::yield_now().await;
    let (read, write) = tokio::io::split(backend_client_io);
    let backend_service = rmcp::ServiceExt::serve((), (read, write))
        .await
        .expect("backend handshake");
    manager.insert_running_service("calc", backend_service).await;

    let proxy = ProxyService::with_options(
        Arc::clone(&manager),
        Duration::from_secs(5),
        0,
        Duration::from_millis(1),
    );

    // Discover and assemble the group view.
    let mut catalog = CatalogMap::new();
    catalog.insert(
        "calc".to_string(),
        BackendCatalog {
            tools: proxy.list_tools("calc").await.unwrap(),
            ..Default::default()
        },
    );
    let registry = GroupRegistry::new(HashMap::from([(
        "math".to_string(),
        GroupConfig {
            name: "math".to_string(),
            description: Some("Arithmetic".to_string()),
            tools: vec![ToolOverride {
                server_name: "calc".to_string(),
                original_name: "add".to_string(),
                name: Some("sum".to_string()),
                description: Some("Sum two numbers".to_string()),
                input_schema: None,
                argument_mapping: None,
            }],
            resources: vec![ResourceRef {
                server_name: "calc".to_string(),
                uri: "calc://{value}".to_string(),
            }],
            prompts: vec![],
        },
    )]));
    let server = GroupProxyServer::assemble(&registry, &["math".to_string()], &catalog, proxy);

    // Frontend side: the proxy serves MCP over another duplex pipe.
    let (upstream_client_io, upstream_server_io) = tokio::io::duplex(8192);
    tokio::spawn(async move {
        let (read, write) = tokio::io::split(upstream_server_io);
        if let Ok(service) = rmcp::serve_server(server, (read, write)).await {
            let _ = service.waiting().await;
        }
    });
    tokio::task::yield_now().await;
    let (read, write) = tokio::io::split(upstream_client_io);
    rmcp::ServiceExt::serve((), (read, write))
        .await
        .expect("upstream handshake")
}

#[tokio::test]
async fn test_upstream_sees_renamed_tool_and_result() {
    let upstream = start_stack().await;

    let tools = upstream.peer().list_all_tools().await.unwrap();
    let names: Vec<&str> = tools.iter().map(|t| t.name.as_ref()).collect();
    assert_eq!(names, vec!["sum"]);
    assert_eq!(tools[0].description.as_deref(), Some("Sum two numbers"));

    let result = upstream
        .peer()
        .call_tool(CallToolRequestParams {
            meta: None,
            name: "sum".into(),
            arguments: json!({"a": 19.0, "b": 23.0}).as_object().cloned(),
            task: None,
        })
        .await
        .unwrap();
    assert_eq!(
        result.content[0].as_text().map(|t| t.text.as_str()),
        Some("42")
    );

    let _ = upstream.cancel().await;
}

#[tokio::test]
async fn test_upstream_tool_call_validation_error_is_mcp_result() {
    let upstream = start_stack().await;

    // Missing required arguments: the proxy answers with an isError result
    // instead of a protocol error.
    let result = upstream
        .peer()
        .call_tool(CallToolRequestParams {
            meta: None,
            name: "sum".into(),
            arguments: json!({"a": 1.0}).as_object().cloned(),
            task: None,
        })
        .await
        .unwrap();
    assert_eq!(result.is_error, Some(true));
    let text = result.content[0].as_text().unwrap().text.clone();
    assert!(text.contains("validation"), "got: {text}");

    let _ = upstream.cancel().await;
}

#[tokio::test]
async fn test_upstream_resource_read_routes_through_template_ref() {
    let upstream = start_stack().await;

    let result = upstream
        .peer()
        .read_resource(ReadResourceRequestParams {
            meta: None,
            uri: "calc://best".to_string(),
        })
        .await
        .unwrap();
    match &result.contents[0] {
        ResourceContents::TextResourceContents { text, .. } => assert_eq!(text, "42"),
        other => panic!("expected text contents, got {other:?}"),
    }

    let _ = upstream.cancel().await;
}

#[tokio::test]
async fn test_upstream_unknown_tool_is_protocol_error() {
    let upstream = start_stack().await;

    let err = upstream
        .peer()
        .call_tool(CallToolRequestParams {
            meta: None,
            name: "nope".into(),
            arguments: None,
            task: None,
        })
        .await
        .unwrap_err();
    assert!(
        err.to_string().contains("Tool not found"),
        "unexpected error: {err}"
    );

    let _ = upstream.cancel().await;
}
