//! Tool dispatch: override lookup, argument rewriting, schema validation,
//! backend invocation.

use rmcp::ErrorData as McpError;
use rmcp::model::{CallToolRequestParams, CallToolResult, Content};
use serde_json::Value;

use super::GroupProxyServer;
use crate::groups::ResolvedTool;
use crate::mapping;

/// Locate the tool a request names: first match on exposed name across the
/// active groups in order, then a fallback pass on the backend's original
/// name.
fn find_tool<'a>(server: &'a GroupProxyServer, name: &str) -> Option<&'a ResolvedTool> {
    server
        .tools
        .iter()
        .find(|t| t.exposed_name() == name)
        .or_else(|| server.tools.iter().find(|t| t.original_name == name))
}

/// Join the text content of a tool result, for surfacing `isError` results
/// as thrown errors.
fn joined_text(result: &CallToolResult) -> String {
    let text = result
        .content
        .iter()
        .filter_map(|c| c.as_text().map(|t| t.text.as_str()))
        .collect::<Vec<_>>()
        .join("\n");
    if text.is_empty() {
        "tool call failed".to_string()
    } else {
        text
    }
}

/// Handle `tools/call`.
///
/// Argument-validation failures come back as an MCP result with
/// `isError: true` (not a thrown error) and the backend is not invoked.
/// A backend result carrying `isError: true` is thrown with the joined text
/// content as its message.
pub async fn call_tool(
    server: &GroupProxyServer,
    request: CallToolRequestParams,
) -> Result<CallToolResult, McpError> {
    let name = request.name.as_ref();
    let Some(tool) = find_tool(server, name) else {
        return Err(McpError::invalid_params(
            format!("Tool not found: {name}"),
            None,
        ));
    };

    let client_args = request.arguments.unwrap_or_default();
    let backend_args = tool
        .mapping
        .as_ref()
        .map_or_else(|| client_args.clone(), |m| mapping::apply_mapping(&client_args, m));

    if let Some(validator) = &tool.validator {
        let candidate = Value::Object(backend_args.clone());
        if !validator.is_valid(&candidate) {
            let details = validator
                .iter_errors(&candidate)
                .map(|e| e.to_string())
                .collect::<Vec<_>>()
                .join("; ");
            tracing::warn!(
                tool = name,
                backend = tool.server_name.as_str(),
                details = details.as_str(),
                "rejecting tool call: argument validation failed"
            );
            return Ok(CallToolResult::error(vec![Content::text(format!(
                "Argument validation failed for tool '{name}': {details}"
            ))]));
        }
    }

    let arguments = if backend_args.is_empty() {
        None
    } else {
        Some(backend_args)
    };
    let result = server
        .proxy
        .call_tool_with_retry(&tool.server_name, &tool.original_name, arguments)
        .await
        .map_err(|e| McpError::internal_error(e.to_string(), None))?;

    if result.is_error == Some(true) {
        return Err(McpError::internal_error(joined_text(&result), None));
    }
    Ok(result)
}
