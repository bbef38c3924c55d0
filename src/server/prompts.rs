//! Prompt fetches with a priority-ordered fallback chain.

use rmcp::ErrorData as McpError;
use rmcp::model::GetPromptResult;
use serde_json::{Map, Value};

use super::GroupProxyServer;
use crate::conflict;

/// Handle `prompts/get`.
///
/// Refs with the requested name are tried in document order; the first
/// success wins. When every candidate fails, the thrown error names the
/// prompt and carries the last backend error.
pub async fn get_prompt(
    server: &GroupProxyServer,
    name: &str,
    arguments: Option<Map<String, Value>>,
) -> Result<GetPromptResult, McpError> {
    let candidates = conflict::find_matching_prompt_refs(name, &server.prompt_refs);
    if candidates.is_empty() {
        return Err(McpError::invalid_params(
            format!("Prompt not found: {name}"),
            None,
        ));
    }

    let mut last_error = None;
    for candidate in candidates {
        match server
            .proxy
            .get_prompt_with_retry(&candidate.server_name, name, arguments.clone())
            .await
        {
            Ok(result) => return Ok(result),
            Err(error) => {
                tracing::warn!(
                    backend = candidate.server_name.as_str(),
                    prompt = name,
                    error = %error,
                    "prompt fetch failed, trying next candidate"
                );
                last_error = Some(error);
            }
        }
    }

    let last = last_error.map(|e| e.to_string()).unwrap_or_default();
    Err(McpError::internal_error(
        format!("Failed to get prompt {name} from all backends: {last}"),
        None,
    ))
}
