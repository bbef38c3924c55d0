//! Resource reads with a priority-ordered fallback chain.

use rmcp::ErrorData as McpError;
use rmcp::model::ReadResourceResult;

use super::GroupProxyServer;
use crate::conflict;

/// Handle `resources/read`.
///
/// All refs matching the URI (exact or template) are tried in document
/// order; the first success wins. When every candidate fails, the thrown
/// error names the URI and carries the last backend error.
pub async fn read_resource(
    server: &GroupProxyServer,
    uri: &str,
) -> Result<ReadResourceResult, McpError> {
    let candidates = conflict::find_matching_resource_refs(uri, &server.resource_refs);
    if candidates.is_empty() {
        return Err(McpError::resource_not_found(
            format!("Resource not found: {uri}"),
            None,
        ));
    }

    let mut last_error = None;
    for candidate in candidates {
        match server
            .proxy
            .read_resource_with_retry(&candidate.server_name, uri)
            .await
        {
            Ok(result) => return Ok(result),
            Err(error) => {
                tracing::warn!(
                    backend = candidate.server_name.as_str(),
                    uri,
                    error = %error,
                    "resource read failed, trying next candidate"
                );
                last_error = Some(error);
            }
        }
    }

    let last = last_error.map(|e| e.to_string()).unwrap_or_default();
    Err(McpError::internal_error(
        format!("Failed to read resource {uri} from all backends: {last}"),
        None,
    ))
}
