//! Thin request facade over the client manager.
//!
//! Every backend call gets a per-call timeout and backend-context error
//! wrapping; the mutating operations also get linear-backoff retry wrappers
//! and a concurrent batch entry point. Tool results are returned verbatim
//! (including `isError`); deciding whether an `isError` result becomes a
//! thrown error is the frontend router's job.

use std::sync::Arc;
use std::time::Duration;

use rmcp::model::{
    CallToolRequestParams, CallToolResult, GetPromptRequestParams, GetPromptResult, Prompt,
    ReadResourceRequestParams, ReadResourceResult, Resource, ResourceTemplate, Tool,
};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::client::ClientManager;

/// Default per-call timeout for backend round-trips.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);
/// Default number of retries after the first attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 2;
/// Base delay for linear retry backoff (`retry_delay × attempt`).
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(1000);

/// A backend call failure with its originating context.
#[derive(Debug, Error)]
#[error("{server}.{operation} failed: {source}")]
pub struct ProxyError {
    pub server: String,
    pub operation: &'static str,
    #[source]
    pub source: Box<dyn std::error::Error + Send + Sync>,
}

impl ProxyError {
    fn new(
        server: &str,
        operation: &'static str,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self {
            server: server.to_string(),
            operation,
            source: source.into(),
        }
    }
}

/// One entry of a batch tool-call fan-out.
#[derive(Debug, Clone)]
pub struct ToolCallItem {
    pub server_name: String,
    pub tool_name: String,
    pub arguments: Option<Map<String, Value>>,
    pub timeout: Option<Duration>,
}

/// Request facade shared by the frontend router and startup discovery.
#[derive(Clone)]
pub struct ProxyService {
    clients: Arc<ClientManager>,
    default_timeout: Duration,
    max_retries: u32,
    retry_delay: Duration,
}

impl ProxyService {
    pub fn new(clients: Arc<ClientManager>) -> Self {
        Self::with_options(
            clients,
            DEFAULT_CALL_TIMEOUT,
            DEFAULT_MAX_RETRIES,
            DEFAULT_RETRY_DELAY,
        )
    }

    pub fn with_options(
        clients: Arc<ClientManager>,
        default_timeout: Duration,
        max_retries: u32,
        retry_delay: Duration,
    ) -> Self {
        Self {
            clients,
            default_timeout,
            max_retries,
            retry_delay,
        }
    }

    /// The underlying client manager (for shutdown and introspection).
    pub fn clients(&self) -> &Arc<ClientManager> {
        &self.clients
    }

    /// Race an operation against a timer.
    ///
    /// The operation is spawned as its own task: when the timer wins, the
    /// caller rejects but the request keeps running in the background and its
    /// eventual response is discarded (MCP has no cancellation primitive for
    /// in-flight requests here).
    async fn with_timeout<T, F>(
        &self,
        server: &str,
        operation: &'static str,
        timeout: Option<Duration>,
        fut: F,
    ) -> Result<T, ProxyError>
    where
        T: Send + 'static,
        F: Future<Output = Result<T, rmcp::service::ServiceError>> + Send + 'static,
    {
        let timeout = timeout.unwrap_or(self.default_timeout);
        let handle = tokio::spawn(fut);
        match tokio::time::timeout(timeout, handle).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(error))) => Err(ProxyError::new(server, operation, error)),
            Ok(Err(join_error)) => Err(ProxyError::new(server, operation, join_error)),
            Err(_elapsed) => Err(ProxyError::new(
                server,
                operation,
                anyhow::anyhow!("request timed out after {}ms", timeout.as_millis()),
            )),
        }
    }

    async fn client_for(
        &self,
        server: &str,
        operation: &'static str,
    ) -> Result<crate::client::BackendClient, ProxyError> {
        self.clients
            .ensure_connected(server, None)
            .await
            .map_err(|e| ProxyError::new(server, operation, e))
    }

    /// Invoke a tool once. The result is returned verbatim, `isError`
    /// included.
    pub async fn call_tool(
        &self,
        server: &str,
        tool_name: &str,
        arguments: Option<Map<String, Value>>,
        timeout: Option<Duration>,
    ) -> Result<CallToolResult, ProxyError> {
        let client = self.client_for(server, "tools/call").await?;
        let params = CallToolRequestParams {
            meta: None,
            name: tool_name.to_string().into(),
            arguments,
            task: None,
        };
        self.with_timeout(server, "tools/call", timeout, async move {
            client.call_tool(params).await
        })
        .await
    }

    /// Read a resource once, returning the MCP `contents` structure
    /// unchanged.
    pub async fn read_resource(
        &self,
        server: &str,
        uri: &str,
        timeout: Option<Duration>,
    ) -> Result<ReadResourceResult, ProxyError> {
        let client = self.client_for(server, "resources/read").await?;
        let params = ReadResourceRequestParams {
            meta: None,
            uri: uri.to_string(),
        };
        self.with_timeout(server, "resources/read", timeout, async move {
            client.read_resource(params).await
        })
        .await
    }

    /// Fetch a prompt once, returning the MCP `messages` structure unchanged.
    pub async fn get_prompt(
        &self,
        server: &str,
        prompt_name: &str,
        arguments: Option<Map<String, Value>>,
        timeout: Option<Duration>,
    ) -> Result<GetPromptResult, ProxyError> {
        let client = self.client_for(server, "prompts/get").await?;
        let params = GetPromptRequestParams {
            meta: None,
            name: prompt_name.to_string(),
            arguments,
        };
        self.with_timeout(server, "prompts/get", timeout, async move {
            client.get_prompt(params).await
        })
        .await
    }

    // ---- Discovery (startup catalog assembly) ----

    pub async fn list_tools(&self, server: &str) -> Result<Vec<Tool>, ProxyError> {
        let client = self.client_for(server, "tools/list").await?;
        self.with_timeout(server, "tools/list", None, async move {
            client.list_all_tools().await
        })
        .await
    }

    pub async fn list_resources(&self, server: &str) -> Result<Vec<Resource>, ProxyError> {
        let client = self.client_for(server, "resources/list").await?;
        self.with_timeout(server, "resources/list", None, async move {
            client.list_all_resources().await
        })
        .await
    }

    pub async fn list_resource_templates(
        &self,
        server: &str,
    ) -> Result<Vec<ResourceTemplate>, ProxyError> {
        let client = self.client_for(server, "resources/templates/list").await?;
        self.with_timeout(server, "resources/templates/list", None, async move {
            client.list_all_resource_templates().await
        })
        .await
    }

    pub async fn list_prompts(&self, server: &str) -> Result<Vec<Prompt>, ProxyError> {
        let client = self.client_for(server, "prompts/list").await?;
        self.with_timeout(server, "prompts/list", None, async move {
            client.list_all_prompts().await
        })
        .await
    }

    // ---- Retry wrappers ----

    /// Linear-backoff retry driver. `max_retries` counts retries after the
    /// initial attempt; zero retries means exactly one attempt.
    async fn with_retry<T, F, Fut>(
        &self,
        server: &str,
        operation: &'static str,
        mut op: F,
    ) -> Result<T, ProxyError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProxyError>>,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(error) => {
                    if attempt > self.max_retries {
                        tracing::error!(
                            backend = server,
                            operation,
                            max_retries = self.max_retries,
                            error = %error,
                            "backend call failed after retries"
                        );
                        return Err(error);
                    }
                    tracing::warn!(
                        backend = server,
                        operation,
                        attempt,
                        max_retries = self.max_retries,
                        error = %error,
                        "backend call failed, retrying"
                    );
                    tokio::time::sleep(self.retry_delay * attempt).await;
                }
            }
        }
    }

    pub async fn call_tool_with_retry(
        &self,
        server: &str,
        tool_name: &str,
        arguments: Option<Map<String, Value>>,
    ) -> Result<CallToolResult, ProxyError> {
        self.with_retry(server, "tools/call", || {
            self.call_tool(server, tool_name, arguments.clone(), None)
        })
        .await
    }

    pub async fn read_resource_with_retry(
        &self,
        server: &str,
        uri: &str,
    ) -> Result<ReadResourceResult, ProxyError> {
        self.with_retry(server, "resources/read", || {
            self.read_resource(server, uri, None)
        })
        .await
    }

    pub async fn get_prompt_with_retry(
        &self,
        server: &str,
        prompt_name: &str,
        arguments: Option<Map<String, Value>>,
    ) -> Result<GetPromptResult, ProxyError> {
        self.with_retry(server, "prompts/get", || {
            self.get_prompt(server, prompt_name, arguments.clone(), None)
        })
        .await
    }

    /// Invoke a batch of tool calls concurrently with independent per-item
    /// timeouts. Never fails as a whole; results are in input order.
    pub async fn call_tools_batch(
        &self,
        items: Vec<ToolCallItem>,
    ) -> Vec<Result<CallToolResult, ProxyError>> {
        let futures: Vec<_> = items
            .into_iter()
            .map(|item| async move {
                self.call_tool(
                    &item.server_name,
                    &item.tool_name,
                    item.arguments,
                    item.timeout,
                )
                .await
            })
            .collect();
        futures::future::join_all(futures).await
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn empty_proxy(max_retries: u32) -> ProxyService {
        ProxyService::with_options(
            Arc::new(ClientManager::new(HashMap::new(), true)),
            Duration::from_millis(200),
            max_retries,
            Duration::from_millis(1),
        )
    }

    #[tokio::test]
    async fn test_error_is_wrapped_with_backend_context() {
        let proxy = empty_proxy(0);
        let err = proxy.call_tool("calc", "add", None, None).await.unwrap_err();
        let message = err.to_string();
        assert!(
            message.starts_with("calc.tools/call failed:"),
            "unexpected wrapping: {message}"
        );
        assert!(message.contains("unknown backend"));
    }

    #[tokio::test]
    async fn test_zero_retries_is_single_attempt() {
        let proxy = empty_proxy(0);
        let calls = AtomicU32::new(0);
        let result: Result<(), ProxyError> = proxy
            .with_retry("calc", "tools/call", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(ProxyError::new("calc", "tools/call", anyhow::anyhow!("boom"))) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retries_then_succeeds() {
        let proxy = empty_proxy(2);
        let calls = AtomicU32::new(0);
        let result = proxy
            .with_retry("calc", "tools/call", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(ProxyError::new("calc", "tools/call", anyhow::anyhow!("boom")))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retries_exhausted_returns_last_error() {
        let proxy = empty_proxy(2);
        let calls = AtomicU32::new(0);
        let result: Result<(), ProxyError> = proxy
            .with_retry("calc", "tools/call", || {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    Err(ProxyError::new(
                        "calc",
                        "tools/call",
                        anyhow::anyhow!("failure {n}"),
                    ))
                }
            })
            .await;
        let err = result.unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(err.to_string().contains("failure 3"), "got: {err}");
    }

    #[tokio::test]
    async fn test_batch_never_throws_and_preserves_order() {
        let proxy = empty_proxy(0);
        let results = proxy
            .call_tools_batch(vec![
                ToolCallItem {
                    server_name: "a".to_string(),
                    tool_name: "one".to_string(),
                    arguments: None,
                    timeout: None,
                },
                ToolCallItem {
                    server_name: "b".to_string(),
                    tool_name: "two".to_string(),
                    arguments: None,
                    timeout: None,
                },
            ])
            .await;
        assert_eq!(results.len(), 2);
        assert!(results[0].as_ref().unwrap_err().to_string().contains("a.tools/call"));
        assert!(results[1].as_ref().unwrap_err().to_string().contains("b.tools/call"));
    }
}
