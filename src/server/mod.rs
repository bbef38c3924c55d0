//! Frontend router: the MCP server surface bound to stdio.
//!
//! [`GroupProxyServer`] holds the catalogs assembled for the active group
//! set and dispatches requests through the proxy service. Catalogs are
//! computed once at startup and never change during a serving session.

pub mod prompts;
pub mod resources;
pub mod tools;

use rmcp::model::{
    CallToolRequestParams, CallToolResult, GetPromptRequestParams, GetPromptResult,
    Implementation, ListPromptsResult, ListResourceTemplatesResult, ListResourcesResult,
    ListToolsResult, PaginatedRequestParams, Prompt, ReadResourceRequestParams,
    ReadResourceResult, Resource, ResourceTemplate, ServerCapabilities, ServerInfo,
};
use rmcp::service::{RequestContext, RoleServer};
use rmcp::{ErrorData as McpError, ServerHandler};

use crate::config::{PromptRef, ResourceRef};
use crate::groups::{CatalogMap, GroupRegistry, ResolvedTool};
use crate::proxy::ProxyService;

/// The aggregated per-group view served over stdio.
pub struct GroupProxyServer {
    group_names: Vec<String>,
    instructions: String,
    pub(crate) tools: Vec<ResolvedTool>,
    pub(crate) resources: Vec<Resource>,
    pub(crate) resource_templates: Vec<ResourceTemplate>,
    pub(crate) prompts: Vec<Prompt>,
    /// Priority-ordered routing table for `resources/read`.
    pub(crate) resource_refs: Vec<ResourceRef>,
    /// Priority-ordered routing table for `prompts/get`.
    pub(crate) prompt_refs: Vec<PromptRef>,
    pub(crate) proxy: ProxyService,
}

impl GroupProxyServer {
    /// Assemble the exposed catalogs for the active group set from the
    /// discovered backend capabilities. Conflicts in the routing tables are
    /// logged here.
    pub fn assemble(
        registry: &GroupRegistry,
        group_names: &[String],
        catalog: &CatalogMap,
        proxy: ProxyService,
    ) -> Self {
        let tools = registry.tools_for_groups(group_names, catalog);
        let resources = registry.resources_for_groups(group_names, catalog);
        let resource_templates = registry.resource_templates_for_groups(group_names, catalog);
        let prompts = registry.prompts_for_groups(group_names, catalog);
        let resource_refs = registry.resource_refs_for_groups(group_names);
        let prompt_refs = registry.prompt_refs_for_groups(group_names);

        crate::groups::warn_conflicts(&resource_refs, &prompt_refs);

        let summaries: Vec<String> = registry
            .get_groups(group_names)
            .iter()
            .map(|g| {
                g.description.as_ref().map_or_else(
                    || g.name.clone(),
                    |desc| format!("{}: {desc}", g.name),
                )
            })
            .collect();
        let instructions = format!(
            "Aggregating MCP proxy serving the groups: {}. \
             Tools, resources, and prompts listed here are forwarded to the \
             backend servers that provide them.",
            summaries.join("; ")
        );

        tracing::info!(
            groups = group_names.len(),
            tools = tools.len(),
            resources = resources.len(),
            resource_templates = resource_templates.len(),
            prompts = prompts.len(),
            "assembled group catalogs"
        );

        Self {
            group_names: group_names.to_vec(),
            instructions,
            tools,
            resources,
            resource_templates,
            prompts,
            resource_refs,
            prompt_refs,
            proxy,
        }
    }

    /// The group names this server was started with.
    pub fn group_names(&self) -> &[String] {
        &self.group_names
    }

    /// The exposed tool set, in priority order after dedup.
    pub fn tools(&self) -> &[ResolvedTool] {
        &self.tools
    }

    /// The exposed concrete resources.
    pub fn resources(&self) -> &[Resource] {
        &self.resources
    }

    /// The exposed resource templates.
    pub fn resource_templates(&self) -> &[ResourceTemplate] {
        &self.resource_templates
    }

    /// The exposed prompts.
    pub fn prompts(&self) -> &[Prompt] {
        &self.prompts
    }

    fn server_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: rmcp::model::ProtocolVersion::default(),
            capabilities: ServerCapabilities::builder()
                .enable_tools()
                .enable_resources()
                .enable_prompts()
                .build(),
            server_info: Implementation {
                name: "mcp-groups".to_string(),
                title: Some("mcp-groups".to_string()),
                version: env!("CARGO_PKG_VERSION").to_string(),
                description: Some(
                    "Aggregating MCP proxy with per-group views over backend servers".to_string(),
                ),
                icons: None,
                website_url: None,
            },
            instructions: Some(self.instructions.clone()),
        }
    }
}

#[allow(clippy::manual_async_fn)]
impl ServerHandler for GroupProxyServer {
    fn get_info(&self) -> ServerInfo {
        self.server_info()
    }

    fn list_tools(
        &self,
        _request: Option<PaginatedRequestParams>,
        _context: RequestContext<RoleServer>,
    ) -> impl Future<Output = Result<ListToolsResult, McpError>> + Send + '_ {
        std::future::ready(Ok(ListToolsResult {
            tools: self.tools.iter().map(|t| t.tool.clone()).collect(),
            ..Default::default()
        }))
    }

    fn call_tool(
        &self,
        request: CallToolRequestParams,
        _context: RequestContext<RoleServer>,
    ) -> impl Future<Output = Result<CallToolResult, McpError>> + Send + '_ {
        async move { tools::call_tool(self, request).await }
    }

    fn list_resources(
        &self,
        _request: Option<PaginatedRequestParams>,
        _context: RequestContext<RoleServer>,
    ) -> impl Future<Output = Result<ListResourcesResult, McpError>> + Send + '_ {
        std::future::ready(Ok(ListResourcesResult {
            resources: self.resources.clone(),
            ..Default::default()
        }))
    }

    fn list_resource_templates(
        &self,
        _request: Option<PaginatedRequestParams>,
        _context: RequestContext<RoleServer>,
    ) -> impl Future<Output = Result<ListResourceTemplatesResult, McpError>> + Send + '_ {
        std::future::ready(Ok(ListResourceTemplatesResult {
            resource_templates: self.resource_templates.clone(),
            ..Default::default()
        }))
    }

    fn read_resource(
        &self,
        request: ReadResourceRequestParams,
        _context: RequestContext<RoleServer>,
    ) -> impl Future<Output = Result<ReadResourceResult, McpError>> + Send + '_ {
        async move { resources::read_resource(self, &request.uri).await }
    }

    fn list_prompts(
        &self,
        _request: Option<PaginatedRequestParams>,
        _context: RequestContext<RoleServer>,
    ) -> impl Future<Output = Result<ListPromptsResult, McpError>> + Send + '_ {
        std::future::ready(Ok(ListPromptsResult {
            prompts: self.prompts.clone(),
            ..Default::default()
        }))
    }

    fn get_prompt(
        &self,
        request: GetPromptRequestParams,
        _context: RequestContext<RoleServer>,
    ) -> impl Future<Output = Result<GetPromptResult, McpError>> + Send + '_ {
        async move { prompts::get_prompt(self, &request.name, request.arguments).await }
    }
}
