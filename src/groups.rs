//! Group model: assembling per-group catalogs from backend capabilities.
//!
//! A group is a priority-ordered bundle of tool/resource/prompt references.
//! Catalog assembly applies tool overrides over what the backends actually
//! advertise, resolves refs against discovered resources and prompts, and
//! deduplicates first-wins across group order. Catalogs are computed once
//! after discovery and are immutable for the serving session.

use std::collections::{HashMap, HashSet};

use rmcp::model::{Prompt, Resource, ResourceTemplate, Tool};
use serde_json::Value;

use crate::config::{GroupConfig, PromptRef, ResourceRef, ToolOverride};
use crate::conflict;
use crate::mapping::ArgumentMapping;
use crate::uri_template;

/// Everything one backend advertises, discovered once at startup.
#[derive(Debug, Clone, Default)]
pub struct BackendCatalog {
    pub tools: Vec<Tool>,
    pub resources: Vec<Resource>,
    pub resource_templates: Vec<ResourceTemplate>,
    pub prompts: Vec<Prompt>,
}

/// Discovered catalogs keyed by backend name.
pub type CatalogMap = HashMap<String, BackendCatalog>;

/// An exposed tool plus everything the router needs to dispatch it.
pub struct ResolvedTool {
    /// The tool as exposed upstream (override applied).
    pub tool: Tool,
    pub server_name: String,
    pub original_name: String,
    pub mapping: Option<ArgumentMapping>,
    /// Validator compiled from the backend's own input schema. `None` when
    /// the backend schema is empty or fails to compile; validation is then
    /// skipped.
    pub validator: Option<jsonschema::Validator>,
}

impl ResolvedTool {
    pub fn exposed_name(&self) -> &str {
        &self.tool.name
    }
}

/// The loaded groups document plus catalog-assembly operations.
pub struct GroupRegistry {
    groups: HashMap<String, GroupConfig>,
}

impl GroupRegistry {
    pub fn new(groups: HashMap<String, GroupConfig>) -> Self {
        Self { groups }
    }

    /// All group names, sorted for stable display.
    pub fn group_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.groups.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn get_group(&self, name: &str) -> Option<&GroupConfig> {
        self.groups.get(name)
    }

    /// The valid groups among `names`, in the given order. Missing names are
    /// logged and skipped; this never fails.
    pub fn get_groups(&self, names: &[String]) -> Vec<&GroupConfig> {
        names
            .iter()
            .filter_map(|name| {
                let group = self.groups.get(name);
                if group.is_none() {
                    tracing::warn!(group = name.as_str(), "group not found, skipping");
                }
                group
            })
            .collect()
    }

    /// De-duplicated backend names referenced by any tool, resource, or
    /// prompt in the named groups. Insertion order is preserved.
    pub fn required_servers(&self, names: &[String]) -> Vec<String> {
        let mut servers = Vec::new();
        let mut seen = HashSet::new();
        for group in self.get_groups(names) {
            let referenced = group
                .tools
                .iter()
                .map(|t| t.server_name.as_str())
                .chain(group.resources.iter().map(|r| r.server_name.as_str()))
                .chain(group.prompts.iter().map(|p| p.server_name.as_str()));
            for server in referenced {
                if seen.insert(server.to_string()) {
                    servers.push(server.to_string());
                }
            }
        }
        servers
    }

    /// Exposed tools for the named groups: override application over the
    /// backend catalogs, missing backend tools skipped with a warning,
    /// deduplicated by exposed name (first wins).
    pub fn tools_for_groups(&self, names: &[String], catalog: &CatalogMap) -> Vec<ResolvedTool> {
        let mut resolved = Vec::new();
        let mut seen = HashSet::new();

        for group in self.get_groups(names) {
            for tool_ref in &group.tools {
                let Some(backend_tool) = catalog
                    .get(&tool_ref.server_name)
                    .and_then(|c| {
                        c.tools
                            .iter()
                            .find(|t| t.name.as_ref() == tool_ref.original_name)
                    })
                else {
                    tracing::warn!(
                        group = group.name.as_str(),
                        backend = tool_ref.server_name.as_str(),
                        tool = tool_ref.original_name.as_str(),
                        "referenced tool not advertised by backend, skipping"
                    );
                    continue;
                };

                if !seen.insert(tool_ref.exposed_name().to_string()) {
                    continue;
                }
                resolved.push(resolve_tool(tool_ref, backend_tool));
            }
        }
        resolved
    }

    /// Exposed (concrete) resources for the named groups: backend entries
    /// included as-is, deduplicated by URI, first wins across group order.
    ///
    /// Template refs are resolved separately through
    /// [`Self::resource_templates_for_groups`].
    pub fn resources_for_groups(&self, names: &[String], catalog: &CatalogMap) -> Vec<Resource> {
        let mut resources = Vec::new();
        for group in self.get_groups(names) {
            for resource_ref in &group.resources {
                if uri_template::is_template(&resource_ref.uri) {
                    continue;
                }
                let Some(resource) = catalog
                    .get(&resource_ref.server_name)
                    .and_then(|c| c.resources.iter().find(|r| r.raw.uri == resource_ref.uri))
                else {
                    tracing::warn!(
                        group = group.name.as_str(),
                        backend = resource_ref.server_name.as_str(),
                        uri = resource_ref.uri.as_str(),
                        "referenced resource not advertised by backend, skipping"
                    );
                    continue;
                };
                resources.push(resource.clone());
            }
        }
        conflict::deduplicate_resources(resources)
    }

    /// Exposed resource templates: template refs resolved against the
    /// backend resource-template catalogs, deduplicated by template URI.
    pub fn resource_templates_for_groups(
        &self,
        names: &[String],
        catalog: &CatalogMap,
    ) -> Vec<ResourceTemplate> {
        let mut templates = Vec::new();
        let mut seen = HashSet::new();
        for group in self.get_groups(names) {
            for resource_ref in &group.resources {
                if !uri_template::is_template(&resource_ref.uri) {
                    continue;
                }
                let Some(template) = catalog.get(&resource_ref.server_name).and_then(|c| {
                    c.resource_templates
                        .iter()
                        .find(|t| t.raw.uri_template == resource_ref.uri)
                }) else {
                    tracing::warn!(
                        group = group.name.as_str(),
                        backend = resource_ref.server_name.as_str(),
                        uri = resource_ref.uri.as_str(),
                        "referenced resource template not advertised by backend, skipping"
                    );
                    continue;
                };
                if seen.insert(template.raw.uri_template.clone()) {
                    templates.push(template.clone());
                }
            }
        }
        templates
    }

    /// Exposed prompts: backend entries included as-is, deduplicated by
    /// name, first wins across group order.
    pub fn prompts_for_groups(&self, names: &[String], catalog: &CatalogMap) -> Vec<Prompt> {
        let mut prompts = Vec::new();
        for group in self.get_groups(names) {
            for prompt_ref in &group.prompts {
                let Some(prompt) = catalog
                    .get(&prompt_ref.server_name)
                    .and_then(|c| c.prompts.iter().find(|p| p.name == prompt_ref.name))
                else {
                    tracing::warn!(
                        group = group.name.as_str(),
                        backend = prompt_ref.server_name.as_str(),
                        prompt = prompt_ref.name.as_str(),
                        "referenced prompt not advertised by backend, skipping"
                    );
                    continue;
                };
                prompts.push(prompt.clone());
            }
        }
        conflict::deduplicate_prompts(prompts)
    }

    /// The full priority-ordered resource ref list for the named groups, the
    /// routing table for `resources/read`.
    pub fn resource_refs_for_groups(&self, names: &[String]) -> Vec<ResourceRef> {
        self.get_groups(names)
            .iter()
            .flat_map(|g| g.resources.iter().cloned())
            .collect()
    }

    /// The full priority-ordered prompt ref list, the routing table for
    /// `prompts/get`.
    pub fn prompt_refs_for_groups(&self, names: &[String]) -> Vec<PromptRef> {
        self.get_groups(names)
            .iter()
            .flat_map(|g| g.prompts.iter().cloned())
            .collect()
    }
}

/// Build the exposed tool from a backend tool plus its override, compiling
/// the backend-schema validator for the call path.
fn resolve_tool(tool_ref: &ToolOverride, backend_tool: &Tool) -> ResolvedTool {
    let mut tool = backend_tool.clone();
    tool.name = tool_ref.exposed_name().to_string().into();
    if let Some(description) = &tool_ref.description {
        tool.description = Some(description.clone().into());
    }
    if let Some(schema) = &tool_ref.input_schema {
        tool.input_schema = std::sync::Arc::new(schema.clone());
    }

    let validator = compile_validator(
        &tool_ref.server_name,
        &tool_ref.original_name,
        backend_tool.input_schema.as_ref(),
    );

    ResolvedTool {
        tool,
        server_name: tool_ref.server_name.clone(),
        original_name: tool_ref.original_name.clone(),
        mapping: tool_ref.argument_mapping.clone(),
        validator,
    }
}

/// Compile a JSON-Schema validator from a backend input schema. An empty
/// schema counts as unknown; a schema that fails to compile is logged and
/// skipped rather than failing closed.
fn compile_validator(
    server: &str,
    tool: &str,
    schema: &serde_json::Map<String, Value>,
) -> Option<jsonschema::Validator> {
    if schema.is_empty() {
        return None;
    }
    match jsonschema::validator_for(&Value::Object(schema.clone())) {
        Ok(validator) => Some(validator),
        Err(error) => {
            tracing::warn!(
                backend = server,
                tool,
                error = %error,
                "backend input schema does not compile, skipping argument validation"
            );
            None
        }
    }
}

/// Log conflicts detected in the assembled routing tables. Advisory only:
/// dedup and priority ordering already decide runtime behavior.
pub fn warn_conflicts(resource_refs: &[ResourceRef], prompt_refs: &[PromptRef]) {
    for c in conflict::detect_resource_conflicts(resource_refs) {
        tracing::warn!(
            kind = ?c.kind,
            first_backend = c.first.server_name.as_str(),
            first_uri = c.first.uri.as_str(),
            second_backend = c.second.server_name.as_str(),
            second_uri = c.second.uri.as_str(),
            example_uri = c.example_uri.as_str(),
            "resource refs conflict; the earlier ref wins for matching URIs"
        );
    }
    for c in conflict::detect_prompt_conflicts(prompt_refs) {
        tracing::warn!(
            prompt = c.name.as_str(),
            first_backend = c.first.server_name.as_str(),
            second_backend = c.second.server_name.as_str(),
            "duplicate prompt name across refs; the earlier ref wins"
        );
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]
    use super::*;
    use serde_json::json;

    fn tool(name: &str, schema: Value) -> Tool {
        Tool::new(
            name.to_string(),
            format!("{name} tool"),
            rmcp::model::object(schema),
        )
    }

    fn resource(uri: &str) -> Resource {
        serde_json::from_value(json!({"uri": uri, "name": uri})).unwrap()
    }

    fn resource_template(uri_template: &str) -> ResourceTemplate {
        serde_json::from_value(json!({"uriTemplate": uri_template, "name": uri_template})).unwrap()
    }

    fn prompt(name: &str) -> Prompt {
        serde_json::from_value(json!({"name": name, "description": "test prompt"})).unwrap()
    }

    fn tool_ref(server: &str, original: &str, exposed: Option<&str>) -> ToolOverride {
        ToolOverride {
            server_name: server.to_string(),
            original_name: original.to_string(),
            name: exposed.map(str::to_string),
            description: None,
            input_schema: None,
            argument_mapping: None,
        }
    }

    fn group(
        name: &str,
        tools: Vec<ToolOverride>,
        resources: Vec<ResourceRef>,
        prompts: Vec<PromptRef>,
    ) -> GroupConfig {
        GroupConfig {
            name: name.to_string(),
            description: None,
            tools,
            resources,
            prompts,
        }
    }

    fn sample_catalog() -> CatalogMap {
        let mut catalog = CatalogMap::new();
        catalog.insert(
            "calc".to_string(),
            BackendCatalog {
                tools: vec![
                    tool(
                        "add",
                        json!({
                            "type": "object",
                            "required": ["a", "b"],
                            "properties": {
                                "a": {"type": "number"},
                                "b": {"type": "number"}
                            }
                        }),
                    ),
                    tool("mul", json!({"type": "object", "properties": {}})),
                ],
                ..Default::default()
            },
        );
        catalog.insert(
            "files".to_string(),
            BackendCatalog {
                resources: vec![resource("file:///etc/hosts")],
                resource_templates: vec![resource_template("file:///{+path}")],
                prompts: vec![prompt("draft")],
                ..Default::default()
            },
        );
        catalog
    }

    fn registry() -> GroupRegistry {
        let groups = HashMap::from([
            (
                "math".to_string(),
                group(
                    "math",
                    vec![
                        tool_ref("calc", "add", Some("sum")),
                        tool_ref("calc", "missing", None),
                    ],
                    vec![],
                    vec![],
                ),
            ),
            (
                "fs".to_string(),
                group(
                    "fs",
                    vec![tool_ref("calc", "mul", Some("sum"))],
                    vec![
                        ResourceRef {
                            server_name: "files".to_string(),
                            uri: "file:///etc/hosts".to_string(),
                        },
                        ResourceRef {
                            server_name: "files".to_string(),
                            uri: "file:///{+path}".to_string(),
                        },
                    ],
                    vec![PromptRef {
                        server_name: "files".to_string(),
                        name: "draft".to_string(),
                    }],
                ),
            ),
        ]);
        GroupRegistry::new(groups)
    }

    #[test]
    fn test_get_groups_skips_missing() {
        let registry = registry();
        let names = vec!["math".to_string(), "ghost".to_string(), "fs".to_string()];
        let groups = registry.get_groups(&names);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].name, "math");
        assert_eq!(groups[1].name, "fs");
    }

    #[test]
    fn test_required_servers_insertion_order_dedup() {
        let registry = registry();
        let names = vec!["math".to_string(), "fs".to_string()];
        assert_eq!(registry.required_servers(&names), vec!["calc", "files"]);
    }

    #[test]
    fn test_empty_group_list_is_empty_everything() {
        let registry = registry();
        let catalog = sample_catalog();
        assert!(registry.required_servers(&[]).is_empty());
        assert!(registry.tools_for_groups(&[], &catalog).is_empty());
        assert!(registry.resources_for_groups(&[], &catalog).is_empty());
        assert!(registry.prompts_for_groups(&[], &catalog).is_empty());
    }

    #[test]
    fn test_tools_apply_overrides_and_skip_missing() {
        let registry = registry();
        let catalog = sample_catalog();
        let names = vec!["math".to_string()];
        let tools = registry.tools_for_groups(&names, &catalog);
        // "missing" is not advertised by the backend and is skipped.
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].exposed_name(), "sum");
        assert_eq!(tools[0].original_name, "add");
        assert_eq!(tools[0].server_name, "calc");
        // The backend's description survives when not overridden.
        assert_eq!(tools[0].tool.description.as_deref(), Some("add tool"));
        assert!(tools[0].validator.is_some());
    }

    #[test]
    fn test_tool_dedup_by_exposed_name_first_wins() {
        let registry = registry();
        let catalog = sample_catalog();
        let names = vec!["math".to_string(), "fs".to_string()];
        let tools = registry.tools_for_groups(&names, &catalog);
        // Both groups expose "sum": the math group's add wins over fs's mul.
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].original_name, "add");
    }

    #[test]
    fn test_tool_description_and_schema_override() {
        let catalog = sample_catalog();
        let mut tool_ref = tool_ref("calc", "add", Some("sum"));
        tool_ref.description = Some("Sum two values".to_string());
        tool_ref.input_schema = Some(
            json!({"type": "object", "properties": {"x": {"type": "number"}}})
                .as_object()
                .cloned()
                .unwrap(),
        );
        let groups = HashMap::from([(
            "g".to_string(),
            group("g", vec![tool_ref], vec![], vec![]),
        )]);
        let registry = GroupRegistry::new(groups);
        let tools = registry.tools_for_groups(&["g".to_string()], &catalog);
        assert_eq!(tools[0].tool.description.as_deref(), Some("Sum two values"));
        assert!(tools[0].tool.input_schema.contains_key("properties"));
        // The validator still targets the backend schema, not the override.
        let validator = tools[0].validator.as_ref().unwrap();
        assert!(!validator.is_valid(&json!({})));
        assert!(validator.is_valid(&json!({"a": 1, "b": 2})));
    }

    #[test]
    fn test_resources_resolved_as_is_and_deduped() {
        let registry = registry();
        let catalog = sample_catalog();
        let names = vec!["fs".to_string(), "fs".to_string()];
        let resources = registry.resources_for_groups(&names, &catalog);
        assert_eq!(resources.len(), 1);
        assert_eq!(resources[0].raw.uri, "file:///etc/hosts");
    }

    #[test]
    fn test_template_refs_resolve_to_resource_templates() {
        let registry = registry();
        let catalog = sample_catalog();
        let names = vec!["fs".to_string()];
        let templates = registry.resource_templates_for_groups(&names, &catalog);
        assert_eq!(templates.len(), 1);
        assert_eq!(templates[0].raw.uri_template, "file:///{+path}");
    }

    #[test]
    fn test_prompts_resolved_and_deduped() {
        let registry = registry();
        let catalog = sample_catalog();
        let names = vec!["fs".to_string()];
        let prompts = registry.prompts_for_groups(&names, &catalog);
        assert_eq!(prompts.len(), 1);
        assert_eq!(prompts[0].name, "draft");
    }

    #[test]
    fn test_group_of_only_missing_backends_exposes_nothing() {
        let registry = registry();
        // A catalog with no backends at all: everything is skipped.
        let catalog = CatalogMap::new();
        let names = vec!["math".to_string(), "fs".to_string()];
        assert!(registry.tools_for_groups(&names, &catalog).is_empty());
        assert!(registry.resources_for_groups(&names, &catalog).is_empty());
        assert!(registry.prompts_for_groups(&names, &catalog).is_empty());
    }

    #[test]
    fn test_refs_preserve_priority_order() {
        let registry = registry();
        let names = vec!["fs".to_string()];
        let refs = registry.resource_refs_for_groups(&names);
        assert_eq!(refs.len(), 2);
        assert_eq!(refs[0].uri, "file:///etc/hosts");
        assert_eq!(refs[1].uri, "file:///{+path}");
    }
}
