//! Configuration documents loaded at startup.
//!
//! Two JSON files live under the platform config directory (Linux XDG,
//! macOS Application Support, Windows AppData):
//!
//! - `backend-servers.json` - `{ "mcpServers": { "<name>": { ... } } }`
//! - `groups.json` - `{ "groups": { "<name>": { ... } } }`
//!
//! Unknown keys are ignored. Schema violations and dangling references are
//! fatal at load; unsupported backend transports parse here and are rejected
//! by the client manager when a connection is attempted.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::mapping::ArgumentMapping;

/// File name of the backend server document.
pub const BACKENDS_FILE: &str = "backend-servers.json";
/// File name of the groups document.
pub const GROUPS_FILE: &str = "groups.json";

/// Application namespace under the platform config directory.
const APP_DIR: &str = "mcp-groups";

/// Backend entry as written in `backend-servers.json`. The `type` field is
/// optional; absent means stdio when a `command` is present.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawBackendEntry {
    #[serde(rename = "type")]
    pub transport: Option<String>,
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    pub url: Option<String>,
}

/// Resolved backend transport configuration.
///
/// The serving core only connects stdio backends; the other variants are
/// recognized so configs written for a later revision still parse, and the
/// client manager rejects them with an error naming the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendServerConfig {
    Stdio {
        command: String,
        args: Vec<String>,
        env: HashMap<String, String>,
    },
    StreamableHttp {
        url: String,
    },
    Sse {
        url: String,
    },
}

impl BackendServerConfig {
    /// Transport label as it appears in config (`type` values).
    pub const fn transport_label(&self) -> &'static str {
        match self {
            Self::Stdio { .. } => "stdio",
            Self::StreamableHttp { .. } => "streamable-http",
            Self::Sse { .. } => "sse",
        }
    }
}

/// A tool reference with optional overrides for the exposed metadata.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolOverride {
    pub server_name: String,
    pub original_name: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub input_schema: Option<serde_json::Map<String, serde_json::Value>>,
    #[serde(default)]
    pub argument_mapping: Option<ArgumentMapping>,
}

impl ToolOverride {
    /// Name this tool is exposed under: the override if set, else the
    /// backend's own name.
    pub fn exposed_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.original_name)
    }
}

/// A resource reference: exact URI or RFC 6570 template. List position is
/// priority (lower index wins).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRef {
    pub server_name: String,
    pub uri: String,
}

/// A prompt reference. List position is priority.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptRef {
    pub server_name: String,
    pub name: String,
}

/// A named bundle of tool/resource/prompt references forming one virtual
/// server view.
#[derive(Debug, Clone, Deserialize)]
pub struct GroupConfig {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub tools: Vec<ToolOverride>,
    #[serde(default)]
    pub resources: Vec<ResourceRef>,
    #[serde(default)]
    pub prompts: Vec<PromptRef>,
}

#[derive(Debug, Deserialize)]
struct BackendServersDoc {
    #[serde(rename = "mcpServers", default)]
    mcp_servers: HashMap<String, RawBackendEntry>,
}

#[derive(Debug, Deserialize)]
struct GroupsDoc {
    #[serde(default)]
    groups: HashMap<String, GroupConfig>,
}

/// Resolved config file locations.
#[derive(Debug, Clone)]
pub struct ConfigPaths {
    pub backends: PathBuf,
    pub groups: PathBuf,
}

/// Resolve the config file paths, honoring an explicit directory override.
pub fn config_paths(override_dir: Option<&Path>) -> anyhow::Result<ConfigPaths> {
    let dir = match override_dir {
        Some(dir) => dir.to_path_buf(),
        None => dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("could not determine the platform config directory"))?
            .join(APP_DIR),
    };
    Ok(ConfigPaths {
        backends: dir.join(BACKENDS_FILE),
        groups: dir.join(GROUPS_FILE),
    })
}

/// Environment variable names: `[A-Za-z_][A-Za-z0-9_]*`.
fn is_valid_env_key(key: &str) -> bool {
    let mut chars = key.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Resolve a raw backend entry into a transport config.
///
/// Rules:
/// - `type` absent: stdio when `command` is set, streamable-http when only
///   `url` is set.
/// - stdio requires a non-empty `command` and valid env var names; `url` is
///   not allowed.
/// - streamable-http / sse require `url`; `command`, `args`, and `env` are
///   not allowed.
pub fn resolve_backend_entry(
    name: &str,
    entry: &RawBackendEntry,
) -> anyhow::Result<BackendServerConfig> {
    let transport = entry.transport.as_deref().unwrap_or_else(|| {
        if entry.command.is_none() && entry.url.is_some() {
            "streamable-http"
        } else {
            "stdio"
        }
    });

    match transport {
        "stdio" => {
            let command = entry.command.as_deref().ok_or_else(|| {
                anyhow::anyhow!("mcpServers.{name}: stdio backend must set 'command'")
            })?;
            if command.trim().is_empty() {
                anyhow::bail!("mcpServers.{name}: 'command' must be non-empty");
            }
            if entry.url.is_some() {
                anyhow::bail!("mcpServers.{name}: 'url' is only valid for http transports");
            }
            for key in entry.env.keys() {
                if !is_valid_env_key(key) {
                    anyhow::bail!(
                        "mcpServers.{name}: '{key}' is not a valid environment variable name"
                    );
                }
            }
            Ok(BackendServerConfig::Stdio {
                command: command.to_string(),
                args: entry.args.clone(),
                env: entry.env.clone(),
            })
        }
        "streamable-http" | "sse" => {
            let url = entry.url.as_deref().ok_or_else(|| {
                anyhow::anyhow!("mcpServers.{name}: '{transport}' backend must set 'url'")
            })?;
            if entry.command.is_some() || !entry.args.is_empty() || !entry.env.is_empty() {
                anyhow::bail!(
                    "mcpServers.{name}: 'command', 'args', and 'env' are only valid for stdio backends"
                );
            }
            url::Url::parse(url)
                .map_err(|e| anyhow::anyhow!("mcpServers.{name}: invalid url '{url}': {e}"))?;
            if transport == "sse" {
                Ok(BackendServerConfig::Sse {
                    url: url.to_string(),
                })
            } else {
                Ok(BackendServerConfig::StreamableHttp {
                    url: url.to_string(),
                })
            }
        }
        other => {
            anyhow::bail!("mcpServers.{name}: unknown transport type '{other}'")
        }
    }
}

/// Read and resolve `backend-servers.json`.
pub fn load_backends(path: &Path) -> anyhow::Result<HashMap<String, BackendServerConfig>> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", path.display()))?;
    let doc: BackendServersDoc = serde_json::from_str(&content)
        .map_err(|e| anyhow::anyhow!("failed to parse {}: {e}", path.display()))?;

    let mut backends = HashMap::new();
    for (name, entry) in &doc.mcp_servers {
        let resolved = resolve_backend_entry(name, entry)
            .map_err(|e| anyhow::anyhow!("{}: {e}", path.display()))?;
        backends.insert(name.clone(), resolved);
    }
    Ok(backends)
}

/// Read and parse `groups.json`. Each group's `name` field is filled from its
/// map key when omitted.
pub fn load_groups(path: &Path) -> anyhow::Result<HashMap<String, GroupConfig>> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", path.display()))?;
    let doc: GroupsDoc = serde_json::from_str(&content)
        .map_err(|e| anyhow::anyhow!("failed to parse {}: {e}", path.display()))?;

    let mut groups = doc.groups;
    for (key, group) in &mut groups {
        if group.name.is_empty() {
            group.name.clone_from(key);
        }
    }
    Ok(groups)
}

/// Check that every backend referenced by any group exists in the backend
/// map. Dangling references are fatal at startup.
pub fn validate_group_references(
    groups: &HashMap<String, GroupConfig>,
    backends: &HashMap<String, BackendServerConfig>,
) -> anyhow::Result<()> {
    for (group_name, group) in groups {
        let referenced = group
            .tools
            .iter()
            .map(|t| t.server_name.as_str())
            .chain(group.resources.iter().map(|r| r.server_name.as_str()))
            .chain(group.prompts.iter().map(|p| p.server_name.as_str()));
        for server in referenced {
            if !backends.contains_key(server) {
                anyhow::bail!(
                    "group '{group_name}' references unknown backend '{server}' \
                     (not present in {BACKENDS_FILE})"
                );
            }
        }
    }
    Ok(())
}
