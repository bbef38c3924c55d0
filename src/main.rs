mod cli;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use cli::{Cli, Command};
use tracing_subscriber::EnvFilter;

use mcp_groups::client::ClientManager;
use mcp_groups::config::{self, ConfigPaths, GroupConfig};
use mcp_groups::groups::{BackendCatalog, CatalogMap, GroupRegistry};
use mcp_groups::proxy::{DEFAULT_MAX_RETRIES, DEFAULT_RETRY_DELAY, ProxyService};
use mcp_groups::server::GroupProxyServer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let silent = matches!(cli.command, Command::Serve { silent: true, .. });
    init_logging(&cli.log_level, silent)?;

    let paths = config::config_paths(cli.config_dir.as_deref())?;

    match cli.command {
        Command::Serve {
            groups,
            silent,
            timeout,
        } => serve(&paths, groups, silent, timeout).await,
        Command::ListGroups => list_groups(&paths),
        Command::DescribeGroup { name } => describe_group(&paths, &name),
        Command::ListBackends => list_backends(&paths),
        Command::Validate => validate(&paths),
        Command::ConfigPath => {
            println!("{}", paths.backends.display());
            println!("{}", paths.groups.display());
            Ok(())
        }
    }
}

/// Logging goes to stderr: stdout carries the MCP framing. `RUST_LOG`
/// overrides the `--log-level` flag; silent mode forces errors only.
fn init_logging(level: &str, silent: bool) -> anyhow::Result<()> {
    let filter = if silent {
        EnvFilter::new("error")
    } else if let Ok(env) = std::env::var(EnvFilter::DEFAULT_ENV) {
        EnvFilter::try_new(env).map_err(|e| anyhow::anyhow!("invalid RUST_LOG filter: {e}"))?
    } else {
        EnvFilter::try_new(level).map_err(|_| anyhow::anyhow!("invalid log level: '{level}'"))?
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
    Ok(())
}

/// Load both documents and check cross-references. Any failure here is fatal.
fn load_configuration(
    paths: &ConfigPaths,
) -> anyhow::Result<(
    HashMap<String, config::BackendServerConfig>,
    HashMap<String, GroupConfig>,
)> {
    let backends = config::load_backends(&paths.backends)?;
    let groups = config::load_groups(&paths.groups)?;
    config::validate_group_references(&groups, &backends)?;
    Ok((backends, groups))
}

/// Start the serving core: connect required backends, discover their
/// catalogs, assemble the group view, and run the MCP server on stdio until
/// a signal or client disconnect.
async fn serve(
    paths: &ConfigPaths,
    group_names: Vec<String>,
    silent: bool,
    timeout_secs: u64,
) -> anyhow::Result<()> {
    let (backends, group_map) = load_configuration(paths)?;
    let registry = GroupRegistry::new(group_map);

    for name in &group_names {
        if registry.get_group(name).is_none() {
            anyhow::bail!("group '{name}' not found in {}", paths.groups.display());
        }
    }

    let required = registry.required_servers(&group_names);
    tracing::info!(
        groups = ?group_names,
        backends = ?required,
        "starting mcp-groups"
    );

    let serving_backends: HashMap<_, _> = backends
        .into_iter()
        .filter(|(name, _)| required.contains(name))
        .collect();
    let manager = Arc::new(ClientManager::new(serving_backends, silent));

    let report = manager.connect_all().await;
    for name in &report.successful {
        tracing::info!(backend = name.as_str(), "backend connected");
    }
    for (name, error) in &report.failed {
        tracing::error!(backend = name.as_str(), error = %error, "backend failed to connect");
    }

    let proxy = ProxyService::with_options(
        Arc::clone(&manager),
        Duration::from_secs(timeout_secs),
        DEFAULT_MAX_RETRIES,
        DEFAULT_RETRY_DELAY,
    );

    let catalog = discover_catalogs(&proxy, &report.successful).await;
    let server = GroupProxyServer::assemble(&registry, &group_names, &catalog, proxy);

    serve_stdio(server, manager).await
}

/// Ask each connected backend what it offers. Missing capabilities (a
/// backend without resources or prompts) are fine; failures degrade that
/// backend's catalog to empty with a log line.
async fn discover_catalogs(proxy: &ProxyService, servers: &[String]) -> CatalogMap {
    let futures: Vec<_> = servers
        .iter()
        .map(|name| async move {
            let mut catalog = BackendCatalog::default();
            match proxy.list_tools(name).await {
                Ok(tools) => catalog.tools = tools,
                Err(error) => {
                    tracing::warn!(backend = name.as_str(), error = %error, "tool discovery failed");
                }
            }
            match proxy.list_resources(name).await {
                Ok(resources) => catalog.resources = resources,
                Err(error) => {
                    tracing::debug!(backend = name.as_str(), error = %error, "backend lists no resources");
                }
            }
            match proxy.list_resource_templates(name).await {
                Ok(templates) => catalog.resource_templates = templates,
                Err(error) => {
                    tracing::debug!(backend = name.as_str(), error = %error, "backend lists no resource templates");
                }
            }
            match proxy.list_prompts(name).await {
                Ok(prompts) => catalog.prompts = prompts,
                Err(error) => {
                    tracing::debug!(backend = name.as_str(), error = %error, "backend lists no prompts");
                }
            }
            tracing::info!(
                backend = name.as_str(),
                tools = catalog.tools.len(),
                resources = catalog.resources.len(),
                prompts = catalog.prompts.len(),
                "discovered backend catalog"
            );
            (name.clone(), catalog)
        })
        .collect();

    futures::future::join_all(futures).await.into_iter().collect()
}

/// Serve MCP over stdin/stdout until the client disconnects or a signal
/// arrives, then close all backend connections.
async fn serve_stdio(server: GroupProxyServer, manager: Arc<ClientManager>) -> anyhow::Result<()> {
    let transport = rmcp::transport::io::stdio();
    let service = rmcp::serve_server(server, transport).await?;
    let cancel = service.cancellation_token();
    let mut waiting = std::pin::pin!(service.waiting());

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            result = &mut waiting => {
                result?;
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("received SIGINT, shutting down");
                cancel.cancel();
                let _ = waiting.await;
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, shutting down");
                cancel.cancel();
                let _ = waiting.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::select! {
            result = &mut waiting => {
                result?;
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("received SIGINT, shutting down");
                cancel.cancel();
                let _ = waiting.await;
            }
        }
    }

    manager.disconnect_all().await;
    Ok(())
}

fn list_groups(paths: &ConfigPaths) -> anyhow::Result<()> {
    let (_, groups) = load_configuration(paths)?;
    let registry = GroupRegistry::new(groups);
    for name in registry.group_names() {
        if let Some(group) = registry.get_group(&name) {
            match &group.description {
                Some(desc) => println!(
                    "{name}: {desc} ({} tools, {} resources, {} prompts)",
                    group.tools.len(),
                    group.resources.len(),
                    group.prompts.len()
                ),
                None => println!(
                    "{name} ({} tools, {} resources, {} prompts)",
                    group.tools.len(),
                    group.resources.len(),
                    group.prompts.len()
                ),
            }
        }
    }
    Ok(())
}

fn describe_group(paths: &ConfigPaths, name: &str) -> anyhow::Result<()> {
    let (_, groups) = load_configuration(paths)?;
    let registry = GroupRegistry::new(groups);
    let group = registry
        .get_group(name)
        .ok_or_else(|| anyhow::anyhow!("group '{name}' not found in {}", paths.groups.display()))?;

    println!("group: {}", group.name);
    if let Some(desc) = &group.description {
        println!("description: {desc}");
    }
    println!("tools:");
    for tool in &group.tools {
        if tool.exposed_name() == tool.original_name {
            println!("  {} ({})", tool.original_name, tool.server_name);
        } else {
            println!(
                "  {} -> {} ({})",
                tool.exposed_name(),
                tool.original_name,
                tool.server_name
            );
        }
    }
    println!("resources:");
    for resource in &group.resources {
        println!("  {} ({})", resource.uri, resource.server_name);
    }
    println!("prompts:");
    for prompt in &group.prompts {
        println!("  {} ({})", prompt.name, prompt.server_name);
    }
    Ok(())
}

fn list_backends(paths: &ConfigPaths) -> anyhow::Result<()> {
    let backends = config::load_backends(&paths.backends)?;
    let mut names: Vec<&String> = backends.keys().collect();
    names.sort();
    for name in names {
        if let Some(backend) = backends.get(name) {
            match backend {
                config::BackendServerConfig::Stdio { command, args, .. } => {
                    println!("{name}: {} {} [stdio]", command, args.join(" "));
                }
                other => {
                    println!("{name}: [{}] (not served)", other.transport_label());
                }
            }
        }
    }
    Ok(())
}

fn validate(paths: &ConfigPaths) -> anyhow::Result<()> {
    let (backends, groups) = load_configuration(paths)?;
    println!(
        "ok: {} backends, {} groups",
        backends.len(),
        groups.len()
    );
    Ok(())
}
