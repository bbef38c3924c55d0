use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "mcp-groups",
    about = "Aggregating MCP proxy with per-group views over backend servers",
    version
)]
pub struct Cli {
    /// Override the configuration directory
    #[arg(long, global = true, env = "MCP_GROUPS_CONFIG_DIR")]
    pub config_dir: Option<PathBuf>,

    /// Log level (trace|debug|info|warn|error)
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Serve the named groups as one MCP server on stdio
    Serve {
        /// Names of the groups to expose
        #[arg(required = true)]
        groups: Vec<String>,
        /// Suppress proxy logging and discard backend stderr
        #[arg(long)]
        silent: bool,
        /// Per-call timeout for backend requests, in seconds
        #[arg(long, default_value = "30")]
        timeout: u64,
    },
    /// List configured groups
    ListGroups,
    /// Show one group's tools, resources, and prompts
    DescribeGroup {
        /// Group name
        name: String,
    },
    /// List configured backend servers
    ListBackends,
    /// Validate both configuration documents
    Validate,
    /// Print the configuration file paths
    ConfigPath,
}
