//! Aggregating MCP proxy: one upstream client over stdio, many backend MCP
//! servers spawned as child processes, exposed through curated per-group
//! views with overrides, argument rewriting, retries, and fallback chains.

pub mod client;
pub mod config;
pub mod conflict;
pub mod groups;
pub mod mapping;
pub mod proxy;
pub mod server;
pub mod uri_template;
