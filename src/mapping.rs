//! Argument transformation for tool overrides.
//!
//! A tool override may carry an [`ArgumentMapping`] that rewrites the
//! client-supplied arguments into the shape the backend expects. The
//! transformer is purely structural; schema validation of the result is the
//! frontend router's job.

use std::collections::HashMap;

use serde::Deserialize;
use serde_json::{Map, Value};

/// Per-parameter rewrite rule, keyed by the backend parameter name.
///
/// `name` and `description` on `passthrough` / `default` / `rename` describe
/// the client-facing parameter (they feed the exposed input schema); only
/// `source` and `name` influence the transformation itself.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ParameterMapping {
    Passthrough {
        source: String,
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        description: Option<String>,
    },
    Constant {
        value: Value,
    },
    Default {
        source: String,
        default: Value,
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        description: Option<String>,
    },
    Rename {
        source: String,
        name: String,
        #[serde(default)]
        description: Option<String>,
    },
    Omit,
}

/// Top-level mapping attached to a tool override.
///
/// `jsonata` is reserved: it parses and is passed through without
/// transformation.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ArgumentMapping {
    Template {
        mappings: HashMap<String, ParameterMapping>,
    },
    Jsonata {
        expression: String,
    },
}

/// Apply a mapping to client arguments, producing backend arguments.
///
/// Starts from a copy of `client_args`; absence of a rule for a key means
/// passthrough. The result is not validated against any schema here.
pub fn apply_mapping(client_args: &Map<String, Value>, mapping: &ArgumentMapping) -> Map<String, Value> {
    let mappings = match mapping {
        ArgumentMapping::Jsonata { .. } => return client_args.clone(),
        ArgumentMapping::Template { mappings } => mappings,
    };

    let mut backend_args = client_args.clone();
    for (backend_name, rule) in mappings {
        match rule {
            ParameterMapping::Passthrough { source, name, .. } => {
                if name.as_deref().is_some_and(|n| n != backend_name)
                    && let Some(value) = backend_args.remove(source)
                {
                    backend_args.insert(backend_name.clone(), value);
                }
            }
            ParameterMapping::Constant { value } => {
                backend_args.insert(backend_name.clone(), value.clone());
            }
            ParameterMapping::Default {
                source, default, ..
            } => {
                let value = client_args
                    .get(source)
                    .filter(|v| !v.is_null())
                    .cloned()
                    .unwrap_or_else(|| default.clone());
                if source != backend_name {
                    backend_args.remove(source);
                }
                backend_args.insert(backend_name.clone(), value);
            }
            ParameterMapping::Rename { source, name, .. } => {
                backend_args.remove(source);
                if let Some(value) = client_args.get(source) {
                    backend_args.insert(name.clone(), value.clone());
                }
            }
            ParameterMapping::Omit => {
                backend_args.remove(backend_name);
            }
        }
    }
    backend_args
}
