//! Aggregated tool catalog
//!
//! Presents a flattened, queryable view of every connected server's tools.
//! The view is recomputed from live connection state on each query, so a
//! disconnected server's tools vanish with it.
//!
//! Tool names are qualified as `server_tool`. Resolution checks the
//! qualified form first; a bare name resolves only when exactly one
//! connected server exposes it.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

use crate::client::ToolInfo;
use crate::connection::ConnectionManager;
use crate::error::{CoreError, Result};

/// Input schema of a tool, validated at aggregation time.
///
/// A malformed schema never breaks aggregation; the tool is listed but
/// flagged as non-callable.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolSchema {
    Valid(Value),
    Invalid { reason: String },
}

impl ToolSchema {
    /// Classify a raw schema blob from a server
    pub fn from_value(value: &Value) -> Self {
        match value {
            Value::Object(obj) => {
                let is_object_schema = obj
                    .get("type")
                    .and_then(|t| t.as_str())
                    .map(|t| t == "object")
                    .unwrap_or(true); // missing "type" is tolerated
                if is_object_schema {
                    ToolSchema::Valid(value.clone())
                } else {
                    ToolSchema::Invalid {
                        reason: "input schema is not an object schema".to_string(),
                    }
                }
            }
            Value::Null => ToolSchema::Invalid {
                reason: "input schema is missing".to_string(),
            },
            _ => ToolSchema::Invalid {
                reason: "input schema is not a JSON object".to_string(),
            },
        }
    }

    pub fn is_callable(&self) -> bool {
        matches!(self, ToolSchema::Valid(_))
    }
}

/// One callable capability, scoped to its owning server
#[derive(Debug, Clone, Serialize)]
pub struct ToolDescriptor {
    /// Server-local name, as the server declared it
    pub name: String,
    /// Fully-qualified name (`server_tool`)
    pub qualified_name: String,
    /// Owning server id
    pub server: String,
    pub description: Option<String>,
    pub schema: ToolSchema,
}

impl ToolDescriptor {
    fn from_info(server: &str, info: &ToolInfo) -> Self {
        Self {
            name: info.name.clone(),
            qualified_name: qualified_name(server, &info.name),
            server: server.to_string(),
            description: info.description.clone(),
            schema: ToolSchema::from_value(&info.input_schema),
        }
    }
}

/// Qualified tool name used in the aggregated catalog
pub fn qualified_name(server: &str, tool: &str) -> String {
    format!("{}_{}", server, tool)
}

/// Flattened view over all connected servers' tools
pub struct ToolCatalog {
    connections: Arc<ConnectionManager>,
}

impl ToolCatalog {
    pub fn new(connections: Arc<ConnectionManager>) -> Self {
        Self { connections }
    }

    /// Tools of every connected, enabled server, keyed by server id
    pub fn all_enabled_tools(&self) -> HashMap<String, Vec<ToolDescriptor>> {
        self.connections
            .connected_tools()
            .into_iter()
            .map(|(server, tools)| {
                let descriptors = tools
                    .iter()
                    .map(|t| ToolDescriptor::from_info(&server, t))
                    .collect();
                (server, descriptors)
            })
            .collect()
    }

    /// Resolve a bare or server-qualified tool name to its descriptor.
    ///
    /// An exact qualified match wins over a bare one. A name that matches
    /// tools on more than one server is an error, never a silent pick; this
    /// holds for qualified names too, since distinct servers can mint the
    /// same qualified form (`a` + `b_x` and `a_b` + `x`).
    pub fn resolve(&self, name: &str) -> Result<ToolDescriptor> {
        let by_server = self.all_enabled_tools();

        // Qualified match first
        let qualified: Vec<&ToolDescriptor> = by_server
            .values()
            .flatten()
            .filter(|d| d.qualified_name == name)
            .collect();
        match qualified.len() {
            0 => {}
            1 => return Ok(qualified[0].clone()),
            _ => return Err(ambiguous(name, &qualified)),
        }

        // Bare match, only if unambiguous across connected servers
        let matches: Vec<&ToolDescriptor> = by_server
            .values()
            .flatten()
            .filter(|d| d.name == name)
            .collect();

        match matches.len() {
            0 => Err(CoreError::ToolNotFound(name.to_string())),
            1 => Ok(matches[0].clone()),
            _ => Err(ambiguous(name, &matches)),
        }
    }
}

fn ambiguous(name: &str, matches: &[&ToolDescriptor]) -> CoreError {
    let mut candidates: Vec<String> = matches.iter().map(|d| d.server.clone()).collect();
    candidates.sort();
    CoreError::AmbiguousTool {
        name: name.to_string(),
        candidates,
    }
}
