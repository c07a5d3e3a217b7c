// crates/ponte-server/src/schema.rs
// Tool schema translation between MCP and the LLM runtime:
// descriptor flattening, argument normalisation, numeric coercion, and
// cross-server name qualification.

use crate::error::{PonteError, Result};
use crate::llm::LlmTool;
use serde_json::{Map, Value, json};
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// Build a flat tool descriptor from an MCP tool definition.
pub fn from_mcp_tool(tool: &rmcp::model::Tool) -> LlmTool {
    let parameters = serde_json::to_value(tool.input_schema.as_ref())
        .unwrap_or(json!({"type": "object", "properties": {}}));
    LlmTool::function(
        tool.name.to_string(),
        tool.description.as_deref().unwrap_or("").to_string(),
        parameters,
    )
}

/// Lift a free-form descriptor into the flat shape the runtime requires.
/// Accepts both the flat form and the OpenAI-nested form (fields under a
/// `function` key). The parameter schema passes through unrewritten.
pub fn flatten_descriptor(descriptor: &Value) -> Result<LlmTool> {
    let inner = descriptor.get("function").unwrap_or(descriptor);

    let name = inner
        .get("name")
        .and_then(|n| n.as_str())
        .ok_or_else(|| PonteError::ToolArgument("tool descriptor has no name".into()))?;
    let description = inner
        .get("description")
        .and_then(|d| d.as_str())
        .unwrap_or("");
    let parameters = inner
        .get("parameters")
        .cloned()
        .unwrap_or(json!({"type": "object", "properties": {}}));

    Ok(LlmTool::function(name, description, parameters))
}

/// Decode tool-call arguments. The runtime frequently returns them as a
/// JSON-encoded string rather than a structured object; both are accepted.
/// Idempotent: normalising an already-structured value is a no-op.
pub fn normalize_arguments(raw: &Value) -> Result<Map<String, Value>> {
    match raw {
        Value::Object(map) => Ok(map.clone()),
        Value::Null => Ok(Map::new()),
        Value::String(s) => {
            if s.trim().is_empty() {
                return Ok(Map::new());
            }
            let decoded: Value = serde_json::from_str(s).map_err(|e| {
                PonteError::ToolArgument(format!("arguments are not valid JSON: {}", e))
            })?;
            match decoded {
                Value::Object(map) => Ok(map),
                other => Err(PonteError::ToolArgument(format!(
                    "arguments decoded to {} instead of an object",
                    json_type_name(&other)
                ))),
            }
        }
        other => Err(PonteError::ToolArgument(format!(
            "arguments are {} instead of an object",
            json_type_name(other)
        ))),
    }
}

/// What the tool's parameter schema declares for one argument.
#[derive(Debug, PartialEq)]
enum DeclaredType {
    Integer,
    Number,
    String,
    Other,
}

fn declared_type(schema: &Value, key: &str) -> DeclaredType {
    let declared = schema
        .get("properties")
        .and_then(|p| p.get(key))
        .and_then(|s| s.get("type"));

    let holds = |v: &Value, t: &str| match v {
        Value::String(s) => s == t,
        Value::Array(items) => items.iter().any(|i| i.as_str() == Some(t)),
        _ => false,
    };

    match declared {
        Some(v) if holds(v, "integer") => DeclaredType::Integer,
        Some(v) if holds(v, "number") => DeclaredType::Number,
        Some(v) if holds(v, "string") => DeclaredType::String,
        _ => DeclaredType::Other,
    }
}

/// Coerce string-encoded numbers to the declared numeric type.
///
/// Small models pass integers as decimal strings even when the schema
/// declares an integer. A parameter is coerced when the schema declares it
/// `integer`/`number`, or when its name is in `numeric_names` and the schema
/// does not explicitly declare it a string. Idempotent: already-numeric
/// values are untouched.
pub fn coerce_arguments(
    args: &mut Map<String, Value>,
    schema: &Value,
    numeric_names: &HashSet<String>,
) -> Result<()> {
    for (key, value) in args.iter_mut() {
        let Value::String(raw) = value else {
            continue;
        };

        let declared = declared_type(schema, key);
        let wants_numeric = match declared {
            DeclaredType::Integer | DeclaredType::Number => true,
            DeclaredType::String => false,
            DeclaredType::Other => numeric_names.contains(key),
        };
        if !wants_numeric {
            continue;
        }

        let trimmed = raw.trim();
        let coerced = if declared == DeclaredType::Number {
            trimmed
                .parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number)
        } else {
            // Integer declaration or name-set match: prefer an integer,
            // fall back to a float for name-set-only parameters.
            match trimmed.parse::<i64>() {
                Ok(n) => Some(json!(n)),
                Err(_) if declared == DeclaredType::Other => trimmed
                    .parse::<f64>()
                    .ok()
                    .and_then(serde_json::Number::from_f64)
                    .map(Value::Number),
                Err(_) => None,
            }
        };

        match coerced {
            Some(number) => {
                debug!(parameter = %key, raw = %raw, "Coerced string argument to number");
                *value = number;
            }
            None => {
                return Err(PonteError::ToolArgument(format!(
                    "parameter '{}' should be numeric but is '{}'",
                    key, raw
                )));
            }
        }
    }
    Ok(())
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// One entry of the merged tool catalogue.
#[derive(Debug, Clone)]
pub struct CatalogueEntry {
    /// Name shown to the LLM: the bare tool name, or `<server>.<tool>` when
    /// two servers expose the same name.
    pub exposed_name: String,
    pub server: String,
    pub tool_name: String,
    pub description: String,
    pub parameters: Value,
}

/// Tool catalogue merged from one or several downstream servers.
///
/// Non-conflicting names pass through unchanged so the LLM keeps its
/// familiarity with common tool names; only conflicts get qualified.
#[derive(Debug, Clone, Default)]
pub struct ToolCatalogue {
    entries: Vec<CatalogueEntry>,
    index: HashMap<String, usize>,
}

impl ToolCatalogue {
    pub fn build(per_server: &[(String, Vec<LlmTool>)]) -> Self {
        let mut occurrences: HashMap<&str, usize> = HashMap::new();
        for (_, tools) in per_server {
            for tool in tools {
                *occurrences.entry(tool.name.as_str()).or_default() += 1;
            }
        }

        let mut entries = Vec::new();
        let mut index = HashMap::new();
        for (server, tools) in per_server {
            for tool in tools {
                let conflicted = occurrences.get(tool.name.as_str()).copied().unwrap_or(0) > 1;
                let exposed_name = if conflicted {
                    format!("{}.{}", server, tool.name)
                } else {
                    tool.name.clone()
                };
                index.insert(exposed_name.clone(), entries.len());
                entries.push(CatalogueEntry {
                    exposed_name,
                    server: server.clone(),
                    tool_name: tool.name.clone(),
                    description: tool.description.clone(),
                    parameters: tool.parameters.clone(),
                });
            }
        }

        Self { entries, index }
    }

    /// Resolve a tool name from the LLM back to its owning server. Accepts
    /// the exposed name, and tolerates an unrequested `<server>.<tool>`
    /// qualifier on non-conflicting names.
    pub fn resolve(&self, name: &str) -> Option<&CatalogueEntry> {
        if let Some(&idx) = self.index.get(name) {
            return Some(&self.entries[idx]);
        }
        if let Some((server, tool)) = name.split_once('.') {
            return self
                .entries
                .iter()
                .find(|e| e.server == server && e.tool_name == tool);
        }
        None
    }

    /// The flat descriptors to send to the runtime.
    pub fn llm_tools(&self) -> Vec<LlmTool> {
        self.entries
            .iter()
            .map(|e| LlmTool::function(&e.exposed_name, &e.description, e.parameters.clone()))
            .collect()
    }

    pub fn exposed_names(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.exposed_name.clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
