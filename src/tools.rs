//! Tools exposed to agents and to Gemini function calling.
//!
//! A [`Tool`] has a name, a description, a JSON Schema for its parameters
//! and an async `execute`. The [`ToolRegistry`] holds the built-ins and
//! any tools registered by an embedding application; the HTTP server and
//! [`GeminiClient::chat`](crate::gemini::GeminiClient::chat) both dispatch
//! through it.
//!
//! | Tool | Parameters | Result |
//! |------|------------|--------|
//! | `search_records` | `query`, `top_k` | `{ "results": [QueryHit] }` |
//! | `get_record` | `row_index` | stored entry without its vector |
//! | `list_records` | `limit` | `{ "total", "records": [...] }` |

use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};

use crate::gemini::AnalysisClient;
use crate::pipeline;
use crate::store::VectorStore;

/// A callable tool.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Lowercase identifier, used as the route `POST /tools/{name}`.
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// Built-ins are flagged in `GET /tools/list`.
    fn is_builtin(&self) -> bool {
        false
    }

    /// JSON Schema (`type: "object"`) for the parameters.
    fn parameters_schema(&self) -> Value;

    /// Run with parameters already checked by [`validate_params`].
    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<Value>;
}

/// What a tool may touch while it runs.
#[derive(Clone)]
pub struct ToolContext {
    pub store: Arc<dyn VectorStore>,
    pub analyst: Arc<dyn AnalysisClient>,
}

impl ToolContext {
    pub fn new(store: Arc<dyn VectorStore>, analyst: Arc<dyn AnalysisClient>) -> Self {
        Self { store, analyst }
    }
}

/// Serializable tool descriptor for `GET /tools/list`.
#[derive(Debug, Clone, Serialize)]
pub struct ToolInfo {
    pub name: String,
    pub description: String,
    pub builtin: bool,
    pub parameters: Value,
}

impl ToolInfo {
    pub fn from_tool(tool: &dyn Tool) -> Self {
        Self {
            name: tool.name().to_string(),
            description: tool.description().to_string(),
            builtin: tool.is_builtin(),
            parameters: tool.parameters_schema(),
        }
    }
}

// ============ Built-ins ============

/// Semantic search over analyzed records.
pub struct SearchRecordsTool;

#[async_trait]
impl Tool for SearchRecordsTool {
    fn name(&self) -> &str {
        "search_records"
    }

    fn description(&self) -> &str {
        "Find analyzed spreadsheet rows similar to a natural-language query"
    }

    fn is_builtin(&self) -> bool {
        true
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": { "type": "string", "description": "What to look for" },
                "top_k": { "type": "integer", "description": "Max results", "default": 5, "minimum": 1, "maximum": 50 }
            },
            "required": ["query"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<Value> {
        let query = params["query"].as_str().unwrap_or("");
        if query.trim().is_empty() {
            bail!("query must not be empty");
        }
        let top_k = params["top_k"].as_u64().unwrap_or(5).max(1) as usize;

        let hits =
            pipeline::search(ctx.analyst.as_ref(), ctx.store.as_ref(), query, top_k).await?;
        Ok(json!({ "results": hits }))
    }
}

/// Fetch one analyzed row by its sheet position.
pub struct GetRecordTool;

#[async_trait]
impl Tool for GetRecordTool {
    fn name(&self) -> &str {
        "get_record"
    }

    fn description(&self) -> &str {
        "Retrieve the stored analysis for one spreadsheet row"
    }

    fn is_builtin(&self) -> bool {
        true
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "row_index": { "type": "integer", "description": "Zero-based data row index", "minimum": 0 }
            },
            "required": ["row_index"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<Value> {
        let Some(index) = params["row_index"].as_u64() else {
            bail!("row_index must be a non-negative integer");
        };
        let id = format!("row_{}", index);
        match ctx.store.get(&id).await? {
            Some(entry) => Ok(json!({ "id": entry.id, "metadata": entry.metadata })),
            None => bail!("no stored record with id {}", id),
        }
    }
}

/// Page through stored rows.
pub struct ListRecordsTool;

#[async_trait]
impl Tool for ListRecordsTool {
    fn name(&self) -> &str {
        "list_records"
    }

    fn description(&self) -> &str {
        "List stored spreadsheet rows with their analyses"
    }

    fn is_builtin(&self) -> bool {
        true
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "limit": { "type": "integer", "description": "Max rows", "default": 20, "minimum": 1 }
            },
            "additionalProperties": false
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<Value> {
        let limit = params["limit"].as_u64().unwrap_or(20) as usize;
        let entries = ctx.store.list().await?;
        let total = entries.len();
        let records: Vec<Value> = entries
            .into_iter()
            .take(limit)
            .map(|e| json!({ "id": e.id, "metadata": e.metadata }))
            .collect();
        Ok(json!({ "total": total, "records": records }))
    }
}

// ============ Registry ============

pub struct ToolRegistry {
    tools: Vec<Box<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self { tools: Vec::new() }
    }

    /// Registry with `search_records`, `get_record` and `list_records`.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(SearchRecordsTool));
        registry.register(Box::new(GetRecordTool));
        registry.register(Box::new(ListRecordsTool));
        registry
    }

    /// Register a tool. Lookups return the first tool registered under a name.
    pub fn register(&mut self, tool: Box<dyn Tool>) {
        self.tools.push(tool);
    }

    pub fn tools(&self) -> &[Box<dyn Tool>] {
        &self.tools
    }

    pub fn find(&self, name: &str) -> Option<&dyn Tool> {
        self.tools
            .iter()
            .find(|t| t.name() == name)
            .map(|t| t.as_ref())
    }

    pub fn infos(&self) -> Vec<ToolInfo> {
        self.tools.iter().map(|t| ToolInfo::from_tool(t.as_ref())).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Check `params` against a tool's schema.
///
/// Enforces `required`, primitive `type`s and numeric `minimum`/`maximum`,
/// and fills in `default`s for missing properties. Unknown keys are an
/// error when the schema sets `"additionalProperties": false`. A `null`
/// body counts as `{}`. Returns the completed object.
pub fn validate_params(schema: &Value, params: &Value) -> Result<Value> {
    let mut given = match params {
        Value::Object(map) => map.clone(),
        Value::Null => serde_json::Map::new(),
        other => bail!("parameters must be a JSON object, got {}", json_type_name(other)),
    };

    let empty = serde_json::Map::new();
    let properties = schema
        .get("properties")
        .and_then(Value::as_object)
        .unwrap_or(&empty);
    let closed = schema.get("additionalProperties") == Some(&Value::Bool(false));

    if closed {
        if let Some(unknown) = given.keys().find(|k| !properties.contains_key(*k)) {
            bail!("unknown parameter: {}", unknown);
        }
    }

    let required = schema
        .get("required")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(Value::as_str);
    for field in required {
        if !given.contains_key(field) {
            bail!("missing required parameter: {}", field);
        }
    }

    for (name, prop) in properties {
        match given.get(name) {
            Some(value) => check_property(name, prop, value)?,
            None => {
                if let Some(default) = prop.get("default") {
                    given.insert(name.clone(), default.clone());
                }
            }
        }
    }

    Ok(Value::Object(given))
}

fn check_property(name: &str, prop: &Value, value: &Value) -> Result<()> {
    if let Some(expected) = prop.get("type").and_then(Value::as_str) {
        let ok = match expected {
            "string" => value.is_string(),
            "integer" => value.is_i64() || value.is_u64(),
            "number" => value.is_number(),
            "boolean" => value.is_boolean(),
            "array" => value.is_array(),
            "object" => value.is_object(),
            _ => true,
        };
        if !ok {
            bail!(
                "parameter '{}' must be of type '{}', got {}",
                name,
                expected,
                json_type_name(value)
            );
        }
    }

    if let Some(n) = value.as_f64() {
        if let Some(min) = prop.get("minimum").and_then(Value::as_f64) {
            if n < min {
                bail!("parameter '{}' must be >= {}, got {}", name, min, value);
            }
        }
        if let Some(max) = prop.get("maximum").and_then(Value::as_f64) {
            if n > max {
                bail!("parameter '{}' must be <= {}, got {}", name, max, value);
            }
        }
    }
    Ok(())
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
