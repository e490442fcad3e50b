//! Context protocol: the fixed message envelope shared by the analysis
//! client, the tool server, and anything downstream.
//!
//! Every message has the same three fields:
//!
//! ```json
//! { "role": "user", "content": "…", "metadata": { "kind": "analysis_request", … } }
//! ```
//!
//! [`wrap`] and [`unwrap`] convert between typed payloads and messages.
//! They are pure functions; `unwrap(&wrap(&p))` returns `p` for every valid
//! payload. [`Conversation`] is a caller-owned context stack for building
//! multi-message prompts.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::error::{Error, Result};
use crate::models::{AnalysisRequest, AnalysisResult, Record};

pub const KIND_REQUEST: &str = "analysis_request";
pub const KIND_RESULT: &str = "analysis_result";
pub const KIND_TOOL_CALL: &str = "tool_call";
pub const KIND_TOOL_RESULT: &str = "tool_result";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

/// The protocol envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProtocolMessage {
    pub role: Role,
    pub content: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl ProtocolMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            metadata: Map::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn kind(&self) -> Option<&str> {
        self.metadata.get("kind").and_then(Value::as_str)
    }
}

/// Typed content carried by a protocol message.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Request(AnalysisRequest),
    Response(AnalysisResult),
}

/// Package a payload into a protocol message.
pub fn wrap(payload: &Payload) -> ProtocolMessage {
    match payload {
        Payload::Request(req) => {
            let mut metadata = Map::new();
            metadata.insert("kind".into(), json!(KIND_REQUEST));
            metadata.insert(
                "record".into(),
                serde_json::to_value(&req.record).unwrap_or(Value::Null),
            );
            ProtocolMessage::new(Role::User, req.instruction.clone()).with_metadata(metadata)
        }
        Payload::Response(res) => {
            let mut metadata = Map::new();
            metadata.insert("kind".into(), json!(KIND_RESULT));
            metadata.insert("record_index".into(), json!(res.record_index));
            metadata.insert("model".into(), json!(res.model));
            if let Some(structured) = &res.structured {
                metadata.insert("structured".into(), structured.clone());
            }
            ProtocolMessage::new(Role::Assistant, res.text.clone()).with_metadata(metadata)
        }
    }
}

/// Extract the typed payload from a message, rejecting anything that does
/// not match the schema.
pub fn unwrap(message: &ProtocolMessage) -> Result<Payload> {
    validate(message)?;

    match message.kind() {
        Some(KIND_REQUEST) => {
            let raw = message.metadata.get("record").cloned().unwrap_or(Value::Null);
            let record: Record = serde_json::from_value(raw)
                .map_err(|e| Error::protocol(format!("malformed record metadata: {}", e)))?;
            Ok(Payload::Request(AnalysisRequest {
                record,
                instruction: message.content.clone(),
            }))
        }
        Some(KIND_RESULT) => {
            let record_index = message
                .metadata
                .get("record_index")
                .and_then(Value::as_u64)
                .ok_or_else(|| Error::protocol("record_index must be a non-negative integer"))?;
            let model = message
                .metadata
                .get("model")
                .and_then(Value::as_str)
                .ok_or_else(|| Error::protocol("model must be a string"))?;
            Ok(Payload::Response(AnalysisResult {
                record_index: record_index as usize,
                text: message.content.clone(),
                structured: message.metadata.get("structured").cloned(),
                model: model.to_string(),
            }))
        }
        Some(other) => Err(Error::protocol(format!(
            "message kind '{}' carries no analysis payload",
            other
        ))),
        None => Err(Error::protocol("metadata.kind is missing")),
    }
}

/// Check a message against the schema without extracting it.
///
/// Messages without a `kind` are plain context (system prompts, chat
/// turns) and only need non-empty content.
pub fn validate(message: &ProtocolMessage) -> Result<()> {
    let kind = match message.metadata.get("kind") {
        None => {
            if message.content.trim().is_empty() {
                return Err(Error::protocol("content must not be empty"));
            }
            return Ok(());
        }
        Some(Value::String(k)) => k.as_str(),
        Some(_) => return Err(Error::protocol("metadata.kind must be a string")),
    };

    let expected_role = match kind {
        KIND_REQUEST => Role::User,
        KIND_RESULT => Role::Assistant,
        KIND_TOOL_CALL => Role::Assistant,
        KIND_TOOL_RESULT => Role::Tool,
        other => return Err(Error::protocol(format!("unknown message kind '{}'", other))),
    };
    if message.role != expected_role {
        return Err(Error::protocol(format!(
            "{} messages must have role '{}', got '{}'",
            kind,
            expected_role.as_str(),
            message.role.as_str()
        )));
    }

    match kind {
        KIND_REQUEST => {
            if message.content.trim().is_empty() {
                return Err(Error::protocol("instruction must not be empty"));
            }
            if !message.metadata.get("record").is_some_and(Value::is_object) {
                return Err(Error::protocol("analysis_request requires a record object"));
            }
        }
        KIND_RESULT => {
            if message.content.trim().is_empty() {
                return Err(Error::protocol("analysis text must not be empty"));
            }
            if !message.metadata.contains_key("record_index") {
                return Err(Error::protocol("analysis_result requires record_index"));
            }
            if !message.metadata.get("model").is_some_and(Value::is_string) {
                return Err(Error::protocol("analysis_result requires model"));
            }
        }
        _ => {
            if !message.metadata.get("tool").is_some_and(Value::is_string) {
                return Err(Error::protocol(format!("{} requires a tool name", kind)));
            }
        }
    }
    Ok(())
}

/// Parse and validate a JSON-encoded message.
pub fn parse(json: &str) -> Result<ProtocolMessage> {
    let message: ProtocolMessage = serde_json::from_str(json)
        .map_err(|e| Error::protocol(format!("invalid message: {}", e)))?;
    validate(&message)?;
    Ok(message)
}

/// Prompt text for a single message.
///
/// Analysis requests carry their record as `column: value` lines ahead of
/// the instruction; all other messages render as their content.
pub fn render(message: &ProtocolMessage) -> String {
    if message.kind() == Some(KIND_REQUEST) {
        let raw = message.metadata.get("record").cloned().unwrap_or(Value::Null);
        if let Ok(record) = serde_json::from_value::<Record>(raw) {
            let mut lines = vec![format!("Record (row {}):", record.index)];
            for field in &record.fields {
                lines.push(format!("{}: {}", field.column, field.value));
            }
            lines.push(String::new());
            lines.push(format!("Instruction: {}", message.content));
            return lines.join("\n");
        }
    }
    message.content.clone()
}

/// Tool descriptor used in [`Conversation::build_prompt`].
#[derive(Debug, Clone, Serialize)]
pub struct ToolSummary {
    pub name: String,
    pub description: String,
}

/// Ordered context stack for building prompts.
#[derive(Debug, Clone, Default)]
pub struct Conversation {
    messages: Vec<ProtocolMessage>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, role: Role, content: impl Into<String>, metadata: Option<Map<String, Value>>) {
        let mut message = ProtocolMessage::new(role, content);
        if let Some(metadata) = metadata {
            message.metadata = metadata;
        }
        self.messages.push(message);
    }

    pub fn push(&mut self, message: ProtocolMessage) {
        self.messages.push(message);
    }

    pub fn messages(&self) -> &[ProtocolMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }

    /// Render the last `max_items` messages (all when `None`) as
    /// `[ROLE] content (metadata: {...})` blocks separated by blank lines.
    pub fn context_string(&self, max_items: Option<usize>) -> String {
        let start = match max_items {
            Some(n) => self.messages.len().saturating_sub(n),
            None => 0,
        };
        self.messages[start..]
            .iter()
            .map(|m| {
                let mut line = format!("[{}] {}", m.role.as_str().to_uppercase(), m.content);
                if !m.metadata.is_empty() {
                    line.push_str(&format!(" (metadata: {})", Value::Object(m.metadata.clone())));
                }
                line
            })
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    /// Assemble a single prompt from context, optional tools, and the request.
    pub fn build_prompt(
        &self,
        user_prompt: &str,
        include_context: bool,
        tools: &[ToolSummary],
    ) -> String {
        let mut parts: Vec<String> = Vec::new();

        if include_context && !self.messages.is_empty() {
            parts.push("CONTEXT:".into());
            parts.push(self.context_string(None));
            parts.push(String::new());
        }

        if !tools.is_empty() {
            parts.push("AVAILABLE TOOLS:".into());
            for tool in tools {
                parts.push(format!("- {}: {}", tool.name, tool.description));
            }
            parts.push(String::new());
        }

        parts.push("USER REQUEST:".into());
        parts.push(user_prompt.to_string());
        parts.join("\n")
    }
}

/// Message recording that the model asked for a tool.
pub fn tool_call(tool: &str, parameters: Value) -> ProtocolMessage {
    let mut metadata = Map::new();
    metadata.insert("kind".into(), json!(KIND_TOOL_CALL));
    metadata.insert("tool".into(), json!(tool));
    metadata.insert("parameters".into(), parameters);
    ProtocolMessage::new(Role::Assistant, format!("call {}", tool)).with_metadata(metadata)
}

/// Message carrying a tool's output back to the model.
pub fn tool_result(tool: &str, result: Value, success: bool) -> ProtocolMessage {
    let content = match &result {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    let mut metadata = Map::new();
    metadata.insert("kind".into(), json!(KIND_TOOL_RESULT));
    metadata.insert("tool".into(), json!(tool));
    metadata.insert("success".into(), json!(success));
    metadata.insert("result".into(), result);
    ProtocolMessage::new(Role::Tool, content).with_metadata(metadata)
}
