//! Analysis client for the Gemini REST API.
//!
//! [`AnalysisClient`] is the seam the pipeline depends on: it takes
//! protocol messages in and returns a protocol message, and it turns text
//! into embedding vectors. [`GeminiClient`] is the production
//! implementation:
//!
//! - `POST /v1beta/models/{model}:generateContent` for analysis and chat
//! - `POST /v1beta/models/{model}:batchEmbedContents` for embeddings
//!
//! # Failure mapping
//!
//! | Condition | Error |
//! |-----------|-------|
//! | HTTP 429 | [`Error::RateLimited`] |
//! | other non-2xx, timeout, transport error | [`Error::Upstream`] |
//! | 2xx without usable text or vectors | [`Error::Upstream`] |
//!
//! With the default `max_retries = 0` every failure goes straight to the
//! caller. Raising it retries 429, 5xx and transport errors with
//! exponential backoff (1s, 2s, 4s, … capped at 32s).

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::config::{Config, GeminiConfig};
use crate::error::{Error, Result};
use crate::models::{AnalysisRequest, AnalysisResult};
use crate::protocol::{self, Payload, ProtocolMessage, Role, KIND_REQUEST, KIND_TOOL_CALL, KIND_TOOL_RESULT};
use crate::tools::{validate_params, ToolContext, ToolRegistry};

/// Gemini accepts at most this many texts per `batchEmbedContents` call.
const EMBED_BATCH_LIMIT: usize = 100;

/// How an embedding will be used; Gemini tunes vectors per task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskType {
    RetrievalDocument,
    RetrievalQuery,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::RetrievalDocument => "RETRIEVAL_DOCUMENT",
            TaskType::RetrievalQuery => "RETRIEVAL_QUERY",
        }
    }
}

/// Sends protocol messages to a generative model and embeds text.
#[async_trait]
pub trait AnalysisClient: Send + Sync {
    /// Identifier of the generation model (e.g. `"gemini-2.0-flash"`).
    fn model_name(&self) -> &str;

    /// Send a conversation and return the model's reply.
    ///
    /// When the conversation contains an `analysis_request`, the reply is an
    /// `analysis_result` for that record; otherwise it is a plain assistant
    /// message.
    async fn respond(&self, messages: &[ProtocolMessage]) -> Result<ProtocolMessage>;

    /// Embed `texts`, returning one vector per input in input order.
    async fn embed(&self, texts: &[String], task: TaskType) -> Result<Vec<Vec<f32>>>;

    /// Analyze a single request: wrap, respond, unwrap.
    async fn analyze(&self, request: &AnalysisRequest) -> Result<AnalysisResult> {
        let message = protocol::wrap(&Payload::Request(request.clone()));
        let reply = self.respond(std::slice::from_ref(&message)).await?;
        match protocol::unwrap(&reply)? {
            Payload::Response(result) => Ok(result),
            Payload::Request(_) => Err(Error::protocol(
                "analysis client replied with a request instead of a result",
            )),
        }
    }
}

// ============ Wire types ============

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Content {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default)]
    pub parts: Vec<Part>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_call: Option<FunctionCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_response: Option<FunctionResponse>,
}

impl Part {
    fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    #[serde(default)]
    pub args: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionResponse {
    pub name: String,
    pub response: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct FunctionDeclaration {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDeclarations {
    pub function_declarations: Vec<FunctionDeclaration>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateRequest {
    pub contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDeclarations>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateResponse {
    #[serde(default)]
    pub candidates: Vec<Candidate>,
    #[serde(default)]
    pub prompt_feedback: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    #[serde(default)]
    pub content: Option<Content>,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

impl GenerateResponse {
    fn first_content(&self) -> Option<&Content> {
        self.candidates.first().and_then(|c| c.content.as_ref())
    }

    /// Concatenated text parts of the first candidate, if any are non-blank.
    pub fn text(&self) -> Option<String> {
        let text: String = self
            .first_content()?
            .parts
            .iter()
            .filter_map(|p| p.text.as_deref())
            .collect();
        if text.trim().is_empty() {
            None
        } else {
            Some(text)
        }
    }

    /// The first function call requested by the model.
    pub fn function_call(&self) -> Option<&FunctionCall> {
        self.first_content()?
            .parts
            .iter()
            .find_map(|p| p.function_call.as_ref())
    }

    fn finish_reason(&self) -> &str {
        self.candidates
            .first()
            .and_then(|c| c.finish_reason.as_deref())
            .unwrap_or("unknown")
    }
}

/// Result of [`GeminiClient::chat`].
#[derive(Debug, Clone, Serialize)]
pub struct ChatReply {
    pub response: String,
    /// Names of the tools called, in order.
    pub tool_calls: Vec<String>,
}

// ============ Client ============

pub struct GeminiClient {
    http: reqwest::Client,
    api_key: String,
    config: GeminiConfig,
}

impl GeminiClient {
    pub fn new(config: &GeminiConfig, api_key: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| Error::Upstream(format!("http client: {}", e)))?;
        Ok(Self {
            http,
            api_key: api_key.into(),
            config: config.clone(),
        })
    }

    /// Build a client from the full config; fails when `GEMINI_API_KEY` is unset.
    pub fn from_config(config: &Config) -> Result<Self> {
        Self::new(&config.gemini, config.gemini_api_key()?)
    }

    fn endpoint(&self, model: &str, method: &str) -> String {
        let model = if model.starts_with("models/") {
            model.to_string()
        } else {
            format!("models/{}", model)
        };
        format!(
            "{}/v1beta/{}:{}",
            self.config.base_url.trim_end_matches('/'),
            model,
            method
        )
    }

    /// POST JSON with the configured retry policy.
    async fn post(&self, url: &str, body: &Value) -> Result<Value> {
        let mut last_err = None;

        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tracing::warn!(attempt, ?delay, "retrying Gemini request");
                tokio::time::sleep(delay).await;
            }

            let resp = self
                .http
                .post(url)
                .header("x-goog-api-key", &self.api_key)
                .json(body)
                .send()
                .await;

            let response = match resp {
                Ok(response) => response,
                Err(e) => {
                    last_err = Some(if e.is_timeout() {
                        Error::Upstream(format!(
                            "request timed out after {}s",
                            self.config.timeout_secs
                        ))
                    } else {
                        Error::Upstream(format!("request failed: {}", e))
                    });
                    continue;
                }
            };

            let status = response.status();
            if status.is_success() {
                return response
                    .json::<Value>()
                    .await
                    .map_err(|e| Error::Upstream(format!("unreadable response: {}", e)));
            }

            let body_text = response.text().await.unwrap_or_default();
            let (message, api_status) = api_error(&body_text);

            if status.as_u16() == 429 || api_status.as_deref() == Some("RESOURCE_EXHAUSTED") {
                last_err = Some(Error::RateLimited(message));
                continue;
            }
            if status.is_server_error() {
                last_err = Some(Error::Upstream(format!("Gemini API error {}: {}", status, message)));
                continue;
            }
            return Err(Error::Upstream(format!("Gemini API error {}: {}", status, message)));
        }

        Err(last_err.unwrap_or_else(|| Error::Upstream("request failed after retries".into())))
    }

    /// Raw `generateContent` call.
    pub async fn generate(&self, request: &GenerateRequest) -> Result<GenerateResponse> {
        let url = self.endpoint(&self.config.model, "generateContent");
        let body = serde_json::to_value(request)
            .map_err(|e| Error::protocol(format!("cannot encode request: {}", e)))?;
        tracing::debug!(model = %self.config.model, contents = request.contents.len(), "generateContent");
        let json = self.post(&url, &body).await?;
        serde_json::from_value(json)
            .map_err(|e| Error::Upstream(format!("unexpected generateContent response: {}", e)))
    }

    async fn embed_batch(&self, texts: &[String], task: TaskType) -> Result<Vec<Vec<f32>>> {
        let model = if self.config.embedding_model.starts_with("models/") {
            self.config.embedding_model.clone()
        } else {
            format!("models/{}", self.config.embedding_model)
        };

        let requests: Vec<Value> = texts
            .iter()
            .map(|text| {
                let mut req = json!({
                    "model": model,
                    "content": { "parts": [{ "text": text }] },
                    "taskType": task.as_str(),
                });
                if let Some(dims) = self.config.embedding_dims {
                    req["outputDimensionality"] = json!(dims);
                }
                req
            })
            .collect();

        let url = self.endpoint(&self.config.embedding_model, "batchEmbedContents");
        let json = self.post(&url, &json!({ "requests": requests })).await?;
        parse_embeddings(&json, texts.len())
    }

    /// Answer `message` with Gemini function calling over `tools`.
    ///
    /// Each requested tool is executed locally and its output sent back
    /// until the model replies with text. Tool failures are reported to the
    /// model rather than aborting the chat.
    pub async fn chat(
        &self,
        message: &str,
        system_prompt: &str,
        tools: &ToolRegistry,
        ctx: &ToolContext,
    ) -> Result<ChatReply> {
        let declarations: Vec<FunctionDeclaration> = tools
            .tools()
            .iter()
            .map(|t| FunctionDeclaration {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: clean_schema(t.parameters_schema()),
            })
            .collect();

        let mut conversation = vec![
            ProtocolMessage::new(Role::System, system_prompt),
            ProtocolMessage::new(Role::User, message),
        ];
        let mut tool_calls = Vec::new();

        for _ in 0..self.config.max_tool_turns {
            let mut request = to_generate_request(&conversation)?;
            if !declarations.is_empty() {
                request.tools = vec![ToolDeclarations {
                    function_declarations: declarations.clone(),
                }];
            }

            let response = self.generate(&request).await?;

            let Some(call) = response.function_call().cloned() else {
                let text = response.text().ok_or_else(|| {
                    Error::Upstream(format!(
                        "response contained no text (finish reason: {})",
                        response.finish_reason()
                    ))
                })?;
                return Ok(ChatReply {
                    response: text,
                    tool_calls,
                });
            };

            tracing::info!(tool = %call.name, "model requested tool");
            tool_calls.push(call.name.clone());
            conversation.push(protocol::tool_call(&call.name, call.args.clone()));

            let outcome = match tools.find(&call.name) {
                Some(tool) => match validate_params(&tool.parameters_schema(), &call.args) {
                    Ok(params) => tool.execute(params, ctx).await,
                    Err(e) => Err(e),
                },
                None => Err(anyhow::anyhow!("no tool registered with name: {}", call.name)),
            };

            let result = match outcome {
                Ok(value) => protocol::tool_result(&call.name, value, true),
                Err(e) => {
                    tracing::warn!(tool = %call.name, error = %e, "tool failed");
                    protocol::tool_result(
                        &call.name,
                        json!(format!("Error executing tool: {}", e)),
                        false,
                    )
                }
            };
            conversation.push(result);
        }

        Err(Error::Upstream(format!(
            "model still requesting tools after {} turns",
            self.config.max_tool_turns
        )))
    }
}

#[async_trait]
impl AnalysisClient for GeminiClient {
    fn model_name(&self) -> &str {
        &self.config.model
    }

    async fn respond(&self, messages: &[ProtocolMessage]) -> Result<ProtocolMessage> {
        let request = to_generate_request(messages)?;
        let response = self.generate(&request).await?;
        let text = response.text().ok_or_else(|| {
            Error::Upstream(format!(
                "response contained no text (finish reason: {})",
                response.finish_reason()
            ))
        })?;
        Ok(reply_message(messages, text, &self.config.model))
    }

    async fn embed(&self, texts: &[String], task: TaskType) -> Result<Vec<Vec<f32>>> {
        let mut vectors = Vec::with_capacity(texts.len());
        for batch in texts.chunks(EMBED_BATCH_LIMIT) {
            vectors.extend(self.embed_batch(batch, task).await?);
        }
        Ok(vectors)
    }
}

/// Wrap model text as the reply to `messages`.
///
/// The reply is an `analysis_result` for the most recent
/// `analysis_request`, or a plain assistant message when there is none.
pub fn reply_message(messages: &[ProtocolMessage], text: String, model: &str) -> ProtocolMessage {
    let record_index = messages
        .iter()
        .rev()
        .find(|m| m.kind() == Some(KIND_REQUEST))
        .and_then(|m| m.metadata.get("record"))
        .and_then(|r| r.get("index"))
        .and_then(Value::as_u64);

    match record_index {
        Some(index) => protocol::wrap(&Payload::Response(AnalysisResult::from_text(
            index as usize,
            text,
            model,
        ))),
        None => ProtocolMessage::new(Role::Assistant, text),
    }
}

/// Map protocol messages onto Gemini `contents` + `systemInstruction`.
pub fn to_generate_request(messages: &[ProtocolMessage]) -> Result<GenerateRequest> {
    let mut system_parts = Vec::new();
    let mut contents = Vec::new();

    for message in messages {
        protocol::validate(message)?;
        match message.role {
            Role::System => system_parts.push(Part::text(message.content.clone())),
            Role::User => contents.push(Content {
                role: Some("user".into()),
                parts: vec![Part::text(protocol::render(message))],
            }),
            Role::Assistant => {
                let part = if message.kind() == Some(KIND_TOOL_CALL) {
                    Part {
                        function_call: Some(FunctionCall {
                            name: metadata_str(message, "tool"),
                            args: message.metadata.get("parameters").cloned().unwrap_or(json!({})),
                        }),
                        ..Default::default()
                    }
                } else {
                    Part::text(message.content.clone())
                };
                contents.push(Content {
                    role: Some("model".into()),
                    parts: vec![part],
                });
            }
            Role::Tool => {
                let result = if message.kind() == Some(KIND_TOOL_RESULT) {
                    message.metadata.get("result").cloned().unwrap_or(Value::Null)
                } else {
                    json!(message.content)
                };
                contents.push(Content {
                    role: Some("user".into()),
                    parts: vec![Part {
                        function_response: Some(FunctionResponse {
                            name: metadata_str(message, "tool"),
                            response: json!({ "result": result }),
                        }),
                        ..Default::default()
                    }],
                });
            }
        }
    }

    if contents.is_empty() {
        return Err(Error::protocol("conversation has no user message"));
    }

    Ok(GenerateRequest {
        contents,
        system_instruction: if system_parts.is_empty() {
            None
        } else {
            Some(Content {
                role: None,
                parts: system_parts,
            })
        },
        tools: Vec::new(),
    })
}

fn metadata_str(message: &ProtocolMessage, key: &str) -> String {
    message
        .metadata
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn parse_embeddings(json: &Value, expected: usize) -> Result<Vec<Vec<f32>>> {
    let items = json
        .get("embeddings")
        .and_then(Value::as_array)
        .ok_or_else(|| Error::Upstream("embedding response missing 'embeddings'".into()))?;

    if items.len() != expected {
        return Err(Error::Upstream(format!(
            "expected {} embeddings, got {}",
            expected,
            items.len()
        )));
    }

    items
        .iter()
        .map(|item| {
            let values = item
                .get("values")
                .and_then(Value::as_array)
                .filter(|v| !v.is_empty())
                .ok_or_else(|| Error::Upstream("embedding without values".into()))?;
            Ok(values
                .iter()
                .map(|v| v.as_f64().unwrap_or(0.0) as f32)
                .collect())
        })
        .collect()
}

/// Pull `error.message` out of a Google API error body, falling back to the raw text.
/// Message and `error.status` from a Gemini error body, falling back to the raw text.
fn api_error(body: &str) -> (String, Option<String>) {
    let parsed = serde_json::from_str::<Value>(body).ok();
    let field = |key: &str| {
        parsed
            .as_ref()
            .and_then(|v| v["error"][key].as_str())
            .map(String::from)
    };
    (field("message").unwrap_or_else(|| body.to_string()), field("status"))
}

/// Strip JSON Schema keys that Gemini function declarations reject.
///
/// Removes `title`, `$schema`, `additionalProperties`, and `id`, recursing
/// into `properties` and `items`.
pub fn clean_schema(schema: Value) -> Value {
    let Value::Object(mut map) = schema else {
        return schema;
    };

    for key in ["title", "$schema", "additionalProperties", "id"] {
        map.remove(key);
    }

    if let Some(Value::Object(props)) = map.remove("properties") {
        let cleaned = props
            .into_iter()
            .map(|(k, v)| (k, clean_schema(v)))
            .collect();
        map.insert("properties".into(), Value::Object(cleaned));
    }

    if let Some(items) = map.remove("items") {
        map.insert("items".into(), clean_schema(items));
    }

    Value::Object(map)
}
