//! The four-stage run: source → protocol → analysis → protocol → store.
//!
//! Records are processed one at a time in sheet order. The first error
//! aborts the run; everything upserted before it stays in the store, since
//! each upsert replaces a single entry.
//!
//! Each stored entry carries a `content_hash` over the record, the
//! instruction and the model. On a re-run, rows whose hash is unchanged are
//! skipped unless `force` is set.

use serde::Serialize;
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};

use crate::config::AnalysisConfig;
use crate::error::{Error, Result};
use crate::gemini::{AnalysisClient, TaskType};
use crate::models::{AnalysisRequest, AnalysisResult, Record};
use crate::protocol::{Conversation, ProtocolMessage, Role};
use crate::sheets::RecordSource;
use crate::store::{Metadata, QueryHit, VectorStore};

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub instruction: String,
    /// Re-analyze rows even when their stored hash matches.
    pub force: bool,
    /// Process at most this many records.
    pub limit: Option<usize>,
}

impl RunOptions {
    pub fn new(instruction: impl Into<String>) -> Self {
        Self {
            instruction: instruction.into(),
            force: false,
            limit: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub fetched: usize,
    pub analyzed: usize,
    pub skipped: usize,
    pub stored: usize,
}

/// Run the pipeline once over every record `source` yields.
pub async fn run(
    source: &dyn RecordSource,
    analyst: &dyn AnalysisClient,
    store: &dyn VectorStore,
    options: &RunOptions,
) -> Result<RunSummary> {
    let records = source.fetch_records().await?;
    let mut summary = RunSummary {
        fetched: records.len(),
        ..Default::default()
    };

    if records.is_empty() {
        tracing::warn!("sheet has no data rows; nothing to analyze");
        return Ok(summary);
    }

    let take = options.limit.unwrap_or(records.len());
    tracing::info!(records = records.len(), processing = take.min(records.len()), "starting run");

    for record in records.into_iter().take(take) {
        let id = record.id();
        let hash = content_hash(&record, &options.instruction, analyst.model_name());

        if !options.force && stored_hash(store, &id).await?.as_deref() == Some(hash.as_str()) {
            tracing::debug!(%id, "unchanged since last run, skipping");
            summary.skipped += 1;
            continue;
        }

        let request = AnalysisRequest::new(record, options.instruction.clone());
        let result = analyst.analyze(&request).await?;
        if result.record_index != request.record.index {
            return Err(Error::protocol(format!(
                "result for row {} returned for request on row {}",
                result.record_index, request.record.index
            )));
        }
        summary.analyzed += 1;

        let document = document_text(&request.record, &result);
        let vector = analyst
            .embed(std::slice::from_ref(&document), TaskType::RetrievalDocument)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Error::Upstream(format!("no embedding returned for {}", id)))?;

        let metadata = entry_metadata(&request.record, &result, document, hash);
        store.upsert(&id, &vector, &metadata).await?;
        summary.stored += 1;
        tracing::info!(%id, dims = vector.len(), "stored analysis");
    }

    if summary.skipped > 0 {
        tracing::warn!(skipped = summary.skipped, "rows unchanged since last run; use --force to re-analyze");
    }
    Ok(summary)
}

async fn stored_hash(store: &dyn VectorStore, id: &str) -> Result<Option<String>> {
    Ok(store.get(id).await?.and_then(|entry| {
        entry
            .metadata
            .get("content_hash")
            .and_then(Value::as_str)
            .map(String::from)
    }))
}

/// SHA-256 (hex) over the record's cells, the instruction and the model.
pub fn content_hash(record: &Record, instruction: &str, model: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(Value::Object(record.to_json_object()).to_string().as_bytes());
    hasher.update([0u8]);
    hasher.update(instruction.as_bytes());
    hasher.update([0u8]);
    hasher.update(model.as_bytes());
    hex::encode(hasher.finalize())
}

/// Text that gets embedded: the row description followed by the analysis.
pub fn document_text(record: &Record, result: &AnalysisResult) -> String {
    format!("{}\n\nAnalysis: {}", record.describe(), result.text)
}

fn entry_metadata(
    record: &Record,
    result: &AnalysisResult,
    document: String,
    hash: String,
) -> Metadata {
    let mut metadata = Map::new();
    metadata.insert("row_index".into(), json!(record.index));
    metadata.insert("record".into(), Value::Object(record.to_json_object()));
    metadata.insert("analysis".into(), json!(result.text));
    if let Some(structured) = &result.structured {
        metadata.insert("structured".into(), structured.clone());
    }
    metadata.insert("document".into(), json!(document));
    metadata.insert("model".into(), json!(result.model));
    metadata.insert("content_hash".into(), json!(hash));
    metadata.insert("analyzed_at".into(), json!(chrono::Utc::now().to_rfc3339()));
    metadata
}

/// Ask the model for an overall analysis of the sheet.
///
/// `prompt` defaults to the configured insights prompt.
pub async fn insights(
    source: &dyn RecordSource,
    analyst: &dyn AnalysisClient,
    config: &AnalysisConfig,
    prompt: Option<&str>,
) -> Result<String> {
    let records = source.fetch_records().await?;
    if records.is_empty() {
        tracing::warn!("sheet has no data rows; skipping insights");
        return Ok("No data available for insights.".to_string());
    }

    let mut conversation = Conversation::new();
    let mut meta = Map::new();
    meta.insert("rows".into(), json!(records.len()));
    conversation.add(
        Role::User,
        describe_dataset(&records, config.sample_rows),
        Some(meta),
    );

    let user_prompt = prompt.unwrap_or(&config.insights_prompt);
    let messages = [
        ProtocolMessage::new(Role::System, config.system_prompt.clone()),
        ProtocolMessage::new(Role::User, conversation.build_prompt(user_prompt, true, &[])),
    ];

    tracing::info!(rows = records.len(), "requesting dataset insights");
    let reply = analyst.respond(&messages).await?;
    Ok(reply.content)
}

/// Row count, column names and the first `sample_rows` rows as text.
pub fn describe_dataset(records: &[Record], sample_rows: usize) -> String {
    let columns: Vec<&str> = records
        .first()
        .map(|r| r.columns().collect())
        .unwrap_or_default();

    let mut lines = vec![
        format!("Dataset: {} rows", records.len()),
        format!("Columns: {}", columns.join(", ")),
        String::new(),
        "Sample rows:".to_string(),
    ];
    lines.extend(records.iter().take(sample_rows).map(Record::describe));
    lines.join("\n")
}

/// Embed `query` and return the `top_k` closest stored analyses.
pub async fn search(
    analyst: &dyn AnalysisClient,
    store: &dyn VectorStore,
    query: &str,
    top_k: usize,
) -> Result<Vec<QueryHit>> {
    if query.trim().is_empty() {
        return Err(Error::InvalidInput("search query must not be empty".into()));
    }
    let vector = analyst
        .embed(&[query.to_string()], TaskType::RetrievalQuery)
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| Error::Upstream("no embedding returned for query".into()))?;
    store.query(&vector, top_k).await
}
