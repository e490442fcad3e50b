//! CLI command implementations.
//!
//! Each `run_*` function wires the configured components together, calls
//! into the library and prints a short human-readable report to stdout.

use std::sync::Arc;
use std::time::Duration;

use crate::auth::CachedOAuth;
use crate::config::Config;
use crate::error::Result;
use crate::gemini::{AnalysisClient, GeminiClient};
use crate::pipeline::{self, RunOptions};
use crate::server::{self, AppState};
use crate::sheets::{GoogleSheetsSource, RecordSource};
use crate::store::{SqliteVectorStore, VectorStore};
use crate::tools::{ToolContext, ToolRegistry};

/// Sheets client authenticated from the configured token cache.
pub fn sheets_source(config: &Config) -> Result<GoogleSheetsSource> {
    let spreadsheet_id = config.spreadsheet_id()?;
    let tokens = CachedOAuth::new(
        &config.sheets.token_path,
        &config.sheets.credentials_path,
        &config.sheets.token_uri,
        Duration::from_secs(config.sheets.timeout_secs),
    )?;
    GoogleSheetsSource::new(&config.sheets, spreadsheet_id, Box::new(tokens))
}

pub async fn open_store(config: &Config) -> Result<SqliteVectorStore> {
    SqliteVectorStore::open(&config.store.path, &config.store.collection).await
}

fn truncate(text: &str, max_chars: usize) -> String {
    let flat = text.replace('\n', " ");
    if flat.chars().count() <= max_chars {
        flat
    } else {
        let cut: String = flat.chars().take(max_chars).collect();
        format!("{}…", cut)
    }
}

/// Fetch, analyze and store every row.
pub async fn run_pipeline(config: &Config, options: &RunOptions) -> Result<()> {
    let analyst = GeminiClient::from_config(config)?;
    let source = sheets_source(config)?;
    let store = open_store(config).await?;

    let summary = pipeline::run(&source, &analyst, &store, options).await?;
    store.close().await;

    println!("run");
    println!("  rows fetched: {}", summary.fetched);
    println!("  analyzed: {}", summary.analyzed);
    println!("  unchanged (skipped): {}", summary.skipped);
    println!("  embeddings stored: {}", summary.stored);
    println!("  store: {}", config.store.path.display());
    println!("ok");
    Ok(())
}

/// Print fetched rows without analyzing them.
pub async fn run_fetch(config: &Config, limit: Option<usize>) -> Result<()> {
    let source = sheets_source(config)?;
    let records = source.fetch_records().await?;

    println!("Fetched {} rows.", records.len());
    for record in records.iter().take(limit.unwrap_or(records.len())) {
        println!("  {}", record.describe());
    }
    Ok(())
}

pub async fn run_sheets(config: &Config) -> Result<()> {
    let source = sheets_source(config)?;
    let sheets = source.list_sheets().await?;
    if sheets.is_empty() {
        println!("No sheets found.");
        return Ok(());
    }
    println!("{:<12} TITLE", "SHEET ID");
    for sheet in sheets {
        println!("{:<12} {}", sheet.sheet_id, sheet.title);
    }
    Ok(())
}

pub async fn run_insights(config: &Config, prompt: Option<&str>) -> Result<()> {
    let analyst = GeminiClient::from_config(config)?;
    let source = sheets_source(config)?;
    let text = pipeline::insights(&source, &analyst, &config.analysis, prompt).await?;
    println!("{}", text);
    Ok(())
}

pub async fn run_search(config: &Config, query: &str, top_k: usize) -> Result<()> {
    let analyst = GeminiClient::from_config(config)?;
    let store = open_store(config).await?;
    let hits = pipeline::search(&analyst, &store, query, top_k).await?;
    store.close().await;

    if hits.is_empty() {
        println!("No results.");
        return Ok(());
    }
    for (rank, hit) in hits.iter().enumerate() {
        let analysis = hit
            .metadata
            .get("analysis")
            .and_then(|v| v.as_str())
            .unwrap_or("");
        println!("{}. [{:.3}] {}", rank + 1, hit.score, hit.id);
        println!("    {}", truncate(analysis, 160));
    }
    Ok(())
}

/// Print every stored entry. Needs neither network nor secrets.
pub async fn run_list(config: &Config) -> Result<()> {
    let store = open_store(config).await?;
    let entries = store.list().await?;
    store.close().await;

    if entries.is_empty() {
        println!("No stored analyses in collection '{}'.", config.store.collection);
        return Ok(());
    }
    println!("{} stored analyses in '{}':", entries.len(), config.store.collection);
    for entry in entries {
        let analysis = entry
            .metadata
            .get("analysis")
            .and_then(|v| v.as_str())
            .unwrap_or("");
        println!("  {}  {}", entry.id, truncate(analysis, 100));
    }
    Ok(())
}

pub async fn run_reset(config: &Config) -> Result<()> {
    let store = open_store(config).await?;
    let before = store.count().await?;
    store.clear().await?;
    store.close().await;
    println!(
        "Removed {} entries from collection '{}'.",
        before, config.store.collection
    );
    Ok(())
}

fn tool_context(analyst: Arc<GeminiClient>, store: SqliteVectorStore) -> ToolContext {
    let store: Arc<dyn VectorStore> = Arc::new(store);
    let analyst: Arc<dyn AnalysisClient> = analyst;
    ToolContext::new(store, analyst)
}

/// One chat turn with function calling over the stored analyses.
pub async fn run_chat(config: &Config, message: &str) -> Result<()> {
    let gemini = Arc::new(GeminiClient::from_config(config)?);
    let store = open_store(config).await?;
    let ctx = tool_context(gemini.clone(), store);
    let tools = ToolRegistry::with_builtins();

    let reply = gemini
        .chat(message, &config.analysis.system_prompt, &tools, &ctx)
        .await?;
    if !reply.tool_calls.is_empty() {
        println!("(tools used: {})", reply.tool_calls.join(", "));
    }
    println!("{}", reply.response);
    Ok(())
}

pub async fn run_serve(config: &Config) -> anyhow::Result<()> {
    let gemini = Arc::new(GeminiClient::from_config(config)?);
    let store = open_store(config).await?;
    let state = AppState {
        tools: Arc::new(ToolRegistry::with_builtins()),
        ctx: tool_context(gemini.clone(), store),
        gemini,
        system_prompt: config.analysis.system_prompt.clone(),
        token: config.server.token.clone(),
    };
    server::run_server(&config.server.bind, state).await
}
