//! Configuration loading.
//!
//! Settings come from an optional TOML file and from environment variables.
//! The file provides model names, ranges, and server settings; the
//! environment provides secrets and paths and always wins over the file:
//!
//! | Variable | Field |
//! |----------|-------|
//! | `GEMINI_API_KEY` | `gemini.api_key` |
//! | `GOOGLE_SHEETS_ID` | `sheets.spreadsheet_id` |
//! | `GOOGLE_CREDENTIALS_PATH` | `sheets.credentials_path` |
//! | `GOOGLE_TOKEN_PATH` | `sheets.token_path` |
//! | `CHROMA_DB_PATH` | `store.path` |
//!
//! The binary loads a `.env` file from the working directory first; variables
//! already present in the process environment are not overwritten.
//!
//! Secrets are not required at load time. Commands that need one call the
//! matching accessor (e.g. [`Config::gemini_api_key`]), which fails with a
//! [`Error::Config`] naming the missing variable.

use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub gemini: GeminiConfig,
    #[serde(default)]
    pub sheets: SheetsConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub analysis: AnalysisConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct GeminiConfig {
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
    /// Requested output dimensionality; `None` keeps the model default.
    #[serde(default)]
    pub embedding_dims: Option<usize>,
    #[serde(default = "default_gemini_base_url")]
    pub base_url: String,
    #[serde(default = "default_gemini_timeout")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default = "default_max_tool_turns")]
    pub max_tool_turns: usize,
}

impl Default for GeminiConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            model: default_model(),
            embedding_model: default_embedding_model(),
            embedding_dims: None,
            base_url: default_gemini_base_url(),
            timeout_secs: default_gemini_timeout(),
            max_retries: 0,
            max_tool_turns: default_max_tool_turns(),
        }
    }
}

fn default_model() -> String {
    "gemini-2.0-flash".to_string()
}
fn default_embedding_model() -> String {
    "text-embedding-004".to_string()
}
fn default_gemini_base_url() -> String {
    "https://generativelanguage.googleapis.com".to_string()
}
fn default_gemini_timeout() -> u64 {
    60
}
fn default_max_tool_turns() -> usize {
    8
}

#[derive(Debug, Deserialize, Clone)]
pub struct SheetsConfig {
    #[serde(default)]
    pub spreadsheet_id: Option<String>,
    /// A1 notation, optionally prefixed with a tab name (`Sheet1!A1:Z1000`).
    #[serde(default = "default_range")]
    pub range: String,
    #[serde(default = "default_credentials_path")]
    pub credentials_path: PathBuf,
    #[serde(default = "default_token_path")]
    pub token_path: PathBuf,
    #[serde(default = "default_sheets_base_url")]
    pub base_url: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
    #[serde(default = "default_sheets_timeout")]
    pub timeout_secs: u64,
}

impl Default for SheetsConfig {
    fn default() -> Self {
        Self {
            spreadsheet_id: None,
            range: default_range(),
            credentials_path: default_credentials_path(),
            token_path: default_token_path(),
            base_url: default_sheets_base_url(),
            token_uri: default_token_uri(),
            timeout_secs: default_sheets_timeout(),
        }
    }
}

fn default_range() -> String {
    "A1:Z1000".to_string()
}
fn default_credentials_path() -> PathBuf {
    PathBuf::from("./credentials.json")
}
fn default_token_path() -> PathBuf {
    PathBuf::from("./token.json")
}
fn default_sheets_base_url() -> String {
    "https://sheets.googleapis.com".to_string()
}
fn default_token_uri() -> String {
    "https://oauth2.googleapis.com/token".to_string()
}
fn default_sheets_timeout() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    /// Directory holding the embedding database.
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
    #[serde(default = "default_collection")]
    pub collection: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
            collection: default_collection(),
        }
    }
}

fn default_store_path() -> PathBuf {
    PathBuf::from("./chroma_db")
}
fn default_collection() -> String {
    "stock_data".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct AnalysisConfig {
    /// Instruction sent with every record.
    #[serde(default = "default_instruction")]
    pub instruction: String,
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
    #[serde(default = "default_insights_prompt")]
    pub insights_prompt: String,
    /// Rows included verbatim in the `insights` context.
    #[serde(default = "default_sample_rows")]
    pub sample_rows: usize,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            instruction: default_instruction(),
            system_prompt: default_system_prompt(),
            insights_prompt: default_insights_prompt(),
            sample_rows: default_sample_rows(),
        }
    }
}

fn default_instruction() -> String {
    "Summarize this stock record in two or three sentences and point out anything unusual."
        .to_string()
}
fn default_system_prompt() -> String {
    "You are analyzing stock data from Google Sheets. Use the provided context to answer questions."
        .to_string()
}
fn default_insights_prompt() -> String {
    "Analyze the stock data and provide key insights. What trends do you notice?".to_string()
}
fn default_sample_rows() -> usize {
    20
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Bearer token required by `GET /health` when set.
    #[serde(default)]
    pub token: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            token: None,
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8000".to_string()
}

impl Config {
    /// Parse a TOML document without touching the environment.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::config(format!("failed to parse config: {}", e)))
    }

    /// Overlay environment variables using `lookup`. Empty values are ignored.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("GEMINI_API_KEY") {
            self.gemini.api_key = Some(v);
        }
        if let Some(v) = get("GOOGLE_SHEETS_ID") {
            self.sheets.spreadsheet_id = Some(v);
        }
        if let Some(v) = get("GOOGLE_CREDENTIALS_PATH") {
            self.sheets.credentials_path = PathBuf::from(v);
        }
        if let Some(v) = get("GOOGLE_TOKEN_PATH") {
            self.sheets.token_path = PathBuf::from(v);
        }
        if let Some(v) = get("CHROMA_DB_PATH") {
            self.store.path = PathBuf::from(v);
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.gemini.timeout_secs == 0 {
            return Err(Error::config("gemini.timeout_secs must be > 0"));
        }
        if self.sheets.timeout_secs == 0 {
            return Err(Error::config("sheets.timeout_secs must be > 0"));
        }
        if self.gemini.embedding_dims == Some(0) {
            return Err(Error::config("gemini.embedding_dims must be > 0 when set"));
        }
        if self.gemini.max_tool_turns == 0 {
            return Err(Error::config("gemini.max_tool_turns must be >= 1"));
        }
        if self.store.collection.trim().is_empty() {
            return Err(Error::config("store.collection must not be empty"));
        }
        if self.sheets.range.trim().is_empty() {
            return Err(Error::config("sheets.range must not be empty"));
        }
        Ok(())
    }

    pub fn gemini_api_key(&self) -> Result<&str> {
        self.gemini.api_key.as_deref().ok_or_else(|| {
            Error::config("GEMINI_API_KEY is not set. Export it or add it to a .env file.")
        })
    }

    pub fn spreadsheet_id(&self) -> Result<&str> {
        self.sheets.spreadsheet_id.as_deref().ok_or_else(|| {
            Error::config("GOOGLE_SHEETS_ID is not set. Use the ID from the sheet's URL.")
        })
    }
}

/// Load configuration from an optional TOML file plus the process environment.
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let mut config = match path {
        Some(path) => {
            let content = std::fs::read_to_string(path).map_err(|e| {
                Error::config(format!(
                    "failed to read config file {}: {}",
                    path.display(),
                    e
                ))
            })?;
            Config::from_toml_str(&content)?
        }
        None => Config::default(),
    };

    config.apply_env(|key| std::env::var(key).ok());
    config.validate()?;
    Ok(config)
}
