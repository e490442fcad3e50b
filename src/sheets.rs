//! Data source adapter: spreadsheet rows → [`Record`]s.
//!
//! [`RecordSource`] is the seam the pipeline depends on.
//! [`GoogleSheetsSource`] implements it over the Sheets v4 REST API;
//! the header handling lives in [`records_from_values`] so it can be
//! tested without a network.
//!
//! # Header rules
//!
//! - The first row is the header. No rows at all, or an empty header, is
//!   a schema error.
//! - Column names are trimmed; blank or duplicate names are schema errors.
//! - Short data rows are padded with [`CellValue::Empty`]; data rows with
//!   more cells than the header are schema errors.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::auth::TokenProvider;
use crate::config::SheetsConfig;
use crate::error::{Error, Result};
use crate::models::{CellValue, Field, Record};

/// Anything that can produce the ordered records for a run.
#[async_trait]
pub trait RecordSource: Send + Sync {
    async fn fetch_records(&self) -> Result<Vec<Record>>;
}

/// Tab metadata returned by [`GoogleSheetsSource::list_sheets`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SheetInfo {
    pub title: String,
    pub sheet_id: i64,
}

#[derive(Deserialize)]
struct ValueRange {
    #[serde(default)]
    values: Vec<Vec<Value>>,
}

/// Google Sheets v4 client for a single spreadsheet.
pub struct GoogleSheetsSource {
    http: reqwest::Client,
    base_url: String,
    spreadsheet_id: String,
    range: String,
    tokens: Box<dyn TokenProvider>,
}

impl GoogleSheetsSource {
    pub fn new(
        config: &SheetsConfig,
        spreadsheet_id: impl Into<String>,
        tokens: Box<dyn TokenProvider>,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| Error::SourceUnavailable(format!("http client: {}", e)))?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            spreadsheet_id: spreadsheet_id.into(),
            range: config.range.clone(),
            tokens,
        })
    }

    /// Override the A1 range read by [`fetch_records`](RecordSource::fetch_records).
    pub fn with_range(mut self, range: impl Into<String>) -> Self {
        self.range = range.into();
        self
    }

    fn url(&self, segments: &[&str]) -> Result<reqwest::Url> {
        let mut url = reqwest::Url::parse(&self.base_url)
            .map_err(|e| Error::config(format!("invalid sheets base_url: {}", e)))?;
        url.path_segments_mut()
            .map_err(|_| Error::config("sheets base_url cannot be a base"))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(
        &self,
        url: reqwest::Url,
        query: &[(&str, &str)],
    ) -> Result<T> {
        let token = self.tokens.access_token().await?;
        let response = self
            .http
            .get(url)
            .query(query)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| Error::SourceUnavailable(format!("sheets request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::SourceUnavailable(format!(
                "sheets API returned {}: {}",
                status, body
            )));
        }

        response
            .json()
            .await
            .map_err(|e| Error::SourceUnavailable(format!("unreadable sheets response: {}", e)))
    }

    /// Raw cell grid for the configured range.
    pub async fn fetch_values(&self) -> Result<Vec<Vec<Value>>> {
        let url = self.url(&["v4", "spreadsheets", &self.spreadsheet_id, "values", &self.range])?;
        tracing::debug!(range = %self.range, "fetching sheet values");
        let range: ValueRange = self
            .get_json(
                url,
                &[
                    ("valueRenderOption", "UNFORMATTED_VALUE"),
                    ("majorDimension", "ROWS"),
                ],
            )
            .await?;
        Ok(range.values)
    }

    /// Titles and ids of every tab in the spreadsheet.
    pub async fn list_sheets(&self) -> Result<Vec<SheetInfo>> {
        let url = self.url(&["v4", "spreadsheets", &self.spreadsheet_id])?;
        let body: Value = self
            .get_json(url, &[("fields", "sheets.properties(sheetId,title)")])
            .await?;

        let sheets = body
            .get("sheets")
            .and_then(Value::as_array)
            .map(|sheets| {
                sheets
                    .iter()
                    .filter_map(|s| {
                        let props = s.get("properties")?;
                        Some(SheetInfo {
                            title: props.get("title")?.as_str()?.to_string(),
                            sheet_id: props.get("sheetId").and_then(Value::as_i64).unwrap_or(0),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(sheets)
    }
}

#[async_trait]
impl RecordSource for GoogleSheetsSource {
    async fn fetch_records(&self) -> Result<Vec<Record>> {
        let values = self.fetch_values().await?;
        let records = records_from_values(&values)?;
        tracing::info!(rows = records.len(), "fetched records");
        Ok(records)
    }
}

/// A fixed set of records, for tests and piping pre-fetched data.
pub struct StaticSource(pub Vec<Record>);

#[async_trait]
impl RecordSource for StaticSource {
    async fn fetch_records(&self) -> Result<Vec<Record>> {
        Ok(self.0.clone())
    }
}

/// Convert a header-first cell grid into records.
pub fn records_from_values(values: &[Vec<Value>]) -> Result<Vec<Record>> {
    let Some((header_row, data_rows)) = values.split_first() else {
        return Err(Error::schema("sheet has no header row"));
    };

    let header = parse_header(header_row)?;

    data_rows
        .iter()
        .enumerate()
        .map(|(index, row)| {
            if row.len() > header.len() {
                return Err(Error::schema(format!(
                    "data row {} has {} cells but the header has {} columns",
                    index,
                    row.len(),
                    header.len()
                )));
            }
            let fields = header
                .iter()
                .enumerate()
                .map(|(col, name)| Field {
                    column: name.clone(),
                    value: row.get(col).map(CellValue::from_json).unwrap_or(CellValue::Empty),
                })
                .collect();
            Ok(Record::new(index, fields))
        })
        .collect()
}

fn parse_header(row: &[Value]) -> Result<Vec<String>> {
    if row.is_empty() {
        return Err(Error::schema("header row is empty"));
    }

    let mut seen = HashSet::new();
    let mut header = Vec::with_capacity(row.len());
    for (col, cell) in row.iter().enumerate() {
        let name = match cell {
            Value::String(s) => s.trim().to_string(),
            Value::Null => String::new(),
            other => other.to_string(),
        };
        if name.is_empty() {
            return Err(Error::schema(format!("header column {} has no name", col + 1)));
        }
        if !seen.insert(name.clone()) {
            return Err(Error::schema(format!("duplicate header column '{}'", name)));
        }
        header.push(name);
    }
    Ok(header)
}
