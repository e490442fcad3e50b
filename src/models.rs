//! Core data models used throughout sheetsense.
//!
//! These types represent the spreadsheet rows, analysis requests, and
//! analysis results that flow through the pipeline.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// A single spreadsheet cell.
///
/// Cells are read with `UNFORMATTED_VALUE`, so numeric cells arrive as JSON
/// numbers and stay numbers here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CellValue {
    Number(f64),
    Bool(bool),
    Text(String),
    Empty,
}

impl CellValue {
    /// Convert a raw JSON cell from the Sheets API.
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Null => CellValue::Empty,
            Value::Bool(b) => CellValue::Bool(*b),
            Value::Number(n) => n
                .as_f64()
                .map(CellValue::Number)
                .unwrap_or_else(|| CellValue::Text(n.to_string())),
            Value::String(s) if s.is_empty() => CellValue::Empty,
            Value::String(s) => CellValue::Text(s.clone()),
            other => CellValue::Text(other.to_string()),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            CellValue::Empty => true,
            CellValue::Text(s) => s.trim().is_empty(),
            _ => false,
        }
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

impl fmt::Display for CellValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CellValue::Number(n) if n.fract() == 0.0 && n.abs() < 1e15 => {
                write!(f, "{}", *n as i64)
            }
            CellValue::Number(n) => write!(f, "{}", n),
            CellValue::Bool(true) => write!(f, "TRUE"),
            CellValue::Bool(false) => write!(f, "FALSE"),
            CellValue::Text(s) => write!(f, "{}", s),
            CellValue::Empty => Ok(()),
        }
    }
}

/// One column of a [`Record`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub column: String,
    pub value: CellValue,
}

/// One spreadsheet data row, keyed by the header columns.
///
/// `index` is the 0-based position among data rows (the header is not
/// counted) and is the record's identity for the run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub index: usize,
    pub fields: Vec<Field>,
}

impl Record {
    pub fn new(index: usize, fields: Vec<Field>) -> Self {
        Self { index, fields }
    }

    /// Store identifier for embeddings derived from this record.
    pub fn id(&self) -> String {
        format!("row_{}", self.index)
    }

    pub fn get(&self, column: &str) -> Option<&CellValue> {
        self.fields
            .iter()
            .find(|f| f.column == column)
            .map(|f| &f.value)
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.column.as_str())
    }

    /// One-line text form used for prompts and embedding documents.
    ///
    /// Empty cells are left out: `Stock data row 0: Symbol: AAPL | Price: 150`.
    pub fn describe(&self) -> String {
        let parts: Vec<String> = self
            .fields
            .iter()
            .filter(|f| !f.value.is_empty())
            .map(|f| format!("{}: {}", f.column, f.value))
            .collect();
        format!("Stock data row {}: {}", self.index, parts.join(" | "))
    }

    /// Column → value object, in header order where the map preserves it.
    pub fn to_json_object(&self) -> Map<String, Value> {
        self.fields
            .iter()
            .map(|f| (f.column.clone(), f.value.to_json()))
            .collect()
    }
}

/// A record plus the natural-language instruction to apply to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisRequest {
    pub record: Record,
    pub instruction: String,
}

impl AnalysisRequest {
    pub fn new(record: Record, instruction: impl Into<String>) -> Self {
        Self {
            record,
            instruction: instruction.into(),
        }
    }
}

/// Output of the AI endpoint for one record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub record_index: usize,
    pub text: String,
    /// Parsed JSON when the model answered with a JSON document.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structured: Option<Value>,
    pub model: String,
}

impl AnalysisResult {
    /// Build a result from raw model text, detecting structured output.
    pub fn from_text(record_index: usize, text: impl Into<String>, model: impl Into<String>) -> Self {
        let text = text.into();
        let structured = extract_structured(&text);
        Self {
            record_index,
            text,
            structured,
            model: model.into(),
        }
    }
}

/// Parse a JSON object or array out of model text, accepting a fenced
/// ```` ```json ```` block.
pub fn extract_structured(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    let body = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.strip_suffix("```"))
        .map(str::trim)
        .unwrap_or(trimmed);

    match serde_json::from_str::<Value>(body) {
        Ok(v @ Value::Object(_)) | Ok(v @ Value::Array(_)) => Some(v),
        _ => None,
    }
}
