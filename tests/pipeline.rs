//! End-to-end pipeline runs against mocked Sheets and Gemini APIs.

use std::time::Duration;

use serde_json::{json, Value};
use sheetsense::auth::StaticToken;
use sheetsense::config::Config;
use sheetsense::gemini::GeminiClient;
use sheetsense::models::CellValue;
use sheetsense::pipeline::{self, RunOptions};
use sheetsense::sheets::{GoogleSheetsSource, RecordSource};
use sheetsense::store::{SqliteVectorStore, VectorStore};
use sheetsense::Error;
use tempfile::TempDir;
use wiremock::matchers::{header, method, path_regex};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn config_for(server: &MockServer) -> Config {
    let mut cfg = Config::default();
    cfg.gemini.base_url = server.uri();
    cfg.gemini.timeout_secs = 1;
    cfg.sheets.base_url = server.uri();
    cfg
}

fn source(cfg: &Config) -> GoogleSheetsSource {
    GoogleSheetsSource::new(&cfg.sheets, "sheet-1", Box::new(StaticToken("tok".into()))).unwrap()
}

fn text_reply(text: &str) -> Value {
    json!({
        "candidates": [{
            "content": { "role": "model", "parts": [{ "text": text }] },
            "finishReason": "STOP"
        }]
    })
}

async fn mount_sheet(server: &MockServer, values: Value) {
    Mock::given(method("GET"))
        .and(path_regex(r"^/v4/spreadsheets/sheet-1/values/.+$"))
        .and(header("authorization", "Bearer tok"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "range": "Sheet1!A1:Z1000",
            "majorDimension": "ROWS",
            "values": values
        })))
        .mount(server)
        .await;
}

async fn mount_embeddings(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path_regex(r":batchEmbedContents$"))
        .and(header("x-goog-api-key", "test-key"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "embeddings": [{ "values": [0.1, 0.2, 0.3] }] })),
        )
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_single_row_round_trip() {
    let server = MockServer::start().await;
    mount_sheet(&server, json!([["Symbol", "Price"], ["AAPL", 150]])).await;
    mount_embeddings(&server).await;
    Mock::given(method("POST"))
        .and(path_regex(r"/v1beta/models/gemini-2\.0-flash:generateContent$"))
        .and(header("x-goog-api-key", "test-key"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(text_reply("AAPL trades at 150.")),
        )
        .mount(&server)
        .await;

    let cfg = config_for(&server);
    let src = source(&cfg);

    let records = src.fetch_records().await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].get("Symbol"), Some(&CellValue::Text("AAPL".into())));
    assert_eq!(records[0].get("Price"), Some(&CellValue::Number(150.0)));

    let analyst = GeminiClient::new(&cfg.gemini, "test-key").unwrap();
    let dir = TempDir::new().unwrap();
    let store = SqliteVectorStore::open(dir.path(), "stock_data").await.unwrap();

    let summary = pipeline::run(&src, &analyst, &store, &RunOptions::new("summarize"))
        .await
        .unwrap();
    assert_eq!(summary.stored, 1);

    let entry = store.get("row_0").await.unwrap().unwrap();
    assert_eq!(entry.metadata["analysis"], json!("AAPL trades at 150."));
    assert_eq!(entry.metadata["record"], json!({ "Symbol": "AAPL", "Price": 150.0 }));

    let hits = store.query(&entry.vector, 1).await.unwrap();
    assert_eq!(hits[0].id, "row_0");
    assert!((hits[0].score - 1.0).abs() < 1e-6);
}

#[tokio::test]
async fn test_timeout_keeps_earlier_embeddings() {
    let server = MockServer::start().await;
    mount_sheet(
        &server,
        json!([["Symbol", "Price"], ["AAPL", 150], ["MSFT", 410], ["NVDA", 120]]),
    )
    .await;
    mount_embeddings(&server).await;

    Mock::given(method("POST"))
        .and(path_regex(r":generateContent$"))
        .respond_with(ResponseTemplate::new(200).set_body_json(text_reply("first row ok")))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path_regex(r":generateContent$"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(text_reply("too late"))
                .set_delay(Duration::from_secs(3)),
        )
        .with_priority(2)
        .mount(&server)
        .await;

    let cfg = config_for(&server);
    let analyst = GeminiClient::new(&cfg.gemini, "test-key").unwrap();
    let dir = TempDir::new().unwrap();
    let store = SqliteVectorStore::open(dir.path(), "stock_data").await.unwrap();

    let err = pipeline::run(&source(&cfg), &analyst, &store, &RunOptions::new("summarize"))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Upstream(_)), "got {:?}", err);
    assert!(err.to_string().contains("timed out"));
    assert_eq!(store.count().await.unwrap(), 1);
    let kept = store.get("row_0").await.unwrap().unwrap();
    assert_eq!(kept.metadata["analysis"], json!("first row ok"));
}

#[tokio::test]
async fn test_rate_limit_surfaces_as_rate_limited() {
    let server = MockServer::start().await;
    mount_sheet(&server, json!([["Symbol"], ["AAPL"]])).await;
    Mock::given(method("POST"))
        .and(path_regex(r":generateContent$"))
        .respond_with(ResponseTemplate::new(429).set_body_json(json!({
            "error": { "code": 429, "message": "Resource has been exhausted", "status": "RESOURCE_EXHAUSTED" }
        })))
        .mount(&server)
        .await;

    let cfg = config_for(&server);
    let analyst = GeminiClient::new(&cfg.gemini, "test-key").unwrap();
    let dir = TempDir::new().unwrap();
    let store = SqliteVectorStore::open(dir.path(), "stock_data").await.unwrap();

    let err = pipeline::run(&source(&cfg), &analyst, &store, &RunOptions::new("x"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::RateLimited(_)));
    assert_eq!(err.stage(), "analysis");
    assert!(err.to_string().contains("Resource has been exhausted"));
    assert_eq!(store.count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_resource_exhausted_status_is_rate_limited() {
    let server = MockServer::start().await;
    mount_sheet(&server, json!([["Symbol"], ["AAPL"]])).await;
    Mock::given(method("POST"))
        .and(path_regex(r":generateContent$"))
        .respond_with(ResponseTemplate::new(403).set_body_json(json!({
            "error": { "code": 403, "message": "Quota exceeded", "status": "RESOURCE_EXHAUSTED" }
        })))
        .mount(&server)
        .await;

    let cfg = config_for(&server);
    let analyst = GeminiClient::new(&cfg.gemini, "test-key").unwrap();
    let dir = TempDir::new().unwrap();
    let store = SqliteVectorStore::open(dir.path(), "stock_data").await.unwrap();

    let err = pipeline::run(&source(&cfg), &analyst, &store, &RunOptions::new("x"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::RateLimited(_)), "got {:?}", err);
    assert!(err.to_string().contains("Quota exceeded"));
    assert_eq!(store.count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_retries_recover_from_server_error() {
    let server = MockServer::start().await;
    mount_sheet(&server, json!([["Symbol"], ["AAPL"]])).await;
    mount_embeddings(&server).await;
    Mock::given(method("POST"))
        .and(path_regex(r":generateContent$"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path_regex(r":generateContent$"))
        .respond_with(ResponseTemplate::new(200).set_body_json(text_reply("recovered")))
        .with_priority(2)
        .mount(&server)
        .await;

    let mut cfg = config_for(&server);
    cfg.gemini.max_retries = 1;
    let analyst = GeminiClient::new(&cfg.gemini, "test-key").unwrap();
    let dir = TempDir::new().unwrap();
    let store = SqliteVectorStore::open(dir.path(), "stock_data").await.unwrap();

    let summary = pipeline::run(&source(&cfg), &analyst, &store, &RunOptions::new("x"))
        .await
        .unwrap();
    assert_eq!(summary.stored, 1);
}

#[tokio::test]
async fn test_malformed_header_is_schema_error() {
    let server = MockServer::start().await;
    mount_sheet(&server, json!([["Symbol", "Symbol"], ["AAPL", "MSFT"]])).await;

    let cfg = config_for(&server);
    let err = source(&cfg).fetch_records().await.unwrap_err();
    assert!(matches!(err, Error::Schema(_)));
    assert_eq!(err.stage(), "source");
}

#[tokio::test]
async fn test_sheets_error_is_source_unavailable() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(403).set_body_string("forbidden"))
        .mount(&server)
        .await;

    let cfg = config_for(&server);
    let err = source(&cfg).fetch_records().await.unwrap_err();
    assert!(matches!(err, Error::SourceUnavailable(_)));
}

#[tokio::test]
async fn test_list_sheets() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path_regex(r"^/v4/spreadsheets/sheet-1$"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "sheets": [
                { "properties": { "sheetId": 0, "title": "Sheet1" } },
                { "properties": { "sheetId": 42, "title": "Watchlist" } }
            ]
        })))
        .mount(&server)
        .await;

    let cfg = config_for(&server);
    let sheets = source(&cfg).list_sheets().await.unwrap();
    assert_eq!(sheets.len(), 2);
    assert_eq!(sheets[1].title, "Watchlist");
    assert_eq!(sheets[1].sheet_id, 42);
}
