//! HTTP tool server over a real listener, with Gemini mocked.

use std::sync::Arc;

use serde_json::{json, Value};
use sheetsense::config::Config;
use sheetsense::gemini::{AnalysisClient, GeminiClient};
use sheetsense::server::{self, AppState};
use sheetsense::store::{InMemoryVectorStore, Metadata, VectorStore};
use sheetsense::tools::{ToolContext, ToolRegistry};
use tokio::net::TcpListener;
use wiremock::matchers::{body_string_contains, method, path_regex};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct Harness {
    base: String,
    client: reqwest::Client,
    gemini_mock: MockServer,
}

async fn start(token: Option<&str>) -> Harness {
    let gemini_mock = MockServer::start().await;

    let mut cfg = Config::default();
    cfg.gemini.base_url = gemini_mock.uri();
    cfg.gemini.timeout_secs = 5;

    let store = InMemoryVectorStore::new();
    for (i, (symbol, vector)) in [("AAPL", [1.0f32, 0.0]), ("XOM", [0.0f32, 1.0])].iter().enumerate() {
        let mut meta = Metadata::new();
        meta.insert("row_index".into(), json!(i));
        meta.insert("record".into(), json!({ "Symbol": symbol }));
        meta.insert("analysis".into(), json!(format!("{} analysis", symbol)));
        store.upsert(&format!("row_{}", i), vector, &meta).await.unwrap();
    }

    let gemini = Arc::new(GeminiClient::new(&cfg.gemini, "test-key").unwrap());
    let analyst: Arc<dyn AnalysisClient> = gemini.clone();
    let store: Arc<dyn VectorStore> = Arc::new(store);

    let state = AppState {
        tools: Arc::new(ToolRegistry::with_builtins()),
        ctx: ToolContext::new(store, analyst),
        gemini,
        system_prompt: cfg.analysis.system_prompt.clone(),
        token: token.map(String::from),
    };

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(server::serve(listener, state));

    Harness {
        base: format!("http://{}", addr),
        client: reqwest::Client::new(),
        gemini_mock,
    }
}

impl Harness {
    async fn post(&self, path: &str, body: Value) -> (u16, Value) {
        let resp = self
            .client
            .post(format!("{}{}", self.base, path))
            .json(&body)
            .send()
            .await
            .unwrap();
        let status = resp.status().as_u16();
        (status, resp.json().await.unwrap())
    }

    async fn post_raw(&self, path: &str, body: &'static str) -> (u16, Value) {
        let resp = self
            .client
            .post(format!("{}{}", self.base, path))
            .body(body)
            .send()
            .await
            .unwrap();
        let status = resp.status().as_u16();
        (status, resp.json().await.unwrap())
    }
}

#[tokio::test]
async fn test_health_without_token() {
    let h = start(None).await;
    let resp = h.client.get(format!("{}/health", h.base)).send().await.unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], json!("ok"));
    assert_eq!(body["tools"], json!(3));
}

#[tokio::test]
async fn test_health_requires_bearer_token() {
    let h = start(Some("s3cret")).await;

    let resp = h.client.get(format!("{}/health", h.base)).send().await.unwrap();
    assert_eq!(resp.status().as_u16(), 401);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], json!("unauthorized"));

    let resp = h
        .client
        .get(format!("{}/health", h.base))
        .bearer_auth("wrong")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 401);

    let resp = h
        .client
        .get(format!("{}/health", h.base))
        .bearer_auth("s3cret")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);
}

#[tokio::test]
async fn test_tools_list() {
    let h = start(None).await;
    let body: Value = h
        .client
        .get(format!("{}/tools/list", h.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let names: Vec<&str> = body["tools"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["search_records", "get_record", "list_records"]);
    assert_eq!(body["tools"][0]["parameters"]["required"], json!(["query"]));
}

#[tokio::test]
async fn test_get_and_list_records() {
    let h = start(None).await;

    let (status, body) = h.post("/tools/get_record", json!({ "row_index": 1 })).await;
    assert_eq!(status, 200);
    assert_eq!(body["result"]["metadata"]["analysis"], json!("XOM analysis"));

    let (status, body) = h.post("/tools/get_record", json!({ "row_index": 7 })).await;
    assert_eq!(status, 404);
    assert_eq!(body["error"]["code"], json!("not_found"));

    let (status, body) = h.post("/tools/list_records", json!({})).await;
    assert_eq!(status, 200);
    assert_eq!(body["result"]["total"], json!(2));
}

#[tokio::test]
async fn test_parameter_validation_and_unknown_tool() {
    let h = start(None).await;

    let (status, body) = h.post("/tools/search_records", json!({})).await;
    assert_eq!(status, 400);
    assert!(body["error"]["message"]
        .as_str()
        .unwrap()
        .contains("missing required parameter: query"));

    let (status, body) = h.post("/tools/get_record", json!({ "row_index": "one" })).await;
    assert_eq!(status, 400);
    assert_eq!(body["error"]["code"], json!("bad_request"));

    let (status, body) = h.post("/tools/delete_everything", json!({})).await;
    assert_eq!(status, 404);
    assert_eq!(body["error"]["code"], json!("not_found"));
}

#[tokio::test]
async fn test_search_records_embeds_query() {
    let h = start(None).await;
    Mock::given(method("POST"))
        .and(path_regex(r":batchEmbedContents$"))
        .and(body_string_contains("RETRIEVAL_QUERY"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "embeddings": [{ "values": [0.1, 0.9] }] })),
        )
        .mount(&h.gemini_mock)
        .await;

    let (status, body) = h
        .post("/tools/search_records", json!({ "query": "oil companies", "top_k": 1 }))
        .await;
    assert_eq!(status, 200);
    let results = body["result"]["results"].as_array().unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0]["id"], json!("row_1"));
}

#[tokio::test]
async fn test_chat_runs_tool_loop() {
    let h = start(None).await;

    // Second turn: the tool output has been sent back, answer in text.
    Mock::given(method("POST"))
        .and(path_regex(r":generateContent$"))
        .and(body_string_contains("functionResponse"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "candidates": [{
                "content": { "role": "model", "parts": [{ "text": "You have 2 analyzed rows." }] },
                "finishReason": "STOP"
            }]
        })))
        .with_priority(1)
        .mount(&h.gemini_mock)
        .await;
    // First turn: ask for list_records.
    Mock::given(method("POST"))
        .and(path_regex(r":generateContent$"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "candidates": [{
                "content": { "role": "model", "parts": [{ "functionCall": { "name": "list_records", "args": {} } }] }
            }]
        })))
        .with_priority(2)
        .mount(&h.gemini_mock)
        .await;

    let (status, body) = h.post("/chat", json!({ "message": "How many rows?" })).await;
    assert_eq!(status, 200, "body: {}", body);
    assert_eq!(body["response"], json!("You have 2 analyzed rows."));
    assert_eq!(body["tool_calls"], json!(["list_records"]));
}

#[tokio::test]
async fn test_chat_upstream_failure_maps_to_502() {
    let h = start(None).await;
    Mock::given(method("POST"))
        .and(path_regex(r":generateContent$"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": { "code": 400, "message": "API key not valid" }
        })))
        .mount(&h.gemini_mock)
        .await;

    let (status, body) = h.post("/chat", json!({ "message": "hi" })).await;
    assert_eq!(status, 502);
    assert_eq!(body["error"]["code"], json!("upstream"));
    assert!(body["error"]["message"].as_str().unwrap().contains("API key not valid"));
}

#[tokio::test]
async fn test_malformed_bodies_use_error_envelope() {
    let h = start(None).await;

    let (status, body) = h.post_raw("/tools/search_records", "{not json").await;
    assert_eq!(status, 400);
    assert_eq!(body["error"]["code"], json!("bad_request"));
    assert!(body["error"]["message"].as_str().unwrap().contains("not valid JSON"));

    let (status, body) = h.post_raw("/chat", "hello").await;
    assert_eq!(status, 400);
    assert_eq!(body["error"]["code"], json!("bad_request"));
}

#[tokio::test]
async fn test_empty_body_means_no_parameters() {
    let h = start(None).await;

    let (status, body) = h.post_raw("/tools/list_records", "").await;
    assert_eq!(status, 200);
    assert_eq!(body["result"]["total"], json!(2));
}

#[tokio::test]
async fn test_unknown_parameter_rejected() {
    let h = start(None).await;

    let (status, body) = h
        .post("/tools/get_record", json!({ "row_index": 0, "include_vector": true }))
        .await;
    assert_eq!(status, 400);
    assert_eq!(body["error"]["message"], json!("unknown parameter: include_vector"));
}
