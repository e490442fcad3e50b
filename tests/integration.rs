use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use serde_json::json;
use tempfile::TempDir;
use wiremock::matchers::{method, path_regex};
use wiremock::{Mock, MockServer, ResponseTemplate};

const ENV_VARS: [&str; 6] = [
    "GEMINI_API_KEY",
    "GOOGLE_SHEETS_ID",
    "GOOGLE_CREDENTIALS_PATH",
    "GOOGLE_TOKEN_PATH",
    "CHROMA_DB_PATH",
    "SHEETSENSE_CONFIG",
];

fn sheetsense_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("sheetsense");
    path
}

/// Temp dir with a config pointing every path inside it.
/// `mock_uri` routes both Google APIs to a mock server.
fn setup_test_env(mock_uri: Option<&str>, api_key: bool) -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path();

    fs::write(
        root.join("token.json"),
        json!({ "token": "cached-token", "expiry": "2999-01-01T00:00:00Z" }).to_string(),
    )
    .unwrap();

    let uri = mock_uri.unwrap_or("http://127.0.0.1:9");
    let key_line = if api_key { "api_key = \"test-key\"" } else { "" };
    let config = format!(
        r#"[gemini]
{key}
base_url = "{uri}"
timeout_secs = 5

[sheets]
spreadsheet_id = "sheet-1"
base_url = "{uri}"
token_path = "{root}/token.json"
credentials_path = "{root}/credentials.json"

[store]
path = "{root}/db"
"#,
        key = key_line,
        uri = uri,
        root = root.display()
    );

    let config_path = root.join("sheetsense.toml");
    fs::write(&config_path, config).unwrap();
    (tmp, config_path)
}

fn run_sheetsense(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = sheetsense_binary();
    let mut cmd = Command::new(&binary);
    for var in ENV_VARS {
        cmd.env_remove(var);
    }
    // Run from the temp dir so only its `.env` (if any) is picked up.
    if let Some(dir) = config_path.parent() {
        cmd.current_dir(dir);
    }
    let output = cmd
        .arg("--config")
        .arg(config_path)
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run sheetsense binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

async fn mock_apis() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path_regex(r"^/v4/spreadsheets/sheet-1/values/.+$"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "values": [["Symbol", "Price"], ["AAPL", 150], ["XOM", 110]]
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path_regex(r":generateContent$"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "candidates": [{
                "content": { "role": "model", "parts": [{ "text": "Steady large-cap stock." }] },
                "finishReason": "STOP"
            }]
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path_regex(r":batchEmbedContents$"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "embeddings": [{ "values": [0.3, 0.4, 0.5] }] })),
        )
        .mount(&server)
        .await;
    server
}

#[test]
fn test_missing_api_key_fails_in_config_stage() {
    let (_tmp, config_path) = setup_test_env(None, false);

    let (stdout, stderr, success) = run_sheetsense(&config_path, &["run"]);
    assert!(!success, "run should fail: stdout={}", stdout);
    assert!(stderr.contains("error: config stage failed"), "stderr={}", stderr);
    assert!(stderr.contains("GEMINI_API_KEY"));
}

#[test]
fn test_no_subcommand_runs_pipeline() {
    let (_tmp, config_path) = setup_test_env(None, false);

    let (_, stderr, success) = run_sheetsense(&config_path, &[]);
    assert!(!success);
    assert!(stderr.contains("GEMINI_API_KEY"), "stderr={}", stderr);
}

#[test]
fn test_invalid_config_file() {
    let tmp = TempDir::new().unwrap();
    let config_path = tmp.path().join("bad.toml");
    fs::write(&config_path, "[gemini\nmodel = ").unwrap();

    let (_, stderr, success) = run_sheetsense(&config_path, &["list"]);
    assert!(!success);
    assert!(stderr.contains("error: config stage failed"), "stderr={}", stderr);
}

#[test]
fn test_list_empty_store() {
    let (_tmp, config_path) = setup_test_env(None, false);

    let (stdout, stderr, success) = run_sheetsense(&config_path, &["list"]);
    assert!(success, "list failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("No stored analyses in collection 'stock_data'"));
}

#[test]
fn test_reset_empty_store() {
    let (_tmp, config_path) = setup_test_env(None, false);

    let (stdout, stderr, success) = run_sheetsense(&config_path, &["reset"]);
    assert!(success, "reset failed: stderr={}", stderr);
    assert!(stdout.contains("Removed 0 entries"));
}

#[test]
fn test_unreachable_sheets_fails_in_source_stage() {
    let (_tmp, config_path) = setup_test_env(None, true);

    let (_, stderr, success) = run_sheetsense(&config_path, &["fetch"]);
    assert!(!success);
    assert!(stderr.contains("error: source stage failed"), "stderr={}", stderr);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_run_then_list_and_rerun() {
    let server = mock_apis().await;
    let (_tmp, config_path) = setup_test_env(Some(&server.uri()), true);

    let (stdout, stderr, success) = run_sheetsense(&config_path, &["run"]);
    assert!(success, "run failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("rows fetched: 2"));
    assert!(stdout.contains("embeddings stored: 2"));
    assert!(stdout.contains("ok"));

    let (stdout, _, success) = run_sheetsense(&config_path, &["list"]);
    assert!(success);
    assert!(stdout.contains("2 stored analyses"));
    assert!(stdout.contains("row_0"));
    assert!(stdout.contains("row_1"));

    // Nothing changed, so the second run skips both rows.
    let (stdout, _, success) = run_sheetsense(&config_path, &["run"]);
    assert!(success);
    assert!(stdout.contains("unchanged (skipped): 2"));

    let (stdout, _, success) = run_sheetsense(&config_path, &["run", "--force", "--limit", "1"]);
    assert!(success);
    assert!(stdout.contains("analyzed: 1"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_fetch_prints_rows() {
    let server = mock_apis().await;
    let (_tmp, config_path) = setup_test_env(Some(&server.uri()), false);

    let (stdout, stderr, success) = run_sheetsense(&config_path, &["fetch"]);
    assert!(success, "fetch failed: stderr={}", stderr);
    assert!(stdout.contains("Fetched 2 rows."));
    assert!(stdout.contains("Stock data row 0: Symbol: AAPL | Price: 150"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_search_after_run() {
    let server = mock_apis().await;
    let (_tmp, config_path) = setup_test_env(Some(&server.uri()), true);

    let (_, stderr, success) = run_sheetsense(&config_path, &["run"]);
    assert!(success, "run failed: stderr={}", stderr);

    let (stdout, stderr, success) =
        run_sheetsense(&config_path, &["search", "large caps", "--top-k", "1"]);
    assert!(success, "search failed: stderr={}", stderr);
    assert!(stdout.contains("1. [1.000] row_0"), "stdout={}", stdout);
    assert!(stdout.contains("Steady large-cap stock."));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_dotenv_file_supplies_api_key() {
    let server = mock_apis().await;
    let (tmp, config_path) = setup_test_env(Some(&server.uri()), false);
    fs::write(tmp.path().join(".env"), "GEMINI_API_KEY=from-dotenv\n").unwrap();

    let (stdout, stderr, success) = run_sheetsense(&config_path, &["run"]);
    assert!(success, "run failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("embeddings stored: 2"));
}
