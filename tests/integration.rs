use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use axum::response::Html;
use axum::routing::get;
use axum::Router;
use tempfile::TempDir;

fn docmirror_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_docmirror"))
}

const WEBHOOKS_PAGE: &str = "<html><head><title>Webhooks | Acme Docs</title></head><body>\
    <main><h2>Webhook signatures</h2>\
    <p>Verify webhook signatures with the endpoint signing secret before trusting any event. \
    Reject events whose timestamp is older than five minutes to prevent replay attacks.</p>\
    </main></body></html>";

/// Serve one documentation page on an ephemeral port. The returned runtime
/// keeps the server alive.
fn start_docs_server() -> (tokio::runtime::Runtime, String) {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .enable_all()
        .build()
        .unwrap();
    let base = runtime.block_on(async {
        let app = Router::new().route("/docs/webhooks", get(|| async { Html(WEBHOOKS_PAGE) }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    });
    (runtime, base)
}

fn setup_test_env(base_url: &str) -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let config_content = format!(
        r#"[db]
path = "{root}/data/docmirror.sqlite"

[crawl]
timeout_ms = 2000
fetch_retries = 0
min_text_chars = 40
max_depth = 0

[tenants.restricted]
allow_sources = ["other"]

[[sources]]
id = "acme"
name = "Acme Docs"
base_url = "{base}/docs"
seed_urls = ["{base}/docs/webhooks"]
trust_score = 0.9
"#,
        root = root.display(),
        base = base_url,
    );

    let config_path = config_dir.join("docmirror.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_docmirror(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = docmirror_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .env("RUST_LOG", "warn")
        .output()
        .unwrap_or_else(|e| panic!("Failed to run docmirror binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env("http://127.0.0.1:9");

    let (stdout, stderr, success) = run_docmirror(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));

    let (_, stderr, success) = run_docmirror(&config_path, &["init"]);
    assert!(success, "Second init failed (not idempotent): {}", stderr);
}

#[test]
fn test_missing_config_errors() {
    let tmp = TempDir::new().unwrap();
    let (_, stderr, success) = run_docmirror(&tmp.path().join("nope.toml"), &["init"]);
    assert!(!success);
    assert!(stderr.contains("Failed to read config file"));
}

#[test]
fn test_sources_before_first_sync() {
    let (_tmp, config_path) = setup_test_env("http://127.0.0.1:9");
    run_docmirror(&config_path, &["init"]);

    let (stdout, stderr, success) = run_docmirror(&config_path, &["sources"]);
    assert!(success, "sources failed: {}", stderr);
    assert!(stdout.contains("SOURCE"));
    assert!(stdout.contains("acme"));
    assert!(stdout.contains("failing"));
    assert!(stdout.contains("never"));
}

#[test]
fn test_sync_unknown_source() {
    let (_tmp, config_path) = setup_test_env("http://127.0.0.1:9");
    run_docmirror(&config_path, &["init"]);

    let (_, stderr, success) = run_docmirror(&config_path, &["sync", "nope"]);
    assert!(!success);
    assert!(stderr.contains("Unknown source: 'nope'"));
}

#[test]
fn test_sync_unreachable_source_fails() {
    let (_tmp, config_path) = setup_test_env("http://127.0.0.1:9");
    run_docmirror(&config_path, &["init"]);

    let (stdout, _, success) = run_docmirror(&config_path, &["sync", "acme"]);
    assert!(!success);
    assert!(stdout.contains("status: failed"));
    assert!(stdout.contains("failed: 1"));
}

#[test]
fn test_sync_search_answer_changes() {
    let (_runtime, base) = start_docs_server();
    let (_tmp, config_path) = setup_test_env(&base);
    run_docmirror(&config_path, &["init"]);

    let (stdout, stderr, success) = run_docmirror(&config_path, &["sync", "all"]);
    assert!(success, "sync failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("sync acme"));
    assert!(stdout.contains("status: success"));
    assert!(stdout.contains("documents inserted: 1"));
    assert!(stdout.contains("change events: 1"));
    assert!(stdout.contains("ok"));

    let (stdout, _, success) = run_docmirror(&config_path, &["search", "webhook signatures"]);
    assert!(success);
    assert!(stdout.contains("1. ["));
    assert!(stdout.contains(&format!("url: {}/docs/webhooks", base)));
    assert!(stdout.contains("section: Webhook signatures"));

    let (stdout, _, success) = run_docmirror(&config_path, &["search", "kubernetes helm"]);
    assert!(success);
    assert!(stdout.contains("No results."));

    let (stdout, _, success) = run_docmirror(
        &config_path,
        &["answer", "how do I verify webhook signatures"],
    );
    assert!(success);
    let response: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(response["decision"]["status"], "grounded");
    assert_eq!(response["citations"][0]["source"], "acme");
    assert!(response["answer"]
        .as_str()
        .unwrap()
        .contains("Verify webhook signatures"));

    let (stdout, _, success) = run_docmirror(
        &config_path,
        &["answer", "webhook signatures", "--tenant", "restricted", "--source", "acme"],
    );
    assert!(success);
    let response: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(response["decision"]["status"], "policy_blocked");

    let (stdout, _, success) = run_docmirror(&config_path, &["changes", "--source", "acme"]);
    assert!(success);
    assert!(stdout.contains("document_added Webhooks"));

    let (stdout, _, success) =
        run_docmirror(&config_path, &["changes", "--event-type", "deprecation"]);
    assert!(success);
    assert!(stdout.contains("No changes."));

    let (stdout, _, success) = run_docmirror(&config_path, &["sources"]);
    assert!(success);
    assert!(stdout.contains("healthy"));
    assert!(stdout.contains("success"));
}

#[test]
fn test_worker_once_syncs_due_sources() {
    let (_runtime, base) = start_docs_server();
    let (_tmp, config_path) = setup_test_env(&base);
    run_docmirror(&config_path, &["init"]);

    let (stdout, stderr, success) = run_docmirror(&config_path, &["worker", "--once"]);
    assert!(success, "worker failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("completed: 1"));
    assert!(stdout.contains("failed: 0"));

    // The source is no longer due.
    let (stdout, _, success) = run_docmirror(&config_path, &["worker", "--once"]);
    assert!(success);
    assert!(stdout.contains("completed: 0"));
}
