use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn ragchat_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_ragchat"))
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let policy = "HR policy: employees accrue paid leave monthly and request time off through their manager. ".repeat(7);
    let docs = serde_json::json!({
        "docs": [
            {"id": "A", "department": "HR", "text": policy},
            {"id": "B", "department": "Security", "text": "Rotate credentials every ninety days and report phishing."}
        ]
    });
    fs::write(root.join("docs.json"), docs.to_string()).unwrap();
    fs::write(
        root.join("eval.json"),
        r#"[{"q": "paid leave policy", "expected_doc_id": "A"}, {"q": "rotate credentials phishing", "expected_doc_id": "B"}]"#,
    )
    .unwrap();

    let config_content = format!(
        r#"[db]
path = "{root}/data/ragchat.sqlite"

[store]
dir = "{root}/data/rag"

[server]
bind = "127.0.0.1:0"

[embedding]
provider = "hash"
"#,
        root = root.display()
    );

    let config_path = config_dir.join("ragchat.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_ragchat(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = ragchat_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path)
        .args(args)
        .env_remove("CHAT_CONTEXT_MAX_TURNS")
        .output()
        .unwrap_or_else(|e| panic!("Failed to run ragchat binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

#[test]
fn test_init_creates_database_and_store() {
    let (tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_ragchat(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("Database initialized"));
    assert!(tmp.path().join("data/ragchat.sqlite").exists());
    assert!(tmp.path().join("data/rag/rag_index.bin").exists());
    assert!(tmp.path().join("data/rag/rag_meta.json").exists());
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (_, _, success1) = run_ragchat(&config_path, &["init"]);
    assert!(success1, "First init failed");

    let (_, _, success2) = run_ragchat(&config_path, &["init"]);
    assert!(success2, "Second init failed (not idempotent)");
}

#[test]
fn test_ingest_then_query() {
    let (tmp, config_path) = setup_test_env();
    let docs = tmp.path().join("docs.json");

    let (stdout, stderr, success) = run_ragchat(&config_path, &["ingest", docs.to_str().unwrap()]);
    assert!(success, "ingest failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("model dummy-32-hash"));

    let (stdout, stderr, success) = run_ragchat(
        &config_path,
        &["query", "HR policy", "--department", "HR", "--k", "1"],
    );
    assert!(success, "query failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("A::chunk"));
    assert!(!stdout.contains("B::chunk"));
    assert!(stdout.starts_with("1. ["));
    assert!(!stdout.contains("2. ["));
}

#[test]
fn test_query_is_deterministic() {
    let (tmp, config_path) = setup_test_env();
    let docs = tmp.path().join("docs.json");
    run_ragchat(&config_path, &["ingest", docs.to_str().unwrap()]);

    let (first, _, _) = run_ragchat(&config_path, &["query", "credentials", "--no-mmr"]);
    let (second, _, _) = run_ragchat(&config_path, &["query", "credentials", "--no-mmr"]);
    assert_eq!(first, second);
}

#[test]
fn test_blank_query_has_no_results() {
    let (_tmp, config_path) = setup_test_env();
    let (stdout, stderr, success) = run_ragchat(&config_path, &["query", "   "]);
    assert!(success, "query failed: stderr={}", stderr);
    assert!(stdout.contains("No results."));
}

#[test]
fn test_mmr_flags_conflict() {
    let (_tmp, config_path) = setup_test_env();
    let (_, _, success) = run_ragchat(
        &config_path,
        &["query", "x", "--no-mmr", "--mmr-lambda", "0.5"],
    );
    assert!(!success);
}

#[test]
fn test_eval_prints_metrics() {
    let (tmp, config_path) = setup_test_env();
    let docs = tmp.path().join("docs.json");
    run_ragchat(&config_path, &["ingest", docs.to_str().unwrap()]);

    let eval = tmp.path().join("eval.json");
    let (stdout, stderr, success) = run_ragchat(&config_path, &["eval", eval.to_str().unwrap(), "--k", "4"]);
    assert!(success, "eval failed: stdout={}, stderr={}", stdout, stderr);
    let metrics: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(metrics["n"], 2);
    assert_eq!(metrics["recall_at_k"], 1.0);
}

#[test]
fn test_overwrite_replaces_store() {
    let (tmp, config_path) = setup_test_env();
    let docs = tmp.path().join("docs.json");
    run_ragchat(&config_path, &["ingest", docs.to_str().unwrap()]);

    let replacement = tmp.path().join("replacement.json");
    fs::write(
        &replacement,
        r#"{"docs": [{"id": "C", "department": "HR", "text": "Remote work requires manager approval."}]}"#,
    )
    .unwrap();
    let (_, stderr, success) = run_ragchat(
        &config_path,
        &["ingest", replacement.to_str().unwrap(), "--overwrite"],
    );
    assert!(success, "overwrite failed: {}", stderr);

    let (stdout, _, _) = run_ragchat(&config_path, &["query", "HR policy", "--k", "5"]);
    assert!(stdout.contains("C::chunk0"));
    assert!(!stdout.contains("A::chunk"));
}

#[test]
fn test_missing_config_file_errors() {
    let tmp = TempDir::new().unwrap();
    let (_, stderr, success) = run_ragchat(&tmp.path().join("nope.toml"), &["init"]);
    assert!(!success);
    assert!(stderr.contains("Failed to read config file"));
}

#[test]
fn test_invalid_config_is_rejected() {
    let (_tmp, config_path) = setup_test_env();
    let mut content = fs::read_to_string(&config_path).unwrap();
    content.push_str("\n[chunking]\nsize = 100\noverlap = 100\n");
    fs::write(&config_path, content).unwrap();

    let (_, stderr, success) = run_ragchat(&config_path, &["init"]);
    assert!(!success);
    assert!(stderr.contains("chunking"));
}
