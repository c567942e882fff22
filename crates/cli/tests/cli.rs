//! Smoke tests for the `graphrag` binary

use assert_cmd::Command;
use predicates::prelude::*;

fn graphrag() -> Command {
    let mut cmd = Command::cargo_bin("graphrag").unwrap();
    cmd.env("GRAPHRAG_PROVIDER", "ollama")
        .env("GRAPHRAG_LLM_URL", "http://127.0.0.1:9");
    cmd
}

#[test]
fn test_help_lists_commands() {
    graphrag()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("index"))
        .stdout(predicate::str::contains("query"))
        .stdout(predicate::str::contains("invalidate"));
}

#[test]
fn test_reset_db_missing_path() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("absent");

    graphrag()
        .args(["reset-db", "--db-path"])
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("nothing to remove"));
}

#[test]
fn test_reset_db_removes_directory() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("data");
    std::fs::create_dir_all(path.join("nested")).unwrap();

    graphrag()
        .args(["reset-db", "--db-path"])
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("Removed database"));
    assert!(!path.exists());
}

#[test]
fn test_stats_on_empty_memory_db() {
    graphrag()
        .args(["--memory", "stats"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Graphs: 0"));
}

#[test]
fn test_graphs_on_empty_memory_db() {
    graphrag()
        .args(["--memory", "graphs"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No graphs indexed yet"));
}

#[test]
fn test_query_unknown_graph_fails() {
    graphrag()
        .args(["--memory", "query", "0123456789abcdef", "Who supplies JapanCo?"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Not found"));
}

#[test]
fn test_invalidate_requires_target() {
    graphrag()
        .args(["--memory", "invalidate"])
        .assert()
        .failure();
}

#[test]
fn test_index_refuses_unreachable_provider() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("doc.txt");
    std::fs::write(&file, "Acme Corp supplies chips to TaiwanTech.").unwrap();

    graphrag()
        .args(["--memory", "index"])
        .arg(&file)
        .assert()
        .failure()
        .stderr(predicate::str::contains("not reachable"));
}
