//! Command-line smoke tests

use assert_cmd::Command;
use serde_json::Value;
use tempfile::TempDir;

fn cli() -> Command {
    let mut cmd = Command::cargo_bin("catalog-crawler").unwrap();
    cmd.env_remove("CATALOG_DB")
        .env_remove("CATALOG_EMAIL")
        .env_remove("CATALOG_PASSWORD")
        .env_remove("CATALOG_BASE_URL");
    cmd
}

#[test]
fn test_help_lists_commands() {
    let output = cli().arg("--help").output().unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for command in ["crawl", "status", "export", "reset"] {
        assert!(stdout.contains(command), "help is missing {command}");
    }
}

#[test]
fn test_status_on_fresh_store() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("nested").join("progress.db");

    let output = cli()
        .args(["status", "--output-format", "json", "--database"])
        .arg(&db)
        .output()
        .unwrap();

    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    let status: Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(status["records"]["total"], 0);
    assert_eq!(status["committed_pages"], 0);
    assert_eq!(status["cursor"]["next_page"], 1);
    assert!(db.exists());
}

#[test]
fn test_export_empty_store_writes_file() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("progress.db");
    let csv = dir.path().join("records.csv");

    cli()
        .args(["export", "--output-format", "json", "--database"])
        .arg(&db)
        .arg("--output")
        .arg(&csv)
        .assert()
        .success();

    assert!(csv.exists());
}

#[test]
fn test_reset_requires_a_target() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("progress.db");

    cli().arg("reset").arg("--database").arg(&db).assert().failure();
    cli()
        .args(["reset", "--cursor", "--failed", "--database"])
        .arg(&db)
        .assert()
        .success();
}

#[test]
fn test_crawl_requires_credentials() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("progress.db");

    let output = cli()
        .args(["crawl", "--base-url", "http://127.0.0.1:9", "--database"])
        .arg(&db)
        .output()
        .unwrap();

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("--email"), "{stderr}");
}

#[test]
fn test_invalid_resume_mode_is_rejected() {
    let output = cli()
        .args([
            "crawl",
            "--email",
            "me@example.com",
            "--password",
            "secret",
            "--resume",
            "sideways",
        ])
        .output()
        .unwrap();

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Invalid resume mode"), "{stderr}");
}
