//! End-to-end CLI tests for the streamfetch binary.

// `Command::cargo_bin` is deprecated in assert_cmd >=2.0.17 in favor of
// `cargo::cargo_bin_cmd!` macro.
#![allow(deprecated)]

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn write_config(config_home: &std::path::Path, contents: &str) {
    let config_dir = config_home.join("streamfetch");
    std::fs::create_dir_all(&config_dir).unwrap();
    std::fs::write(config_dir.join("config.toml"), contents).unwrap();
}

fn streamfetch(config_home: &std::path::Path) -> Command {
    let mut cmd = Command::cargo_bin("streamfetch").unwrap();
    cmd.env("XDG_CONFIG_HOME", config_home).env_remove("RUST_LOG");
    cmd
}

#[test]
fn test_binary_help_lists_subcommands() {
    let mut cmd = Command::cargo_bin("streamfetch").unwrap();
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("resolve"))
        .stdout(predicate::str::contains("variants"))
        .stdout(predicate::str::contains("download"))
        .stdout(predicate::str::contains("records"));
}

#[test]
fn test_binary_without_subcommand_fails() {
    let mut cmd = Command::cargo_bin("streamfetch").unwrap();
    cmd.assert().failure().code(2);
}

#[test]
fn test_records_on_empty_file_reports_nothing() {
    let tempdir = TempDir::new().unwrap();
    let records = tempdir.path().join("records.json");

    streamfetch(&tempdir.path().join("xdg"))
        .arg("records")
        .arg("--file")
        .arg(&records)
        .assert()
        .success()
        .stdout(predicate::str::contains("No downloads recorded"));
}

#[test]
fn test_records_json_on_empty_file_is_empty_array() {
    let tempdir = TempDir::new().unwrap();

    let assert = streamfetch(&tempdir.path().join("xdg"))
        .args(["-q", "records", "--json", "--file"])
        .arg(tempdir.path().join("records.json"))
        .assert()
        .success();
    let stdout = String::from_utf8_lossy(&assert.get_output().stdout).to_string();
    let parsed: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(parsed, serde_json::json!([]));
}

#[test]
fn test_config_records_path_is_used() {
    let tempdir = TempDir::new().unwrap();
    let config_home = tempdir.path().join("xdg");
    let records = tempdir.path().join("configured.json");
    write_config(
        &config_home,
        &format!(
            "records_path = \"{}\"\n",
            records.to_string_lossy().replace('\\', "\\\\")
        ),
    );

    streamfetch(&config_home)
        .arg("records")
        .assert()
        .success()
        .stdout(predicate::str::contains("configured.json"));
}

#[test]
fn test_invalid_config_key_fails() {
    let tempdir = TempDir::new().unwrap();
    let config_home = tempdir.path().join("xdg");
    write_config(&config_home, "colour = \"blue\"\n");

    streamfetch(&config_home)
        .arg("records")
        .assert()
        .failure()
        .stderr(predicate::str::contains("config"));
}

#[test]
fn test_resolve_with_missing_module_fails() {
    let tempdir = TempDir::new().unwrap();

    streamfetch(&tempdir.path().join("xdg"))
        .arg("--modules")
        .arg(tempdir.path().join("modules"))
        .args(["resolve", "nowhere", "https://site.example/ep/1"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("nowhere"));
}

#[test]
fn test_download_season_without_show_is_usage_error() {
    let mut cmd = Command::cargo_bin("streamfetch").unwrap();
    cmd.args(["download", "https://cdn.example/a.mp4", "--season", "1"])
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("--show"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_variants_lists_playlist_qualities() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/master.m3u8"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            "#EXTM3U\n\
             #EXT-X-STREAM-INF:BANDWIDTH=800000,RESOLUTION=854x480\n\
             low.m3u8\n\
             #EXT-X-STREAM-INF:BANDWIDTH=5000000,RESOLUTION=1920x1080\n\
             hd.m3u8\n",
        ))
        .mount(&server)
        .await;
    let url = format!("{}/master.m3u8", server.uri());
    let tempdir = TempDir::new().unwrap();
    let config_home = tempdir.path().join("xdg");

    let output = tokio::task::spawn_blocking(move || {
        streamfetch(&config_home)
            .args(["-q", "variants", &url, "--quality", "best"])
            .output()
            .unwrap()
    })
    .await
    .unwrap();

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    let lines: Vec<&str> = stdout.lines().collect();
    assert_eq!(lines.len(), 3, "unexpected output: {stdout}");
    assert!(lines[0].contains("Auto"));
    assert!(lines[1].starts_with('*'));
    assert!(lines[1].contains("1080p"));
    assert!(lines[2].contains("480p"));
}
