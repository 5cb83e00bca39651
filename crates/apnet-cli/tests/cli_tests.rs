//! CLI behavior tests that never touch kernel state.

use assert_cmd::Command;
use predicates::prelude::*;
use std::io::Write;

fn write_topology(json: &str) -> tempfile::NamedTempFile {
    let mut f = tempfile::NamedTempFile::new().unwrap();
    f.write_all(json.as_bytes()).unwrap();
    f
}

const VALID_DOC: &str = r#"{
    "version": "1.0",
    "application": "apnet",
    "controllers": [{"name": "c0"}],
    "stations": [
        {"name": "sta1", "position": "10,10,0",
         "wlans": [{"mac": "02:00:00:00:00:01", "mode": "managed",
                    "ssid": "ssid-1", "channel": 1, "band": 20, "ieee": "g",
                    "txpower": 14.0, "antenna_gain": 5.0, "medium": 0}]}
    ],
    "aps": [
        {"name": "ap1", "position": "50,50,0",
         "wlans": [{"mac": "02:00:00:00:01:00", "mode": "master",
                    "ssid": "ssid-1", "channel": 1, "band": 20, "ieee": "g",
                    "txpower": 14.0, "antenna_gain": 5.0, "medium": 0}]}
    ],
    "links": [{"kind": "managed", "from": "sta1", "from_wlan": 0,
               "to": "ap1", "to_wlan": 0}]
}"#;

#[test]
fn help_lists_subcommands() {
    Command::cargo_bin("apnet")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("check"))
        .stdout(predicate::str::contains("cleanup"));
}

#[test]
fn check_accepts_a_valid_document() {
    let f = write_topology(VALID_DOC);
    Command::cargo_bin("apnet")
        .unwrap()
        .args(["check", f.path().to_str().unwrap()])
        .assert()
        .success()
        .stdout(predicate::str::contains("ok:"))
        .stdout(predicate::str::contains("1 stations"));
}

#[test]
fn missing_file_exits_with_config_error() {
    Command::cargo_bin("apnet")
        .unwrap()
        .args(["check", "/nonexistent/topo.json"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("ConfigError"));
}

#[test]
fn malformed_json_exits_with_config_error() {
    let f = write_topology("{ not json }");
    Command::cargo_bin("apnet")
        .unwrap()
        .args(["check", f.path().to_str().unwrap()])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("ConfigError"));
}

#[test]
fn duplicate_names_exit_with_config_error() {
    let doc = r#"{
        "version": "1.0",
        "application": "apnet",
        "stations": [{"name": "sta1"}, {"name": "sta1"}]
    }"#;
    let f = write_topology(doc);
    Command::cargo_bin("apnet")
        .unwrap()
        .args(["check", f.path().to_str().unwrap()])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("duplicate"));
}
