use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Child, Command as StdCommand, Stdio};
use std::sync::OnceLock;

use assert_cmd::Command;
use serde_json::Value;
use tempfile::TempDir;

static DAEMON_BIN: OnceLock<PathBuf> = OnceLock::new();

struct DaemonGuard {
    child: Child,
}

impl Drop for DaemonGuard {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn workspace_root() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .parent()
        .expect("workspace root")
        .to_path_buf()
}

fn daemon_bin() -> &'static PathBuf {
    DAEMON_BIN.get_or_init(|| {
        let root = workspace_root();
        let status = StdCommand::new("cargo")
            .arg("build")
            .arg("-p")
            .arg("hostlinkd")
            .current_dir(&root)
            .status()
            .expect("cargo build should run");

        assert!(status.success(), "failed to build hostlinkd binary");

        root.join("target/debug/hostlinkd")
    })
}

fn hostlink(db: &Path) -> Command {
    let mut command = Command::new(assert_cmd::cargo::cargo_bin!("hostlink"));
    command.arg("--json").arg("--db").arg(db);
    command
}

fn parse_json_output(output: &[u8]) -> Value {
    serde_json::from_slice(output).expect("command output should be valid json")
}

fn run_ok(command: &mut Command) -> Value {
    let output = command.assert().success().get_output().stdout.clone();
    let json = parse_json_output(&output);
    assert_eq!(json["ok"], Value::Bool(true));
    json["result"].clone()
}

fn run_err(command: &mut Command, code: i32) -> Value {
    let output = command.assert().code(code).get_output().stderr.clone();
    let json = parse_json_output(&output);
    assert_eq!(json["ok"], Value::Bool(false));
    assert_eq!(json["error"]["code"], code);
    json["error"].clone()
}

fn write_daemon_config(dir: &Path) -> PathBuf {
    fs::create_dir_all(dir.join("Assets")).expect("project marker");
    let config_path = dir.join("hostlink.toml");
    let config = r#"
[global]
instance_id = "e2e-host"
project_dir = "."

[poller]
interval = "50ms"

[sessions]
clear_check_interval = "50ms"
"#;
    fs::write(&config_path, config).expect("config should be written");
    config_path
}

#[test]
fn resubmitting_a_correlation_returns_the_original() {
    let temp = TempDir::new().expect("tempdir");
    let db = temp.path().join("coordination.db");

    let first = run_ok(
        hostlink(&db)
            .arg("submit")
            .arg("refresh")
            .arg("--correlation")
            .arg("abc")
            .arg("--payload")
            .arg("{\"scene\":\"Main\"}"),
    );
    assert_eq!(first["status"], "pending");
    assert_eq!(first["duplicate"], false);
    assert_eq!(first["payload"], "{\"scene\":\"Main\"}");

    let second = run_ok(
        hostlink(&db)
            .arg("submit")
            .arg("refresh")
            .arg("--correlation")
            .arg("abc"),
    );
    assert_eq!(second["duplicate"], true);
    assert_eq!(second["id"], first["id"]);

    let status = run_ok(hostlink(&db).arg("status").arg("abc"));
    assert_eq!(status["id"], first["id"]);
    assert_eq!(status["result"], Value::Null);

    let listed = run_ok(hostlink(&db).arg("list").arg("--status").arg("pending"));
    assert_eq!(listed.as_array().map(Vec::len), Some(1));
}

#[test]
fn cancel_only_affects_pending_requests() {
    let temp = TempDir::new().expect("tempdir");
    let db = temp.path().join("coordination.db");

    let submitted = run_ok(hostlink(&db).arg("submit").arg("import"));
    let id = submitted["id"].as_i64().expect("numeric id");

    let cancelled = run_ok(hostlink(&db).arg("cancel").arg(id.to_string()));
    assert_eq!(cancelled["cancel"]["outcome"], "cancelled");

    let again = run_ok(hostlink(&db).arg("cancel").arg(id.to_string()));
    assert_eq!(again["cancel"]["outcome"], "not_pending");
    assert_eq!(again["cancel"]["status"], "cancelled");

    let error = run_err(hostlink(&db).arg("cancel").arg("9999"), 4);
    assert_eq!(error["kind"], "not_found");
}

#[test]
fn wait_without_a_host_times_out() {
    let temp = TempDir::new().expect("tempdir");
    let db = temp.path().join("coordination.db");

    run_ok(
        hostlink(&db)
            .arg("submit")
            .arg("refresh")
            .arg("--correlation")
            .arg("orphan"),
    );

    let error = run_err(
        hostlink(&db)
            .arg("wait")
            .arg("orphan")
            .arg("--timeout")
            .arg("300ms")
            .arg("--interval")
            .arg("50ms"),
        5,
    );
    let message = error["message"].as_str().unwrap_or_default();
    assert!(message.contains("still pending"), "{message}");
    assert!(message.contains("no host has reported status"), "{message}");
}

#[test]
fn unknown_targets_exit_not_found() {
    let temp = TempDir::new().expect("tempdir");
    let db = temp.path().join("coordination.db");

    run_err(hostlink(&db).arg("status").arg("42"), 4);
    run_err(hostlink(&db).arg("host"), 4);
    // No session has been opened yet.
    run_err(hostlink(&db).arg("logs"), 4);
}

#[test]
fn empty_store_reports_empty_collections() {
    let temp = TempDir::new().expect("tempdir");
    let db = temp.path().join("coordination.db");

    let sessions = run_ok(hostlink(&db).arg("sessions"));
    assert_eq!(sessions, Value::Array(Vec::new()));

    let stats = run_ok(hostlink(&db).arg("stats"));
    assert_eq!(stats["sessions"], 0);
    assert_eq!(stats["logs"], 0);

    let cleaned = run_ok(hostlink(&db).arg("clean").arg("--keep").arg("0s").arg("--vacuum"));
    assert_eq!(cleaned["vacuumed"], true);
}

#[test]
fn invalid_arguments_fail_with_usage_error() {
    let temp = TempDir::new().expect("tempdir");
    let db = temp.path().join("coordination.db");

    hostlink(&db).arg("frobnicate").assert().code(2);
    hostlink(&db)
        .arg("logs")
        .arg("--session")
        .arg("not-a-uuid")
        .assert()
        .code(2);
}

#[test]
fn missing_project_is_a_usage_error() {
    let temp = TempDir::new().expect("tempdir");
    Command::new(assert_cmd::cargo::cargo_bin!("hostlink"))
        .current_dir(temp.path())
        .arg("stats")
        .assert()
        .code(2);
}

#[test]
fn daemon_completes_submitted_requests() {
    let temp = TempDir::new().expect("tempdir");
    let config = write_daemon_config(temp.path());
    let db = temp.path().join(".hostlink").join("coordination.db");

    let _daemon = DaemonGuard {
        child: StdCommand::new(daemon_bin())
            .arg("--config")
            .arg(&config)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .expect("hostlinkd should start"),
    };

    let echoed = run_ok(
        hostlink(&db)
            .arg("submit")
            .arg("echo")
            .arg("--payload")
            .arg("{\"scene\":\"Main\"}")
            .arg("--wait")
            .arg("--timeout")
            .arg("20s")
            .arg("--interval")
            .arg("50ms"),
    );
    assert_eq!(echoed["status"], "completed");
    assert_eq!(echoed["result"]["data"]["scene"], "Main");

    let unknown = run_ok(
        hostlink(&db)
            .arg("submit")
            .arg("no-such-kind")
            .arg("--wait")
            .arg("--timeout")
            .arg("20s"),
    );
    assert_eq!(unknown["status"], "failed");
    assert!(
        unknown["result"]["error_message"]
            .as_str()
            .unwrap_or_default()
            .contains("no-such-kind")
    );

    let host = run_ok(hostlink(&db).arg("host"));
    assert_eq!(host["instance_id"], "e2e-host");

    let sessions = run_ok(hostlink(&db).arg("sessions"));
    assert_eq!(sessions[0]["start_reason"], "host_start");
}
