use std::path::Path;
use std::time::Duration;

use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::Value;
use tempfile::tempdir;

fn binary_command(workspace: &Path) -> Command {
    let mut command = Command::new(assert_cmd::cargo::cargo_bin!("kestrel"));
    command
        .env_remove("KESTREL_STATE_DIR")
        .env_remove("KESTREL_APPROVAL_MODE")
        .env("KESTREL_WORKSPACE", workspace)
        .env("KESTREL_SHELL", "sh");
    command
}

fn stdout_json(output: &std::process::Output) -> Value {
    serde_json::from_slice(&output.stdout).expect("stdout should be JSON")
}

#[test]
fn unit_help_lists_subcommands() {
    let temp = tempdir().expect("tempdir");
    binary_command(temp.path())
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("heartbeat"))
        .stdout(predicate::str::contains("exec"))
        .stdout(predicate::str::contains("voice"));
}

#[cfg(unix)]
#[test]
fn functional_exec_run_propagates_exit_code_and_prints_json() {
    let temp = tempdir().expect("tempdir");
    let output = binary_command(temp.path())
        .args(["exec", "run", "echo hello; exit 3"])
        .output()
        .expect("run");
    assert_eq!(output.status.code(), Some(3));
    let payload = stdout_json(&output);
    assert_eq!(payload["stdout"], "hello\n");
    assert_eq!(payload["exit_code"], 3);
    assert_eq!(payload["timed_out"], false);
}

#[cfg(unix)]
#[test]
fn functional_exec_run_timeout_exits_124() {
    let temp = tempdir().expect("tempdir");
    let output = binary_command(temp.path())
        .args(["exec", "run", "sleep 10", "--timeout-ms", "1000"])
        .output()
        .expect("run");
    assert_eq!(output.status.code(), Some(124));
    assert_eq!(stdout_json(&output)["timed_out"], true);
}

#[test]
fn regression_denied_exec_exits_3_and_spawns_nothing() {
    let temp = tempdir().expect("tempdir");
    let marker = temp.path().join("marker");
    let command = format!("touch {}", marker.display());
    for subcommand in ["run", "start-background"] {
        let output = binary_command(temp.path())
            .args(["--approval-mode", "deny", "exec", subcommand, command.as_str()])
            .output()
            .expect("run");
        assert_eq!(output.status.code(), Some(3));
        assert_eq!(stdout_json(&output)["denied"], true);
    }
    assert!(!marker.exists());
}

#[cfg(unix)]
#[test]
fn integration_background_job_lifecycle_across_invocations() {
    let temp = tempdir().expect("tempdir");
    let started = binary_command(temp.path())
        .args(["exec", "start-background", "echo from-job; exit 7"])
        .output()
        .expect("start");
    assert!(started.status.success());
    let job = stdout_json(&started);
    let job_id = job["id"].as_str().expect("job id").to_string();
    assert_eq!(job["status"], "running");

    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    let status = loop {
        let output = binary_command(temp.path())
            .args(["exec", "status-background", job_id.as_str()])
            .output()
            .expect("status");
        assert!(output.status.success());
        let payload = stdout_json(&output);
        if payload["job"]["status"] != "running" {
            break payload;
        }
        assert!(std::time::Instant::now() < deadline, "job never finished");
        std::thread::sleep(Duration::from_millis(50));
    };
    assert_eq!(status["job"]["status"], "failed");
    assert_eq!(status["job"]["exit_code"], 7);
    assert_eq!(status["failure_shaped"], true);
    assert!(status["log_tail"]
        .as_str()
        .unwrap_or_default()
        .contains("from-job"));

    let listed = binary_command(temp.path())
        .args(["exec", "list-background"])
        .output()
        .expect("list");
    assert_eq!(stdout_json(&listed)["count"], 1);
}

#[test]
fn regression_unknown_job_id_exits_1() {
    let temp = tempdir().expect("tempdir");
    for subcommand in ["status-background", "stop-background"] {
        binary_command(temp.path())
            .args(["exec", subcommand, "job-0-missing"])
            .assert()
            .code(1)
            .stdout(predicate::str::contains("unknown background job 'job-0-missing'"));
    }
}

#[test]
fn functional_heartbeat_status_and_stop_without_daemon() {
    let temp = tempdir().expect("tempdir");
    let status = binary_command(temp.path())
        .args(["heartbeat", "status"])
        .output()
        .expect("status");
    assert!(status.status.success());
    let payload = stdout_json(&status);
    assert_eq!(payload["running"], false);
    assert_eq!(payload["stale"], false);

    let stop = binary_command(temp.path())
        .args(["heartbeat", "stop"])
        .output()
        .expect("stop");
    assert!(stop.status.success());
    assert_eq!(stdout_json(&stop)["was_running"], false);
}

#[cfg(unix)]
#[test]
fn functional_heartbeat_once_exit_code_follows_task_outcomes() {
    let temp = tempdir().expect("tempdir");
    let heartbeat_dir = temp.path().join(".kestrel/heartbeat");
    std::fs::create_dir_all(&heartbeat_dir).expect("heartbeat dir");
    std::fs::write(
        heartbeat_dir.join("plan.json"),
        r#"{"tasks":[
            {"key":"ok_check","title":"Ok","interval_seconds":60,"command":"true"},
            {"key":"bad_check","title":"Bad","interval_seconds":60,"command":"exit 2"}
        ]}"#,
    )
    .expect("plan");

    let first = binary_command(temp.path())
        .args(["heartbeat", "once"])
        .output()
        .expect("once");
    assert_eq!(first.status.code(), Some(1));
    let payload = stdout_json(&first);
    assert_eq!(payload["all_ok"], false);
    assert_eq!(payload["report"]["runs"].as_array().map(Vec::len), Some(2));

    let state = std::fs::read_to_string(heartbeat_dir.join("state.json")).expect("state");
    let state = serde_json::from_str::<Value>(&state).expect("state json");
    assert_eq!(state["last_results"]["bad_check"], "failed: exit code 2");

    let second = binary_command(temp.path())
        .args(["heartbeat", "once"])
        .output()
        .expect("once again");
    assert_eq!(second.status.code(), Some(0));
    assert_eq!(stdout_json(&second)["report"]["runs"], serde_json::json!([]));
}

#[cfg(unix)]
#[test]
fn integration_heartbeat_start_is_idempotent_and_stop_cleans_record() {
    let temp = tempdir().expect("tempdir");
    let first = binary_command(temp.path())
        .args(["heartbeat", "start", "--poll-seconds", "15"])
        .output()
        .expect("start");
    assert!(first.status.success());
    let first = stdout_json(&first);
    assert_eq!(first["started"], true);

    let second = binary_command(temp.path())
        .args(["heartbeat", "start"])
        .output()
        .expect("start again");
    let second = stdout_json(&second);
    assert_eq!(second["already_running"], true);
    assert_eq!(second["pid"], first["pid"]);

    let stop = binary_command(temp.path())
        .args(["heartbeat", "stop"])
        .output()
        .expect("stop");
    assert!(stop.status.success());
    assert_eq!(stdout_json(&stop)["signal_sent"], true);
    assert!(!temp.path().join(".kestrel/heartbeat/runtime.json").exists());
}

#[test]
fn regression_voice_record_without_recorders_fails_with_aggregated_reason() {
    let temp = tempdir().expect("tempdir");
    binary_command(temp.path())
        .env("PATH", temp.path())
        .args(["voice", "record", "--seconds", "1"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("no recorder available"))
        .stderr(predicate::str::contains("not installed"));
}

#[cfg(unix)]
#[test]
fn regression_relative_workspace_daemon_uses_controller_state_dir() {
    let temp = tempdir().expect("tempdir");
    let relative = |args: &[&str]| {
        binary_command(temp.path())
            .current_dir(temp.path())
            .env("KESTREL_WORKSPACE", "ws")
            .args(args)
            .output()
            .expect("run")
    };

    let started = relative(&["heartbeat", "start", "--poll-seconds", "15"]);
    assert!(started.status.success());
    let started = stdout_json(&started);
    assert_eq!(started["started"], true);

    let heartbeat_dir = temp.path().join("ws/.kestrel/heartbeat");
    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    while !heartbeat_dir.join("events.jsonl").exists() {
        assert!(
            std::time::Instant::now() < deadline,
            "daemon never wrote its first batch under ws/.kestrel"
        );
        std::thread::sleep(Duration::from_millis(50));
    }
    let record = std::fs::read_to_string(heartbeat_dir.join("runtime.json")).expect("record");
    let record = serde_json::from_str::<Value>(&record).expect("record json");
    assert_eq!(record["pid"], started["pid"]);
    assert!(!temp.path().join("ws/ws").exists());

    let status = stdout_json(&relative(&["heartbeat", "status"]));
    assert_eq!(status["running"], true);

    let stop = relative(&["heartbeat", "stop"]);
    assert!(stop.status.success());
    assert_eq!(stdout_json(&stop)["signal_sent"], true);
}
