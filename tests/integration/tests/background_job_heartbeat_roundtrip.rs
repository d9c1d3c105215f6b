use std::{
    fs,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use kestrel_runtime::{
    default_heartbeat_registry, is_process_alive, run_heartbeat_once, AutoApproveGate,
    HeartbeatState, HeartbeatTask, StaticHeartbeatPlanSource, WorkspaceLayout,
    BACKGROUND_JOBS_RECONCILE_TASK_KEY,
};
use kestrel_tools::{AgentTool, CommandRunnerTool};
use serde_json::{json, Value};

static WORKSPACE_COUNTER: AtomicU64 = AtomicU64::new(1);

struct IsolatedWorkspace {
    root: PathBuf,
}

impl IsolatedWorkspace {
    fn new(label: &str) -> Self {
        let tick = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock should be after unix epoch")
            .as_nanos();
        let count = WORKSPACE_COUNTER.fetch_add(1, Ordering::Relaxed);
        let root = std::env::temp_dir().join(format!(
            "kestrel-{label}-{}-{tick}-{count}",
            std::process::id()
        ));
        fs::create_dir_all(&root).expect("must create isolated workspace root");
        Self { root }
    }

    fn root(&self) -> &Path {
        &self.root
    }
}

impl Drop for IsolatedWorkspace {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.root);
    }
}

fn command_tool(layout: &WorkspaceLayout) -> CommandRunnerTool {
    CommandRunnerTool::for_layout(layout, Arc::new(AutoApproveGate), "sh")
        .expect("command runner tool should build")
}

async fn start_job(tool: &CommandRunnerTool, command: &str) -> String {
    let started = tool
        .execute(json!({ "action": "start_background", "command": command }))
        .await;
    assert!(!started.is_error, "{}", started.as_text());
    started.content["job"]["id"]
        .as_str()
        .expect("job id should be a string")
        .to_string()
}

async fn wait_for_job_exit(layout: &WorkspaceLayout, job_id: &str) {
    let status_path = layout.jobs_dir().join(job_id).join("status.json");
    let pid = job_pid(layout, job_id);
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !status_path.exists() || is_process_alive(pid) {
        assert!(
            tokio::time::Instant::now() < deadline,
            "job {job_id} never exited"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

fn job_pid(layout: &WorkspaceLayout, job_id: &str) -> u32 {
    let raw = fs::read_to_string(layout.jobs_dir().join("jobs.json")).expect("jobs store");
    let store: Value = serde_json::from_str(&raw).expect("jobs store should be valid json");
    store["jobs"][job_id]["pid"]
        .as_u64()
        .and_then(|pid| u32::try_from(pid).ok())
        .expect("job pid")
}

fn read_heartbeat_state(layout: &WorkspaceLayout) -> HeartbeatState {
    let raw = fs::read_to_string(layout.heartbeat_state_path()).expect("heartbeat state");
    serde_json::from_str(&raw).expect("heartbeat state should be valid json")
}

#[cfg(unix)]
#[tokio::test]
async fn integration_heartbeat_reconcile_flags_failed_job_started_by_tool() {
    let workspace = IsolatedWorkspace::new("reconcile");
    let layout = WorkspaceLayout::new(workspace.root(), None);
    layout.ensure().expect("layout");
    let tool = command_tool(&layout);

    let good = start_job(&tool, "echo fine").await;
    let bad = start_job(&tool, "echo broken >&2; exit 9").await;
    wait_for_job_exit(&layout, &good).await;
    wait_for_job_exit(&layout, &bad).await;

    let registry =
        default_heartbeat_registry(&layout, Arc::new(AutoApproveGate), "sh").expect("registry");
    let plan = StaticHeartbeatPlanSource::new(vec![HeartbeatTask::new(
        BACKGROUND_JOBS_RECONCILE_TASK_KEY,
        "Reconcile background jobs",
        300,
    )]);
    let report = run_heartbeat_once(&layout, &plan, &registry)
        .await
        .expect("heartbeat batch");
    assert_eq!(report.runs.len(), 1);
    let run = &report.runs[0];
    assert!(run.ok);
    assert!(run.urgent);
    assert!(run.summary.contains(&format!("{bad}=failed")));
    assert!(!run.summary.contains(&format!("{good}=")));

    let status = tool
        .execute(json!({ "action": "status_background", "job_id": bad }))
        .await;
    assert!(!status.is_error);
    assert_eq!(status.content["job"]["status"], "failed");
    assert_eq!(status.content["job"]["exit_code"], 9);
    assert!(status.content["log_tail"]
        .as_str()
        .unwrap_or_default()
        .contains("broken"));

    let state = read_heartbeat_state(&layout);
    assert!(state
        .last_checks
        .contains_key(BACKGROUND_JOBS_RECONCILE_TASK_KEY));

    let again = run_heartbeat_once(&layout, &plan, &registry)
        .await
        .expect("second batch");
    assert!(again.is_noop());
}

#[cfg(unix)]
#[tokio::test]
async fn integration_job_state_survives_new_runtime_instances() {
    let workspace = IsolatedWorkspace::new("persist");
    let layout = WorkspaceLayout::new(workspace.root(), None);

    let job_id = {
        let tool = command_tool(&layout);
        start_job(&tool, "sleep 30").await
    };

    let tool = command_tool(&layout);
    let listed = tool.execute(json!({ "action": "list_background" })).await;
    assert_eq!(listed.content["count"], 1);
    let jobs = listed.content["jobs"].as_array().cloned().unwrap_or_default();
    assert_eq!(jobs[0]["id"], Value::String(job_id.clone()));
    assert_eq!(jobs[0]["status"], "running");

    let stopped = tool
        .execute(json!({ "action": "stop_background", "job_id": job_id }))
        .await;
    assert!(!stopped.is_error);
    assert_eq!(stopped.content["signal_sent"], true);

    let status = command_tool(&layout)
        .execute(json!({ "action": "status_background", "job_id": job_id }))
        .await;
    assert_eq!(status.content["job"]["status"], "stopped");
}

#[cfg(unix)]
#[tokio::test]
async fn integration_foreground_run_and_command_task_share_workspace() {
    let workspace = IsolatedWorkspace::new("foreground");
    let layout = WorkspaceLayout::new(workspace.root(), None);
    let tool = command_tool(&layout);

    let run = tool
        .execute(json!({ "action": "run", "command": "echo marker > shared.txt" }))
        .await;
    assert!(!run.is_error);
    assert_eq!(run.content["exit_code"], 0);

    let registry =
        default_heartbeat_registry(&layout, Arc::new(AutoApproveGate), "sh").expect("registry");
    let plan = StaticHeartbeatPlanSource::new(vec![HeartbeatTask::new(
        "read_marker",
        "Read marker",
        60,
    )
    .with_command("cat shared.txt")]);
    let report = run_heartbeat_once(&layout, &plan, &registry)
        .await
        .expect("heartbeat batch");
    assert!(report.all_ok());
    assert_eq!(report.runs[0].summary, "exit code 0: marker");
    assert_eq!(
        read_heartbeat_state(&layout).last_results.get("read_marker"),
        Some(&"ok: exit code 0: marker".to_string())
    );
}
