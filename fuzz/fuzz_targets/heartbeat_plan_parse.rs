#![no_main]

use libfuzzer_sys::fuzz_target;
use kestrel_runtime::{
    due_heartbeat_tasks, validate_heartbeat_plan, HeartbeatPlan, HeartbeatState,
};

fuzz_target!(|data: &[u8]| {
    let raw = String::from_utf8_lossy(data);
    let Ok(plan) = serde_json::from_str::<HeartbeatPlan>(&raw) else {
        return;
    };
    if validate_heartbeat_plan(&plan.tasks).is_err() {
        return;
    }
    let state = serde_json::from_str::<HeartbeatState>(&raw).unwrap_or_default();
    let due = due_heartbeat_tasks(&plan.tasks, &state, u64::MAX);
    assert!(due.len() <= plan.tasks.len());
    assert!(due.iter().all(|task| task.interval_seconds > 0));
});
