#![no_main]

use libfuzzer_sys::fuzz_target;
use kestrel_runtime::{parse_background_job_status_file, BackgroundJobStatus};

fuzz_target!(|data: &[u8]| {
    let raw = String::from_utf8_lossy(data);
    if let Some(status_file) = parse_background_job_status_file(&raw) {
        let expected = if status_file.exit_code == 0 {
            BackgroundJobStatus::Completed
        } else {
            BackgroundJobStatus::Failed
        };
        assert!(expected.is_terminal());
        assert_eq!(expected.is_failure_shaped(), status_file.exit_code != 0);
        if let Some(ended_at) = status_file.ended_at.as_deref() {
            assert!(!ended_at.trim().is_empty());
        }
    }
});
