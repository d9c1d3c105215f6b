//! Audio recorder sessions backed by whichever recorder program is installed.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::task::JoinHandle;

use crate::output_capture_runtime::{collect_capture, spawn_capture_reader, StreamCapture};
use crate::process_runtime_error::{stderr_preview, ProcessRuntimeError, RecorderCandidateFailure};
use crate::process_spawn_runtime::{
    command_available, send_signal, spawn_process, ProcessExit, ProcessOutput, ProcessSignal,
    ProcessSpawnSpec, SignalTarget, SpawnedProcess,
};
use crate::termination_escalation::{escalate_until_exit, EscalationPlan};

pub const VOICE_RECORDING_FILE_NAME: &str = "voice-input.wav";
pub const RECORDER_OUTPUT_PLACEHOLDER: &str = "{output}";
/// ffmpeg exits with 255 when interrupted by a signal.
pub const RECORDER_INTERRUPTED_EXIT_CODE: i32 = 255;
const RECORDER_STDERR_CAPTURE_CHARS: usize = 16_000;
const RECORDER_STDERR_DRAIN_MS: u64 = 500;

/// One recorder program and its argument template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecorderCandidate {
    pub label: String,
    pub program: String,
    /// `{output}` is replaced with the recording path.
    pub args: Vec<String>,
}

impl RecorderCandidate {
    pub fn new<I, S>(label: impl Into<String>, program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            label: label.into(),
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    fn spawn_spec(&self, output_path: &Path) -> ProcessSpawnSpec {
        let output = output_path.display().to_string();
        let args = self
            .args
            .iter()
            .map(|arg| arg.replace(RECORDER_OUTPUT_PLACEHOLDER, &output))
            .collect::<Vec<_>>();
        ProcessSpawnSpec::new(self.program.clone())
            .with_args(args)
            .with_output(ProcessOutput::StderrPiped)
    }
}

fn ffmpeg_candidate(label: &str, format: &str, input: &str) -> RecorderCandidate {
    RecorderCandidate::new(
        label,
        "ffmpeg",
        [
            "-hide_banner",
            "-loglevel",
            "error",
            "-y",
            "-f",
            format,
            "-i",
            input,
            "-ac",
            "1",
            "-ar",
            "16000",
            RECORDER_OUTPUT_PLACEHOLDER,
        ],
    )
}

fn sox_candidate() -> RecorderCandidate {
    RecorderCandidate::new(
        "rec (sox)",
        "rec",
        ["-q", "-c", "1", "-r", "16000", RECORDER_OUTPUT_PLACEHOLDER],
    )
}

/// Recorder candidates for the current OS, in preference order.
pub fn default_recorder_candidates() -> Vec<RecorderCandidate> {
    if cfg!(target_os = "macos") {
        vec![
            ffmpeg_candidate("ffmpeg (avfoundation)", "avfoundation", ":0"),
            sox_candidate(),
        ]
    } else if cfg!(windows) {
        vec![ffmpeg_candidate(
            "ffmpeg (dshow)",
            "dshow",
            "audio=default",
        )]
    } else {
        vec![
            RecorderCandidate::new(
                "arecord",
                "arecord",
                [
                    "-q",
                    "-f",
                    "S16_LE",
                    "-r",
                    "16000",
                    "-c",
                    "1",
                    RECORDER_OUTPUT_PLACEHOLDER,
                ],
            ),
            ffmpeg_candidate("ffmpeg (pulse)", "pulse", "default"),
            ffmpeg_candidate("ffmpeg (alsa)", "alsa", "default"),
            sox_candidate(),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoiceRecorderConfig {
    pub output_dir: PathBuf,
    pub candidates: Vec<RecorderCandidate>,
}

impl VoiceRecorderConfig {
    pub fn for_output_dir(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            candidates: default_recorder_candidates(),
        }
    }

    pub fn output_path(&self) -> PathBuf {
        self.output_dir.join(VOICE_RECORDING_FILE_NAME)
    }
}

impl Default for VoiceRecorderConfig {
    fn default() -> Self {
        Self::for_output_dir(".kestrel/voice")
    }
}

/// A running recorder. Dropping it kills the recorder process.
pub struct VoiceRecordingSession {
    recorder: String,
    output_path: PathBuf,
    process: Option<SpawnedProcess>,
    stderr: Arc<Mutex<StreamCapture>>,
    stderr_reader: Option<JoinHandle<()>>,
    result: Option<Result<PathBuf, ProcessRuntimeError>>,
}

impl std::fmt::Debug for VoiceRecordingSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VoiceRecordingSession")
            .field("recorder", &self.recorder)
            .field("output_path", &self.output_path)
            .field("pid", &self.process.as_ref().map(SpawnedProcess::pid))
            .field("stopped", &self.result.is_some())
            .finish()
    }
}

impl VoiceRecordingSession {
    /// Label of the candidate that was started.
    pub fn recorder(&self) -> &str {
        self.recorder.as_str()
    }

    pub fn output_path(&self) -> &Path {
        self.output_path.as_path()
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().map(SpawnedProcess::pid)
    }

    /// Stops the recorder and verifies the recording is non-empty.
    ///
    /// Later calls return the first result without signalling again.
    pub async fn stop(&mut self) -> Result<PathBuf, ProcessRuntimeError> {
        if let Some(result) = self.result.as_ref() {
            return result.clone();
        }
        let result = self.stop_recorder().await;
        self.result = Some(result.clone());
        result
    }

    async fn stop_recorder(&mut self) -> Result<PathBuf, ProcessRuntimeError> {
        let Some(mut process) = self.process.take() else {
            return verify_recording(&self.output_path);
        };
        let pid = process.pid();
        let exit = match process.try_wait()? {
            Some(exit) => Some(exit),
            None => {
                let outcome = escalate_until_exit(
                    EscalationPlan::recorder_stop(),
                    process.wait(),
                    |signal| send_signal(SignalTarget::Group(pid), signal),
                )
                .await;
                tracing::debug!(
                    pid,
                    recorder = %self.recorder,
                    signals = ?outcome.signals_sent,
                    phase = outcome.final_phase.as_str(),
                    "recorder stop escalation finished"
                );
                outcome.exit.transpose()?
            }
        };
        let (stderr, _) = collect_capture(
            self.stderr_reader.take(),
            &self.stderr,
            Duration::from_millis(RECORDER_STDERR_DRAIN_MS),
        )
        .await;

        match exit {
            Some(exit) if recorder_exit_is_success(&exit) => {}
            Some(exit) => {
                return Err(ProcessRuntimeError::AbnormalExit {
                    label: self.recorder.clone(),
                    code: exit.code,
                    stderr_preview: stderr_preview(&stderr),
                });
            }
            None => {
                process.spawn_reaper();
                return Err(ProcessRuntimeError::AbnormalExit {
                    label: self.recorder.clone(),
                    code: None,
                    stderr_preview: stderr_preview(&format!(
                        "recorder did not exit after SIGKILL\n{stderr}"
                    )),
                });
            }
        }
        verify_recording(&self.output_path)
    }

    /// Best-effort release: kills a still-running recorder and removes the file.
    pub fn cleanup(&mut self) {
        if let Some(process) = self.process.take() {
            if let Err(error) = send_signal(SignalTarget::Group(process.pid()), ProcessSignal::Kill)
            {
                if !error.is_no_such_process() {
                    tracing::warn!(
                        recorder = %self.recorder,
                        error = %error,
                        "failed to kill recorder during cleanup"
                    );
                }
            }
            process.spawn_reaper();
        }
        if let Some(reader) = self.stderr_reader.take() {
            reader.abort();
        }
        if let Err(error) = std::fs::remove_file(&self.output_path) {
            if error.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(
                    path = %self.output_path.display(),
                    error = %error,
                    "failed to remove recording"
                );
            }
        }
    }
}

/// `0`, the interrupted sentinel, and death by signal all count as a clean stop.
pub fn recorder_exit_is_success(exit: &ProcessExit) -> bool {
    match exit.code {
        Some(0) | Some(RECORDER_INTERRUPTED_EXIT_CODE) => true,
        Some(_) => false,
        None => true,
    }
}

fn verify_recording(path: &Path) -> Result<PathBuf, ProcessRuntimeError> {
    match std::fs::metadata(path) {
        Ok(metadata) if metadata.is_file() && metadata.len() > 0 => Ok(path.to_path_buf()),
        _ => Err(ProcessRuntimeError::EmptyRecording {
            path: path.to_path_buf(),
        }),
    }
}

/// Starts the first installed recorder candidate. Must run inside a tokio runtime.
pub fn start_voice_recording(
    config: &VoiceRecorderConfig,
) -> Result<VoiceRecordingSession, ProcessRuntimeError> {
    let output_path = config.output_path();
    if let Err(error) = std::fs::create_dir_all(&config.output_dir) {
        tracing::warn!(
            path = %config.output_dir.display(),
            error = %error,
            "failed to create voice output dir"
        );
    }
    match std::fs::remove_file(&output_path) {
        Ok(()) => tracing::debug!(path = %output_path.display(), "removed stale recording"),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
        Err(error) => tracing::warn!(
            path = %output_path.display(),
            error = %error,
            "failed to remove stale recording"
        ),
    }

    let mut attempts = Vec::new();
    for candidate in &config.candidates {
        if !command_available(&candidate.program) {
            attempts.push(RecorderCandidateFailure {
                label: candidate.label.clone(),
                reason: "not installed".to_string(),
            });
            continue;
        }
        match spawn_process(&candidate.spawn_spec(&output_path)) {
            Ok(mut process) => {
                let stderr = Arc::new(Mutex::new(StreamCapture::new(
                    RECORDER_STDERR_CAPTURE_CHARS,
                )));
                let stderr_reader = process
                    .take_stderr()
                    .map(|pipe| spawn_capture_reader(pipe, Arc::clone(&stderr)));
                tracing::info!(
                    recorder = %candidate.label,
                    pid = process.pid(),
                    path = %output_path.display(),
                    "voice recording started"
                );
                return Ok(VoiceRecordingSession {
                    recorder: candidate.label.clone(),
                    output_path,
                    process: Some(process),
                    stderr,
                    stderr_reader,
                    result: None,
                });
            }
            Err(error) => {
                tracing::debug!(
                    recorder = %candidate.label,
                    error = %error,
                    "recorder candidate failed to spawn"
                );
                attempts.push(RecorderCandidateFailure {
                    label: candidate.label.clone(),
                    reason: error.to_string(),
                });
            }
        }
    }
    Err(ProcessRuntimeError::NoRecorderAvailable { attempts })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VoiceRecordingReport {
    pub recorder: String,
    pub path: PathBuf,
    pub bytes: u64,
    pub duration_ms: u64,
}

/// Records for `duration`, stops, and reports the verified file.
pub async fn record_for_duration(
    config: &VoiceRecorderConfig,
    duration: Duration,
) -> Result<VoiceRecordingReport, ProcessRuntimeError> {
    let started = Instant::now();
    let mut session = start_voice_recording(config)?;
    tokio::time::sleep(duration).await;
    let path = session.stop().await?;
    let bytes = std::fs::metadata(&path)
        .map(|metadata| metadata.len())
        .unwrap_or_default();
    Ok(VoiceRecordingReport {
        recorder: session.recorder().to_string(),
        path,
        bytes,
        duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
    })
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::time::{Duration, Instant};

    use tempfile::tempdir;

    use super::{
        recorder_exit_is_success, record_for_duration, start_voice_recording, RecorderCandidate,
        VoiceRecorderConfig, VOICE_RECORDING_FILE_NAME,
    };
    use crate::process_runtime_error::ProcessRuntimeError;
    use crate::process_spawn_runtime::ProcessExit;

    fn missing(label: &str) -> RecorderCandidate {
        RecorderCandidate::new(label, "kestrel-missing-recorder-binary", ["{output}"])
    }

    fn fake(label: &str, script: &str) -> RecorderCandidate {
        RecorderCandidate::new(label, "sh", ["-c", script, "sh", "{output}"])
    }

    fn config(dir: &Path, candidates: Vec<RecorderCandidate>) -> VoiceRecorderConfig {
        VoiceRecorderConfig {
            output_dir: dir.join("voice"),
            candidates,
        }
    }

    #[test]
    fn unit_exit_policy_accepts_zero_sentinel_and_signals() {
        let exit = |code, signal| ProcessExit { code, signal };
        assert!(recorder_exit_is_success(&exit(Some(0), None)));
        assert!(recorder_exit_is_success(&exit(Some(255), None)));
        assert!(recorder_exit_is_success(&exit(None, Some(2))));
        assert!(!recorder_exit_is_success(&exit(Some(1), None)));
        assert!(!recorder_exit_is_success(&exit(Some(130), None)));
    }

    #[test]
    fn unit_output_placeholder_is_substituted() {
        let candidate = RecorderCandidate::new("x", "rec", ["-q", "{output}", "keep"]);
        let spec = candidate.spawn_spec(Path::new("/tmp/out.wav"));
        assert_eq!(spec.args, vec!["-q", "/tmp/out.wav", "keep"]);
    }

    #[tokio::test]
    async fn regression_no_installed_candidate_aggregates_every_attempt() {
        let temp = tempdir().expect("tempdir");
        let error = start_voice_recording(&config(
            temp.path(),
            vec![missing("first"), missing("second")],
        ))
        .expect_err("nothing installed");
        match &error {
            ProcessRuntimeError::NoRecorderAvailable { attempts } => {
                assert_eq!(attempts.len(), 2);
                assert_eq!(attempts[0].label, "first");
                assert_eq!(attempts[1].reason, "not installed");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        let message = error.to_string();
        assert!(message.contains("first (not installed)"));
        assert!(message.contains("second (not installed)"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn functional_falls_back_to_next_candidate_and_stops_on_interrupt() {
        let temp = tempdir().expect("tempdir");
        let config = config(
            temp.path(),
            vec![
                missing("missing"),
                fake(
                    "fake-sox",
                    "printf RIFF > \"$1\"; trap 'exit 0' INT; while :; do sleep 0.05; done",
                ),
                fake("never-tried", "printf other > \"$1\"; sleep 5"),
            ],
        );
        std::fs::create_dir_all(&config.output_dir).expect("voice dir");
        std::fs::write(config.output_path(), "stale").expect("stale file");

        let mut session = start_voice_recording(&config).expect("session");
        assert_eq!(session.recorder(), "fake-sox");
        assert!(session.pid().is_some());
        tokio::time::sleep(Duration::from_millis(200)).await;

        let path = session.stop().await.expect("stop");
        assert_eq!(path.file_name().and_then(|n| n.to_str()), Some(VOICE_RECORDING_FILE_NAME));
        assert_eq!(std::fs::read_to_string(&path).expect("read"), "RIFF");

        let again = session.stop().await.expect("idempotent stop");
        assert_eq!(again, path);

        session.cleanup();
        assert!(!path.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn functional_interrupted_sentinel_exit_counts_as_success() {
        let temp = tempdir().expect("tempdir");
        let config = config(
            temp.path(),
            vec![fake(
                "fake-ffmpeg",
                "printf data > \"$1\"; trap 'exit 255' INT; while :; do sleep 0.05; done",
            )],
        );
        let report = record_for_duration(&config, Duration::from_millis(150))
            .await
            .expect("record");
        assert_eq!(report.recorder, "fake-ffmpeg");
        assert_eq!(report.bytes, 4);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn regression_abnormal_exit_carries_stderr_preview() {
        let temp = tempdir().expect("tempdir");
        let config = config(
            temp.path(),
            vec![fake("busy", "echo 'device busy' >&2; exit 3")],
        );
        let mut session = start_voice_recording(&config).expect("session");
        tokio::time::sleep(Duration::from_millis(200)).await;
        let error = session.stop().await.expect_err("abnormal exit");
        match error {
            ProcessRuntimeError::AbnormalExit {
                label,
                code,
                stderr_preview,
            } => {
                assert_eq!(label, "busy");
                assert_eq!(code, Some(3));
                assert!(stderr_preview.contains("device busy"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn regression_clean_exit_without_audio_is_empty_recording() {
        let temp = tempdir().expect("tempdir");
        let config = config(
            temp.path(),
            vec![fake("silent", "trap 'exit 0' INT; while :; do sleep 0.05; done")],
        );
        let mut session = start_voice_recording(&config).expect("session");
        tokio::time::sleep(Duration::from_millis(100)).await;
        let error = session.stop().await.expect_err("empty");
        assert_eq!(
            error,
            ProcessRuntimeError::EmptyRecording {
                path: config.output_path()
            }
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn integration_recorder_ignoring_interrupt_and_terminate_is_killed() {
        let temp = tempdir().expect("tempdir");
        let config = config(
            temp.path(),
            vec![fake(
                "stubborn",
                "trap '' INT TERM; printf data > \"$1\"; while :; do sleep 0.05; done",
            )],
        );
        let mut session = start_voice_recording(&config).expect("session");
        tokio::time::sleep(Duration::from_millis(150)).await;
        let started = Instant::now();
        let path = session.stop().await.expect("killed recorder still succeeds");
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(2_800), "elapsed {elapsed:?}");
        assert!(elapsed < Duration::from_secs(6), "elapsed {elapsed:?}");
        assert!(path.exists());
    }
}
