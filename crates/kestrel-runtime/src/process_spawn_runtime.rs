//! OS process creation, signalling and liveness probing.
//!
//! Every process spawned here leads its own process group so a signal sent to
//! the group reaches grandchildren started by a shell. Detached processes
//! additionally start a new session and survive the controller exiting.

use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};

use tokio::process::{Child, ChildStderr, ChildStdout, Command};

use crate::process_runtime_error::ProcessRuntimeError;

const DEFAULT_SHELL_PROGRAM: &str = "sh";
const SIGNAL_EXIT_CODE_BASE: i32 = 128;

/// Where the spawned process writes stdout and stderr.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutput {
    /// Both streams are piped back to the caller.
    Piped,
    /// Both streams are appended to one log file.
    AppendToLog(PathBuf),
    /// Stdout is discarded, stderr is piped back to the caller.
    StderrPiped,
    /// Both streams are discarded.
    Null,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpawnSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
    pub output: ProcessOutput,
    pub detached: bool,
}

impl ProcessSpawnSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: BTreeMap::new(),
            output: ProcessOutput::Null,
            detached: false,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_output(mut self, output: ProcessOutput) -> Self {
        self.output = output;
        self
    }

    pub fn detached(mut self) -> Self {
        self.detached = true;
        self
    }
}

/// Exit event of a spawned process. `code` is `None` when a signal killed it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ProcessExit {
    pub fn from_status(status: ExitStatus) -> Self {
        Self {
            code: status.code(),
            signal: exit_status_signal(status),
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Collapses the exit into one shell-style code (`128 + signal` when killed).
    pub fn normalized_code(&self) -> i32 {
        match (self.code, self.signal) {
            (Some(code), _) => code,
            (None, Some(signal)) => SIGNAL_EXIT_CODE_BASE.saturating_add(signal),
            (None, None) => 1,
        }
    }
}

#[cfg(unix)]
fn exit_status_signal(status: ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_status_signal(_status: ExitStatus) -> Option<i32> {
    None
}

/// Signals the runtime knows how to deliver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessSignal {
    Interrupt,
    Terminate,
    Kill,
}

impl ProcessSignal {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Interrupt => "SIGINT",
            Self::Terminate => "SIGTERM",
            Self::Kill => "SIGKILL",
        }
    }

    #[cfg(unix)]
    fn as_nix(self) -> nix::sys::signal::Signal {
        use nix::sys::signal::Signal;
        match self {
            Self::Interrupt => Signal::SIGINT,
            Self::Terminate => Signal::SIGTERM,
            Self::Kill => Signal::SIGKILL,
        }
    }
}

/// Recipient of a signal: one pid or a whole process group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalTarget {
    Process(u32),
    Group(u32),
}

impl SignalTarget {
    pub fn describe(self) -> String {
        match self {
            Self::Process(pid) => format!("pid {pid}"),
            Self::Group(pgid) => format!("process group {pgid}"),
        }
    }
}

/// A process accepted by the OS.
#[derive(Debug)]
pub struct SpawnedProcess {
    child: Child,
    pid: u32,
    program: String,
}

impl SpawnedProcess {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn program(&self) -> &str {
        self.program.as_str()
    }

    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.child.stdout.take()
    }

    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.child.stderr.take()
    }

    /// Waits for the exit event. Cancel-safe.
    pub async fn wait(&mut self) -> Result<ProcessExit, ProcessRuntimeError> {
        let status = self
            .child
            .wait()
            .await
            .map_err(|error| ProcessRuntimeError::Wait {
                program: self.program.clone(),
                detail: error.to_string(),
            })?;
        Ok(ProcessExit::from_status(status))
    }

    pub fn try_wait(&mut self) -> Result<Option<ProcessExit>, ProcessRuntimeError> {
        let status = self
            .child
            .try_wait()
            .map_err(|error| ProcessRuntimeError::Wait {
                program: self.program.clone(),
                detail: error.to_string(),
            })?;
        Ok(status.map(ProcessExit::from_status))
    }

    /// Hands the child to a reaper task so it never lingers as a zombie.
    ///
    /// The reaper does not keep the controller alive; a detached child keeps
    /// running when the runtime shuts down.
    pub fn spawn_reaper(self) {
        let Self {
            mut child,
            pid,
            program,
        } = self;
        spawn_background_future(async move {
            match child.wait().await {
                Ok(status) => tracing::debug!(
                    pid,
                    program = %program,
                    exit = ?ProcessExit::from_status(status),
                    "reaped detached process"
                ),
                Err(error) => tracing::warn!(
                    pid,
                    program = %program,
                    error = %error,
                    "failed to reap detached process"
                ),
            }
        });
    }
}

/// Starts a process described by `spec`. Exec failures are never retried.
pub fn spawn_process(spec: &ProcessSpawnSpec) -> Result<SpawnedProcess, ProcessRuntimeError> {
    let mut command = Command::new(&spec.program);
    command.args(&spec.args);
    if let Some(cwd) = spec.cwd.as_ref() {
        command.current_dir(cwd);
    }
    for (key, value) in &spec.env {
        command.env(key, value);
    }
    command.stdin(Stdio::null());
    match &spec.output {
        ProcessOutput::Piped => {
            command.stdout(Stdio::piped());
            command.stderr(Stdio::piped());
        }
        ProcessOutput::AppendToLog(path) => {
            let (stdout, stderr) = open_append_log(path)
                .map_err(|error| ProcessRuntimeError::spawn_failure(&spec.program, &error))?;
            command.stdout(stdout);
            command.stderr(stderr);
        }
        ProcessOutput::StderrPiped => {
            command.stdout(Stdio::null());
            command.stderr(Stdio::piped());
        }
        ProcessOutput::Null => {
            command.stdout(Stdio::null());
            command.stderr(Stdio::null());
        }
    }
    command.kill_on_drop(!spec.detached);
    configure_process_group(&mut command, spec.detached);

    let child = command
        .spawn()
        .map_err(|error| ProcessRuntimeError::spawn_failure(&spec.program, &error))?;
    let Some(pid) = child.id() else {
        return Err(ProcessRuntimeError::SpawnFailure {
            program: spec.program.clone(),
            kind: std::io::ErrorKind::Other,
            detail: "process exited before its pid could be read".to_string(),
        });
    };
    tracing::debug!(
        pid,
        program = %spec.program,
        detached = spec.detached,
        "spawned process"
    );
    Ok(SpawnedProcess {
        child,
        pid,
        program: spec.program.clone(),
    })
}

fn open_append_log(path: &Path) -> std::io::Result<(Stdio, Stdio)> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    let stderr = file.try_clone()?;
    Ok((Stdio::from(file), Stdio::from(stderr)))
}

#[cfg(unix)]
fn configure_process_group(command: &mut Command, detached: bool) {
    // SAFETY: the hook only calls async-signal-safe libc functions.
    unsafe {
        command.pre_exec(move || {
            let status = if detached {
                libc::setsid()
            } else {
                libc::setpgid(0, 0)
            };
            if status == -1 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }
}

#[cfg(not(unix))]
fn configure_process_group(_command: &mut Command, _detached: bool) {}

/// Delivers `signal` to `target`.
#[cfg(unix)]
pub fn send_signal(target: SignalTarget, signal: ProcessSignal) -> Result<(), ProcessRuntimeError> {
    use nix::sys::signal::{kill, killpg};
    use nix::unistd::Pid;

    let raw = match target {
        SignalTarget::Process(pid) | SignalTarget::Group(pid) => i32::try_from(pid).ok(),
    }
    .filter(|value| *value > 0);
    let Some(raw) = raw else {
        return Err(ProcessRuntimeError::Signal {
            target: target.describe(),
            signal: signal.as_str(),
            errno: libc::ESRCH,
            detail: "pid out of range".to_string(),
        });
    };
    let result = match target {
        SignalTarget::Process(_) => kill(Pid::from_raw(raw), signal.as_nix()),
        SignalTarget::Group(_) => killpg(Pid::from_raw(raw), signal.as_nix()),
    };
    result.map_err(|errno| ProcessRuntimeError::Signal {
        target: target.describe(),
        signal: signal.as_str(),
        errno: errno as i32,
        detail: errno.desc().to_string(),
    })
}

/// Delivers `signal` to `target`. Every signal is a forced termination here.
#[cfg(not(unix))]
pub fn send_signal(target: SignalTarget, signal: ProcessSignal) -> Result<(), ProcessRuntimeError> {
    let pid = match target {
        SignalTarget::Process(pid) | SignalTarget::Group(pid) => pid,
    };
    let status = std::process::Command::new("taskkill")
        .args(["/PID", &pid.to_string(), "/T", "/F"])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
    match status {
        Ok(status) if status.success() => Ok(()),
        Ok(status) => Err(ProcessRuntimeError::Signal {
            target: target.describe(),
            signal: signal.as_str(),
            errno: status.code().unwrap_or(-1),
            detail: "taskkill failed".to_string(),
        }),
        Err(error) => Err(ProcessRuntimeError::Signal {
            target: target.describe(),
            signal: signal.as_str(),
            errno: error.raw_os_error().unwrap_or(-1),
            detail: error.to_string(),
        }),
    }
}

/// Zero-signal liveness probe. Zombies and invalid pids are never alive.
#[cfg(unix)]
pub fn is_process_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    match kill(Pid::from_raw(raw), None) {
        Ok(()) => !is_zombie_process(pid),
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
pub fn is_process_alive(_pid: u32) -> bool {
    false
}

#[cfg(target_os = "linux")]
fn is_zombie_process(pid: u32) -> bool {
    let Ok(raw) = std::fs::read_to_string(format!("/proc/{pid}/stat")) else {
        return false;
    };
    // the command name may contain spaces or parens; the state follows the last ')'
    raw.rsplit_once(')')
        .and_then(|(_, rest)| rest.split_whitespace().next())
        .map(|state| state == "Z")
        .unwrap_or(false)
}

#[cfg(all(unix, not(target_os = "linux")))]
fn is_zombie_process(_pid: u32) -> bool {
    false
}

/// Returns true when `command` resolves to a file directly or on `PATH`.
pub fn command_available(command: &str) -> bool {
    let command = command.trim();
    if command.is_empty() {
        return false;
    }
    let direct = Path::new(command);
    if direct.components().count() > 1 || direct.is_absolute() {
        return direct.is_file();
    }
    let Some(path) = std::env::var_os("PATH") else {
        return false;
    };
    for dir in std::env::split_paths(&path) {
        let candidate = dir.join(command);
        if candidate.is_file() {
            return true;
        }
        if cfg!(windows) && dir.join(format!("{command}.exe")).is_file() {
            return true;
        }
    }
    false
}

/// Returns `$SHELL` when set and non-empty, else `sh`.
pub fn shell_program() -> String {
    std::env::var("SHELL")
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| DEFAULT_SHELL_PROGRAM.to_string())
}

/// Builds a `ProcessSpawnSpec` for `<shell> -c <command>`.
pub fn shell_command_spec(shell: &str, command: &str) -> ProcessSpawnSpec {
    ProcessSpawnSpec::new(shell).with_args(["-c", command])
}

pub(crate) fn spawn_background_future<F>(future: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(handle) = tokio::runtime::Handle::try_current() {
        handle.spawn(future);
        return;
    }

    std::thread::spawn(move || {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build();
        match runtime {
            Ok(runtime) => runtime.block_on(future),
            Err(error) => {
                tracing::warn!(error = %error, "background reaper bootstrap failed")
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{
        command_available, is_process_alive, send_signal, shell_command_spec, spawn_process,
        ProcessExit, ProcessOutput, ProcessSignal, ProcessSpawnSpec, SignalTarget,
    };
    use crate::process_runtime_error::ProcessRuntimeError;

    #[test]
    fn unit_normalized_exit_code_maps_signal_to_128_offset() {
        let exited = ProcessExit {
            code: Some(7),
            signal: None,
        };
        assert_eq!(exited.normalized_code(), 7);
        assert!(!exited.success());
        let killed = ProcessExit {
            code: None,
            signal: Some(9),
        };
        assert_eq!(killed.normalized_code(), 137);
        let opaque = ProcessExit {
            code: None,
            signal: None,
        };
        assert_eq!(opaque.normalized_code(), 1);
    }

    #[test]
    fn unit_invalid_pids_are_never_alive() {
        assert!(!is_process_alive(0));
        assert!(!is_process_alive(u32::MAX));
    }

    #[test]
    fn unit_command_available_handles_missing_and_paths() {
        assert!(!command_available(""));
        assert!(!command_available("kestrel-definitely-not-installed-binary"));
        let temp = tempfile::tempdir().expect("tempdir");
        let file = temp.path().join("tool");
        std::fs::write(&file, "").expect("write");
        assert!(command_available(file.to_str().expect("utf8 path")));
        assert!(!command_available(
            temp.path().join("missing").to_str().expect("utf8 path")
        ));
    }

    #[tokio::test]
    async fn regression_missing_binary_is_spawn_failure_not_exit() {
        let spec = ProcessSpawnSpec::new("kestrel-definitely-not-installed-binary");
        let error = spawn_process(&spec).expect_err("spawn should fail");
        match error {
            ProcessRuntimeError::SpawnFailure { kind, .. } => {
                assert_eq!(kind, std::io::ErrorKind::NotFound)
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn functional_piped_spawn_reports_exit_code_and_output() {
        use tokio::io::AsyncReadExt;

        let spec = shell_command_spec("sh", "printf hello; exit 3")
            .with_output(ProcessOutput::Piped);
        let mut process = spawn_process(&spec).expect("spawn");
        let mut stdout = process.take_stdout().expect("stdout");
        let mut captured = String::new();
        stdout
            .read_to_string(&mut captured)
            .await
            .expect("read stdout");
        let exit = process.wait().await.expect("wait");
        assert_eq!(captured, "hello");
        assert_eq!(exit.code, Some(3));
        assert_eq!(exit.signal, None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn functional_group_signal_reaches_shell_and_reports_signal_exit() {
        let spec = shell_command_spec("sh", "sleep 30");
        let mut process = spawn_process(&spec).expect("spawn");
        assert!(is_process_alive(process.pid()));
        send_signal(SignalTarget::Group(process.pid()), ProcessSignal::Kill).expect("kill");
        let exit = tokio::time::timeout(Duration::from_secs(5), process.wait())
            .await
            .expect("exit in time")
            .expect("wait");
        assert_eq!(exit.code, None);
        assert_eq!(exit.signal, Some(9));
        assert_eq!(exit.normalized_code(), 137);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn integration_detached_process_appends_to_log_and_survives_reaper_handoff() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log_path = temp.path().join("logs").join("output.log");
        std::fs::create_dir_all(log_path.parent().expect("parent")).expect("mkdir");
        std::fs::write(&log_path, "previous\n").expect("seed log");
        let spec = shell_command_spec("sh", "echo out; echo err >&2")
            .with_output(ProcessOutput::AppendToLog(log_path.clone()))
            .detached();
        let mut process = spawn_process(&spec).expect("spawn");
        let exit = process.wait().await.expect("wait");
        assert!(exit.success());
        let log = std::fs::read_to_string(&log_path).expect("read log");
        assert!(log.starts_with("previous\n"));
        assert!(log.contains("out"));
        assert!(log.contains("err"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn regression_zombie_child_is_not_reported_alive() {
        let spec = shell_command_spec("sh", "exit 0");
        let mut process = spawn_process(&spec).expect("spawn");
        let pid = process.pid();
        // give the child time to exit without reaping it
        tokio::time::sleep(Duration::from_millis(300)).await;
        if cfg!(target_os = "linux") {
            assert!(!is_process_alive(pid));
        }
        process.wait().await.expect("wait");
        assert!(!is_process_alive(pid));
    }

    #[cfg(unix)]
    #[test]
    fn unit_signal_to_missing_group_is_no_such_process() {
        let error = send_signal(SignalTarget::Group(0), ProcessSignal::Terminate)
            .expect_err("pid 0 is rejected");
        assert!(error.is_no_such_process());
    }
}
