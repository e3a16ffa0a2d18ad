use std::ffi::OsString;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{SupervisorError, SupervisorResult};
use crate::platform::Platform;

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Fixed argument list for launching the worker's dashboard server inside
/// the installed environment.
#[derive(Debug, Clone)]
pub struct WorkerSpawnSpec {
    pub launcher: std::path::PathBuf,
    pub data_root: std::path::PathBuf,
    pub env_name: String,
    pub worker_cli: String,
    pub listen_host: String,
    pub listen_port: u16,
}

pub(crate) fn dashboard_args(spec: &WorkerSpawnSpec) -> Vec<OsString> {
    vec![
        OsString::from("-r"),
        spec.data_root.clone().into_os_string(),
        OsString::from("-n"),
        OsString::from(spec.env_name.as_str()),
        OsString::from("run"),
        OsString::from(spec.worker_cli.as_str()),
        OsString::from("dashboard"),
        OsString::from("--host"),
        OsString::from(spec.listen_host.as_str()),
        OsString::from("--port"),
        OsString::from(spec.listen_port.to_string()),
    ]
}

/// How the worker process ended, paired with whatever stderr was captured
/// while startup was still unconfirmed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerExit {
    pub exit_code: Option<i32>,
    pub stderr: String,
}

/// A running worker process with its output relays attached.
///
/// stderr lines are mirrored into `startup_stderr` until the first
/// successful liveness probe detaches the capture, so an early crash can be
/// reported with the worker's own words while routine later chatter cannot.
pub struct WorkerProcess {
    child: Child,
    startup_stderr: Arc<Mutex<String>>,
    capture_startup: Arc<AtomicBool>,
    stdout_task: JoinHandle<()>,
    stderr_task: JoinHandle<()>,
}

impl WorkerProcess {
    pub fn spawn(spec: &WorkerSpawnSpec) -> SupervisorResult<Self> {
        let mut command = Command::new(&spec.launcher);
        command.args(dashboard_args(spec));
        command.stdin(Stdio::null());
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());
        command.kill_on_drop(true);
        #[cfg(windows)]
        command.creation_flags(CREATE_NO_WINDOW);

        let mut child = command.spawn().map_err(|error| {
            SupervisorError::Process(format!(
                "failed to launch worker via '{}': {error}",
                spec.launcher.display()
            ))
        })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SupervisorError::Process("worker stdout unavailable".to_owned()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| SupervisorError::Process("worker stderr unavailable".to_owned()))?;

        let startup_stderr = Arc::new(Mutex::new(String::new()));
        let capture_startup = Arc::new(AtomicBool::new(true));
        let stdout_task = spawn_stdout_relay(stdout);
        let stderr_task = spawn_stderr_relay(
            stderr,
            Arc::clone(&startup_stderr),
            Arc::clone(&capture_startup),
        );

        info!(pid = ?child.id(), "worker process spawned");
        Ok(Self {
            child,
            startup_stderr,
            capture_startup,
            stdout_task,
            stderr_task,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// Stops mirroring stderr into the startup buffer. Called once liveness
    /// is confirmed so ordinary runtime chatter is never mistaken for a
    /// startup failure.
    pub fn stop_startup_capture(&self) {
        self.capture_startup.store(false, Ordering::SeqCst);
    }

    pub fn startup_stderr(&self) -> String {
        self.startup_stderr
            .lock()
            .map(|buffer| buffer.clone())
            .unwrap_or_default()
    }

    /// Waits for the process to end and reports the exit alongside the
    /// captured startup stderr.
    pub async fn wait_for_exit(&mut self) -> WorkerExit {
        let exit_code = match self.child.wait().await {
            Ok(status) => status.code(),
            Err(error) => {
                warn!(error = %error, "failed to observe worker exit status");
                None
            }
        };

        WorkerExit {
            exit_code,
            stderr: self.startup_stderr(),
        }
    }
}

impl Drop for WorkerProcess {
    fn drop(&mut self) {
        self.stdout_task.abort();
        self.stderr_task.abort();
    }
}

fn spawn_stdout_relay<R>(stdout: R) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            info!(target: "simdesk_worker", stream = "stdout", "{line}");
        }
    })
}

fn spawn_stderr_relay<R>(
    stderr: R,
    buffer: Arc<Mutex<String>>,
    capture: Arc<AtomicBool>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            warn!(target: "simdesk_worker", stream = "stderr", "{line}");
            if capture.load(Ordering::SeqCst) {
                if let Ok(mut captured) = buffer.lock() {
                    captured.push_str(&line);
                    captured.push('\n');
                }
            }
        }
    })
}

/// Minimal view of a live process that kill strategies operate on, so the
/// escalation logic can be exercised against fakes.
#[async_trait]
pub trait ProcessHandle: Send {
    fn pid(&self) -> Option<u32>;
    fn signal_graceful(&mut self) -> SupervisorResult<()>;
    fn signal_forceful(&mut self) -> SupervisorResult<()>;
    /// Waits up to `grace` for the process to end on its own.
    async fn exited_within(&mut self, grace: Duration) -> bool;
}

#[async_trait]
impl ProcessHandle for WorkerProcess {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    fn signal_graceful(&mut self) -> SupervisorResult<()> {
        let Some(pid) = self.child.id() else {
            debug!("worker already exited before graceful signal");
            return Ok(());
        };

        signal_term(pid)
    }

    fn signal_forceful(&mut self) -> SupervisorResult<()> {
        match self.child.start_kill() {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == std::io::ErrorKind::InvalidInput => {
                debug!("worker already exited before forceful signal");
                Ok(())
            }
            Err(error) => Err(SupervisorError::Process(format!(
                "failed to kill worker: {error}"
            ))),
        }
    }

    async fn exited_within(&mut self, grace: Duration) -> bool {
        tokio::time::timeout(grace, self.child.wait())
            .await
            .is_ok()
    }
}

#[cfg(unix)]
fn signal_term(pid: u32) -> SupervisorResult<()> {
    let result = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
    if result == 0 {
        return Ok(());
    }

    let error = std::io::Error::last_os_error();
    if error.raw_os_error() == Some(libc::ESRCH) {
        debug!(pid, "worker pid no longer exists, treating as terminated");
        return Ok(());
    }

    Err(SupervisorError::Process(format!(
        "failed to signal worker pid {pid}: {error}"
    )))
}

#[cfg(not(unix))]
fn signal_term(_pid: u32) -> SupervisorResult<()> {
    // No graceful signal to send here; the forceful strategy is the default
    // on this platform anyway.
    Ok(())
}

/// Platform-selected termination behavior.
#[async_trait]
pub trait KillStrategy: Send + Sync {
    /// Attempts to end the process, escalating within `grace` as the
    /// strategy dictates. Returns whether the initial termination call was
    /// issued successfully.
    async fn terminate(&self, process: &mut dyn ProcessHandle, grace: Duration) -> bool;
}

/// Sends a termination signal, then one forceful kill if the process is
/// still running after the grace period.
#[derive(Debug, Default)]
pub struct GracefulKillStrategy;

#[async_trait]
impl KillStrategy for GracefulKillStrategy {
    async fn terminate(&self, process: &mut dyn ProcessHandle, grace: Duration) -> bool {
        if let Err(error) = process.signal_graceful() {
            warn!(pid = ?process.pid(), error = %error, "graceful worker signal failed");
            return false;
        }

        if process.exited_within(grace).await {
            debug!(pid = ?process.pid(), "worker exited within the grace period");
            return true;
        }

        info!(pid = ?process.pid(), grace_ms = grace.as_millis() as u64, "worker ignored graceful signal, killing");
        if let Err(error) = process.signal_forceful() {
            warn!(pid = ?process.pid(), error = %error, "forceful worker kill failed");
        }

        true
    }
}

/// Kills immediately without a graceful phase.
#[derive(Debug, Default)]
pub struct ForcefulKillStrategy;

#[async_trait]
impl KillStrategy for ForcefulKillStrategy {
    async fn terminate(&self, process: &mut dyn ProcessHandle, grace: Duration) -> bool {
        if let Err(error) = process.signal_forceful() {
            warn!(pid = ?process.pid(), error = %error, "forceful worker kill failed");
            return false;
        }

        let _ = process.exited_within(grace).await;
        true
    }
}

pub fn default_kill_strategy(platform: Platform) -> Arc<dyn KillStrategy> {
    match platform {
        Platform::Windows => Arc::new(ForcefulKillStrategy),
        Platform::MacOs | Platform::Linux => Arc::new(GracefulKillStrategy),
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::time::Duration;

    use tokio::io::AsyncWriteExt;

    use super::*;

    struct FakeProcessHandle {
        graceful_signals: usize,
        forceful_signals: usize,
        exits_within_grace: bool,
        graceful_fails: bool,
    }

    impl FakeProcessHandle {
        fn stubborn() -> Self {
            Self {
                graceful_signals: 0,
                forceful_signals: 0,
                exits_within_grace: false,
                graceful_fails: false,
            }
        }

        fn cooperative() -> Self {
            Self {
                exits_within_grace: true,
                ..Self::stubborn()
            }
        }
    }

    #[async_trait]
    impl ProcessHandle for FakeProcessHandle {
        fn pid(&self) -> Option<u32> {
            Some(4242)
        }

        fn signal_graceful(&mut self) -> SupervisorResult<()> {
            self.graceful_signals += 1;
            if self.graceful_fails {
                return Err(SupervisorError::Process("signal failed".to_owned()));
            }
            Ok(())
        }

        fn signal_forceful(&mut self) -> SupervisorResult<()> {
            self.forceful_signals += 1;
            Ok(())
        }

        async fn exited_within(&mut self, _grace: Duration) -> bool {
            self.exits_within_grace
        }
    }

    fn spec() -> WorkerSpawnSpec {
        WorkerSpawnSpec {
            launcher: PathBuf::from("/opt/simdesk/micromamba"),
            data_root: PathBuf::from("/data/simdesk"),
            env_name: "simdesk".to_owned(),
            worker_cli: "simdesk-worker".to_owned(),
            listen_host: "127.0.0.1".to_owned(),
            listen_port: 5050,
        }
    }

    #[test]
    fn dashboard_args_scope_the_environment_before_the_subcommand() {
        let args = dashboard_args(&spec());
        let rendered: Vec<String> = args
            .iter()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            rendered,
            vec![
                "-r",
                "/data/simdesk",
                "-n",
                "simdesk",
                "run",
                "simdesk-worker",
                "dashboard",
                "--host",
                "127.0.0.1",
                "--port",
                "5050",
            ]
        );
    }

    #[tokio::test]
    async fn stderr_relay_stops_capturing_once_detached() {
        let (mut writer, reader) = tokio::io::duplex(1024);
        let buffer = Arc::new(Mutex::new(String::new()));
        let capture = Arc::new(AtomicBool::new(true));
        let relay = spawn_stderr_relay(reader, Arc::clone(&buffer), Arc::clone(&capture));

        writer.write_all(b"startup failure\n").await.expect("write");
        wait_until(|| buffer.lock().expect("lock").contains("startup failure")).await;

        capture.store(false, Ordering::SeqCst);
        writer.write_all(b"later chatter\n").await.expect("write");
        drop(writer);
        relay.await.expect("relay task");

        assert_eq!(buffer.lock().expect("lock").as_str(), "startup failure\n");
    }

    #[tokio::test]
    async fn stderr_relay_accumulates_multiple_startup_lines() {
        let (mut writer, reader) = tokio::io::duplex(1024);
        let buffer = Arc::new(Mutex::new(String::new()));
        let capture = Arc::new(AtomicBool::new(true));
        let relay = spawn_stderr_relay(reader, Arc::clone(&buffer), Arc::clone(&capture));

        writer
            .write_all(b"Traceback (most recent call last):\n  ImportError: no module\n")
            .await
            .expect("write");
        drop(writer);
        relay.await.expect("relay task");

        assert_eq!(
            buffer.lock().expect("lock").as_str(),
            "Traceback (most recent call last):\n  ImportError: no module\n"
        );
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn graceful_strategy_escalates_exactly_once_for_a_stubborn_process() {
        let mut handle = FakeProcessHandle::stubborn();
        let terminated = GracefulKillStrategy
            .terminate(&mut handle, Duration::from_millis(100))
            .await;

        assert!(terminated);
        assert_eq!(handle.graceful_signals, 1);
        assert_eq!(handle.forceful_signals, 1);
    }

    #[tokio::test]
    async fn graceful_strategy_skips_escalation_when_the_process_exits() {
        let mut handle = FakeProcessHandle::cooperative();
        let terminated = GracefulKillStrategy
            .terminate(&mut handle, Duration::from_millis(100))
            .await;

        assert!(terminated);
        assert_eq!(handle.graceful_signals, 1);
        assert_eq!(handle.forceful_signals, 0);
    }

    #[tokio::test]
    async fn graceful_strategy_reports_signal_failure_without_escalating() {
        let mut handle = FakeProcessHandle {
            graceful_fails: true,
            ..FakeProcessHandle::stubborn()
        };
        let terminated = GracefulKillStrategy
            .terminate(&mut handle, Duration::from_millis(100))
            .await;

        assert!(!terminated);
        assert_eq!(handle.graceful_signals, 1);
        assert_eq!(handle.forceful_signals, 0);
    }

    #[tokio::test]
    async fn forceful_strategy_never_sends_a_graceful_signal() {
        let mut handle = FakeProcessHandle::cooperative();
        let terminated = ForcefulKillStrategy
            .terminate(&mut handle, Duration::from_millis(100))
            .await;

        assert!(terminated);
        assert_eq!(handle.graceful_signals, 0);
        assert_eq!(handle.forceful_signals, 1);
    }

    #[tokio::test]
    async fn default_strategy_is_forceful_only_on_windows() {
        let mut handle = FakeProcessHandle::cooperative();
        default_kill_strategy(Platform::Windows)
            .terminate(&mut handle, Duration::from_millis(10))
            .await;
        assert_eq!(handle.graceful_signals, 0);
        assert_eq!(handle.forceful_signals, 1);

        let mut handle = FakeProcessHandle::cooperative();
        default_kill_strategy(Platform::Linux)
            .terminate(&mut handle, Duration::from_millis(10))
            .await;
        assert_eq!(handle.graceful_signals, 1);
        assert_eq!(handle.forceful_signals, 0);
    }
}
