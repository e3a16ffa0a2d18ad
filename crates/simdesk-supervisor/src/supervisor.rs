use std::ffi::OsString;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use simdesk_client::WorkerClient;
use tracing::{info, warn};

use crate::command::{CommandRunner, TokioCommandRunner, command_output_detail};
use crate::environment::{
    EnvironmentManager, EnvironmentPlan, EnvironmentSettings, HttpManifestSource, ManifestSource,
    version_tag,
};
use crate::error::{SupervisorError, SupervisorResult};
use crate::liveness::{LivenessOutcome, wait_until_alive};
use crate::phase::SupervisorPhase;
use crate::platform::{Platform, resolve_data_root};
use crate::process::{KillStrategy, WorkerProcess, WorkerSpawnSpec, default_kill_strategy};

pub const DEFAULT_KILL_TIMEOUT: Duration = Duration::from_millis(10_000);

/// Everything the supervisor needs to locate, install, spawn, and probe the
/// worker. `None` overrides fall back to per-platform resolution.
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub launcher_path: Option<PathBuf>,
    pub resources_dir: Option<PathBuf>,
    pub data_root: Option<PathBuf>,
    pub env_name: String,
    pub worker_cli: String,
    pub package_name: String,
    pub package_git_url: String,
    pub manifest_url_template: String,
    pub listen_host: String,
    pub listen_port: u16,
    pub liveness_poll_interval: Duration,
    pub liveness_timeout: Duration,
    pub kill_timeout: Duration,
}

impl SupervisorSettings {
    pub fn listen_url(&self) -> String {
        format!("http://{}:{}", self.listen_host, self.listen_port)
    }
}

/// Owns the one worker process per application run: environment
/// reconciliation, spawn, liveness confirmation, and teardown.
pub struct WorkerSupervisor {
    settings: SupervisorSettings,
    platform: Platform,
    phase: SupervisorPhase,
    runner: Arc<dyn CommandRunner>,
    manifests: Arc<dyn ManifestSource>,
    kill_strategy: Arc<dyn KillStrategy>,
    worker: Option<WorkerProcess>,
}

impl WorkerSupervisor {
    pub fn new(settings: SupervisorSettings) -> Self {
        let platform = Platform::current();
        Self::with_transports(
            settings,
            platform,
            Arc::new(TokioCommandRunner),
            Arc::new(HttpManifestSource::new()),
            default_kill_strategy(platform),
        )
    }

    /// Constructor with injectable process/network seams for tests.
    pub fn with_transports(
        settings: SupervisorSettings,
        platform: Platform,
        runner: Arc<dyn CommandRunner>,
        manifests: Arc<dyn ManifestSource>,
        kill_strategy: Arc<dyn KillStrategy>,
    ) -> Self {
        Self {
            settings,
            platform,
            phase: SupervisorPhase::NotStarted,
            runner,
            manifests,
            kill_strategy,
            worker: None,
        }
    }

    pub fn phase(&self) -> SupervisorPhase {
        self.phase
    }

    pub fn listen_url(&self) -> String {
        self.settings.listen_url()
    }

    pub fn worker_pid(&self) -> Option<u32> {
        self.worker.as_ref().and_then(WorkerProcess::pid)
    }

    /// Runs the full startup sequence: environment reconciliation, spawn,
    /// and liveness confirmation. On success the supervisor is `Alive` and
    /// startup stderr capture has been detached; any failure lands in
    /// `Failed` with the underlying error.
    pub async fn start(&mut self, app_version: &str) -> SupervisorResult<()> {
        self.ensure_environment(app_version).await?;

        self.set_phase(SupervisorPhase::Spawning);
        let spec = match self.spawn_spec().await {
            Ok(spec) => spec,
            Err(error) => return Err(self.fail(error)),
        };
        let mut worker = match WorkerProcess::spawn(&spec) {
            Ok(worker) => worker,
            Err(error) => return Err(self.fail(error)),
        };

        self.set_phase(SupervisorPhase::AwaitingLiveness);
        let probe = WorkerClient::new(self.listen_url());
        let outcome = wait_until_alive(
            &probe,
            worker.wait_for_exit(),
            self.settings.liveness_poll_interval,
            self.settings.liveness_timeout,
        )
        .await;

        match outcome {
            LivenessOutcome::Alive => {
                worker.stop_startup_capture();
                self.worker = Some(worker);
                self.set_phase(SupervisorPhase::Alive);
                info!(url = %self.listen_url(), "worker confirmed alive");
                Ok(())
            }
            LivenessOutcome::TimedOut => {
                // Keep the handle so terminate_worker can still kill the
                // unresponsive process.
                self.worker = Some(worker);
                let error = SupervisorError::Process(format!(
                    "worker did not answer {} within {:?}",
                    self.listen_url(),
                    self.settings.liveness_timeout
                ));
                Err(self.fail(error))
            }
            LivenessOutcome::WorkerExited(exit) => {
                let error = SupervisorError::Process(startup_failure_message(
                    exit.exit_code,
                    &exit.stderr,
                ));
                Err(self.fail(error))
            }
        }
    }

    /// Brings the installed environment in line with the application
    /// version: creates it when absent or unhealthy, updates it when stale,
    /// and leaves editable installs alone.
    pub async fn ensure_environment(&mut self, app_version: &str) -> SupervisorResult<()> {
        self.set_phase(SupervisorPhase::EnvironmentChecking);

        let manager = match self.environment_manager().await {
            Ok(manager) => manager,
            Err(error) => return Err(self.fail(error)),
        };

        let plan = match manager.assess(app_version).await {
            Ok(plan) => plan,
            Err(error) => return Err(self.fail(error)),
        };

        let tag = version_tag(app_version);
        let result = match plan {
            EnvironmentPlan::Create => {
                self.set_phase(SupervisorPhase::EnvironmentInstalling);
                manager.create_environment(&tag).await
            }
            EnvironmentPlan::Update { installed } => {
                info!(installed = %installed, target = %app_version, "worker environment is stale");
                self.set_phase(SupervisorPhase::EnvironmentUpdating);
                manager.update_environment(&tag).await
            }
            EnvironmentPlan::EditableInstall { installed } => {
                info!(installed = %installed, "editable worker install, skipping version reconciliation");
                Ok(())
            }
            EnvironmentPlan::UpToDate { installed } => {
                info!(installed = %installed, "worker environment up to date");
                Ok(())
            }
        };

        result.map_err(|error| self.fail(error))
    }

    /// Tears down the worker process if one is held. Safe to call at any
    /// point of the lifecycle; a missing worker is a logged no-op.
    pub async fn terminate_worker(&mut self) -> bool {
        let Some(mut worker) = self.worker.take() else {
            info!("no worker process to terminate");
            return true;
        };

        // Detach startup capture before signalling so shutdown output is
        // never misread as a startup failure.
        worker.stop_startup_capture();

        let transition = !self.phase.is_terminal();
        if transition {
            self.set_phase(SupervisorPhase::Terminating);
        }

        let pid = worker.pid();
        let terminated = self
            .kill_strategy
            .terminate(&mut worker, self.settings.kill_timeout)
            .await;
        if terminated {
            info!(pid = ?pid, "worker terminated");
        } else {
            warn!(pid = ?pid, "worker termination signal failed");
        }

        if transition {
            self.set_phase(SupervisorPhase::Terminated);
        }

        terminated
    }

    /// Resolves the runtime launcher binary and proves it is usable with a
    /// version probe.
    async fn locate_launcher(&self) -> SupervisorResult<PathBuf> {
        let candidate = match &self.settings.launcher_path {
            Some(path) => path.clone(),
            None => {
                let resources = self.settings.resources_dir.as_ref().ok_or_else(|| {
                    SupervisorError::Configuration(
                        "no launcher path or resources directory configured".to_owned(),
                    )
                })?;
                resources.join(self.platform.launcher_binary_name())
            }
        };

        if !candidate.is_file() {
            return Err(SupervisorError::Environment(format!(
                "runtime launcher {} does not exist",
                candidate.display()
            )));
        }

        let args = vec![OsString::from("--version")];
        let output = self
            .runner
            .run(&candidate, &args)
            .await
            .map_err(|error| {
                SupervisorError::Environment(format!(
                    "runtime launcher {} is unusable: {error}",
                    candidate.display()
                ))
            })?;
        if !output.status.success() {
            return Err(SupervisorError::Environment(format!(
                "runtime launcher {} failed its version probe: {}",
                candidate.display(),
                command_output_detail(&output)
            )));
        }

        Ok(candidate)
    }

    fn locate_data_root(&self) -> SupervisorResult<PathBuf> {
        match &self.settings.data_root {
            Some(root) => Ok(root.clone()),
            None => resolve_data_root(self.platform),
        }
    }

    async fn environment_manager(&self) -> SupervisorResult<EnvironmentManager> {
        let launcher = self.locate_launcher().await?;
        let data_root = self.locate_data_root()?;
        Ok(EnvironmentManager::new(
            launcher,
            EnvironmentSettings {
                data_root,
                env_name: self.settings.env_name.clone(),
                worker_cli: self.settings.worker_cli.clone(),
                package_name: self.settings.package_name.clone(),
                package_git_url: self.settings.package_git_url.clone(),
                manifest_url_template: self.settings.manifest_url_template.clone(),
            },
            Arc::clone(&self.runner),
            Arc::clone(&self.manifests),
        ))
    }

    async fn spawn_spec(&self) -> SupervisorResult<WorkerSpawnSpec> {
        let launcher = self.locate_launcher().await?;
        let data_root = self.locate_data_root()?;
        Ok(WorkerSpawnSpec {
            launcher,
            data_root,
            env_name: self.settings.env_name.clone(),
            worker_cli: self.settings.worker_cli.clone(),
            listen_host: self.settings.listen_host.clone(),
            listen_port: self.settings.listen_port,
        })
    }

    fn set_phase(&mut self, next: SupervisorPhase) {
        if self.phase == next {
            return;
        }
        info!(from = ?self.phase, to = ?next, "supervisor phase change");
        self.phase = next;
    }

    fn fail(&mut self, error: SupervisorError) -> SupervisorError {
        warn!(error = %error, "supervisor startup failed");
        self.set_phase(SupervisorPhase::Failed);
        error
    }
}

/// Startup failures carry the worker's own stderr verbatim so the user sees
/// the real traceback, not a paraphrase.
fn startup_failure_message(exit_code: Option<i32>, stderr: &str) -> String {
    let code = match exit_code {
        Some(code) => code.to_string(),
        None => "unknown".to_owned(),
    };
    let stderr = stderr.trim();
    if stderr.is_empty() {
        format!("worker exited during startup (exit code {code})")
    } else {
        format!("worker exited during startup (exit code {code}):\n{stderr}")
    }
}
