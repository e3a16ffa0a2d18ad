use std::ffi::OsString;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::command::{CommandRunner, command_output_detail, render_args};
use crate::error::{SupervisorError, SupervisorResult};

/// Fixed name of the pinned dependency manifest inside the data root.
pub const LOCK_FILE_NAME: &str = "conda-lock.yml";

/// Marker pip prints for packages installed with `pip install -e`.
const EDITABLE_MARKER: &str = "Editable project location:";

/// Where the worker package and its pinned dependency manifest come from.
#[derive(Debug, Clone)]
pub struct EnvironmentSettings {
    pub data_root: PathBuf,
    pub env_name: String,
    pub worker_cli: String,
    pub package_name: String,
    pub package_git_url: String,
    pub manifest_url_template: String,
}

/// Seam for fetching the version-pinned dependency manifest.
#[async_trait]
pub trait ManifestSource: Send + Sync {
    async fn fetch(&self, url: &str) -> SupervisorResult<Vec<u8>>;
}

#[derive(Debug, Clone, Default)]
pub struct HttpManifestSource {
    http: reqwest::Client,
}

impl HttpManifestSource {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl ManifestSource for HttpManifestSource {
    async fn fetch(&self, url: &str) -> SupervisorResult<Vec<u8>> {
        let response =
            self.http
                .get(url)
                .send()
                .await
                .map_err(|error| SupervisorError::Download {
                    url: url.to_owned(),
                    reason: error.to_string(),
                })?;

        let status = response.status();
        if !status.is_success() {
            return Err(SupervisorError::Download {
                url: url.to_owned(),
                reason: format!("unexpected status {status}"),
            });
        }

        let bytes = response.bytes().await.map_err(|error| SupervisorError::Download {
            url: url.to_owned(),
            reason: error.to_string(),
        })?;

        Ok(bytes.to_vec())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvironmentHealth {
    pub editable: bool,
}

/// Action the supervisor should take after inspecting the installed
/// environment against the application's own version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvironmentPlan {
    /// No usable environment on disk; materialize one from scratch.
    Create,
    /// Installed version differs from the application version.
    Update { installed: String },
    /// Installed and current; nothing to do.
    UpToDate { installed: String },
    /// In-place development install; version reconciliation is skipped.
    EditableInstall { installed: String },
}

/// Formats an application version as the tag used for manifest URLs and
/// package pins, e.g. `5.2.0` becomes `v5.2.0`.
pub fn version_tag(app_version: &str) -> String {
    format!("v{}", app_version.trim().trim_start_matches('v'))
}

fn normalized_version(version: &str) -> &str {
    version.trim().trim_start_matches('v')
}

/// Inspects, creates, and updates the worker's isolated package environment
/// through the runtime launcher binary.
pub struct EnvironmentManager {
    launcher: PathBuf,
    settings: EnvironmentSettings,
    runner: Arc<dyn CommandRunner>,
    manifests: Arc<dyn ManifestSource>,
}

impl EnvironmentManager {
    pub fn new(
        launcher: PathBuf,
        settings: EnvironmentSettings,
        runner: Arc<dyn CommandRunner>,
        manifests: Arc<dyn ManifestSource>,
    ) -> Self {
        Self {
            launcher,
            settings,
            runner,
            manifests,
        }
    }

    pub fn settings(&self) -> &EnvironmentSettings {
        &self.settings
    }

    /// Directory the launcher materializes the named environment into.
    pub fn env_dir(&self) -> PathBuf {
        self.settings
            .data_root
            .join("envs")
            .join(&self.settings.env_name)
    }

    /// Decides whether the environment must be created, updated, or left
    /// alone for the given application version.
    pub async fn assess(&self, app_version: &str) -> SupervisorResult<EnvironmentPlan> {
        let installed = match self.installed_version().await {
            Ok(version) => version,
            Err(SupervisorError::EnvironmentMissing(reason)) => {
                info!(reason = %reason, "worker environment not installed");
                return Ok(EnvironmentPlan::Create);
            }
            Err(error) => return Err(error),
        };

        let health = match self.check_healthy().await {
            Ok(health) => health,
            Err(error) => {
                warn!(error = %error, "installed worker environment failed its self check, reinstalling");
                return Ok(EnvironmentPlan::Create);
            }
        };

        if health.editable {
            return Ok(EnvironmentPlan::EditableInstall { installed });
        }

        if normalized_version(&installed) != normalized_version(app_version) {
            return Ok(EnvironmentPlan::Update { installed });
        }

        Ok(EnvironmentPlan::UpToDate { installed })
    }

    /// Reports the version of the worker package installed in the
    /// environment. A missing environment directory, a failing probe, or an
    /// empty report all mean "not installed" rather than a fatal error.
    pub async fn installed_version(&self) -> SupervisorResult<String> {
        let env_dir = self.env_dir();
        if !env_dir.is_dir() {
            return Err(SupervisorError::EnvironmentMissing(format!(
                "environment directory {} does not exist",
                env_dir.display()
            )));
        }

        let args = self.run_args(&[self.settings.worker_cli.as_str(), "--version"]);
        let output = self
            .runner
            .run(&self.launcher, &args)
            .await
            .map_err(|error| {
                SupervisorError::EnvironmentMissing(format!("version probe failed to start: {error}"))
            })?;

        if !output.status.success() {
            return Err(SupervisorError::EnvironmentMissing(format!(
                "version probe failed: {}",
                command_output_detail(&output)
            )));
        }

        let version = String::from_utf8_lossy(&output.stdout).trim().to_owned();
        if version.is_empty() {
            return Err(SupervisorError::EnvironmentMissing(
                "version probe produced no output".to_owned(),
            ));
        }

        Ok(version)
    }

    /// Runs the worker's self check inside the environment and sniffs
    /// whether the package is an editable install.
    pub async fn check_healthy(&self) -> SupervisorResult<EnvironmentHealth> {
        let args = self.run_args(&[self.settings.worker_cli.as_str(), "--help"]);
        let output = self.run_launcher(args, "worker self check").await?;
        if !output.status.success() {
            return Err(SupervisorError::Environment(format!(
                "worker self check failed: {}",
                command_output_detail(&output)
            )));
        }

        Ok(EnvironmentHealth {
            editable: self.detect_editable_install().await,
        })
    }

    async fn detect_editable_install(&self) -> bool {
        let args = self.run_args(&["pip", "show", self.settings.package_name.as_str()]);
        match self.runner.run(&self.launcher, &args).await {
            Ok(output) if output.status.success() => {
                String::from_utf8_lossy(&output.stdout).contains(EDITABLE_MARKER)
            }
            Ok(output) => {
                debug!(
                    detail = %command_output_detail(&output),
                    "pip show probe failed, treating install as non-editable"
                );
                false
            }
            Err(error) => {
                debug!(error = %error, "pip show probe failed to start, treating install as non-editable");
                false
            }
        }
    }

    pub async fn create_environment(&self, tag: &str) -> SupervisorResult<()> {
        self.materialize("create", tag).await
    }

    pub async fn update_environment(&self, tag: &str) -> SupervisorResult<()> {
        self.materialize("update", tag).await
    }

    /// Fetches the manifest pinned at `tag`, materializes the environment
    /// from it, then installs the worker package at the same tag.
    async fn materialize(&self, verb: &str, tag: &str) -> SupervisorResult<()> {
        let lock_path = self.download_manifest(tag).await?;

        let mut args = vec![OsString::from(verb)];
        args.extend(self.scope_args());
        args.push(OsString::from("-f"));
        args.push(lock_path.clone().into_os_string());
        args.push(OsString::from("-y"));
        self.run_checked(args, "environment materialization").await?;

        let requirement = format!("git+{}@{}", self.settings.package_git_url, tag);
        let args = self.run_args(&["pip", "install", requirement.as_str()]);
        self.run_checked(args, "worker package install").await?;

        info!(tag = %tag, env = %self.settings.env_name, "worker environment ready");
        Ok(())
    }

    /// Downloads the manifest for `tag` into the data root. The write goes
    /// through a sibling `.partial` file and a rename so a failed download
    /// never leaves a corrupt manifest at the path later steps consume.
    async fn download_manifest(&self, tag: &str) -> SupervisorResult<PathBuf> {
        let url = self.settings.manifest_url_template.replace("{tag}", tag);
        let bytes = self.manifests.fetch(&url).await?;

        std::fs::create_dir_all(&self.settings.data_root).map_err(|error| {
            SupervisorError::Environment(format!(
                "failed to create data root {}: {error}",
                self.settings.data_root.display()
            ))
        })?;

        let destination = self.settings.data_root.join(LOCK_FILE_NAME);
        let partial = self
            .settings
            .data_root
            .join(format!("{LOCK_FILE_NAME}.partial"));

        std::fs::write(&partial, &bytes).map_err(|error| {
            let _ = std::fs::remove_file(&partial);
            SupervisorError::Environment(format!(
                "failed to write manifest {}: {error}",
                partial.display()
            ))
        })?;
        std::fs::rename(&partial, &destination).map_err(|error| {
            let _ = std::fs::remove_file(&partial);
            SupervisorError::Environment(format!(
                "failed to move manifest into place at {}: {error}",
                destination.display()
            ))
        })?;

        info!(url = %url, path = %destination.display(), "downloaded environment manifest");
        Ok(destination)
    }

    fn scope_args(&self) -> Vec<OsString> {
        vec![
            OsString::from("-r"),
            self.settings.data_root.clone().into_os_string(),
            OsString::from("-n"),
            OsString::from(self.settings.env_name.as_str()),
        ]
    }

    fn run_args(&self, trailing: &[&str]) -> Vec<OsString> {
        let mut args = self.scope_args();
        args.push(OsString::from("run"));
        args.extend(trailing.iter().map(OsString::from));
        args
    }

    async fn run_launcher(
        &self,
        args: Vec<OsString>,
        operation: &str,
    ) -> SupervisorResult<std::process::Output> {
        self.runner
            .run(&self.launcher, &args)
            .await
            .map_err(|error| {
                SupervisorError::Environment(format!(
                    "{operation} could not start (`{} {}`): {error}",
                    self.launcher.display(),
                    render_args(&args)
                ))
            })
    }

    async fn run_checked(&self, args: Vec<OsString>, operation: &str) -> SupervisorResult<()> {
        let output = self.run_launcher(args.clone(), operation).await?;
        if !output.status.success() {
            return Err(SupervisorError::Environment(format!(
                "{operation} failed (`{} {}`): {}",
                self.launcher.display(),
                render_args(&args),
                command_output_detail(&output)
            )));
        }

        Ok(())
    }
}
