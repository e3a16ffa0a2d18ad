use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const ENV_SIMDESK_CONFIG: &str = "SIMDESK_CONFIG";

const DEFAULT_SERVER_HOST: &str = "127.0.0.1";
const DEFAULT_SERVER_PORT: u16 = 5050;
const DEFAULT_ENV_NAME: &str = "simdesk";
const DEFAULT_WORKER_CLI: &str = "simdesk-worker";
const DEFAULT_PACKAGE_NAME: &str = "simdesk-worker";
const DEFAULT_PACKAGE_GIT_URL: &str = "https://github.com/simdesk/simdesk-worker.git";
const DEFAULT_MANIFEST_URL_TEMPLATE: &str =
    "https://raw.githubusercontent.com/simdesk/simdesk-worker/{tag}/conda-lock.yml";
const DEFAULT_LIVENESS_POLL_SECS: u64 = 3;
const DEFAULT_LIVENESS_TIMEOUT_SECS: u64 = 300;
const DEFAULT_KILL_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_NOTICE_AUTO_DISMISS_SECS: u64 = 6;
const DEFAULT_STATUS_LINE_MAX_CHARS: usize = 120;

const TAG_PLACEHOLDER: &str = "{tag}";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0}")]
    Message(String),
}

impl ConfigError {
    fn configuration(message: impl Into<String>) -> Self {
        Self::Message(message.into())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct SimdeskConfig {
    #[serde(default)]
    pub server: ServerConfigToml,
    #[serde(default)]
    pub supervisor: SupervisorConfigToml,
    #[serde(default)]
    pub notices: NoticesConfigToml,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerConfigToml {
    #[serde(default = "default_server_host")]
    pub host: String,
    #[serde(default = "default_server_port")]
    pub port: u16,
}

impl Default for ServerConfigToml {
    fn default() -> Self {
        Self {
            host: default_server_host(),
            port: default_server_port(),
        }
    }
}

/// Worker environment and process settings. The three path fields are
/// overrides; empty means "resolve per platform at runtime".
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SupervisorConfigToml {
    #[serde(default)]
    pub launcher_path: String,
    #[serde(default)]
    pub resources_dir: String,
    #[serde(default)]
    pub data_root: String,
    #[serde(default = "default_env_name")]
    pub env_name: String,
    #[serde(default = "default_worker_cli")]
    pub worker_cli: String,
    #[serde(default = "default_package_name")]
    pub package_name: String,
    #[serde(default = "default_package_git_url")]
    pub package_git_url: String,
    #[serde(default = "default_manifest_url_template")]
    pub manifest_url_template: String,
    #[serde(default = "default_liveness_poll_secs")]
    pub liveness_poll_secs: u64,
    #[serde(default = "default_liveness_timeout_secs")]
    pub liveness_timeout_secs: u64,
    #[serde(default = "default_kill_timeout_ms")]
    pub kill_timeout_ms: u64,
}

impl Default for SupervisorConfigToml {
    fn default() -> Self {
        Self {
            launcher_path: String::new(),
            resources_dir: String::new(),
            data_root: String::new(),
            env_name: default_env_name(),
            worker_cli: default_worker_cli(),
            package_name: default_package_name(),
            package_git_url: default_package_git_url(),
            manifest_url_template: default_manifest_url_template(),
            liveness_poll_secs: default_liveness_poll_secs(),
            liveness_timeout_secs: default_liveness_timeout_secs(),
            kill_timeout_ms: default_kill_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NoticesConfigToml {
    #[serde(default = "default_notice_auto_dismiss_secs")]
    pub auto_dismiss_secs: u64,
    #[serde(default = "default_status_line_max_chars")]
    pub status_line_max_chars: usize,
}

impl Default for NoticesConfigToml {
    fn default() -> Self {
        Self {
            auto_dismiss_secs: default_notice_auto_dismiss_secs(),
            status_line_max_chars: default_status_line_max_chars(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerAddress {
    pub host: String,
    pub port: u16,
}

impl ServerAddress {
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

/// Supervisor slice with the raw strings resolved into paths and the
/// interval fields resolved into durations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerRuntimeConfig {
    pub launcher_path: Option<PathBuf>,
    pub resources_dir: Option<PathBuf>,
    pub data_root: Option<PathBuf>,
    pub env_name: String,
    pub worker_cli: String,
    pub package_name: String,
    pub package_git_url: String,
    pub manifest_url_template: String,
    pub liveness_poll: Duration,
    pub liveness_timeout: Duration,
    pub kill_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NoticeViewConfig {
    pub auto_dismiss: Duration,
    pub status_line_max_chars: usize,
}

impl SimdeskConfig {
    pub fn server_address(&self) -> ServerAddress {
        ServerAddress {
            host: self.server.host.clone(),
            port: self.server.port,
        }
    }

    pub fn worker_runtime(&self) -> WorkerRuntimeConfig {
        WorkerRuntimeConfig {
            launcher_path: optional_path(&self.supervisor.launcher_path),
            resources_dir: optional_path(&self.supervisor.resources_dir),
            data_root: optional_path(&self.supervisor.data_root),
            env_name: self.supervisor.env_name.clone(),
            worker_cli: self.supervisor.worker_cli.clone(),
            package_name: self.supervisor.package_name.clone(),
            package_git_url: self.supervisor.package_git_url.clone(),
            manifest_url_template: self.supervisor.manifest_url_template.clone(),
            liveness_poll: Duration::from_secs(self.supervisor.liveness_poll_secs),
            liveness_timeout: Duration::from_secs(self.supervisor.liveness_timeout_secs),
            kill_timeout: Duration::from_millis(self.supervisor.kill_timeout_ms),
        }
    }

    pub fn notice_view(&self) -> NoticeViewConfig {
        NoticeViewConfig {
            auto_dismiss: Duration::from_secs(self.notices.auto_dismiss_secs),
            status_line_max_chars: self.notices.status_line_max_chars,
        }
    }
}

pub fn load_from_env() -> Result<SimdeskConfig, ConfigError> {
    let path = config_path_from_env()?;
    load_from_path(path)
}

pub fn load_from_path(path: impl AsRef<Path>) -> Result<SimdeskConfig, ConfigError> {
    load_or_create_config(path.as_ref())
}

pub fn default_config_path() -> Result<PathBuf, ConfigError> {
    let home = resolve_home_dir().ok_or_else(|| {
        ConfigError::configuration("Unable to resolve home directory from HOME or USERPROFILE")
    })?;

    Ok(home.join(".config").join("simdesk").join("config.toml"))
}

fn config_path_from_env() -> Result<PathBuf, ConfigError> {
    match std::env::var(ENV_SIMDESK_CONFIG) {
        Ok(raw) => {
            if raw.trim().is_empty() {
                default_config_path()
            } else {
                Ok(raw.into())
            }
        }
        Err(std::env::VarError::NotPresent) => default_config_path(),
        Err(_) => Err(ConfigError::configuration(
            "SIMDESK_CONFIG contained invalid UTF-8",
        )),
    }
}

fn resolve_home_dir() -> Option<PathBuf> {
    std::env::var("HOME")
        .ok()
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
        .or_else(|| {
            std::env::var("USERPROFILE")
                .ok()
                .map(|value| value.trim().to_owned())
                .filter(|value| !value.is_empty())
                .map(PathBuf::from)
        })
}

fn optional_path(raw: &str) -> Option<PathBuf> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(PathBuf::from(trimmed))
    }
}

fn default_server_host() -> String {
    DEFAULT_SERVER_HOST.to_owned()
}

fn default_server_port() -> u16 {
    DEFAULT_SERVER_PORT
}

fn default_env_name() -> String {
    DEFAULT_ENV_NAME.to_owned()
}

fn default_worker_cli() -> String {
    DEFAULT_WORKER_CLI.to_owned()
}

fn default_package_name() -> String {
    DEFAULT_PACKAGE_NAME.to_owned()
}

fn default_package_git_url() -> String {
    DEFAULT_PACKAGE_GIT_URL.to_owned()
}

fn default_manifest_url_template() -> String {
    DEFAULT_MANIFEST_URL_TEMPLATE.to_owned()
}

fn default_liveness_poll_secs() -> u64 {
    DEFAULT_LIVENESS_POLL_SECS
}

fn default_liveness_timeout_secs() -> u64 {
    DEFAULT_LIVENESS_TIMEOUT_SECS
}

fn default_kill_timeout_ms() -> u64 {
    DEFAULT_KILL_TIMEOUT_MS
}

fn default_notice_auto_dismiss_secs() -> u64 {
    DEFAULT_NOTICE_AUTO_DISMISS_SECS
}

fn default_status_line_max_chars() -> usize {
    DEFAULT_STATUS_LINE_MAX_CHARS
}

fn persist_config(path: &Path, config: &SimdeskConfig) -> Result<(), ConfigError> {
    let rendered = toml::to_string_pretty(config).map_err(|err| {
        ConfigError::configuration(format!(
            "Failed to serialize SIMDESK_CONFIG for {}: {err}",
            path.display()
        ))
    })?;

    std::fs::write(path, rendered.as_bytes()).map_err(|err| {
        ConfigError::configuration(format!(
            "Failed to write SIMDESK_CONFIG to {}: {err}",
            path.display()
        ))
    })
}

fn load_or_create_config(path: &Path) -> Result<SimdeskConfig, ConfigError> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent).map_err(|err| {
                        ConfigError::configuration(format!(
                            "Failed to create parent directory {} for SIMDESK_CONFIG: {err}",
                            parent.display()
                        ))
                    })?;
                }
            }

            let default_config = SimdeskConfig::default();
            persist_config(path, &default_config)?;

            toml::to_string_pretty(&default_config).map_err(|err| {
                ConfigError::configuration(format!(
                    "Failed to serialize default SIMDESK_CONFIG: {err}"
                ))
            })?
        }
        Err(err) => {
            return Err(ConfigError::configuration(format!(
                "Failed to read SIMDESK_CONFIG from {}: {err}",
                path.display()
            )));
        }
    };

    let mut config: SimdeskConfig = toml::from_str(&raw).map_err(|err| {
        ConfigError::configuration(format!(
            "Failed to parse SIMDESK_CONFIG from {}: {err}",
            path.display()
        ))
    })?;

    let changed = normalize_config(&mut config)?;
    if changed {
        persist_config(path, &config)?;
    }

    Ok(config)
}

fn normalize_config(config: &mut SimdeskConfig) -> Result<bool, ConfigError> {
    let mut changed = false;

    changed |= normalize_non_empty_string(&mut config.server.host, default_server_host());
    if config.server.port == 0 {
        config.server.port = default_server_port();
        changed = true;
    }

    changed |= normalize_path_override(&mut config.supervisor.launcher_path);
    changed |= normalize_path_override(&mut config.supervisor.resources_dir);
    changed |= normalize_path_override(&mut config.supervisor.data_root);
    changed |= normalize_non_empty_string(&mut config.supervisor.env_name, default_env_name());
    changed |= normalize_non_empty_string(&mut config.supervisor.worker_cli, default_worker_cli());
    changed |= normalize_non_empty_string(
        &mut config.supervisor.package_name,
        default_package_name(),
    );
    changed |= normalize_non_empty_string(
        &mut config.supervisor.package_git_url,
        default_package_git_url(),
    );
    changed |= normalize_manifest_url_template(&mut config.supervisor.manifest_url_template)?;

    let normalized_liveness_poll_secs = if config.supervisor.liveness_poll_secs == 0 {
        default_liveness_poll_secs()
    } else {
        config.supervisor.liveness_poll_secs.clamp(1, 60)
    };
    if normalized_liveness_poll_secs != config.supervisor.liveness_poll_secs {
        config.supervisor.liveness_poll_secs = normalized_liveness_poll_secs;
        changed = true;
    }

    let normalized_liveness_timeout_secs = if config.supervisor.liveness_timeout_secs == 0 {
        default_liveness_timeout_secs()
    } else {
        config.supervisor.liveness_timeout_secs.clamp(5, 3_600)
    };
    if normalized_liveness_timeout_secs != config.supervisor.liveness_timeout_secs {
        config.supervisor.liveness_timeout_secs = normalized_liveness_timeout_secs;
        changed = true;
    }

    let normalized_kill_timeout_ms = if config.supervisor.kill_timeout_ms == 0 {
        default_kill_timeout_ms()
    } else {
        config.supervisor.kill_timeout_ms.clamp(100, 120_000)
    };
    if normalized_kill_timeout_ms != config.supervisor.kill_timeout_ms {
        config.supervisor.kill_timeout_ms = normalized_kill_timeout_ms;
        changed = true;
    }

    if config.notices.auto_dismiss_secs == 0 {
        config.notices.auto_dismiss_secs = default_notice_auto_dismiss_secs();
        changed = true;
    }
    let normalized_status_line_max_chars = config.notices.status_line_max_chars.max(1);
    if normalized_status_line_max_chars != config.notices.status_line_max_chars {
        config.notices.status_line_max_chars = normalized_status_line_max_chars;
        changed = true;
    }

    Ok(changed)
}

fn normalize_manifest_url_template(value: &mut String) -> Result<bool, ConfigError> {
    let changed = normalize_non_empty_string(value, default_manifest_url_template());
    if !value.contains(TAG_PLACEHOLDER) {
        return Err(ConfigError::configuration(format!(
            "Invalid `manifest_url_template` value '{value}' in SIMDESK_CONFIG: the template \
             must contain the literal `{{tag}}` placeholder."
        )));
    }
    Ok(changed)
}

fn normalize_non_empty_string(value: &mut String, default: String) -> bool {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        if *value != default {
            *value = default;
            return true;
        }
        return false;
    }

    if trimmed != value {
        *value = trimmed.to_owned();
        return true;
    }
    false
}

fn normalize_path_override(value: &mut String) -> bool {
    let trimmed = value.trim();
    if trimmed != value {
        *value = trimmed.to_owned();
        return true;
    }
    false
}
