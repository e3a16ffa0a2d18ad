use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use simdesk_client::WorkerClient;
use simdesk_config::{ConfigError, ENV_SIMDESK_CONFIG, ServerAddress, WorkerRuntimeConfig};
use simdesk_reconciler::{DEFAULT_NOTICE_BUFFER_CAPACITY, JobReconciler, NoticeEnvelope};
use simdesk_supervisor::{Platform, SupervisorSettings, WorkerSupervisor, resolve_data_root};
use tokio::sync::broadcast;
use tracing::{error, info, warn};

const APP_VERSION: &str = env!("CARGO_PKG_VERSION");
const LOG_FILE_NAME: &str = "simdesk.log";

#[tokio::main]
async fn main() -> Result<()> {
    let cli = parse_cli_flags()?;
    let config = match &cli.config_path {
        Some(path) => simdesk_config::load_from_path(path)?,
        None => simdesk_config::load_from_env()?,
    };

    let address = config.server_address();
    let runtime = config.worker_runtime();
    let notice_view = config.notice_view();

    let data_root = resolve_log_root(runtime.data_root.as_deref())?;
    init_file_logging(&data_root)?;
    info!(version = APP_VERSION, url = %address.base_url(), "simdesk starting");

    let mut supervisor = WorkerSupervisor::new(supervisor_settings(&address, &runtime));
    if let Err(startup_error) = supervisor.start(APP_VERSION).await {
        error!(error = %startup_error, "worker startup failed");
        supervisor.terminate_worker().await;
        return Err(startup_error.into());
    }

    let client = WorkerClient::new(supervisor.listen_url());
    let mut reconciler = JobReconciler::with_limits(
        Arc::new(client.clone()),
        notice_view.status_line_max_chars,
        DEFAULT_NOTICE_BUFFER_CAPACITY,
    );
    let notice_log = tokio::spawn(log_notices(reconciler.subscribe_notices()));

    let feed = Box::new(client.job_events());
    tokio::select! {
        () = reconciler.run(feed) => {
            warn!("job event loop ended");
        }
        signal = tokio::signal::ctrl_c() => {
            match signal {
                Ok(()) => info!("shutdown requested"),
                Err(signal_error) => {
                    warn!(error = %signal_error, "ctrl-c handler failed, shutting down");
                }
            }
        }
    }

    notice_log.abort();
    supervisor.terminate_worker().await;
    info!("simdesk stopped");
    Ok(())
}

/// Mirrors job notices into the log so transitions stay traceable even when
/// no presentation layer is attached.
async fn log_notices(mut notices: broadcast::Receiver<NoticeEnvelope>) {
    loop {
        match notices.recv().await {
            Ok(envelope) => info!(
                sequence = envelope.sequence,
                job_id = %envelope.notice.job_id,
                kind = ?envelope.notice.kind,
                title = %envelope.notice.title,
                "job notice"
            ),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "notice log fell behind");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn supervisor_settings(
    address: &ServerAddress,
    runtime: &WorkerRuntimeConfig,
) -> SupervisorSettings {
    SupervisorSettings {
        launcher_path: runtime.launcher_path.clone(),
        resources_dir: runtime.resources_dir.clone(),
        data_root: runtime.data_root.clone(),
        env_name: runtime.env_name.clone(),
        worker_cli: runtime.worker_cli.clone(),
        package_name: runtime.package_name.clone(),
        package_git_url: runtime.package_git_url.clone(),
        manifest_url_template: runtime.manifest_url_template.clone(),
        listen_host: address.host.clone(),
        listen_port: address.port,
        liveness_poll_interval: runtime.liveness_poll,
        liveness_timeout: runtime.liveness_timeout,
        kill_timeout: runtime.kill_timeout,
    }
}

fn resolve_log_root(data_root_override: Option<&Path>) -> Result<PathBuf> {
    match data_root_override {
        Some(root) => Ok(root.to_path_buf()),
        None => Ok(resolve_data_root(Platform::current())?),
    }
}

fn init_file_logging(data_root: &Path) -> Result<(), ConfigError> {
    std::fs::create_dir_all(data_root).map_err(|err| {
        ConfigError::Message(format!(
            "failed to create simdesk data directory '{}': {err}",
            data_root.display()
        ))
    })?;

    let log_path = log_file_path(data_root);
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .map_err(|err| {
            ConfigError::Message(format!(
                "failed to open simdesk log file '{}': {err}",
                log_path.display()
            ))
        })?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with_ansi(false)
        .with_writer(std::sync::Mutex::new(log_file))
        .init();

    Ok(())
}

fn log_file_path(data_root: &Path) -> PathBuf {
    data_root.join(LOG_FILE_NAME)
}

#[derive(Debug, Default, PartialEq)]
struct CliFlags {
    config_path: Option<PathBuf>,
}

fn parse_cli_flags() -> Result<CliFlags, ConfigError> {
    let mut flags = CliFlags::default();
    let mut args = std::env::args().skip(1);

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => {
                let value = args.next().ok_or_else(|| {
                    ConfigError::Message(
                        "Missing value after --config. Use --config <path-to-config.toml>."
                            .to_owned(),
                    )
                })?;
                flags.config_path = Some(read_config_flag_value(&value)?);
            }
            "--help" | "-h" => {
                print_cli_help();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("simdesk {APP_VERSION}");
                std::process::exit(0);
            }
            value if value.starts_with("--") => {
                return Err(ConfigError::Message(format!(
                    "Unknown flag '{value}'. Run with --help for valid flags."
                )));
            }
            unknown => {
                return Err(ConfigError::Message(format!(
                    "Unexpected argument '{unknown}'. Run with --help for valid flags."
                )));
            }
        }
    }

    Ok(flags)
}

fn read_config_flag_value(value: &str) -> Result<PathBuf, ConfigError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ConfigError::Message(
            "Flag '--config' requires a non-empty path.".to_owned(),
        ));
    }
    Ok(PathBuf::from(trimmed))
}

fn print_cli_help() {
    println!("Usage: simdesk [--config <path>]");
    println!();
    println!("  --config <path>   Load configuration from <path> instead of ${ENV_SIMDESK_CONFIG}");
    println!("  --help            Show this help message");
    println!("  --version         Print the application version");
}
