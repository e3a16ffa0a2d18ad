//! Lifecycle supervision for the local simulation worker: environment
//! install/update, process spawn with startup stderr capture, liveness
//! confirmation, and platform-aware teardown.

pub mod command;
pub mod environment;
pub mod error;
pub mod liveness;
pub mod phase;
pub mod platform;
pub mod process;
pub mod supervisor;

pub use command::{CommandRunner, TokioCommandRunner};
pub use environment::{
    EnvironmentHealth, EnvironmentManager, EnvironmentPlan, EnvironmentSettings,
    HttpManifestSource, LOCK_FILE_NAME, ManifestSource, version_tag,
};
pub use error::{SupervisorError, SupervisorResult};
pub use liveness::{
    DEFAULT_LIVENESS_POLL_INTERVAL, DEFAULT_LIVENESS_TIMEOUT, LivenessOutcome, LivenessProbe,
    wait_until_alive,
};
pub use phase::SupervisorPhase;
pub use platform::{PRODUCT_DIR_NAME, Platform, resolve_data_root};
pub use process::{
    ForcefulKillStrategy, GracefulKillStrategy, KillStrategy, ProcessHandle, WorkerExit,
    WorkerProcess, WorkerSpawnSpec, default_kill_strategy,
};
pub use supervisor::{DEFAULT_KILL_TIMEOUT, SupervisorSettings, WorkerSupervisor};
