use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SupervisorError {
    #[error("supervisor configuration error: {0}")]
    Configuration(String),
    #[error("worker environment error: {0}")]
    Environment(String),
    #[error("worker environment is not installed: {0}")]
    EnvironmentMissing(String),
    #[error("manifest download failed for {url}: {reason}")]
    Download { url: String, reason: String },
    #[error("worker process error: {0}")]
    Process(String),
    #[error("supervisor internal error: {0}")]
    Internal(String),
}

pub type SupervisorResult<T> = Result<T, SupervisorError>;
