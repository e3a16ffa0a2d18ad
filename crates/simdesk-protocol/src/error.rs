use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("worker api transport error: {0}")]
    Transport(String),
    #[error("worker api returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("worker api payload could not be decoded: {0}")]
    Decode(String),
    #[error("malformed event frame: {0}")]
    MalformedFrame(String),
}

pub type ProtocolResult<T> = Result<T, ProtocolError>;
