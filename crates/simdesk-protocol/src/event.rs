use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, ProtocolResult};
use crate::ids::JobId;
use crate::job::JobUpdate;

pub const EVENT_JOB_CREATED: &str = "job-created";
pub const EVENT_WORKER_STARTED: &str = "worker-started";
pub const EVENT_WORKER_SUCCESS: &str = "worker-success";
pub const EVENT_WORKER_CANCELED: &str = "worker-canceled";
pub const EVENT_WORKER_ERROR: &str = "worker-error";
pub const EVENT_WORKER_MESSAGE: &str = "worker-message";

/// Streamed output fragment for a running job. Only well-formed payloads
/// (a string `message` with non-whitespace content) become values of this
/// type; anything else is dropped during parsing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobMessage {
    pub job_id: JobId,
    pub message: String,
}

/// Closed set of job lifecycle events pushed by the worker server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum JobEvent {
    Created(JobUpdate),
    Started(JobUpdate),
    Succeeded(JobUpdate),
    Canceled(JobUpdate),
    Errored(JobUpdate),
    Message(JobMessage),
}

impl JobEvent {
    /// Parses one named wire frame into a typed event.
    ///
    /// `Ok(None)` covers the two contractually silent cases: event names
    /// outside the closed set, and `worker-message` payloads with a
    /// missing, non-string, or all-whitespace `message`. Undecodable
    /// payloads for the five job-shaped events are an error.
    pub fn from_wire(name: &str, data: serde_json::Value) -> ProtocolResult<Option<Self>> {
        let event = match name {
            EVENT_JOB_CREATED => Self::Created(parse_job_update(name, data)?),
            EVENT_WORKER_STARTED => Self::Started(parse_job_update(name, data)?),
            EVENT_WORKER_SUCCESS => Self::Succeeded(parse_job_update(name, data)?),
            EVENT_WORKER_CANCELED => Self::Canceled(parse_job_update(name, data)?),
            EVENT_WORKER_ERROR => Self::Errored(parse_job_update(name, data)?),
            EVENT_WORKER_MESSAGE => match parse_job_message(&data) {
                Some(message) => Self::Message(message),
                None => return Ok(None),
            },
            _ => return Ok(None),
        };

        Ok(Some(event))
    }

    pub fn job_id(&self) -> &JobId {
        match self {
            Self::Created(update)
            | Self::Started(update)
            | Self::Succeeded(update)
            | Self::Canceled(update)
            | Self::Errored(update) => &update.id,
            Self::Message(message) => &message.job_id,
        }
    }
}

fn parse_job_update(name: &str, data: serde_json::Value) -> ProtocolResult<JobUpdate> {
    serde_json::from_value(data)
        .map_err(|error| ProtocolError::MalformedFrame(format!("{name}: {error}")))
}

fn parse_job_message(data: &serde_json::Value) -> Option<JobMessage> {
    let job_id = data.get("jobid").and_then(serde_json::Value::as_str)?;
    let message = data.get("message")?.as_str()?;
    if message.trim().is_empty() {
        return None;
    }

    Some(JobMessage {
        job_id: JobId::new(job_id),
        message: message.to_owned(),
    })
}
