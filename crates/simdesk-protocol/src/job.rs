use serde::{Deserialize, Serialize};

use crate::ids::JobId;

/// Lifecycle state of one job, encoded on the wire as the server's
/// integer state code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum JobState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl JobState {
    /// Monotonic tier used by the merge guard: Pending < Running < terminal.
    /// Terminal states share a tier; once reached, the state never changes.
    pub fn rank(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Running => 1,
            Self::Succeeded | Self::Failed | Self::Canceled => 2,
        }
    }

    pub fn is_terminal(self) -> bool {
        self.rank() == 2
    }
}

impl TryFrom<u8> for JobState {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Pending),
            1 => Ok(Self::Running),
            2 => Ok(Self::Succeeded),
            3 => Ok(Self::Failed),
            4 => Ok(Self::Canceled),
            other => Err(format!("unknown job state code: {other}")),
        }
    }
}

impl From<JobState> for u8 {
    fn from(value: JobState) -> Self {
        match value {
            JobState::Pending => 0,
            JobState::Running => 1,
            JobState::Succeeded => 2,
            JobState::Failed => 3,
            JobState::Canceled => 4,
        }
    }
}

/// Full job record as returned by the server's job-list endpoint. Wire
/// field names are the server's camelCase ones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub state: JobState,
    #[serde(default, rename = "scriptName")]
    pub script: Option<String>,
    #[serde(default, rename = "scenarioName")]
    pub scenario: Option<String>,
    #[serde(default, rename = "createdTime")]
    pub created_time: Option<String>,
    #[serde(default, rename = "startTime")]
    pub start_time: Option<String>,
    #[serde(default, rename = "endTime")]
    pub end_time: Option<String>,
    #[serde(default, rename = "errorMessage")]
    pub error_message: Option<String>,
    #[serde(default)]
    pub output: Option<serde_json::Value>,
}

impl Job {
    pub fn new(id: impl Into<JobId>, state: JobState) -> Self {
        Self {
            id: id.into(),
            state,
            script: None,
            scenario: None,
            created_time: None,
            start_time: None,
            end_time: None,
            error_message: None,
            output: None,
        }
    }
}

/// Partial job record carried by lifecycle events. Every field except the
/// id is optional; absent fields must never erase values already merged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobUpdate {
    pub id: JobId,
    #[serde(default)]
    pub state: Option<JobState>,
    #[serde(default, rename = "scriptName")]
    pub script: Option<String>,
    #[serde(default, rename = "scenarioName")]
    pub scenario: Option<String>,
    #[serde(default, rename = "createdTime")]
    pub created_time: Option<String>,
    #[serde(default, rename = "startTime")]
    pub start_time: Option<String>,
    #[serde(default, rename = "endTime")]
    pub end_time: Option<String>,
    #[serde(default, rename = "errorMessage")]
    pub error_message: Option<String>,
    #[serde(default)]
    pub output: Option<serde_json::Value>,
}

impl JobUpdate {
    pub fn new(id: impl Into<JobId>) -> Self {
        Self {
            id: id.into(),
            state: None,
            script: None,
            scenario: None,
            created_time: None,
            start_time: None,
            end_time: None,
            error_message: None,
            output: None,
        }
    }

    pub fn with_state(mut self, state: JobState) -> Self {
        self.state = Some(state);
        self
    }
}
