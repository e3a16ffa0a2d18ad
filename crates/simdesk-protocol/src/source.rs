use async_trait::async_trait;

use crate::error::ProtocolResult;
use crate::event::JobEvent;
use crate::ids::JobId;
use crate::job::Job;

/// One item delivered by a job event subscription.
#[derive(Debug, Clone, PartialEq)]
pub enum JobFeedItem {
    /// The underlying channel (re)established a connection. Consumers use
    /// this to resynchronize from the authoritative job list.
    Connected,
    Event(JobEvent),
}

#[async_trait]
pub trait JobEventSource: Send {
    /// Next feed item, or `None` once the subscription is permanently closed.
    async fn next(&mut self) -> ProtocolResult<Option<JobFeedItem>>;
}

pub type JobEventFeed = Box<dyn JobEventSource>;

/// Job management surface of the worker server consumed by the reconciler.
#[async_trait]
pub trait WorkerJobsApi: Send + Sync {
    async fn list_jobs(&self) -> ProtocolResult<Vec<Job>>;
    async fn cancel_job(&self, job_id: &JobId) -> ProtocolResult<()>;
    async fn read_job_stream(&self, job_id: &JobId) -> ProtocolResult<String>;
}
