use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use simdesk_client::WorkerClient;
use tracing::debug;

use crate::process::WorkerExit;

pub const DEFAULT_LIVENESS_POLL_INTERVAL: Duration = Duration::from_secs(3);
pub const DEFAULT_LIVENESS_TIMEOUT: Duration = Duration::from_secs(300);

/// Explicit result of waiting for the worker to come up, so a probe that
/// never succeeds is an observable outcome instead of a silent hang.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LivenessOutcome {
    Alive,
    TimedOut,
    WorkerExited(WorkerExit),
}

#[async_trait]
pub trait LivenessProbe: Send + Sync {
    async fn alive(&self) -> bool;
}

#[async_trait]
impl LivenessProbe for WorkerClient {
    async fn alive(&self) -> bool {
        WorkerClient::alive(self).await
    }
}

/// Polls `probe` on `poll_interval` until it reports alive, the overall
/// `timeout` elapses, or `worker_exit` resolves because the process died
/// first. Exit always wins a tie so a crashed worker is reported with its
/// captured stderr rather than as a bare timeout.
pub async fn wait_until_alive<F>(
    probe: &dyn LivenessProbe,
    worker_exit: F,
    poll_interval: Duration,
    timeout: Duration,
) -> LivenessOutcome
where
    F: Future<Output = WorkerExit>,
{
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);
    tokio::pin!(worker_exit);
    let mut ticks = tokio::time::interval(poll_interval);

    loop {
        tokio::select! {
            biased;
            exit = &mut worker_exit => {
                return LivenessOutcome::WorkerExited(exit);
            }
            _ = &mut deadline => {
                return LivenessOutcome::TimedOut;
            }
            _ = ticks.tick() => {
                if probe.alive().await {
                    return LivenessOutcome::Alive;
                }
                debug!("worker not answering liveness probe yet");
            }
        }
    }
}
