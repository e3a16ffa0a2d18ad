use std::sync::Arc;

use simdesk_protocol::error::ProtocolResult;
use simdesk_protocol::event::{JobEvent, JobMessage};
use simdesk_protocol::ids::JobId;
use simdesk_protocol::job::{Job, JobState, JobUpdate};
use simdesk_protocol::source::{JobEventFeed, JobFeedItem, WorkerJobsApi};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::notice::{
    DEFAULT_NOTICE_BUFFER_CAPACITY, Notice, NoticeAction, NoticeBus, NoticeEnvelope, NoticeKind,
};
use crate::registry::{DEFAULT_STATUS_LINE_MAX_CHARS, JobRegistry};

/// Scripts whose results land in the map-based result viewers; their
/// completion notices offer a View Results follow-up.
pub const MAP_RESULT_SCRIPTS: [&str; 4] =
    ["demand", "emissions", "photovoltaic", "thermal-network"];

/// Applies the worker server's job lifecycle events to the owned registry
/// and publishes at most one notice per lifecycle transition per job.
pub struct JobReconciler {
    registry: JobRegistry,
    notices: NoticeBus,
    jobs_api: Arc<dyn WorkerJobsApi>,
}

impl JobReconciler {
    pub fn new(jobs_api: Arc<dyn WorkerJobsApi>) -> Self {
        Self::with_limits(
            jobs_api,
            DEFAULT_STATUS_LINE_MAX_CHARS,
            DEFAULT_NOTICE_BUFFER_CAPACITY,
        )
    }

    pub fn with_limits(
        jobs_api: Arc<dyn WorkerJobsApi>,
        status_line_max_chars: usize,
        notice_buffer_capacity: usize,
    ) -> Self {
        Self {
            registry: JobRegistry::with_status_line_limit(status_line_max_chars),
            notices: NoticeBus::new(notice_buffer_capacity),
            jobs_api,
        }
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    pub fn subscribe_notices(&self) -> broadcast::Receiver<NoticeEnvelope> {
        self.notices.subscribe()
    }

    pub fn select_job(&mut self, id: Option<JobId>) -> bool {
        self.registry.select(id)
    }

    pub fn dismiss_job(&mut self, id: &JobId) -> bool {
        self.registry.dismiss(id)
    }

    pub fn mark_all_read(&mut self) {
        self.registry.mark_all_read();
    }

    /// Asks the server to cancel the job. The registry is not touched here;
    /// the confirmation arrives as a `worker-canceled` event.
    pub async fn cancel_job(&self, job_id: &JobId) -> ProtocolResult<()> {
        self.jobs_api.cancel_job(job_id).await
    }

    /// Historical output text for the job, from the server's stream store.
    pub async fn job_output(&self, job_id: &JobId) -> ProtocolResult<String> {
        self.jobs_api.read_job_stream(job_id).await
    }

    /// Replaces the registry with the server's authoritative job list.
    pub async fn resync(&mut self) -> ProtocolResult<()> {
        let jobs = self.jobs_api.list_jobs().await?;
        info!(count = jobs.len(), "resynchronized job list");
        self.registry.resync(jobs);
        Ok(())
    }

    /// Consumes the event feed until it closes or fails. `Connected` items
    /// trigger a full resync, covering both the initial subscription and
    /// reconnects after a dropped stream.
    pub async fn run(&mut self, mut feed: JobEventFeed) {
        loop {
            match feed.next().await {
                Ok(Some(JobFeedItem::Connected)) => {
                    info!("job event channel connected");
                    if let Err(error) = self.resync().await {
                        warn!(error = %error, "job list resync failed");
                    }
                }
                Ok(Some(JobFeedItem::Event(event))) => self.handle(event),
                Ok(None) => {
                    info!("job event feed closed");
                    break;
                }
                Err(error) => {
                    warn!(error = %error, "job event feed failed");
                    break;
                }
            }
        }
    }

    /// Single entry point for every lifecycle event.
    pub fn handle(&mut self, event: JobEvent) {
        match event {
            JobEvent::Created(update) => self.handle_created(update),
            JobEvent::Started(update) => self.handle_started(update),
            JobEvent::Succeeded(update) => self.handle_succeeded(update),
            JobEvent::Canceled(update) => self.handle_canceled(update),
            JobEvent::Errored(update) => self.handle_errored(update),
            JobEvent::Message(message) => self.handle_message(message),
        }
    }

    fn handle_created(&mut self, update: JobUpdate) {
        // The job enters the registry once an event carries a state.
        debug!(job_id = %update.id, "job created");
        let title = format!("{} queued", describe_update(&update));
        self.notices
            .publish(Notice::new(NoticeKind::JobCreated, update.id, title));
    }

    fn handle_started(&mut self, update: JobUpdate) {
        let update = update.with_state(JobState::Running);
        let id = update.id.clone();
        let outcome = self.registry.upsert(update);
        if !outcome.reached(JobState::Running) {
            debug!(job_id = %id, "started event absorbed without a transition");
            return;
        }

        info!(job_id = %id, "job running");
        let title = format!("{} started", self.describe_entry(&id));
        self.notices
            .publish(Notice::new(NoticeKind::JobStarted, id, title));
    }

    fn handle_succeeded(&mut self, update: JobUpdate) {
        let update = update.with_state(JobState::Succeeded);
        let id = update.id.clone();
        let outcome = self.registry.upsert(update);
        if !outcome.reached(JobState::Succeeded) {
            debug!(job_id = %id, "success event absorbed without a transition");
            return;
        }

        info!(job_id = %id, "job succeeded");
        if let Some(entry) = self.registry.get(&id) {
            self.notices.publish(completed_notice(&entry.job));
        }
    }

    fn handle_canceled(&mut self, update: JobUpdate) {
        let update = update.with_state(JobState::Canceled);
        let id = update.id.clone();
        let outcome = self.registry.upsert(update);
        // The job leaves the visible set regardless of the merge outcome.
        self.registry.dismiss(&id);
        if !outcome.reached(JobState::Canceled) {
            return;
        }

        info!(job_id = %id, "job canceled");
        let title = format!("{} canceled", self.describe_entry(&id));
        self.notices
            .publish(Notice::new(NoticeKind::JobCanceled, id, title));
    }

    fn handle_errored(&mut self, update: JobUpdate) {
        let update = update.with_state(JobState::Failed);
        let id = update.id.clone();
        let outcome = self.registry.upsert(update);
        if !outcome.reached(JobState::Failed) {
            debug!(job_id = %id, "error event absorbed without a transition");
            return;
        }

        let body = self
            .registry
            .get(&id)
            .and_then(|entry| entry.job.error_message.clone())
            .unwrap_or_default();
        warn!(job_id = %id, error = %body, "job failed");

        let title = format!("{} failed", self.describe_entry(&id));
        self.notices.publish(
            Notice::new(NoticeKind::JobFailed, id, title)
                .with_body(body)
                .with_action(NoticeAction::ViewLogs)
                .sticky(),
        );
    }

    fn handle_message(&mut self, message: JobMessage) {
        if !self.registry.apply_message(&message.job_id, &message.message) {
            debug!(job_id = %message.job_id, "stream message for untracked job dropped");
        }
    }

    fn describe_entry(&self, id: &JobId) -> String {
        match self.registry.get(id) {
            Some(entry) => describe(
                id,
                entry.job.script.as_deref(),
                entry.job.scenario.as_deref(),
            ),
            None => format!("job {id}"),
        }
    }
}

fn describe(id: &JobId, script: Option<&str>, scenario: Option<&str>) -> String {
    match (script, scenario) {
        (Some(script), Some(scenario)) => format!("{script} on {scenario}"),
        (Some(script), None) => script.to_owned(),
        _ => format!("job {id}"),
    }
}

fn describe_update(update: &JobUpdate) -> String {
    describe(&update.id, update.script.as_deref(), update.scenario.as_deref())
}

fn produces_map_results(script: &str) -> bool {
    MAP_RESULT_SCRIPTS.contains(&script)
}

fn completed_notice(job: &Job) -> Notice {
    let title = format!(
        "{} completed",
        describe(&job.id, job.script.as_deref(), job.scenario.as_deref())
    );
    let mut notice = Notice::new(NoticeKind::JobSucceeded, job.id.clone(), title)
        .with_action(NoticeAction::ViewLogs);

    if job.script.as_deref().is_some_and(produces_map_results) {
        notice = notice.with_action(NoticeAction::ViewResults);
    }
    let has_plot = job
        .output
        .as_ref()
        .and_then(|value| value.as_str())
        .is_some_and(|text| !text.trim().is_empty());
    if has_plot {
        notice = notice.with_action(NoticeAction::ViewPlot);
    }

    // Completions worth opening stay on screen until the user acts.
    if notice.offers(NoticeAction::ViewResults) || notice.offers(NoticeAction::ViewPlot) {
        notice = notice.sticky();
    }
    notice
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use serde_json::json;
    use simdesk_protocol::error::ProtocolError;
    use simdesk_protocol::source::JobEventSource;

    use super::*;
    use crate::notice::DismissPolicy;

    struct FakeJobsApi {
        jobs: Mutex<Vec<Job>>,
        canceled: Mutex<Vec<JobId>>,
    }

    impl FakeJobsApi {
        fn new() -> Arc<Self> {
            Self::with_jobs(Vec::new())
        }

        fn with_jobs(jobs: Vec<Job>) -> Arc<Self> {
            Arc::new(Self {
                jobs: Mutex::new(jobs),
                canceled: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl WorkerJobsApi for FakeJobsApi {
        async fn list_jobs(&self) -> ProtocolResult<Vec<Job>> {
            Ok(self.jobs.lock().expect("jobs lock").clone())
        }

        async fn cancel_job(&self, job_id: &JobId) -> ProtocolResult<()> {
            self.canceled
                .lock()
                .expect("canceled lock")
                .push(job_id.clone());
            Ok(())
        }

        async fn read_job_stream(&self, _job_id: &JobId) -> ProtocolResult<String> {
            Ok(String::new())
        }
    }

    struct ScriptedFeed {
        items: VecDeque<ProtocolResult<Option<JobFeedItem>>>,
    }

    impl ScriptedFeed {
        fn boxed(items: Vec<JobFeedItem>) -> JobEventFeed {
            Box::new(Self {
                items: items.into_iter().map(|item| Ok(Some(item))).collect(),
            })
        }

        fn failing(items: Vec<JobFeedItem>, error: ProtocolError) -> JobEventFeed {
            let mut scripted: VecDeque<_> =
                items.into_iter().map(|item| Ok(Some(item))).collect();
            scripted.push_back(Err(error));
            Box::new(Self { items: scripted })
        }
    }

    #[async_trait]
    impl JobEventSource for ScriptedFeed {
        async fn next(&mut self) -> ProtocolResult<Option<JobFeedItem>> {
            self.items.pop_front().unwrap_or(Ok(None))
        }
    }

    fn wire(name: &str, data: serde_json::Value) -> JobEvent {
        JobEvent::from_wire(name, data)
            .expect("parse frame")
            .expect("known event")
    }

    fn reconciler() -> JobReconciler {
        JobReconciler::new(FakeJobsApi::new())
    }

    fn drain_kinds(notices: &mut broadcast::Receiver<NoticeEnvelope>) -> Vec<NoticeKind> {
        let mut kinds = Vec::new();
        while let Ok(envelope) = notices.try_recv() {
            kinds.push(envelope.notice.kind);
        }
        kinds
    }

    #[test]
    fn created_events_notify_without_touching_the_registry() {
        let mut reconciler = reconciler();
        let mut notices = reconciler.subscribe_notices();

        reconciler.handle(wire(
            "job-created",
            json!({"id": "a", "scriptName": "demand", "scenarioName": "baseline"}),
        ));

        assert!(reconciler.registry().is_empty());
        let envelope = notices.try_recv().expect("created notice");
        assert_eq!(envelope.notice.kind, NoticeKind::JobCreated);
        assert_eq!(envelope.notice.title, "demand on baseline queued");
        assert_eq!(envelope.notice.dismiss, DismissPolicy::Auto);
    }

    #[test]
    fn lifecycle_events_reconcile_into_a_succeeded_job_with_plot_affordance() {
        let mut reconciler = reconciler();
        let mut notices = reconciler.subscribe_notices();

        reconciler.handle(wire("job-created", json!({"id": "a"})));
        reconciler.handle(wire("worker-started", json!({"id": "a", "state": 1})));
        reconciler.handle(wire(
            "worker-message",
            json!({"jobid": "a", "message": "line1\nline2"}),
        ));
        reconciler.handle(wire(
            "worker-success",
            json!({"id": "a", "state": 2, "output": "<html>"}),
        ));

        let id = JobId::from("a");
        let entry = reconciler.registry().get(&id).expect("entry");
        assert_eq!(entry.job.state, JobState::Succeeded);
        assert_eq!(reconciler.registry().status_line(&id), Some("line2"));

        let created = notices.try_recv().expect("created notice");
        assert_eq!(created.notice.kind, NoticeKind::JobCreated);
        let started = notices.try_recv().expect("started notice");
        assert_eq!(started.notice.kind, NoticeKind::JobStarted);
        let completed = notices.try_recv().expect("completed notice");
        assert_eq!(completed.notice.kind, NoticeKind::JobSucceeded);
        assert!(completed.notice.offers(NoticeAction::ViewLogs));
        assert!(completed.notice.offers(NoticeAction::ViewPlot));
        assert!(!completed.notice.offers(NoticeAction::ViewResults));
        assert_eq!(completed.notice.dismiss, DismissPolicy::Sticky);
        assert!(notices.try_recv().is_err());
    }

    #[test]
    fn whitespace_stream_messages_leave_the_status_line_alone() {
        let mut reconciler = reconciler();
        reconciler.handle(wire("worker-started", json!({"id": "a", "state": 1})));
        reconciler.handle(wire(
            "worker-message",
            json!({"jobid": "a", "message": "running step 3"}),
        ));

        // An empty message never parses into an event in the first place.
        let parsed = JobEvent::from_wire("worker-message", json!({"jobid": "a", "message": ""}))
            .expect("parse frame");
        assert_eq!(parsed, None);

        // Even a hand-built whitespace message is a no-op.
        reconciler.handle(JobEvent::Message(JobMessage {
            job_id: JobId::from("a"),
            message: "   \n ".to_owned(),
        }));

        assert_eq!(
            reconciler.registry().status_line(&JobId::from("a")),
            Some("running step 3")
        );
    }

    #[test]
    fn duplicate_success_events_emit_one_notice() {
        let mut reconciler = reconciler();
        let mut notices = reconciler.subscribe_notices();

        reconciler.handle(wire("worker-started", json!({"id": "a", "state": 1})));
        reconciler.handle(wire("worker-success", json!({"id": "a", "state": 2})));
        reconciler.handle(wire("worker-success", json!({"id": "a", "state": 2})));

        assert_eq!(
            drain_kinds(&mut notices),
            vec![NoticeKind::JobStarted, NoticeKind::JobSucceeded]
        );
    }

    #[test]
    fn a_late_started_event_neither_reverts_state_nor_notifies() {
        let mut reconciler = reconciler();
        let mut notices = reconciler.subscribe_notices();

        reconciler.handle(wire("worker-success", json!({"id": "a", "state": 2})));
        reconciler.handle(wire("worker-started", json!({"id": "a", "state": 1})));

        let entry = reconciler.registry().get(&JobId::from("a")).expect("entry");
        assert_eq!(entry.job.state, JobState::Succeeded);
        assert_eq!(drain_kinds(&mut notices), vec![NoticeKind::JobSucceeded]);
    }

    #[test]
    fn cancellation_dismisses_the_job_and_notifies_once() {
        let mut reconciler = reconciler();
        let mut notices = reconciler.subscribe_notices();

        reconciler.handle(wire("worker-started", json!({"id": "a", "state": 1})));
        reconciler.handle(wire(
            "worker-message",
            json!({"jobid": "a", "message": "halfway"}),
        ));
        reconciler.handle(wire("worker-canceled", json!({"id": "a", "state": 4})));
        reconciler.handle(wire("worker-canceled", json!({"id": "a", "state": 4})));

        let id = JobId::from("a");
        assert!(reconciler.registry().visible_jobs().is_empty());
        assert_eq!(reconciler.registry().active_count(), 0);
        assert_eq!(reconciler.registry().status_line(&id), None);
        assert_eq!(
            drain_kinds(&mut notices),
            vec![NoticeKind::JobStarted, NoticeKind::JobCanceled]
        );
    }

    #[test]
    fn failures_produce_a_sticky_view_logs_notice() {
        let mut reconciler = reconciler();
        let mut notices = reconciler.subscribe_notices();

        reconciler.handle(wire("worker-started", json!({"id": "a", "state": 1})));
        reconciler.handle(wire(
            "worker-error",
            json!({"id": "a", "state": 3, "errorMessage": "solver diverged"}),
        ));

        let _ = notices.try_recv().expect("started notice");
        let failed = notices.try_recv().expect("failed notice");
        assert_eq!(failed.notice.kind, NoticeKind::JobFailed);
        assert_eq!(failed.notice.body, "solver diverged");
        assert!(failed.notice.offers(NoticeAction::ViewLogs));
        assert_eq!(failed.notice.dismiss, DismissPolicy::Sticky);
    }

    #[test]
    fn recognized_map_result_scripts_offer_view_results() {
        let mut reconciler = reconciler();
        let mut notices = reconciler.subscribe_notices();

        reconciler.handle(wire(
            "worker-started",
            json!({"id": "a", "state": 1, "scriptName": "demand"}),
        ));
        reconciler.handle(wire("worker-success", json!({"id": "a", "state": 2})));

        let _ = notices.try_recv().expect("started notice");
        let completed = notices.try_recv().expect("completed notice");
        assert!(completed.notice.offers(NoticeAction::ViewResults));
        assert!(!completed.notice.offers(NoticeAction::ViewPlot));
        assert_eq!(completed.notice.dismiss, DismissPolicy::Sticky);
    }

    #[test]
    fn plain_completions_auto_dismiss_with_logs_only() {
        let mut reconciler = reconciler();
        let mut notices = reconciler.subscribe_notices();

        reconciler.handle(wire(
            "worker-started",
            json!({"id": "a", "state": 1, "scriptName": "archetypes-mapper"}),
        ));
        reconciler.handle(wire("worker-success", json!({"id": "a", "state": 2})));

        let _ = notices.try_recv().expect("started notice");
        let completed = notices.try_recv().expect("completed notice");
        assert_eq!(completed.notice.actions, vec![NoticeAction::ViewLogs]);
        assert_eq!(completed.notice.dismiss, DismissPolicy::Auto);
    }

    #[tokio::test]
    async fn run_resynchronizes_on_connect_and_applies_events() {
        let api = FakeJobsApi::with_jobs(vec![
            Job::new("a", JobState::Running),
            Job::new("b", JobState::Pending),
        ]);
        let mut reconciler = JobReconciler::new(api);

        let feed = ScriptedFeed::boxed(vec![
            JobFeedItem::Connected,
            JobFeedItem::Event(wire("worker-success", json!({"id": "a", "state": 2}))),
        ]);
        reconciler.run(feed).await;

        assert_eq!(reconciler.registry().len(), 2);
        let entry = reconciler.registry().get(&JobId::from("a")).expect("entry");
        assert_eq!(entry.job.state, JobState::Succeeded);
        assert_eq!(reconciler.registry().active_count(), 1);
    }

    #[tokio::test]
    async fn run_stops_after_a_feed_failure_keeping_applied_events() {
        let mut reconciler = reconciler();

        let feed = ScriptedFeed::failing(
            vec![JobFeedItem::Event(wire(
                "worker-started",
                json!({"id": "a", "state": 1}),
            ))],
            ProtocolError::Transport("stream reset".to_owned()),
        );
        reconciler.run(feed).await;

        let entry = reconciler.registry().get(&JobId::from("a")).expect("entry");
        assert_eq!(entry.job.state, JobState::Running);
    }

    #[tokio::test]
    async fn cancel_requests_pass_through_to_the_jobs_api() {
        let api = FakeJobsApi::new();
        let reconciler = JobReconciler::new(api.clone());

        reconciler
            .cancel_job(&JobId::from("a"))
            .await
            .expect("cancel");

        assert_eq!(
            *api.canceled.lock().expect("canceled lock"),
            vec![JobId::from("a")]
        );
    }
}
