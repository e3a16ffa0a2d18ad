use std::collections::HashMap;

use simdesk_protocol::ids::JobId;
use simdesk_protocol::job::{Job, JobState, JobUpdate};

pub const DEFAULT_STATUS_LINE_MAX_CHARS: usize = 120;

/// One job as tracked client-side: the merged server record plus
/// presentation state that never leaves this process.
#[derive(Debug, Clone, PartialEq)]
pub struct JobEntry {
    pub job: Job,
    pub dismissed: bool,
    pub read: bool,
    /// Streamed output accumulated from worker messages, newest last.
    pub output_log: String,
    /// Last non-empty streamed line, clamped for display.
    pub status_line: Option<String>,
}

impl JobEntry {
    fn fresh(job: Job) -> Self {
        Self {
            job,
            dismissed: false,
            read: false,
            output_log: String::new(),
            status_line: None,
        }
    }
}

/// How an upsert changed a job's lifecycle state. Notifications key off
/// this, so a duplicate delivery can never announce a transition twice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// First sighting of this job id.
    Inserted(JobState),
    /// The state moved forward along the lifecycle.
    Advanced { from: JobState, to: JobState },
    /// Fields merged; the state stayed where it was.
    Unchanged,
    /// The update could not take effect: it carried a state behind the
    /// current one, or it had no state for a job not yet tracked.
    Ignored,
}

impl MergeOutcome {
    /// Whether this upsert is the one that brought the job into `state`.
    pub fn reached(self, state: JobState) -> bool {
        match self {
            Self::Inserted(new) => new == state,
            Self::Advanced { to, .. } => to == state,
            Self::Unchanged | Self::Ignored => false,
        }
    }
}

/// In-memory view of all known jobs, mutated only through its defined
/// operations so the monotonic state guarantee cannot be bypassed.
#[derive(Debug)]
pub struct JobRegistry {
    jobs: HashMap<JobId, JobEntry>,
    selected: Option<JobId>,
    status_line_max_chars: usize,
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::with_status_line_limit(DEFAULT_STATUS_LINE_MAX_CHARS)
    }

    pub fn with_status_line_limit(status_line_max_chars: usize) -> Self {
        Self {
            jobs: HashMap::new(),
            selected: None,
            status_line_max_chars,
        }
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn get(&self, id: &JobId) -> Option<&JobEntry> {
        self.jobs.get(id)
    }

    /// Merges a partial record into the registry, creating the entry when
    /// absent. Fields are last-write-wins; absent fields never erase merged
    /// values; the state may only move forward along
    /// `Pending -> Running -> terminal`, and the first terminal state wins.
    pub fn upsert(&mut self, update: JobUpdate) -> MergeOutcome {
        match self.jobs.get_mut(&update.id) {
            None => {
                // A job only enters the registry once it carries a state.
                let Some(state) = update.state else {
                    return MergeOutcome::Ignored;
                };
                let mut job = Job::new(update.id.clone(), state);
                apply_fields(&mut job, &update);
                self.jobs.insert(update.id, JobEntry::fresh(job));
                MergeOutcome::Inserted(state)
            }
            Some(entry) => {
                let current = entry.job.state;
                let outcome = match update.state {
                    Some(next) if next != current => {
                        if current.is_terminal() || next.rank() < current.rank() {
                            MergeOutcome::Ignored
                        } else {
                            entry.job.state = next;
                            // A finished job demands attention again.
                            if next.is_terminal() {
                                entry.read = false;
                            }
                            MergeOutcome::Advanced {
                                from: current,
                                to: next,
                            }
                        }
                    }
                    _ => MergeOutcome::Unchanged,
                };
                apply_fields(&mut entry.job, &update);
                outcome
            }
        }
    }

    /// Replaces the whole registry with the authoritative server snapshot.
    /// Client-side flags do not survive: the snapshot is the new truth.
    pub fn resync(&mut self, jobs: Vec<Job>) {
        self.jobs = jobs
            .into_iter()
            .map(|job| (job.id.clone(), JobEntry::fresh(job)))
            .collect();

        let selection_survives = self
            .selected
            .as_ref()
            .is_some_and(|id| self.jobs.contains_key(id));
        if !selection_survives {
            self.selected = None;
        }
    }

    /// Hides the job from the visible set without touching server state.
    /// Idempotent; unknown ids are a no-op.
    pub fn dismiss(&mut self, id: &JobId) -> bool {
        let Some(entry) = self.jobs.get_mut(id) else {
            return false;
        };
        entry.dismissed = true;
        entry.status_line = None;

        if self.selected.as_ref() == Some(id) {
            self.selected = None;
        }
        true
    }

    /// Changes which job is selected (at most one at a time). Selecting a
    /// job marks it read; `None` clears the selection.
    pub fn select(&mut self, id: Option<JobId>) -> bool {
        let Some(id) = id else {
            self.selected = None;
            return true;
        };
        let Some(entry) = self.jobs.get_mut(&id) else {
            return false;
        };
        if entry.dismissed {
            return false;
        }
        entry.read = true;
        self.selected = Some(id);
        true
    }

    pub fn selected(&self) -> Option<&JobId> {
        self.selected.as_ref()
    }

    pub fn selected_job(&self) -> Option<&JobEntry> {
        self.selected.as_ref().and_then(|id| self.jobs.get(id))
    }

    pub fn mark_read(&mut self, id: &JobId) -> bool {
        let Some(entry) = self.jobs.get_mut(id) else {
            return false;
        };
        entry.read = true;
        true
    }

    pub fn mark_all_read(&mut self) {
        for entry in self.jobs.values_mut() {
            entry.read = true;
        }
    }

    /// Entries the presentation layer may show, in stable id order.
    pub fn visible_jobs(&self) -> Vec<&JobEntry> {
        let mut entries: Vec<&JobEntry> = self
            .jobs
            .values()
            .filter(|entry| !entry.dismissed)
            .collect();
        entries.sort_by(|a, b| a.job.id.as_str().cmp(b.job.id.as_str()));
        entries
    }

    /// Visible jobs still pending or running.
    pub fn active_count(&self) -> usize {
        self.jobs
            .values()
            .filter(|entry| !entry.dismissed && !entry.job.state.is_terminal())
            .count()
    }

    /// Visible jobs not yet opened by the user.
    pub fn unread_count(&self) -> usize {
        self.jobs
            .values()
            .filter(|entry| !entry.dismissed && !entry.read)
            .count()
    }

    /// Appends streamed output to the job's log and refreshes its status
    /// line with the last non-empty line, clamped for display. Messages
    /// that are all whitespace, or for jobs not yet tracked, change nothing
    /// and report `false`.
    pub fn apply_message(&mut self, job_id: &JobId, message: &str) -> bool {
        let Some(line) = last_non_empty_line(message) else {
            return false;
        };
        let Some(entry) = self.jobs.get_mut(job_id) else {
            return false;
        };

        entry.output_log.push_str(message);
        if !message.ends_with('\n') {
            entry.output_log.push('\n');
        }
        entry.status_line = Some(clamp_line(line, self.status_line_max_chars));
        true
    }

    pub fn status_line(&self, id: &JobId) -> Option<&str> {
        self.jobs
            .get(id)
            .and_then(|entry| entry.status_line.as_deref())
    }
}

fn apply_fields(job: &mut Job, update: &JobUpdate) {
    if let Some(script) = &update.script {
        job.script = Some(script.clone());
    }
    if let Some(scenario) = &update.scenario {
        job.scenario = Some(scenario.clone());
    }
    if let Some(created_time) = &update.created_time {
        job.created_time = Some(created_time.clone());
    }
    if let Some(start_time) = &update.start_time {
        job.start_time = Some(start_time.clone());
    }
    if let Some(end_time) = &update.end_time {
        job.end_time = Some(end_time.clone());
    }
    if let Some(error_message) = &update.error_message {
        job.error_message = Some(error_message.clone());
    }
    if let Some(output) = &update.output {
        job.output = Some(output.clone());
    }
}

fn last_non_empty_line(message: &str) -> Option<&str> {
    message
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
}

fn clamp_line(line: &str, max_chars: usize) -> String {
    if line.chars().count() <= max_chars {
        return line.to_owned();
    }
    line.chars().take(max_chars).collect()
}
