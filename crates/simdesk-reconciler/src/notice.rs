use std::sync::atomic::{AtomicU64, Ordering};

use simdesk_protocol::ids::JobId;
use tokio::sync::broadcast;

pub const DEFAULT_NOTICE_BUFFER_CAPACITY: usize = 128;

/// Which lifecycle moment a notice announces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeKind {
    JobCreated,
    JobStarted,
    JobSucceeded,
    JobFailed,
    JobCanceled,
}

/// Follow-up a consumer may offer alongside the notice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeAction {
    ViewLogs,
    ViewResults,
    ViewPlot,
}

/// Whether the notice may disappear on its own or must wait for the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DismissPolicy {
    #[default]
    Auto,
    Sticky,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Notice {
    pub job_id: JobId,
    pub kind: NoticeKind,
    pub title: String,
    pub body: String,
    pub actions: Vec<NoticeAction>,
    pub dismiss: DismissPolicy,
}

impl Notice {
    pub fn new(kind: NoticeKind, job_id: impl Into<JobId>, title: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            kind,
            title: title.into(),
            body: String::new(),
            actions: Vec::new(),
            dismiss: DismissPolicy::Auto,
        }
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_action(mut self, action: NoticeAction) -> Self {
        self.actions.push(action);
        self
    }

    pub fn sticky(mut self) -> Self {
        self.dismiss = DismissPolicy::Sticky;
        self
    }

    pub fn offers(&self, action: NoticeAction) -> bool {
        self.actions.contains(&action)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NoticeEnvelope {
    pub sequence: u64,
    pub notice: Notice,
}

/// Broadcast fan-out for notices with process-wide monotonic sequence
/// numbers. Publishing never blocks; slow subscribers observe
/// `RecvError::Lagged` when the bounded buffer overtakes them.
#[derive(Debug)]
pub struct NoticeBus {
    next_sequence: AtomicU64,
    sender: broadcast::Sender<NoticeEnvelope>,
}

impl Default for NoticeBus {
    fn default() -> Self {
        Self::new(DEFAULT_NOTICE_BUFFER_CAPACITY)
    }
}

impl NoticeBus {
    pub fn new(buffer_capacity: usize) -> Self {
        assert!(
            buffer_capacity > 0,
            "buffer_capacity must be greater than 0"
        );
        let (sender, _receiver) = broadcast::channel(buffer_capacity);
        Self {
            next_sequence: AtomicU64::new(0),
            sender,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NoticeEnvelope> {
        self.sender.subscribe()
    }

    pub fn publish(&self, notice: Notice) -> NoticeEnvelope {
        let envelope = NoticeEnvelope {
            sequence: self.next_sequence(),
            notice,
        };

        if self.sender.receiver_count() > 0 {
            let _ = self.sender.send(envelope.clone());
        }

        envelope
    }

    fn next_sequence(&self) -> u64 {
        let mut current = self.next_sequence.load(Ordering::Relaxed);
        loop {
            let next = current.checked_add(1).expect("notice sequence exhausted");
            match self.next_sequence.compare_exchange_weak(
                current,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return next,
                Err(observed) => current = observed,
            }
        }
    }
}
