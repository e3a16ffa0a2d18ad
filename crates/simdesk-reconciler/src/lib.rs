//! Client-side view of worker jobs: an owned registry fed by lifecycle
//! events, plus the notice bus announcing transitions to the presentation
//! layer.

pub mod notice;
pub mod reconciler;
pub mod registry;

pub use notice::{
    DEFAULT_NOTICE_BUFFER_CAPACITY, DismissPolicy, Notice, NoticeAction, NoticeBus,
    NoticeEnvelope, NoticeKind,
};
pub use reconciler::{JobReconciler, MAP_RESULT_SCRIPTS};
pub use registry::{DEFAULT_STATUS_LINE_MAX_CHARS, JobEntry, JobRegistry, MergeOutcome};
