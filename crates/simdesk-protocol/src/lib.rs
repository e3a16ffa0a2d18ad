//! Shared job protocol for the simdesk client: the job data model, the
//! closed set of lifecycle events pushed by the worker server, and the
//! trait seams transport implementations plug into.

pub mod error;
pub mod event;
pub mod ids;
pub mod job;
pub mod source;
