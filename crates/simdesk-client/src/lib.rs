//! HTTP transport for the worker server: the REST client consumed by the
//! supervisor and reconciler, and the reconnecting job event subscription.

pub mod client;
pub mod events;

pub use client::WorkerClient;
pub use events::HttpJobEventStream;
