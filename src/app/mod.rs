//! Import jobs and source syncs.
//!
//! The coordinator owns job state transitions; the scheduler drives polled
//! sources and hands fetched chapters back to the coordinator. Everything
//! external (chapter storage, audio generation, fetching) sits behind a trait.

pub mod coordinator;
pub mod dispatcher;
pub mod job_store;
pub mod model;
pub mod novel_store;
pub mod queue;
pub mod scheduler;
