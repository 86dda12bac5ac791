//! Shared wire and data types for the scan pool.
//!
//! Both the coordinator and the worker client depend on this crate so the
//! JSON envelope and the job model have exactly one definition.

pub mod error;
pub mod job;
pub mod protocol;

pub use error::InvalidRangeError;
pub use job::{
    ConnectionId, FoundInfo, Job, JobId, JobOptions, JobStatus, ProgressSample, ProgressWindow,
    SearchArea, SearchMode,
};
pub use protocol::{ClientBound, Envelope, ProgressCounters, ProgressReport, ServerBound};
