//! Job bookkeeping on the coordinator.
//!
//! Provides:
//! - `JobManager`: owns the active job set and hands jobs to idle workers
//! - `JobStore`: locked, swap-on-write persistence of the job list
//! - `WorkerStatus`: per-connection availability used for assignment

pub mod manager;
pub mod store;
pub mod types;

pub use manager::JobManager;
pub use store::JobStore;
pub use types::WorkerStatus;
