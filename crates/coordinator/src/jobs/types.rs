//! Types for worker availability tracking.

use serde::Serialize;
use serde_json::Value;

/// Availability of one worker, rebuilt by `JobManager::refresh_worker_status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerStatus {
    pub is_working: bool,
    pub client_num: usize,
}

/// Whether a `job_status` payload means "no job running".
pub fn reports_idle(status: &Value) -> bool {
    match status {
        Value::Null | Value::Bool(false) => true,
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}
