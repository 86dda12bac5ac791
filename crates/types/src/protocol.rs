//! JSON message envelope exchanged between coordinator and workers.
//!
//! Every frame is `{action, id?, data?}`. [`Envelope`] is the untyped view
//! used for reply correlation; [`ClientBound`] and [`ServerBound`] are the
//! typed views for each direction.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::job::{JobId, JobOptions, SearchMode};

pub const DEFAULT_PORT: u16 = 9002;
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(5000);
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_millis(5000);
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(30_000);

pub const ACTION_AKN: &str = "akn";
pub const ACTION_LAST_FOUND: &str = "last_found";
pub const ACTION_JOB_STATUS: &str = "job_status";

/// Untyped message. Unknown actions still parse, so higher layers can
/// correlate replies the registry does not classify.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
}

impl Envelope {
    pub fn parse(frame: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(frame)
    }

    pub fn is_action(&self, action: &str) -> bool {
        self.action == action
    }

    /// `{action: "akn", id}` echoing exactly `id`.
    pub fn is_akn_for(&self, id: &str) -> bool {
        self.is_action(ACTION_AKN) && self.id.as_deref() == Some(id)
    }
}

/// Coordinator → worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ClientBound {
    /// Raw rel file contents.
    Upload {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        data: String,
    },
    JobStart {
        id: JobId,
        data: JobOptions,
    },
    JobStop {
        id: String,
    },
    GetLastFound,
    GetCurrentJob,
}

impl ClientBound {
    /// Correlation id carried by the message, if any.
    pub fn id(&self) -> Option<&str> {
        match self {
            ClientBound::Upload { id, .. } => id.as_deref(),
            ClientBound::JobStart { id, .. } | ClientBound::JobStop { id } => Some(id),
            ClientBound::GetLastFound | ClientBound::GetCurrentJob => None,
        }
    }
}

/// Worker → coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ServerBound {
    Akn {
        id: String,
    },
    /// `id` is the job the discovery belongs to.
    Found {
        id: JobId,
        data: Value,
    },
    Progress {
        data: ProgressReport,
    },
    SetNick {
        data: String,
    },
    JobFinished {
        id: JobId,
    },
    LastFound {
        #[serde(default)]
        data: Value,
    },
    JobStatus {
        #[serde(default)]
        data: Value,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressReport {
    pub progress: ProgressCounters,
    pub job_id: JobId,
    /// Workers that know their job's mode send it; older ones omit it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<SearchMode>,
}

impl ProgressReport {
    /// The declared mode, or the `maps > 1` inference when none was sent.
    pub fn resolved_mode(&self) -> SearchMode {
        self.mode
            .unwrap_or_else(|| SearchMode::infer_from_maps(self.progress.maps))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressCounters {
    pub maps: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distance: Option<f64>,
}
