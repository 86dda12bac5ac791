use std::path::PathBuf;
use std::time::Duration;

use scan_pool_types::{ConnectionId, InvalidRangeError, JobId};
use thiserror::Error;

/// Errors raised by the coordinator core.
///
/// Timeouts and missing workers surface as `Ok(None)` / `false` from the
/// job-level operations; these variants are for the lower layers and for
/// input rejected before any I/O.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("no matching reply within {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    InvalidRange(#[from] InvalidRangeError),

    #[error("connection not found: {0}")]
    ConnectionNotFound(ConnectionId),

    #[error("no connection at client number {0}")]
    ClientNumNotFound(usize),

    #[error("job not found: {0}")]
    JobNotFound(JobId),

    #[error("malformed frame: {0}")]
    Parse(#[source] serde_json::Error),

    #[error("connection {0} closed")]
    ConnectionClosed(ConnectionId),

    #[error("IO error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode JSON: {0}")]
    Encode(#[source] serde_json::Error),
}

impl CoordinatorError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

pub type Result<T> = std::result::Result<T, CoordinatorError>;
