//! Tracing setup shared by the scan pool binaries.
//!
//! [`init`] installs the global subscriber and returns an
//! [`ObservabilityHandle`]. Keep the handle alive for the life of the
//! process: dropping it flushes and stops the background log writer.

use std::path::PathBuf;

use anyhow::anyhow;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone)]
pub struct ObservabilityConfig {
    pub service_name: String,
    /// Used when `RUST_LOG` is unset or invalid.
    pub default_filter: String,
    pub json: bool,
    /// Write daily-rotated files here instead of stdout.
    pub log_dir: Option<PathBuf>,
}

impl ObservabilityConfig {
    pub fn new(service_name: impl Into<String>) -> Self {
        let service_name = service_name.into();
        Self {
            default_filter: default_filter_for(&service_name),
            service_name,
            json: false,
            log_dir: None,
        }
    }
}

/// `warn` globally, `info` for the service's own crate.
pub fn default_filter_for(service_name: &str) -> String {
    format!("warn,{}=info", service_name.replace('-', "_"))
}

/// Owns the non-blocking writer. Must outlive all logging.
pub struct ObservabilityHandle {
    _guard: WorkerGuard,
}

pub fn init(config: &ObservabilityConfig) -> anyhow::Result<ObservabilityHandle> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.default_filter));

    let (writer, guard) = match &config.log_dir {
        Some(dir) => {
            let appender =
                tracing_appender::rolling::daily(dir, format!("{}.log", config.service_name));
            tracing_appender::non_blocking(appender)
        }
        None => tracing_appender::non_blocking(std::io::stdout()),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_target(true);
    let installed = if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| anyhow!("failed to install tracing subscriber: {e}"))?;

    tracing::debug!(service = %config.service_name, "tracing initialised");
    Ok(ObservabilityHandle { _guard: guard })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filter_uses_crate_name() {
        assert_eq!(
            default_filter_for("scan-pool-coordinator"),
            "warn,scan_pool_coordinator=info"
        );
    }

    #[test]
    fn test_config_defaults() {
        let config = ObservabilityConfig::new("scan-pool-coordinator");
        assert_eq!(config.service_name, "scan-pool-coordinator");
        assert!(!config.json);
        assert!(config.log_dir.is_none());
        assert!(config.default_filter.ends_with("scan_pool_coordinator=info"));
    }

    #[test]
    fn test_init_writes_to_log_dir() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = ObservabilityConfig::new("scan-pool-test");
        config.log_dir = Some(dir.path().to_path_buf());
        // only one subscriber per process; this is the only test that installs it
        let handle = init(&config).unwrap();
        tracing::warn!("hello from test");
        drop(handle);
        let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert!(!entries.is_empty());
    }
}
