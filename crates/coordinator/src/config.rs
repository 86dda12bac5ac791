use std::path::PathBuf;
use std::time::Duration;

use scan_pool_types::protocol::{DEFAULT_PORT, DEFAULT_REQUEST_TIMEOUT, HEARTBEAT_INTERVAL};

/// Coordinator runtime settings.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// SCAN_POOL_PORT, default 9002.
    pub port: u16,
    pub heartbeat_interval: Duration,
    pub request_timeout: Duration,
    /// SCAN_POOL_JOBS_FILE. Persisted job list.
    pub jobs_file: PathBuf,
    /// SCAN_POOL_REL_DIR. Directory holding rel files referenced by jobs.
    pub rel_dir: PathBuf,
    /// How often pending jobs are offered to idle workers.
    pub assign_interval: Duration,
}

impl CoordinatorConfig {
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let port = match lookup("SCAN_POOL_PORT") {
            Some(raw) => raw.parse().unwrap_or_else(|_| {
                tracing::warn!(value = %raw, "ignoring invalid SCAN_POOL_PORT");
                DEFAULT_PORT
            }),
            None => DEFAULT_PORT,
        };
        Self {
            port,
            heartbeat_interval: HEARTBEAT_INTERVAL,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            jobs_file: lookup("SCAN_POOL_JOBS_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("jobs.json")),
            rel_dir: lookup("SCAN_POOL_REL_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("rel-files")),
            assign_interval: Duration::from_secs(10),
        }
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_without_env() {
        let config = CoordinatorConfig::from_lookup(|_| None);
        assert_eq!(config.port, 9002);
        assert_eq!(config.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(config.request_timeout, Duration::from_millis(5000));
        assert_eq!(config.jobs_file, PathBuf::from("jobs.json"));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("SCAN_POOL_PORT", "9100"),
            ("SCAN_POOL_JOBS_FILE", "/var/lib/pool/jobs.json"),
            ("SCAN_POOL_REL_DIR", "/var/lib/pool/rel"),
        ]
        .into_iter()
        .collect();
        let config = CoordinatorConfig::from_lookup(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(config.port, 9100);
        assert_eq!(config.jobs_file, PathBuf::from("/var/lib/pool/jobs.json"));
        assert_eq!(config.rel_dir, PathBuf::from("/var/lib/pool/rel"));
    }

    #[test]
    fn test_bad_port_falls_back() {
        let config = CoordinatorConfig::from_lookup(|k| {
            (k == "SCAN_POOL_PORT").then(|| "not-a-port".to_string())
        });
        assert_eq!(config.port, 9002);
    }
}
