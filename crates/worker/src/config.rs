use std::time::Duration;

use scan_pool_types::protocol::{DEFAULT_PORT, DEFAULT_RECONNECT_DELAY};

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// SCAN_POOL_URL, scheme and host without a port.
    pub url: String,
    /// SCAN_POOL_PORT.
    pub port: u16,
    pub reconnect_delay: Duration,
}

impl ClientConfig {
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            url: lookup("SCAN_POOL_URL").unwrap_or_else(|| "ws://localhost".to_string()),
            port: lookup("SCAN_POOL_PORT")
                .and_then(|raw| raw.parse().ok())
                .unwrap_or(DEFAULT_PORT),
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
        }
    }

    /// Full address the client dials.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.url.trim_end_matches('/'), self.port)
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ClientConfig::from_lookup(|_| None);
        assert_eq!(config.endpoint(), "ws://localhost:9002");
        assert_eq!(config.reconnect_delay, Duration::from_millis(5000));
    }

    #[test]
    fn test_env_overrides() {
        let config = ClientConfig::from_lookup(|key| match key {
            "SCAN_POOL_URL" => Some("ws://pool.lan/".to_string()),
            "SCAN_POOL_PORT" => Some("9100".to_string()),
            _ => None,
        });
        assert_eq!(config.endpoint(), "ws://pool.lan:9100");
    }

    #[test]
    fn test_bad_port_falls_back() {
        let config = ClientConfig::from_lookup(|key| (key == "SCAN_POOL_PORT").then(|| "nine".to_string()));
        assert_eq!(config.port, 9002);
    }
}
