use ipmiproto::shared::{IpmiError, IpmiResult};
use serde_derive::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_PING_PERIOD_MS: u64 = 20_000;
pub const DEFAULT_TIMER_POOL_SIZE: usize = 5;
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 2_000;
pub const DEFAULT_RETRIES: u32 = 3;
pub const DEFAULT_PIPELINE_LIMIT: usize = 16;

/// Client configuration. Every key has a default, so a configuration file
/// only needs to name the keys it overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Keep-alive period in milliseconds.
    #[serde(default = "default_ping_period")]
    pub ping_period: u64,
    /// Number of worker threads in the timer pool.
    #[serde(default = "default_timer_pool_size")]
    pub timer_pool_size: usize,
    /// Per-request response timeout in milliseconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,
    /// Re-sends attempted after the first timeout.
    #[serde(default = "default_retries")]
    pub retries: u32,
    /// Maximum in-flight in-session commands per connection.
    #[serde(default = "default_pipeline_limit")]
    pub pipeline_limit: usize,
}

fn default_ping_period() -> u64 {
    DEFAULT_PING_PERIOD_MS
}

fn default_timer_pool_size() -> usize {
    DEFAULT_TIMER_POOL_SIZE
}

fn default_request_timeout() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_MS
}

fn default_retries() -> u32 {
    DEFAULT_RETRIES
}

fn default_pipeline_limit() -> usize {
    DEFAULT_PIPELINE_LIMIT
}

impl Default for ClientConfig {
    fn default() -> ClientConfig {
        ClientConfig {
            ping_period: DEFAULT_PING_PERIOD_MS,
            timer_pool_size: DEFAULT_TIMER_POOL_SIZE,
            request_timeout: DEFAULT_REQUEST_TIMEOUT_MS,
            retries: DEFAULT_RETRIES,
            pipeline_limit: DEFAULT_PIPELINE_LIMIT,
        }
    }
}

impl ClientConfig {
    /// Loads the configuration from a TOML file. Absent keys fall back to
    /// their defaults; an unreadable file fails with `ConfigurationMissing`.
    pub fn load<P: AsRef<Path>>(path: P) -> IpmiResult<ClientConfig> {
        serdeconv::from_toml_file(path).map_err(|_| IpmiError::ConfigurationMissing)
    }

    /// Parses the configuration from a TOML snippet.
    pub fn from_toml_str(config: &str) -> IpmiResult<ClientConfig> {
        serdeconv::from_toml_str(config).map_err(|_| IpmiError::ConfigurationMissing)
    }

    #[inline]
    pub fn ping_period(&self) -> Duration {
        Duration::from_millis(self.ping_period)
    }

    #[inline]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ClientConfig::default();

        assert_eq!(config.ping_period, 20_000);
        assert_eq!(config.timer_pool_size, 5);
        assert_eq!(config.request_timeout, 2_000);
        assert_eq!(config.retries, 3);
        assert_eq!(config.pipeline_limit, 16);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = ClientConfig::from_toml_str("request_timeout = 500\nretries = 1\n").unwrap();

        assert_eq!(config.request_timeout, 500);
        assert_eq!(config.retries, 1);
        assert_eq!(config.ping_period, DEFAULT_PING_PERIOD_MS);
        assert_eq!(config.timer_pool_size, DEFAULT_TIMER_POOL_SIZE);
    }

    #[test]
    fn test_missing_file_is_configuration_missing() {
        let result = ClientConfig::load("/nonexistent/ipmi.toml");
        assert_eq!(result.unwrap_err(), IpmiError::ConfigurationMissing);
    }
}
