use crate::connector::CONNECTOR_TYPE;
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct ConnectorConfig {
    /// Also the connector type datastreams and pooled producers are keyed by.
    #[serde(default = "default_name")]
    pub name: String,
    /// `host:port` brokers a source must list at least one of. Empty allows any cluster.
    #[serde(default)]
    pub whitelisted_clusters: Vec<String>,
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
    #[serde(default = "default_retry_initial_ms")]
    pub retry_initial_ms: u64,
    #[serde(default = "default_retry_max_ms")]
    pub retry_max_ms: u64,
}

fn default_name() -> String {
    CONNECTOR_TYPE.to_string()
}

fn default_shutdown_grace_secs() -> u64 {
    5
}

fn default_poll_timeout_ms() -> u64 {
    100
}

fn default_retry_initial_ms() -> u64 {
    100
}

fn default_retry_max_ms() -> u64 {
    10_000
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            whitelisted_clusters: Vec::new(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
            poll_timeout_ms: default_poll_timeout_ms(),
            retry_initial_ms: default_retry_initial_ms(),
            retry_max_ms: default_retry_max_ms(),
        }
    }
}

impl ConnectorConfig {
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn retry_initial(&self) -> Duration {
        Duration::from_millis(self.retry_initial_ms.max(1))
    }

    pub fn retry_max(&self) -> Duration {
        Duration::from_millis(self.retry_max_ms.max(self.retry_initial_ms).max(1))
    }
}
