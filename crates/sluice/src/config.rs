use serde::Deserialize;
use sluice_common::Result;
use sluice_connector::ConnectorConfig;
use sluice_producer::ProducerConfig;
use std::time::Duration;

const DEFAULT_CONFIG_PATH: &str = "crates/sluice/config/default.toml";

#[derive(Debug, Deserialize)]
pub struct Settings {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_report_interval_secs")]
    pub report_interval_secs: u64,
    #[serde(default)]
    pub producer: ProducerConfig,
    #[serde(default)]
    pub connector: ConnectorConfig,
    /// Topics created in the in-memory cluster at startup.
    #[serde(default)]
    pub topics: Vec<TopicSettings>,
    #[serde(default)]
    pub datastreams: Vec<DatastreamSettings>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TopicSettings {
    pub name: String,
    pub partitions: u32,
    /// Records appended to every partition before the connector starts.
    #[serde(default)]
    pub seed_records: u32,
    /// Appends one record per partition on this period while running. Zero disables it.
    #[serde(default)]
    pub emit_interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatastreamSettings {
    pub name: String,
    pub source: String,
    pub destination: String,
    #[serde(default)]
    pub partitions: Option<u32>,
    /// Epoch millis to start reading from.
    #[serde(default)]
    pub start_position: Option<i64>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_report_interval_secs() -> u64 {
    10
}

impl Settings {
    /// Loads `path`, or `SLUICE_CONFIG_PATH`, or the bundled default, then
    /// applies `SLUICE__*` environment overrides.
    pub fn new(path: Option<&str>) -> Result<Self> {
        let config_file_path = match path {
            Some(path) => path.to_string(),
            None => std::env::var("SLUICE_CONFIG_PATH")
                .unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string()),
        };

        let s = config::Config::builder()
            .add_source(config::File::with_name(&config_file_path).required(true))
            .add_source(config::Environment::with_prefix("SLUICE").separator("__"))
            .build()?;
        Ok(s.try_deserialize()?)
    }

    pub fn report_interval(&self) -> Duration {
        Duration::from_secs(self.report_interval_secs.max(1))
    }
}

impl TopicSettings {
    pub fn emit_interval(&self) -> Option<Duration> {
        (self.emit_interval_ms > 0).then(|| Duration::from_millis(self.emit_interval_ms))
    }
}
