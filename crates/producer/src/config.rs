use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct ProducerConfig {
    #[serde(default = "default_commit_interval_ms")]
    pub commit_interval_ms: u64,
}

fn default_commit_interval_ms() -> u64 {
    60_000
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self { commit_interval_ms: default_commit_interval_ms() }
    }
}

impl ProducerConfig {
    pub fn with_commit_interval(interval: Duration) -> Self {
        Self { commit_interval_ms: u64::try_from(interval.as_millis()).unwrap_or(u64::MAX) }
    }

    pub fn commit_interval(&self) -> Duration {
        Duration::from_millis(self.commit_interval_ms.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commit_interval_saturates_instead_of_wrapping() {
        let config = ProducerConfig::with_commit_interval(Duration::MAX);
        assert_eq!(config.commit_interval_ms, u64::MAX);

        let config = ProducerConfig::with_commit_interval(Duration::from_millis(250));
        assert_eq!(config.commit_interval(), Duration::from_millis(250));
        assert_eq!(ProducerConfig::with_commit_interval(Duration::ZERO).commit_interval(), Duration::from_millis(1));
    }
}
