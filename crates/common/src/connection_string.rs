//! Canonical form of a partitioned-log source connection string:
//! `kafka://host:port[,host:port...]/topic`.

use crate::error::{Error, Result};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

pub const SCHEME: &str = "kafka://";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BrokerAddress {
    pub host: String,
    pub port: u16,
}

impl FromStr for BrokerAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| Error::validation(format!("broker '{s}' is missing a port")))?;
        let host = host.trim();
        if host.is_empty() {
            return Err(Error::validation(format!("broker '{s}' is missing a host")));
        }
        let port = port
            .trim()
            .parse::<u16>()
            .map_err(|e| Error::validation(format!("broker '{s}' has an invalid port: {e}")))?;
        Ok(Self { host: host.to_lowercase(), port })
    }
}

impl fmt::Display for BrokerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Parsed source connection string. Brokers are kept sorted and unique so
/// the `Display` output is order-normalized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceConnectionString {
    brokers: BTreeSet<BrokerAddress>,
    topic: String,
}

impl SourceConnectionString {
    pub fn brokers(&self) -> impl Iterator<Item = &BrokerAddress> {
        self.brokers.iter()
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

impl FromStr for SourceConnectionString {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let rest = s
            .strip_prefix(SCHEME)
            .ok_or_else(|| Error::validation(format!("connection string '{s}' must start with {SCHEME}")))?;
        let (hosts, topic) = rest
            .split_once('/')
            .ok_or_else(|| Error::validation(format!("connection string '{s}' is missing a topic")))?;
        let topic = topic.trim();
        if topic.is_empty() || topic.contains('/') {
            return Err(Error::validation(format!("connection string '{s}' has an invalid topic")));
        }
        let brokers = hosts
            .split(',')
            .map(BrokerAddress::from_str)
            .collect::<Result<BTreeSet<_>>>()?;
        Ok(Self { brokers, topic: topic.to_string() })
    }
}

impl fmt::Display for SourceConnectionString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(SCHEME)?;
        for (i, broker) in self.brokers.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{broker}")?;
        }
        write!(f, "/{}", self.topic)
    }
}
