use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MetricKind {
    Counter,
    Meter,
    Gauge,
}

/// Describes a metric a connector emits. Names are regular expressions when
/// the metric is registered per task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricInfo {
    pub name: String,
    pub kind: MetricKind,
}

impl MetricInfo {
    fn new(name: String, kind: MetricKind) -> Self {
        Self { name, kind }
    }
}

pub(crate) fn worker_metric_infos(connector: &str) -> Vec<MetricInfo> {
    vec![
        MetricInfo::new(format!("{connector}\\..+\\.eventsProcessedRate"), MetricKind::Meter),
        MetricInfo::new(format!("{connector}\\..+\\.errorRate"), MetricKind::Meter),
        MetricInfo::new(format!("{connector}\\..+\\.lastCheckpoint"), MetricKind::Gauge),
        MetricInfo::new(format!("{connector}\\.numWorkers"), MetricKind::Gauge),
        MetricInfo::new(format!("{connector}\\.workerFaults"), MetricKind::Counter),
    ]
}
