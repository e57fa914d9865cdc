use crate::datastream::Task;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusCode {
    Ok,
    Error,
    Complete,
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StatusCode::Ok => "OK",
            StatusCode::Error => "ERROR",
            StatusCode::Complete => "COMPLETE",
        };
        f.write_str(s)
    }
}

/// Per-task status reported for diagnostics. Every field is a string so the
/// record stays stable on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDiagnostics {
    pub task_name: String,
    pub datastreams: String,
    pub partitions: String,
    pub source: String,
    pub destination: String,
    pub status_code: String,
    pub status_message: String,
    pub source_checkpoint: String,
}

impl TaskDiagnostics {
    pub fn new(
        task: &Task,
        code: StatusCode,
        message: &str,
        checkpoint: &BTreeMap<u32, i64>,
    ) -> Self {
        let join = |items: Vec<String>| items.join(",");
        Self {
            task_name: task.name.clone(),
            datastreams: task.datastreams.join(","),
            partitions: join(task.partitions.iter().map(u32::to_string).collect()),
            source: task.source.connection_string.clone(),
            destination: task.destination.connection_string.clone(),
            status_code: code.to_string(),
            status_message: message.to_string(),
            source_checkpoint: join(
                checkpoint.iter().map(|(partition, offset)| format!("{partition}:{offset}")).collect(),
            ),
        }
    }
}
