/// A record read from a partitioned source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceRecord {
    pub partition: u32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub value: Vec<u8>,
    /// Event time in epoch milliseconds.
    pub timestamp: i64,
}

/// A record handed to an event producer for delivery to a destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerRecord {
    pub partition: u32,
    pub key: Option<Vec<u8>>,
    pub value: Vec<u8>,
    /// Source position that becomes committable once this record is flushed.
    pub source_checkpoint: String,
}

impl From<SourceRecord> for ProducerRecord {
    fn from(record: SourceRecord) -> Self {
        Self {
            partition: record.partition,
            key: record.key,
            value: record.value,
            source_checkpoint: record.offset.to_string(),
        }
    }
}
