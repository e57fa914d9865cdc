use thiserror::Error;

/// Unified error type for Sluice crates.
#[derive(Debug, Error)]
pub enum Error {
    /// A datastream was rejected during admission. Nothing was mutated.
    #[error("Datastream validation failed: {0}")]
    Validation(String),

    /// Source or destination connectivity failure. Workers retry these.
    #[error("Transient I/O error: {0}")]
    TransientIo(String),

    /// A reuse-only producer request had no matching producer.
    #[error("No event producer available: {0}")]
    ResourceExhaustion(String),

    #[error("Worker for task {task} failed: {message}")]
    WorkerFault { task: String, message: String },

    #[error("Shutdown did not complete within {0:?}")]
    ShutdownTimeout(std::time::Duration),

    #[error("Connector {0} has not been started")]
    NotStarted(String),

    #[error("Event producer {0} has been retired")]
    ProducerRetired(String),

    #[error("Failed to load configuration: {0}")]
    Config(#[from] config::ConfigError),

    #[error("An internal error occurred: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        Error::TransientIo(msg.into())
    }

    /// Whether a worker should back off and retry instead of failing.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::TransientIo(_))
    }
}
