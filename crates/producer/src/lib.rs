//! Producer crate
//!
//! Event producers bundle a destination transport with the checkpoint cursor
//! of the tasks writing through it. The [`EventProducerPool`] shares them
//! between tasks with the same connector type and destination.

pub mod config;
pub mod pool;
pub mod producer;

pub use config::ProducerConfig;
pub use pool::EventProducerPool;
pub use producer::EventProducer;
