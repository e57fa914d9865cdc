//! In-memory connector
//!
//! Source, transport and checkpoint providers that keep all state in process.
//! Each provider is cheap to clone and clones share state, so a test or the
//! demo binary can hand one copy to the engine and inspect another.

pub mod checkpoint;
pub mod source;
pub mod transport;

pub use checkpoint::MemoryCheckpointProvider;
pub use source::MemorySource;
pub use transport::MemoryTransportProvider;
