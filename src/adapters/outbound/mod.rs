mod memory_store;
mod memory_transport;
mod quic_transport;
mod sqlite_store;

pub use memory_store::MemoryStore;
pub use memory_transport::{MemoryNetwork, MemoryTransport};
pub use quic_transport::{QuicConfig, QuicTransport};
pub use sqlite_store::SqliteStore;
