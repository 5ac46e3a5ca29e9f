mod persistent_store;
mod transport;

pub use persistent_store::{KnownPeer, PersistentStore, StoreError};
pub use transport::{Channel, FrameSink, FrameStream, Transport, TransportError};
