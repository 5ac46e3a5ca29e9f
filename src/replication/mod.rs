//! Peer Mesh Replication
//!
//! Keeps one shared inspection record consistent across a mesh of peers.
//! There is no server: every node holds a full replica, pushes its changes
//! to the peers it is connected to, and re-broadcasts what it accepts from
//! them so updates reach nodes that are not directly connected.
//!
//! ## Architecture
//!
//! - **Connections**: channel table and lifecycle per peer
//! - **Router**: JSON envelope decoding and per-type dispatch
//! - **Propagation**: re-broadcast of accepted updates, excluding the sender
//! - **Bootstrap**: state push and pull when a connection opens
//! - **Node**: orchestrates all components
//!
//! ## How It Works
//!
//! 1. Each node's id is derived from its user's e-mail, so peers can be dialed by identity
//! 2. On connect both sides push their full state, then ask for the other's
//! 3. Updates are merged field by field (last-writer-wins, union, monotonic flags)
//! 4. Only updates that changed local state are forwarded, so cycles die out
//!
//! ## Usage
//!
//! ```rust,ignore
//! use inspection_sync::replication::{MeshConfig, MeshNode};
//!
//! let config = MeshConfig::new("inspector@example.com").display_name("Ana");
//! let node = MeshNode::new(config, transport, store).await?;
//! node.start();
//! node.connect(&peer_id).await?;
//! ```

mod agent;
mod bootstrap;
mod config;
mod connection;
pub mod envelope;
mod error;
mod events;
mod peers;
mod pending;
mod propagation;
mod router;

pub use agent::{MeshNode, NetworkStats};
pub use bootstrap::Bootstrapper;
pub use config::{ConfigError, MeshConfig};
pub use connection::{ConnectionInfo, ConnectionManager, ConnectionState, OpenedChannel};
pub use envelope::{Envelope, EnvelopeError, ErrorReport, Message, TypingNotice};
pub use error::MeshError;
pub use events::{EventBus, MeshEvent};
pub use peers::KnownPeers;
pub use pending::PendingQueue;
pub use propagation::propagate;
pub use router::{dispatch, Dispatch, MessageHandler};
