//! Mesh Errors

use crate::domain::identity::NodeId;
use crate::domain::ports::{StoreError, TransportError};
use crate::replication::config::ConfigError;
use crate::replication::envelope::EnvelopeError;

/// Errors surfaced by the mesh layer. None of them is fatal to the node.
#[derive(Debug, thiserror::Error)]
pub enum MeshError {
    #[error("connecting to {0} timed out")]
    ConnectTimeout(NodeId),
    #[error("channel error: {0}")]
    Channel(#[from] TransportError),
    #[error("no open connection to {0}")]
    NotConnected(NodeId),
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
}
