//! Transport Port
//!
//! Point-to-point channels between nodes, addressed by `NodeId`.
//! Frames are opaque bytes; the mesh layer owns their encoding.
//!
//! A channel's inbound half is a `FrameStream`: the stream ending is the
//! close notification, so there are no message or close callbacks.

use crate::domain::identity::NodeId;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;

/// Errors raised by transport adapters.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("peer {0} is unreachable")]
    Unreachable(NodeId),
    #[error("channel closed")]
    Closed,
    #[error("frame of {0} bytes exceeds the limit")]
    FrameTooLarge(usize),
    #[error("frame checksum mismatch")]
    Checksum,
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("transport i/o error: {0}")]
    Io(String),
}

/// Outbound half of a channel.
#[async_trait]
pub trait FrameSink: Send + Sync {
    async fn send(&self, frame: Bytes) -> Result<(), TransportError>;

    /// Close the channel. Idempotent.
    async fn close(&self);

    fn is_open(&self) -> bool;
}

/// Inbound half of a channel.
#[async_trait]
pub trait FrameStream: Send {
    /// Next frame, or `None` once the channel is closed.
    async fn next_frame(&mut self) -> Option<Bytes>;
}

/// An established channel to one peer.
pub struct Channel {
    pub peer: NodeId,
    pub sink: Arc<dyn FrameSink>,
    pub stream: Box<dyn FrameStream>,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("peer", &self.peer)
            .field("open", &self.sink.is_open())
            .finish()
    }
}

/// Outbound port for reaching other nodes.
#[async_trait]
pub trait Transport: Send + Sync {
    fn local_id(&self) -> &NodeId;

    /// Open a channel to `peer`. May block; callers bound it with a timeout.
    async fn dial(&self, peer: &NodeId) -> Result<Channel, TransportError>;

    /// Wait for the next inbound channel. `None` once the transport is shut down.
    async fn accept(&self) -> Option<Channel>;
}
