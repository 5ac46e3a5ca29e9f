//! Mesh Events
//!
//! Outward notifications for whatever presents the mesh to a user.
//! The engine publishes, it never renders.

use crate::domain::entities::UserRecord;
use crate::domain::identity::NodeId;
use crate::replication::envelope::TypingNotice;
use tokio::sync::broadcast;

/// Events emitted by a mesh node.
#[derive(Debug, Clone, PartialEq)]
pub enum MeshEvent {
    /// A channel to a peer reached `Open`
    PeerConnected(NodeId),
    /// An open channel closed
    PeerDisconnected(NodeId),
    /// Dialing or talking to a peer failed
    ConnectionError { peer: NodeId, reason: String },
    /// A remote update changed the shared document
    DocumentChanged { from: NodeId, kind: String },
    /// A remote update changed the user directory
    UsersChanged { from: NodeId },
    /// A work in the local catalogue was inserted or replaced
    WorkCatalogChanged { from: NodeId, code: String },
    /// A peer started or stopped typing
    Typing { from: NodeId, notice: TypingNotice },
    /// A peer announced the user logged in on it
    UserLogin { from: NodeId, user: UserRecord },
    /// The local user's own record was updated remotely
    ProfileUpdated(UserRecord),
    /// The local user was removed from the directory; the session must end
    SessionInvalidated,
    /// New peer ids were learned
    PeersDiscovered { peers: Vec<NodeId> },
}

/// Fan-out of `MeshEvent`s to any number of subscribers.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<MeshEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event. Having no subscriber is not an error.
    pub fn publish(&self, event: MeshEvent) {
        tracing::debug!(?event, "mesh event");
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MeshEvent> {
        self.tx.subscribe()
    }
}
