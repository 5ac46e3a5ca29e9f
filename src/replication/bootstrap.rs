//! Sync Session Bootstrapper
//!
//! Runs once per newly opened connection:
//!
//! 1. push our full state, our login and the peers we know
//! 2. after `bootstrap_delay`, pull the peer's state and user directory
//! 3. after `catchup_delay`, ask for its works and flush pending broadcasts to it
//!
//! The task is attached to the connection and aborted when it closes.

use crate::application::DocumentService;
use crate::domain::identity::NodeId;
use crate::replication::connection::ConnectionManager;
use crate::replication::envelope::{Envelope, Message};
use crate::replication::peers::KnownPeers;
use crate::replication::pending::PendingQueue;
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone)]
pub struct Bootstrapper {
    documents: Arc<DocumentService>,
    connections: Arc<ConnectionManager>,
    known: Arc<KnownPeers>,
    pending: Arc<PendingQueue>,
    bootstrap_delay: Duration,
    catchup_delay: Duration,
}

impl Bootstrapper {
    pub fn new(
        documents: Arc<DocumentService>,
        connections: Arc<ConnectionManager>,
        known: Arc<KnownPeers>,
        pending: Arc<PendingQueue>,
        bootstrap_delay: Duration,
        catchup_delay: Duration,
    ) -> Self {
        Self {
            documents,
            connections,
            known,
            pending,
            bootstrap_delay,
            catchup_delay,
        }
    }

    /// Schedule the bootstrap of a connection that just opened.
    pub fn start(&self, peer: &NodeId, generation: u64) {
        let this = self.clone();
        let target = peer.clone();
        let handle = tokio::spawn(async move { this.run(target).await });
        self.connections.attach_task(peer, generation, handle);
    }

    async fn run(self, peer: NodeId) {
        tracing::debug!(%peer, "bootstrap started");

        let mut known = self.known.ids();
        known.push(self.connections.local_id().clone());
        self.send(&peer, Message::StateUpdate(self.documents.fragment())).await;
        self.send(&peer, Message::UserLogin(self.documents.local_user())).await;
        self.send(&peer, Message::PeerDiscovery { peers: known }).await;

        tokio::time::sleep(self.bootstrap_delay).await;
        self.send(&peer, Message::SyncRequest).await;
        self.send(&peer, Message::RequestUsersSync).await;

        tokio::time::sleep(self.catchup_delay.saturating_sub(self.bootstrap_delay)).await;
        self.send(&peer, Message::RequestWorks).await;
        let flushed = self.pending.flush(&self.connections, Some(&peer)).await;

        tracing::debug!(%peer, flushed, "bootstrap finished");
    }

    async fn send(&self, peer: &NodeId, message: Message) {
        let envelope = Envelope::new(&message, self.connections.local_id());
        if let Err(e) = self.connections.send_to(peer, &envelope).await {
            tracing::debug!(%peer, kind = %envelope.kind, error = %e, "bootstrap send skipped");
        }
    }
}
