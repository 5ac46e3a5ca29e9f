//! Known-Peer Registry
//!
//! The set of peers this node keeps trying to reach, persisted so the mesh
//! re-forms after a restart.

use crate::domain::identity::NodeId;
use crate::domain::ports::{KnownPeer, PersistentStore, StoreError};
use parking_lot::RwLock;
use std::sync::Arc;

pub struct KnownPeers {
    local: NodeId,
    store: Arc<dyn PersistentStore>,
    peers: RwLock<Vec<KnownPeer>>,
}

impl KnownPeers {
    pub async fn load(local: NodeId, store: Arc<dyn PersistentStore>) -> Result<Self, StoreError> {
        let peers = store
            .load_known_peers()
            .await?
            .into_iter()
            .filter(|peer| peer.id != local)
            .collect::<Vec<_>>();
        tracing::info!(count = peers.len(), "known peers loaded");
        Ok(Self {
            local,
            store,
            peers: RwLock::new(peers),
        })
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.peers.read().iter().any(|peer| &peer.id == id)
    }

    pub fn list(&self) -> Vec<KnownPeer> {
        self.peers.read().clone()
    }

    pub fn ids(&self) -> Vec<NodeId> {
        self.peers.read().iter().map(|peer| peer.id.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }

    /// Display name of a peer, or its id when unknown.
    pub fn display_name(&self, id: &NodeId) -> String {
        self.peers
            .read()
            .iter()
            .find(|peer| &peer.id == id && !peer.display_name.is_empty())
            .map(|peer| peer.display_name.clone())
            .unwrap_or_else(|| id.to_string())
    }

    /// Add a peer. Returns `false` for self or an already known id.
    ///
    /// A known peer without a display name picks up the new one.
    pub async fn add(&self, peer: KnownPeer) -> bool {
        if peer.id == self.local {
            return false;
        }
        let (added, snapshot) = {
            let mut peers = self.peers.write();
            match peers.iter_mut().find(|known| known.id == peer.id) {
                Some(known) => {
                    if known.display_name.is_empty() && !peer.display_name.is_empty() {
                        known.display_name = peer.display_name;
                        (false, Some(peers.clone()))
                    } else {
                        (false, None)
                    }
                }
                None => {
                    tracing::info!(peer = %peer.id, name = %peer.display_name, "known peer added");
                    peers.push(peer);
                    (true, Some(peers.clone()))
                }
            }
        };
        if let Some(snapshot) = snapshot {
            self.save(&snapshot).await;
        }
        added
    }

    /// Forget a peer. Returns whether it was known.
    pub async fn remove(&self, id: &NodeId) -> bool {
        let snapshot = {
            let mut peers = self.peers.write();
            let before = peers.len();
            peers.retain(|peer| &peer.id != id);
            (peers.len() != before).then(|| peers.clone())
        };
        match snapshot {
            Some(snapshot) => {
                tracing::info!(peer = %id, "known peer removed");
                self.save(&snapshot).await;
                true
            }
            None => false,
        }
    }

    async fn save(&self, peers: &[KnownPeer]) {
        if let Err(e) = self.store.save_known_peers(peers).await {
            tracing::warn!(error = %e, "failed to persist known peers");
        }
    }
}
