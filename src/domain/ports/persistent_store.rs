//! Persistent Store Port
//!
//! Local persistence for everything a node must remember across restarts:
//! the known-peer set, the shared document (user directory included), the
//! catalogue of published works and the pending work broadcast queue.

use crate::domain::entities::{SharedDocument, WorkRecord};
use crate::domain::identity::NodeId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// A peer this node will try to keep a connection to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KnownPeer {
    pub id: NodeId,
    #[serde(default)]
    pub display_name: String,
}

impl KnownPeer {
    pub fn new(id: NodeId, display_name: impl Into<String>) -> Self {
        Self {
            id,
            display_name: display_name.into(),
        }
    }
}

/// Errors raised by store adapters.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("storage backend error: {0}")]
    Backend(String),
    #[error("stored value could not be decoded: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Outbound port for local persistence.
///
/// Loads of missing data return empty values, never errors.
#[async_trait]
pub trait PersistentStore: Send + Sync {
    async fn load_known_peers(&self) -> Result<Vec<KnownPeer>, StoreError>;

    async fn save_known_peers(&self, peers: &[KnownPeer]) -> Result<(), StoreError>;

    /// Load the persisted document, if one was ever saved.
    async fn load_document(&self) -> Result<Option<SharedDocument>, StoreError>;

    async fn save_document(&self, doc: &SharedDocument) -> Result<(), StoreError>;

    /// Load the catalogue of published works.
    async fn load_works(&self) -> Result<Vec<WorkRecord>, StoreError>;

    /// Insert or replace a work by its code.
    async fn save_work(&self, work: &WorkRecord) -> Result<(), StoreError>;

    async fn load_pending_works(&self) -> Result<Vec<WorkRecord>, StoreError>;

    async fn save_pending_works(&self, works: &[WorkRecord]) -> Result<(), StoreError>;
}
