//! In-Memory Store
//!
//! Implements PersistentStore using DashMap. Nothing survives the process;
//! used by tests and by nodes started without a database path.

use crate::domain::entities::{SharedDocument, WorkRecord};
use crate::domain::ports::{KnownPeer, PersistentStore, StoreError};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Default)]
pub struct MemoryStore {
    known_peers: RwLock<Vec<KnownPeer>>,
    document: RwLock<Option<SharedDocument>>,
    works: DashMap<String, WorkRecord>,
    pending: RwLock<Vec<WorkRecord>>,
    document_saves: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// How many times the document was saved.
    pub fn document_saves(&self) -> usize {
        self.document_saves.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PersistentStore for MemoryStore {
    async fn load_known_peers(&self) -> Result<Vec<KnownPeer>, StoreError> {
        Ok(self.known_peers.read().clone())
    }

    async fn save_known_peers(&self, peers: &[KnownPeer]) -> Result<(), StoreError> {
        *self.known_peers.write() = peers.to_vec();
        Ok(())
    }

    async fn load_document(&self) -> Result<Option<SharedDocument>, StoreError> {
        Ok(self.document.read().clone())
    }

    async fn save_document(&self, doc: &SharedDocument) -> Result<(), StoreError> {
        *self.document.write() = Some(doc.clone());
        self.document_saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn load_works(&self) -> Result<Vec<WorkRecord>, StoreError> {
        let mut works: Vec<WorkRecord> = self.works.iter().map(|e| e.value().clone()).collect();
        works.sort_by(|a, b| a.code.cmp(&b.code));
        Ok(works)
    }

    async fn save_work(&self, work: &WorkRecord) -> Result<(), StoreError> {
        self.works.insert(work.code.clone(), work.clone());
        Ok(())
    }

    async fn load_pending_works(&self) -> Result<Vec<WorkRecord>, StoreError> {
        Ok(self.pending.read().clone())
    }

    async fn save_pending_works(&self, works: &[WorkRecord]) -> Result<(), StoreError> {
        *self.pending.write() = works.to_vec();
        Ok(())
    }
}
