//! Pending Work Broadcasts
//!
//! Works published while no peer is connected are queued in the store and
//! re-sent as `work_updated` once a connection opens or on the flush tick.
//! The queue is bounded; the oldest entries are dropped first.

use crate::domain::entities::WorkRecord;
use crate::domain::identity::NodeId;
use crate::domain::ports::{PersistentStore, StoreError};
use crate::replication::connection::ConnectionManager;
use crate::replication::envelope::{Envelope, Message};
use std::sync::Arc;
use tokio::sync::Mutex;

pub struct PendingQueue {
    store: Arc<dyn PersistentStore>,
    capacity: usize,
    items: Mutex<Vec<WorkRecord>>,
}

impl PendingQueue {
    /// Restore the queue from the store.
    pub async fn load(store: Arc<dyn PersistentStore>, capacity: usize) -> Result<Self, StoreError> {
        let mut items = store.load_pending_works().await?;
        trim(&mut items, capacity);
        Ok(Self {
            store,
            capacity,
            items: Mutex::new(items),
        })
    }

    pub async fn len(&self) -> usize {
        self.items.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.items.lock().await.is_empty()
    }

    pub async fn items(&self) -> Vec<WorkRecord> {
        self.items.lock().await.clone()
    }

    /// Queue a work for a later broadcast.
    pub async fn enqueue(&self, work: WorkRecord) {
        let mut items = self.items.lock().await;
        tracing::info!(code = %work.code, "queued pending work broadcast");
        items.push(work);
        trim(&mut items, self.capacity);
        self.save(&items).await;
    }

    async fn save(&self, items: &[WorkRecord]) {
        if let Err(e) = self.store.save_pending_works(items).await {
            tracing::warn!(error = %e, "failed to persist pending works");
        }
    }

    /// Send queued works to `target`, or to every open connection.
    ///
    /// Sent items leave the queue; a broadcast that reached at least one
    /// peer clears it. Returns the number of frames sent.
    pub async fn flush(
        &self,
        connections: &ConnectionManager,
        target: Option<&NodeId>,
    ) -> usize {
        let mut items = self.items.lock().await;
        if items.is_empty() {
            return 0;
        }

        let local = connections.local_id().clone();
        let mut sent = 0;
        match target {
            Some(peer) => {
                let mut remaining = Vec::new();
                for work in items.drain(..) {
                    let envelope = Envelope::new(&Message::WorkUpdated(work.clone()), &local);
                    match connections.send_to(peer, &envelope).await {
                        Ok(()) => sent += 1,
                        Err(_) => remaining.push(work),
                    }
                }
                *items = remaining;
            }
            None => {
                for work in items.iter() {
                    let envelope = Envelope::new(&Message::WorkUpdated(work.clone()), &local);
                    sent += connections.broadcast(&envelope, None).await;
                }
                if sent > 0 {
                    items.clear();
                }
            }
        }

        if sent > 0 {
            tracing::info!(sent, remaining = items.len(), "flushed pending work broadcasts");
            self.save(&items).await;
        }
        sent
    }
}

fn trim(items: &mut Vec<WorkRecord>, capacity: usize) {
    if items.len() > capacity {
        let excess = items.len() - capacity;
        items.drain(..excess);
    }
}
