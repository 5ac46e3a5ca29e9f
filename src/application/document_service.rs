//! Document Service - sole owner of the shared inspection record
//!
//! Every read and write of the `SharedDocument` and the work catalogue goes
//! through this service. Mutations run under one lock and are persisted
//! through the `PersistentStore` port after the lock is released.

use crate::domain::entities::{
    now_millis, ChatMessage, DocumentFragment, ErrorEntry, FieldError, SharedDocument,
    Timestamp, UserRecord, WorkMetadata, WorkRecord,
};
use crate::domain::identity::{normalize_identity, Node, NodeId};
use crate::domain::ports::{PersistentStore, StoreError};
use crate::domain::services::{MergeEngine, MergeReport, UserRemoval};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub struct DocumentService {
    local: Node,
    document: Mutex<SharedDocument>,
    works: Mutex<BTreeMap<String, WorkRecord>>,
    store: Arc<dyn PersistentStore>,
    /// Bumped on every accepted mutation.
    revision: AtomicU64,
    /// Revision last written to the store.
    persisted: tokio::sync::Mutex<u64>,
}

impl DocumentService {
    /// Load the persisted document and work catalogue.
    pub async fn load(local: Node, store: Arc<dyn PersistentStore>) -> Result<Self, StoreError> {
        let document = store.load_document().await?.unwrap_or_default();
        let works = store
            .load_works()
            .await?
            .into_iter()
            .map(|work| (work.code.clone(), work))
            .collect::<BTreeMap<_, _>>();

        tracing::info!(
            node = %local.id,
            users = document.users.len(),
            messages = document.mensagens.len(),
            works = works.len(),
            "document loaded"
        );

        Ok(Self {
            local,
            document: Mutex::new(document),
            works: Mutex::new(works),
            store,
            revision: AtomicU64::new(0),
            persisted: tokio::sync::Mutex::new(0),
        })
    }

    pub fn local(&self) -> &Node {
        &self.local
    }

    /// A copy of the current document.
    pub fn snapshot(&self) -> SharedDocument {
        self.document.lock().clone()
    }

    /// The full replicated state, as pushed in a `state_update`.
    pub fn fragment(&self) -> DocumentFragment {
        self.document.lock().to_fragment()
    }

    pub fn users(&self) -> Vec<UserRecord> {
        self.document.lock().user_list()
    }

    /// Version of a user's record, 0 when the user is unknown.
    pub fn user_version(&self, email: &str) -> Timestamp {
        self.document
            .lock()
            .users
            .get(&normalize_identity(email))
            .map(UserRecord::version)
            .unwrap_or(0)
    }

    /// The local user's directory record, or a minimal one built from the node.
    pub fn local_user(&self) -> UserRecord {
        let key = self.local.identity.clone();
        self.document
            .lock()
            .users
            .get(&key)
            .cloned()
            .unwrap_or_else(|| UserRecord {
                email: key,
                name: self.local.display_name.clone(),
                ..Default::default()
            })
    }

    pub fn works(&self) -> Vec<WorkRecord> {
        self.works.lock().values().cloned().collect()
    }

    /// Run a mutation under the document lock, then persist if it changed anything.
    async fn mutate<R>(
        &self,
        apply: impl FnOnce(&mut SharedDocument) -> R,
        changed: impl FnOnce(&R) -> bool,
    ) -> R {
        let result = {
            let mut document = self.document.lock();
            let result = apply(&mut document);
            if changed(&result) {
                self.revision.fetch_add(1, Ordering::SeqCst);
            }
            result
        };
        self.persist().await;
        result
    }

    /// Write the latest document if the store is behind.
    ///
    /// Concurrent callers are serialized, and a stale snapshot never
    /// overwrites a newer one.
    async fn persist(&self) {
        let mut persisted = self.persisted.lock().await;
        let revision = self.revision.load(Ordering::SeqCst);
        if revision <= *persisted {
            return;
        }
        let snapshot = self.snapshot();
        match self.store.save_document(&snapshot).await {
            Ok(()) => *persisted = revision,
            Err(e) => tracing::warn!(error = %e, "failed to persist document"),
        }
    }

    /// Merge a (possibly partial) remote fragment.
    pub async fn apply_fragment(&self, fragment: &DocumentFragment, from: &NodeId) -> MergeReport {
        self.mutate(
            |doc| MergeEngine::merge_document(doc, fragment, from),
            MergeReport::changed,
        )
        .await
    }

    pub async fn apply_field_error(&self, field_id: &str, record: &FieldError, from: &NodeId) -> bool {
        self.mutate(
            |doc| {
                MergeEngine::merge_field_error(
                    &mut doc.errors,
                    field_id,
                    record,
                    &mut doc.provenance,
                    from,
                )
            },
            |changed| *changed,
        )
        .await
    }

    pub async fn apply_element_error(&self, entry: &ErrorEntry, from: &NodeId) -> bool {
        self.mutate(
            |doc| {
                MergeEngine::merge_list(
                    &mut doc.element_errors,
                    std::slice::from_ref(entry),
                    "elementErrors",
                    &mut doc.provenance,
                    from,
                ) > 0
            },
            |changed| *changed,
        )
        .await
    }

    pub async fn apply_message(&self, message: &ChatMessage, from: &NodeId) -> bool {
        self.mutate(
            |doc| {
                MergeEngine::merge_list(
                    &mut doc.mensagens,
                    std::slice::from_ref(message),
                    "mensagens",
                    &mut doc.provenance,
                    from,
                ) > 0
            },
            |changed| *changed,
        )
        .await
    }

    /// Mark an error as resolved. Resolution is permanent.
    pub async fn resolve_error(&self, error_id: &str, from: &NodeId) -> bool {
        self.mutate(
            |doc| {
                MergeEngine::mark_completed(
                    &mut doc.completion_states,
                    error_id,
                    &mut doc.provenance,
                    from,
                )
            },
            |changed| *changed,
        )
        .await
    }

    /// Record a response to a message. The first response for a key is kept.
    pub async fn respond_to_message(&self, key: &str, response: Value, from: &NodeId) -> bool {
        let mut single = BTreeMap::new();
        single.insert(key.to_string(), response);
        self.mutate(
            |doc| {
                MergeEngine::merge_message_responses(
                    &mut doc.message_responses,
                    &single,
                    &mut doc.provenance,
                    from,
                ) > 0
            },
            |changed| *changed,
        )
        .await
    }

    pub async fn apply_users(&self, users: &[UserRecord], from: &NodeId) -> usize {
        self.mutate(
            |doc| MergeEngine::merge_users(&mut doc.users, users, &mut doc.provenance, from),
            |count| *count > 0,
        )
        .await
    }

    pub async fn apply_user(&self, user: &UserRecord, from: &NodeId) -> bool {
        self.mutate(
            |doc| MergeEngine::merge_user(&mut doc.users, user, &mut doc.provenance, from),
            |changed| *changed,
        )
        .await
    }

    /// Apply a user removal. The local user is never removed here.
    pub async fn remove_user(&self, email: &str) -> UserRemoval {
        let local = self.local.clone();
        self.mutate(
            |doc| MergeEngine::remove_user(&mut doc.users, email, &local, &mut doc.provenance),
            |outcome| *outcome == UserRemoval::Removed,
        )
        .await
    }

    /// Remove a user on behalf of the local operator.
    pub async fn delete_user(&self, email: &str) -> bool {
        let key = normalize_identity(email);
        self.mutate(
            |doc| {
                let removed = doc.users.remove(&key).is_some();
                doc.provenance.remove(&format!("users/{}", key));
                removed
            },
            |removed| *removed,
        )
        .await
    }

    /// Replace the work metadata with a local edit.
    ///
    /// The edit is stamped newer than anything held, so it always wins locally.
    pub async fn edit_work(&self, fields: Map<String, Value>) -> WorkMetadata {
        let local = self.local.id.clone();
        self.mutate(
            |doc| {
                let stamp = now_millis().max(doc.work.last_modified_at + 1);
                let work = WorkMetadata {
                    last_modified_at: stamp,
                    last_modified_by: Some(local.clone()),
                    fields,
                };
                MergeEngine::merge_work(&mut doc.work, &work, &mut doc.provenance, &local);
                doc.work.clone()
            },
            |_| true,
        )
        .await
    }

    /// Merge a catalogue entry (last-writer-wins) and store it when accepted.
    pub async fn apply_work_record(&self, record: &WorkRecord) -> bool {
        let accepted = MergeEngine::merge_work_record(&mut self.works.lock(), record);
        if accepted {
            if let Err(e) = self.store.save_work(record).await {
                tracing::warn!(code = %record.code, error = %e, "failed to persist work");
            }
        }
        accepted
    }

    /// Publish a work from the local catalogue, stamping it as a local edit.
    pub async fn publish_work(&self, mut record: WorkRecord) -> WorkRecord {
        let previous = self
            .works
            .lock()
            .get(&record.code)
            .map(|w| w.last_modified_at)
            .unwrap_or(0);
        record.last_modified_at = now_millis().max(previous + 1);
        record.last_modified_by = Some(self.local.id.clone());
        self.apply_work_record(&record).await;
        record
    }
}
