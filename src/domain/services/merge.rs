//! Merge Engine
//!
//! Pure domain logic reconciling a remote fragment into local state.
//! This service has NO I/O - it only mutates the values it is handed.
//!
//! Policies per sub-entity:
//! - `work`: last-writer-wins by `lastModifiedAt`
//! - `errors`: per-key last-writer-wins by record `timestamp`
//! - `elementErrors`, `anexoErrors`, `mensagens`: id-deduplicated union
//! - `completionStates`: monotonic OR
//! - `messageResponses`: first-write-wins
//! - users: insert new keys, replace only on a strictly newer version
//!
//! Every merge is idempotent, and the union/LWW/OR merges are commutative and
//! associative, which is what lets the mesh converge without coordination.

use crate::domain::entities::{
    DocumentFragment, FieldError, ListItem, Provenance, SharedDocument, Timestamp,
    UserDirectory, UserRecord, WorkMetadata, WorkRecord,
};
use crate::domain::identity::{normalize_identity, Node, NodeId};
use serde::Serialize;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// What a document merge changed, per sub-entity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    pub work: bool,
    pub errors: usize,
    pub element_errors: usize,
    pub anexo_errors: usize,
    pub messages: usize,
    pub completion_states: usize,
    pub message_responses: usize,
}

impl MergeReport {
    /// Whether the merge was accepted, i.e. changed local state.
    pub fn changed(&self) -> bool {
        self.work || self.total_items() > 0
    }

    pub fn total_items(&self) -> usize {
        self.errors
            + self.element_errors
            + self.anexo_errors
            + self.messages
            + self.completion_states
            + self.message_responses
    }
}

/// Outcome of merging a `user_removed` update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserRemoval {
    /// The user existed and was removed.
    Removed,
    /// Nothing to remove; already applied or never known.
    NotFound,
    /// The removed identity is the local user. Nothing was merged; the caller
    /// must invalidate the local session.
    SelfRemoved,
}

/// Merge engine with one function per policy.
pub struct MergeEngine;

impl MergeEngine {
    /// Merge a (possibly partial) remote fragment into the local document.
    ///
    /// Sub-entities are merged independently; absent ones are skipped.
    pub fn merge_document(
        local: &mut SharedDocument,
        remote: &DocumentFragment,
        from: &NodeId,
    ) -> MergeReport {
        let mut report = MergeReport::default();
        let provenance = &mut local.provenance;

        if let Some(work) = &remote.work {
            report.work = Self::merge_work(&mut local.work, work, provenance, from);
        }
        if let Some(errors) = &remote.errors {
            report.errors = Self::merge_field_errors(&mut local.errors, errors, provenance, from);
        }
        if let Some(items) = &remote.element_errors {
            report.element_errors =
                Self::merge_list(&mut local.element_errors, items, "elementErrors", provenance, from);
        }
        if let Some(items) = &remote.anexo_errors {
            report.anexo_errors =
                Self::merge_list(&mut local.anexo_errors, items, "anexoErrors", provenance, from);
        }
        if let Some(items) = &remote.mensagens {
            report.messages =
                Self::merge_list(&mut local.mensagens, items, "mensagens", provenance, from);
        }
        if let Some(states) = &remote.completion_states {
            report.completion_states = Self::merge_completion_states(
                &mut local.completion_states,
                states,
                provenance,
                from,
            );
        }
        if let Some(responses) = &remote.message_responses {
            report.message_responses = Self::merge_message_responses(
                &mut local.message_responses,
                responses,
                provenance,
                from,
            );
        }

        report
    }

    /// Last-writer-wins on the work metadata record.
    ///
    /// Equal timestamps fall back to "non-empty beats empty", then to the
    /// canonical encoding, so the outcome never depends on arrival order.
    pub fn merge_work(
        local: &mut WorkMetadata,
        remote: &WorkMetadata,
        provenance: &mut Provenance,
        from: &NodeId,
    ) -> bool {
        let ordering = remote
            .last_modified_at
            .cmp(&local.last_modified_at)
            .then_with(|| (!remote.is_empty()).cmp(&!local.is_empty()))
            .then_with(|| canonical(remote).cmp(&canonical(local)));

        if ordering == Ordering::Greater {
            *local = remote.clone();
            provenance.insert("work".to_string(), from.clone());
            true
        } else {
            false
        }
    }

    /// Per-key last-writer-wins on field errors. Returns the number of keys written.
    pub fn merge_field_errors(
        local: &mut BTreeMap<String, FieldError>,
        remote: &BTreeMap<String, FieldError>,
        provenance: &mut Provenance,
        from: &NodeId,
    ) -> usize {
        remote
            .iter()
            .filter(|(field_id, record)| {
                Self::merge_field_error(local, field_id, record, provenance, from)
            })
            .count()
    }

    /// Merge a single field error. An absent key is created on first sight.
    pub fn merge_field_error(
        local: &mut BTreeMap<String, FieldError>,
        field_id: &str,
        record: &FieldError,
        provenance: &mut Provenance,
        from: &NodeId,
    ) -> bool {
        let wins = match local.get(field_id) {
            None => true,
            Some(existing) => lww_wins(
                record.timestamp,
                record,
                existing.timestamp,
                existing,
            ),
        };

        if wins {
            local.insert(field_id.to_string(), record.clone());
            provenance.insert(format!("errors/{}", field_id), from.clone());
        }
        wins
    }

    /// Id-deduplicated union. Returns the number of items added.
    ///
    /// Items stay ordered by `(timestamp, id)`: a new item is appended when it
    /// is the newest and inserted at its position otherwise. An item whose id
    /// already exists is ignored.
    pub fn merge_list<T: ListItem>(
        local: &mut Vec<T>,
        remote: &[T],
        section: &str,
        provenance: &mut Provenance,
        from: &NodeId,
    ) -> usize {
        let mut added = 0;
        for item in remote {
            if Self::insert_list_item(local, item) {
                provenance.insert(format!("{}/{}", section, item.id()), from.clone());
                added += 1;
            }
        }
        added
    }

    /// Insert one item if its id is new. Returns whether it was inserted.
    pub fn insert_list_item<T: ListItem>(local: &mut Vec<T>, item: &T) -> bool {
        if local.iter().any(|existing| existing.id() == item.id()) {
            return false;
        }
        let key = (item.timestamp(), item.id());
        let position = local
            .iter()
            .rposition(|existing| (existing.timestamp(), existing.id()) < key)
            .map(|i| i + 1)
            .unwrap_or(0);
        local.insert(position, item.clone());
        true
    }

    /// Monotonic OR: once `true`, a key never reverts to `false`.
    /// Returns the number of keys whose value changed or was created.
    pub fn merge_completion_states(
        local: &mut BTreeMap<String, bool>,
        remote: &BTreeMap<String, bool>,
        provenance: &mut Provenance,
        from: &NodeId,
    ) -> usize {
        let mut changed = 0;
        for (key, incoming) in remote {
            let updated = match local.get(key) {
                None => {
                    local.insert(key.clone(), *incoming);
                    true
                }
                Some(existing) => {
                    let merged = *existing || *incoming;
                    if merged != *existing {
                        local.insert(key.clone(), merged);
                        true
                    } else {
                        false
                    }
                }
            };
            if updated {
                provenance.insert(format!("completionStates/{}", key), from.clone());
                changed += 1;
            }
        }
        changed
    }

    /// Mark one completion key as done.
    pub fn mark_completed(
        local: &mut BTreeMap<String, bool>,
        key: &str,
        provenance: &mut Provenance,
        from: &NodeId,
    ) -> bool {
        let mut single = BTreeMap::new();
        single.insert(key.to_string(), true);
        Self::merge_completion_states(local, &single, provenance, from) > 0
    }

    /// First-write-wins: only fills keys absent locally.
    pub fn merge_message_responses(
        local: &mut BTreeMap<String, Value>,
        remote: &BTreeMap<String, Value>,
        provenance: &mut Provenance,
        from: &NodeId,
    ) -> usize {
        let mut added = 0;
        for (key, response) in remote {
            if !local.contains_key(key) {
                local.insert(key.clone(), response.clone());
                provenance.insert(format!("messageResponses/{}", key), from.clone());
                added += 1;
            }
        }
        added
    }

    /// Merge a list of users. Returns the number of records inserted or replaced.
    pub fn merge_users(
        local: &mut UserDirectory,
        remote: &[UserRecord],
        provenance: &mut Provenance,
        from: &NodeId,
    ) -> usize {
        remote
            .iter()
            .filter(|user| Self::merge_user(local, user, provenance, from))
            .count()
    }

    /// Insert a new user, or replace an existing one only if strictly newer.
    pub fn merge_user(
        local: &mut UserDirectory,
        user: &UserRecord,
        provenance: &mut Provenance,
        from: &NodeId,
    ) -> bool {
        let key = user.key();
        if key.is_empty() {
            return false;
        }
        let accept = match local.get(&key) {
            None => true,
            Some(existing) => user.version() > existing.version(),
        };
        if accept {
            local.insert(key.clone(), user.clone());
            provenance.insert(format!("users/{}", key), from.clone());
        }
        accept
    }

    /// Apply a `user_removed` update.
    ///
    /// When `email` is the local node's own identity nothing is merged and
    /// `SelfRemoved` is returned so the caller can invalidate the session.
    pub fn remove_user(
        local: &mut UserDirectory,
        email: &str,
        local_node: &Node,
        provenance: &mut Provenance,
    ) -> UserRemoval {
        if local_node.is_identity(email) {
            return UserRemoval::SelfRemoved;
        }
        let key = normalize_identity(email);
        if local.remove(&key).is_some() {
            provenance.remove(&format!("users/{}", key));
            UserRemoval::Removed
        } else {
            UserRemoval::NotFound
        }
    }

    /// Last-writer-wins on a catalogue entry keyed by work code.
    pub fn merge_work_record(
        catalog: &mut BTreeMap<String, WorkRecord>,
        incoming: &WorkRecord,
    ) -> bool {
        if incoming.code.is_empty() {
            return false;
        }
        let wins = match catalog.get(&incoming.code) {
            None => true,
            Some(existing) => lww_wins(
                incoming.last_modified_at,
                incoming,
                existing.last_modified_at,
                existing,
            ),
        };
        if wins {
            catalog.insert(incoming.code.clone(), incoming.clone());
        }
        wins
    }
}

/// Deterministic last-writer-wins: newer timestamp wins, ties broken by
/// the canonical encoding so every node picks the same record.
fn lww_wins<T: Serialize>(
    incoming_ts: Timestamp,
    incoming: &T,
    existing_ts: Timestamp,
    existing: &T,
) -> bool {
    match incoming_ts.cmp(&existing_ts) {
        Ordering::Greater => true,
        Ordering::Less => false,
        Ordering::Equal => canonical(incoming) > canonical(existing),
    }
}

/// Canonical JSON encoding (object keys sorted).
fn canonical<T: Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_default()
}
