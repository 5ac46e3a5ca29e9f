//! Domain Entities - The synchronized inspection record
//!
//! `SharedDocument` is composed of independently merged sub-entities. Each
//! sub-entity has its own conflict policy (see `domain::services::merge`).
//! Field names follow the JSON wire format used between peers.

use crate::domain::identity::{normalize_identity, NodeId};
use serde::de::{Deserializer, Error as DeError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the UNIX epoch.
pub type Timestamp = i64;

/// Current wall-clock time in milliseconds.
pub fn now_millis() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as Timestamp)
        .unwrap_or(0)
}

/// Metadata of the work (bridge) under inspection.
///
/// Last-writer-wins by `last_modified_at`. Arbitrary form fields ride along
/// in `fields` and are replaced as a unit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkMetadata {
    #[serde(default)]
    pub last_modified_at: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified_by: Option<NodeId>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl WorkMetadata {
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty() && self.last_modified_at == 0
    }
}

/// Inconsistency flagged on a single form field.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldError {
    #[serde(default)]
    pub timestamp: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Inconsistency flagged on a structural element or an attachment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorEntry {
    pub id: String,
    #[serde(default)]
    pub timestamp: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub element_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A chat message attached to the inspection record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub timestamp: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Items of the append-only collections: stable id plus an ordering timestamp.
pub trait ListItem: Clone + PartialEq {
    fn id(&self) -> &str;
    fn timestamp(&self) -> Timestamp;
}

impl ListItem for ErrorEntry {
    fn id(&self) -> &str {
        &self.id
    }
    fn timestamp(&self) -> Timestamp {
        self.timestamp
    }
}

impl ListItem for ChatMessage {
    fn id(&self) -> &str {
        &self.id
    }
    fn timestamp(&self) -> Timestamp {
        self.timestamp
    }
}

/// A user known to the mesh, keyed case-insensitively by e-mail.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRecord {
    pub email: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub lote: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<Timestamp>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl UserRecord {
    /// Version used for conflict resolution: `updatedAt`, else `createdAt`.
    pub fn version(&self) -> Timestamp {
        self.updated_at.or(self.created_at).unwrap_or(0)
    }

    pub fn key(&self) -> String {
        normalize_identity(&self.email)
    }
}

/// Users keyed by normalized e-mail.
pub type UserDirectory = BTreeMap<String, UserRecord>;

/// A published work in the local catalogue, replicated by `work_updated`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkRecord {
    #[serde(default, rename = "codigo")]
    pub code: String,
    #[serde(default)]
    pub last_modified_at: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified_by: Option<NodeId>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

/// Which node each merged item came from. Local audit data only.
pub type Provenance = BTreeMap<String, NodeId>;

/// The synchronized inspection record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SharedDocument {
    #[serde(default)]
    pub work: WorkMetadata,
    #[serde(default)]
    pub errors: BTreeMap<String, FieldError>,
    #[serde(default)]
    pub element_errors: Vec<ErrorEntry>,
    #[serde(default)]
    pub anexo_errors: Vec<ErrorEntry>,
    #[serde(default)]
    pub mensagens: Vec<ChatMessage>,
    #[serde(default)]
    pub completion_states: BTreeMap<String, bool>,
    #[serde(default)]
    pub message_responses: BTreeMap<String, Value>,
    #[serde(default)]
    pub users: UserDirectory,
    #[serde(default)]
    pub provenance: Provenance,
}

impl SharedDocument {
    pub fn new() -> Self {
        Self::default()
    }

    /// Full-state fragment, as pushed in a `state_update`.
    pub fn to_fragment(&self) -> DocumentFragment {
        DocumentFragment {
            work: Some(self.work.clone()),
            errors: Some(self.errors.clone()),
            element_errors: Some(self.element_errors.clone()),
            anexo_errors: Some(self.anexo_errors.clone()),
            mensagens: Some(self.mensagens.clone()),
            completion_states: Some(self.completion_states.clone()),
            message_responses: Some(self.message_responses.clone()),
        }
    }

    /// Users as a list, in key order.
    pub fn user_list(&self) -> Vec<UserRecord> {
        self.users.values().cloned().collect()
    }

    /// Equality of replicated content, ignoring local provenance.
    pub fn same_content(&self, other: &SharedDocument) -> bool {
        self.to_fragment() == other.to_fragment() && self.users == other.users
    }
}

/// A possibly partial view of a `SharedDocument`.
///
/// Absent sub-entities are left untouched by a merge, so a delta carrying
/// only messages is as valid as a full snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentFragment {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work: Option<WorkMetadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errors: Option<BTreeMap<String, FieldError>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub element_errors: Option<Vec<ErrorEntry>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anexo_errors: Option<Vec<ErrorEntry>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mensagens: Option<Vec<ChatMessage>>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "map_or_pairs"
    )]
    pub completion_states: Option<BTreeMap<String, bool>>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "map_or_pairs"
    )]
    pub message_responses: Option<BTreeMap<String, Value>>,
}

impl DocumentFragment {
    pub fn is_empty(&self) -> bool {
        self == &DocumentFragment::default()
    }
}

/// Accept a keyed map either as a JSON object or as `[[key, value], ...]`.
///
/// Browser peers serialize `Map` objects as arrays of pairs.
fn map_or_pairs<'de, D, T>(deserializer: D) -> Result<Option<BTreeMap<String, T>>, D::Error>
where
    D: Deserializer<'de>,
    T: serde::de::DeserializeOwned,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Object(map)) => map
            .into_iter()
            .map(|(k, v)| serde_json::from_value(v).map(|v| (k, v)))
            .collect::<Result<BTreeMap<_, _>, _>>()
            .map(Some)
            .map_err(D::Error::custom),
        Some(Value::Array(pairs)) => {
            let mut out = BTreeMap::new();
            for pair in pairs {
                let (k, v): (String, T) =
                    serde_json::from_value(pair).map_err(D::Error::custom)?;
                out.insert(k, v);
            }
            Ok(Some(out))
        }
        Some(other) => Err(D::Error::custom(format!(
            "expected object or array of pairs, got {}",
            other
        ))),
    }
}
