//! Wire Envelope
//!
//! Every frame exchanged between peers is one JSON envelope:
//! `{ "type", "payload", "source", "timestamp" }`, plus `propagatedFrom` /
//! `propagatedBy` once a node re-broadcasts it.
//!
//! Uses Sans-IO pattern: encoding and decoding never touch a channel.

use crate::domain::entities::{
    now_millis, ChatMessage, DocumentFragment, ErrorEntry, FieldError, Timestamp, UserRecord,
    WorkRecord,
};
use crate::domain::identity::NodeId;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Errors raised while decoding a frame.
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("malformed envelope: {0}")]
    Malformed(#[source] serde_json::Error),
    #[error("invalid {kind} payload: {source}")]
    InvalidPayload {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
}

/// The JSON envelope as it travels on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<NodeId>,
    #[serde(default)]
    pub timestamp: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub propagated_from: Option<NodeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub propagated_by: Option<NodeId>,
}

impl Envelope {
    /// Wrap a message sent by `source`, stamped with the current time.
    pub fn new(message: &Message, source: &NodeId) -> Self {
        let timestamp = now_millis();
        Self {
            kind: message.kind().to_string(),
            payload: message.to_payload(source, timestamp),
            source: Some(source.clone()),
            timestamp,
            propagated_from: None,
            propagated_by: None,
        }
    }

    /// Parse the payload into a typed message.
    ///
    /// Unknown types decode to `Message::Unknown` so newer peers stay compatible.
    pub fn message(&self) -> Result<Message, EnvelopeError> {
        Message::from_parts(&self.kind, &self.payload)
    }

    /// The node that created the envelope.
    ///
    /// Browser peers only put `source` inside the payload.
    pub fn origin(&self) -> Option<NodeId> {
        self.source.clone().or_else(|| {
            self.payload
                .get("source")
                .and_then(Value::as_str)
                .map(NodeId::from)
        })
    }

    /// Copy of this envelope marked as re-broadcast by `by` on behalf of `from`.
    pub fn propagated(&self, from: &NodeId, by: &NodeId) -> Self {
        let mut envelope = self.clone();
        envelope.propagated_from = Some(from.clone());
        envelope.propagated_by = Some(by.clone());
        envelope
    }
}

/// Encode an envelope into a frame (Sans-IO pattern).
pub fn encode(envelope: &Envelope) -> Result<Bytes, EnvelopeError> {
    serde_json::to_vec(envelope)
        .map(Bytes::from)
        .map_err(EnvelopeError::Malformed)
}

/// Decode a frame into an envelope (Sans-IO pattern).
pub fn decode(frame: &[u8]) -> Result<Envelope, EnvelopeError> {
    serde_json::from_slice(frame).map_err(EnvelopeError::Malformed)
}

/// Payload of `error_added`: either a field error or an element error.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorReport {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub element_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub timestamp: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ErrorReport {
    /// The field error record this report carries, if it targets a field.
    pub fn field_error(&self) -> Option<(String, FieldError)> {
        let field_id = self.field_id.clone()?;
        Some((
            field_id,
            FieldError {
                timestamp: self.timestamp,
                label: self.label.clone(),
                description: self.description.clone(),
                extra: self.extra.clone(),
            },
        ))
    }

    /// The element error entry this report carries, if it targets an element.
    ///
    /// The entry id is the report id when present, else the element id.
    pub fn element_error(&self) -> Option<ErrorEntry> {
        let element_id = self.element_id.clone()?;
        Some(ErrorEntry {
            id: self.id.clone().unwrap_or_else(|| element_id.clone()),
            timestamp: self.timestamp,
            element_id: Some(element_id),
            label: self.label.clone(),
            description: self.description.clone(),
            extra: self.extra.clone(),
        })
    }
}

/// Payload of `typing`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingNotice {
    #[serde(default)]
    pub is_typing: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<NodeId>,
    #[serde(default)]
    pub timestamp: Timestamp,
}

/// Typed view of every message kind.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    StateUpdate(DocumentFragment),
    Message(ChatMessage),
    ErrorAdded(ErrorReport),
    ErrorResolved { error_id: String },
    Typing(TypingNotice),
    SyncRequest,
    UsersSync { users: Vec<UserRecord> },
    UserAdded(UserRecord),
    UserRemoved { email: String },
    UserUpdated(UserRecord),
    RequestUsersSync,
    WorkUpdated(WorkRecord),
    PeerDiscovery { peers: Vec<NodeId> },
    UserLogin(UserRecord),
    RequestWorks,
    WorksList { works: Vec<WorkRecord> },
    /// A type this node does not understand.
    Unknown(String),
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ErrorResolvedPayload {
    error_id: String,
}

#[derive(Deserialize)]
struct UsersPayload {
    #[serde(default)]
    users: Vec<UserRecord>,
}

#[derive(Deserialize)]
struct UserPayload {
    user: UserRecord,
}

#[derive(Deserialize)]
struct UserRefPayload {
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    user: Option<Value>,
}

#[derive(Deserialize)]
struct WorkPayload {
    work: WorkRecord,
}

#[derive(Deserialize)]
struct WorksPayload {
    #[serde(default)]
    works: Vec<WorkRecord>,
}

#[derive(Deserialize)]
struct PeersPayload {
    #[serde(default)]
    peers: Vec<NodeId>,
}

fn parse<T: serde::de::DeserializeOwned>(kind: &str, payload: &Value) -> Result<T, EnvelopeError> {
    T::deserialize(payload).map_err(|source| EnvelopeError::InvalidPayload {
        kind: kind.to_string(),
        source,
    })
}

fn to_value<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

impl Message {
    /// The wire `type` tag.
    pub fn kind(&self) -> &str {
        match self {
            Message::StateUpdate(_) => "state_update",
            Message::Message(_) => "message",
            Message::ErrorAdded(_) => "error_added",
            Message::ErrorResolved { .. } => "error_resolved",
            Message::Typing(_) => "typing",
            Message::SyncRequest => "sync_request",
            Message::UsersSync { .. } => "users_sync",
            Message::UserAdded(_) => "user_added",
            Message::UserRemoved { .. } => "user_removed",
            Message::UserUpdated(_) => "user_updated",
            Message::RequestUsersSync => "request_users_sync",
            Message::WorkUpdated(_) => "work_updated",
            Message::PeerDiscovery { .. } => "peer_discovery",
            Message::UserLogin(_) => "user_login",
            Message::RequestWorks => "request_works",
            Message::WorksList { .. } => "works_list",
            Message::Unknown(kind) => kind,
        }
    }

    /// Whether an accepted message of this kind is re-broadcast to other peers.
    ///
    /// Requests are answered directly; typing and login notices are one hop.
    pub fn is_propagated(&self) -> bool {
        matches!(
            self,
            Message::StateUpdate(_)
                | Message::Message(_)
                | Message::ErrorAdded(_)
                | Message::ErrorResolved { .. }
                | Message::UsersSync { .. }
                | Message::UserAdded(_)
                | Message::UserRemoved { .. }
                | Message::UserUpdated(_)
                | Message::WorkUpdated(_)
        )
    }

    fn from_parts(kind: &str, payload: &Value) -> Result<Self, EnvelopeError> {
        let message = match kind {
            "state_update" => Message::StateUpdate(parse(kind, payload)?),
            "message" => Message::Message(parse(kind, payload)?),
            "error_added" => Message::ErrorAdded(parse(kind, payload)?),
            "error_resolved" => {
                let p: ErrorResolvedPayload = parse(kind, payload)?;
                Message::ErrorResolved { error_id: p.error_id }
            }
            "typing" => Message::Typing(parse(kind, payload)?),
            "sync_request" => Message::SyncRequest,
            "users_sync" => {
                let p: UsersPayload = parse(kind, payload)?;
                Message::UsersSync { users: p.users }
            }
            "user_added" => Message::UserAdded(parse::<UserPayload>(kind, payload)?.user),
            "user_updated" => Message::UserUpdated(parse::<UserPayload>(kind, payload)?.user),
            "user_removed" => {
                let p: UserRefPayload = parse(kind, payload)?;
                let email = p
                    .email
                    .or_else(|| match p.user {
                        Some(Value::String(email)) => Some(email),
                        Some(Value::Object(user)) => user
                            .get("email")
                            .and_then(Value::as_str)
                            .map(str::to_string),
                        _ => None,
                    })
                    .unwrap_or_default();
                Message::UserRemoved { email }
            }
            "request_users_sync" => Message::RequestUsersSync,
            "work_updated" => Message::WorkUpdated(parse::<WorkPayload>(kind, payload)?.work),
            "peer_discovery" => {
                let p: PeersPayload = parse(kind, payload)?;
                Message::PeerDiscovery { peers: p.peers }
            }
            "user_login" => Message::UserLogin(parse(kind, payload)?),
            "request_works" => Message::RequestWorks,
            "works_list" => {
                let p: WorksPayload = parse(kind, payload)?;
                Message::WorksList { works: p.works }
            }
            other => Message::Unknown(other.to_string()),
        };
        Ok(message)
    }

    /// Build the JSON payload.
    ///
    /// Item payloads (chat messages, error reports, typing, login) carry only
    /// the item so every node stores byte-identical records. Wrapper payloads
    /// also carry `source` and `timestamp` for browser peers.
    fn to_payload(&self, source: &NodeId, timestamp: Timestamp) -> Value {
        let wrap = |mut body: Map<String, Value>| {
            body.insert("source".into(), json!(source));
            body.insert("timestamp".into(), json!(timestamp));
            Value::Object(body)
        };
        let single = |key: &str, value: Value| {
            let mut body = Map::new();
            body.insert(key.to_string(), value);
            body
        };

        match self {
            Message::StateUpdate(fragment) => match to_value(fragment) {
                Value::Object(body) => wrap(body),
                _ => wrap(Map::new()),
            },
            Message::Message(message) => to_value(message),
            Message::ErrorAdded(report) => to_value(report),
            Message::ErrorResolved { error_id } => wrap(single("errorId", json!(error_id))),
            Message::Typing(notice) => to_value(notice),
            Message::SyncRequest | Message::RequestUsersSync | Message::RequestWorks => {
                wrap(Map::new())
            }
            Message::UsersSync { users } => wrap(single("users", to_value(users))),
            Message::UserAdded(user) | Message::UserUpdated(user) => {
                wrap(single("user", to_value(user)))
            }
            Message::UserRemoved { email } => wrap(single("email", json!(email))),
            Message::WorkUpdated(work) => wrap(single("work", to_value(work))),
            Message::PeerDiscovery { peers } => wrap(single("peers", to_value(peers))),
            Message::UserLogin(user) => to_value(user),
            Message::WorksList { works } => wrap(single("works", to_value(works))),
            Message::Unknown(_) => Value::Null,
        }
    }
}
