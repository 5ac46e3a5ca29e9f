//! Node Identity
//!
//! Stable node addressing derived from a user-supplied identity string.
//! Any process that knows a user's e-mail can compute the exact id to dial,
//! so two devices of the same inspector find each other without a directory.

use serde::{Deserialize, Serialize};

/// Prefix used for peer addresses when none is configured.
pub const DEFAULT_PEER_PREFIX: &str = "oae";

/// Number of hex characters kept from the identity digest.
const ID_HEX_LEN: usize = 24;

/// Unique identifier for a node in the mesh.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Normalize an identity string before hashing or comparing.
///
/// E-mail addresses are case-insensitive for addressing purposes.
pub fn normalize_identity(identity: &str) -> String {
    identity.trim().to_lowercase()
}

/// Derive the node id for an identity.
///
/// Deterministic and one-way: the same identity always maps to the same
/// `"<prefix>-<digest>"` string, and the identity cannot be recovered from it.
pub fn derive_node_id(prefix: &str, identity: &str) -> NodeId {
    let digest = blake3::hash(normalize_identity(identity).as_bytes());
    let hex = hex::encode(digest.as_bytes());
    NodeId(format!("{}-{}", prefix, &hex[..ID_HEX_LEN]))
}

/// The local node: one running instance of the engine.
///
/// Created once at startup and immutable for the process lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub display_name: String,
    /// Normalized identity (e-mail) this node was derived from.
    pub identity: String,
}

impl Node {
    pub fn new(prefix: &str, identity: &str, display_name: impl Into<String>) -> Self {
        Self {
            id: derive_node_id(prefix, identity),
            display_name: display_name.into(),
            identity: normalize_identity(identity),
        }
    }

    /// Whether `identity` refers to the user running this node.
    pub fn is_identity(&self, identity: &str) -> bool {
        normalize_identity(identity) == self.identity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_is_deterministic() {
        let a = derive_node_id("oae", "inspector@example.com");
        let b = derive_node_id("oae", "inspector@example.com");
        assert_eq!(a, b);
    }

    #[test]
    fn test_derive_is_case_and_whitespace_insensitive() {
        let a = derive_node_id("oae", "Inspector@Example.com");
        let b = derive_node_id("oae", "  inspector@example.com ");
        assert_eq!(a, b);
    }

    #[test]
    fn test_derive_fixed_length() {
        let short = derive_node_id("oae", "a@b.c");
        let long = derive_node_id("oae", &"x".repeat(500));
        assert_eq!(short.as_str().len(), "oae-".len() + ID_HEX_LEN);
        assert_eq!(short.as_str().len(), long.as_str().len());
    }

    #[test]
    fn test_derive_distinct_identities() {
        let a = derive_node_id("oae", "a@example.com");
        let b = derive_node_id("oae", "b@example.com");
        assert_ne!(a, b);
    }

    #[test]
    fn test_derive_does_not_leak_identity() {
        let id = derive_node_id("oae", "inspector@example.com");
        assert!(!id.as_str().contains("inspector"));
        assert!(id.as_str().starts_with("oae-"));
    }

    #[test]
    fn test_node_is_identity() {
        let node = Node::new("oae", "Inspector@Example.com", "Inspector");
        assert!(node.is_identity("inspector@example.com"));
        assert!(node.is_identity("INSPECTOR@EXAMPLE.COM"));
        assert!(!node.is_identity("other@example.com"));
        assert_eq!(node.id, derive_node_id("oae", "inspector@example.com"));
    }

    #[test]
    fn test_node_id_display_and_from() {
        let id: NodeId = "oae-abc".into();
        assert_eq!(id.as_str(), "oae-abc");
        assert_eq!(format!("{}", id), "oae-abc");
        let owned: NodeId = String::from("oae-def").into();
        assert_eq!(owned.as_str(), "oae-def");
    }

    #[test]
    fn test_node_id_serializes_as_plain_string() {
        let id = NodeId::new("oae-abc");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"oae-abc\"");
    }
}
