//! inspection-sync Library
//!
//! Peer-to-peer state synchronization for bridge-inspection workstations.
//! Exposes the mesh components for the node binary, integration tests and
//! embedding applications.

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

pub mod adapters;
pub mod application;
pub mod config;
pub mod domain;
pub mod infrastructure;
pub mod replication;

// Re-export commonly used types
pub use application::DocumentService;
pub use config::{load_config, Config};
pub use domain::entities::{SharedDocument, UserRecord, WorkRecord};
pub use domain::identity::{derive_node_id, Node, NodeId};
pub use domain::ports::{PersistentStore, Transport};
pub use domain::services::MergeEngine;
pub use replication::{MeshConfig, MeshEvent, MeshNode};
