//! Adapters Layer
//!
//! Inbound adapters drive the node (HTTP API); outbound adapters implement
//! the domain ports (transports, stores).

pub mod inbound;
pub mod outbound;
