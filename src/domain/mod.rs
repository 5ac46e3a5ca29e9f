//! Domain Layer
//!
//! Identity, the synchronized document model, merge policies and the ports
//! through which the mesh reaches storage and the network.

pub mod entities;
pub mod identity;
pub mod ports;
pub mod services;
