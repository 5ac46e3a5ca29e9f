//! Infrastructure Layer
//!
//! Cross-cutting concerns shared by the mesh and the node API.

pub mod shutdown;

pub use shutdown::{shutdown_signal, ShutdownController, TaskGuard};
