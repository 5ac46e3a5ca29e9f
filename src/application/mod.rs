//! Application Layer
//!
//! Services that own application state and use the domain ports.

mod document_service;

pub use document_service::DocumentService;
