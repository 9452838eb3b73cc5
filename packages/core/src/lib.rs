//! MirrorStore Core
//!
//! This crate keeps a local, in-memory mirror of records held by a remote data
//! source and resolves the relationships between them on demand.
//!
//! # Architecture
//!
//! - **Identity cache**: one shared node per record, aliased under every entity
//!   in its inheritance chain and guarded by a version gate
//! - **Response parsing**: raw payloads are coerced into typed attribute and
//!   relationship values, with nested prefetched records merged along the way
//! - **Relationship resolution**: missing destinations are faulted in with one
//!   batched fetch per relationship
//! - **Write-back**: saves are echoed locally, then executed as a dependency
//!   ordered, bounded-concurrency pipeline of remote requests
//!
//! # Modules
//!
//! - [`models`] - Entity model, identifiers, values and cache nodes
//! - [`db`] - Identity cache, remote delegate seam, errors and events
//! - [`services`] - Parser, relationship resolver and the `MirrorStore` facade
//! - [`operations`] - Save planning and the write-back scheduler
//! - [`config`] - Store configuration

pub mod config;
pub mod db;
pub mod models;
pub mod operations;
pub mod services;

// Re-export commonly used types
pub use config::{ConnectionMode, StoreConfig};
pub use db::{RemoteDelegate, RemoteRequest, StoreError, StoreEvent, StoreResult};
pub use models::*;
pub use services::MirrorStore;
