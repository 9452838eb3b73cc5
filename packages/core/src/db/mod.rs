//! Cache Layer
//!
//! This module holds the in-memory state of a mirror store and the seam to the
//! remote data source:
//!
//! - Identity cache: one authoritative node per identifier, aliased across the
//!   inheritance chain
//! - Store events broadcast to the owning graph framework
//! - Remote collaborator traits (request factory and executable requests)
//! - The shared error taxonomy
//!
//! # Architecture
//!
//! Nothing in this layer is persisted: the cache is rebuilt from the remote
//! source on demand. The remote source is the source of truth and the cache
//! mirrors it.

mod error;
pub mod events;
mod identity_cache;
mod remote;

pub use error::{StoreError, StoreResult};
pub use events::StoreEvent;
pub use identity_cache::{CacheStats, IdentityCache, MergeOutcome};
pub use remote::{OutboundRequest, RemoteDelegate, RemoteRequest, IDENTIFIER_KEY, VERSION_KEY};
