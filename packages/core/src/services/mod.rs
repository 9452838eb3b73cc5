//! Engine Services
//!
//! This module contains the read-side logic and the public entry point:
//!
//! - `ResponseParser` - raw record parsing, value coercion and cache merge
//! - `RelationshipResolver` - relationship reads with batched fault fetching
//! - `MirrorStore` - facade tying the cache, resolver and write-back together
//!
//! Services coordinate between the identity cache and the remote delegate;
//! none of them speaks a transport protocol.

pub mod mirror_store;
pub mod parser;
pub mod relationship_resolver;

pub use mirror_store::MirrorStore;
pub use parser::{
    coerce_attribute, MergeReport, ParsedRecord, PrefetchTree, RejectedItem, ResponseParser,
};
pub use relationship_resolver::{RelationshipResolver, Resolution};
