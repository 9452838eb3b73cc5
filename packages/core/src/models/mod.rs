//! Data Models
//!
//! This module contains the data structures shared by every layer of the engine:
//!
//! - `Identifier` / `ReferenceKey` - canonical record addressing
//! - `EntityModel` - read-only entity metadata (attributes, relationships, inheritance)
//! - `RawValue` / `AttributeValue` / `NodeValues` - wire values and typed values
//! - `CacheNode` - the versioned cache record
//! - `FetchRequest` / `ChangeSet` - request descriptors from the graph framework

mod identifier;
mod node;
mod request;
mod schema;
mod value;

pub use identifier::{Identifier, ReferenceKey};
pub use node::CacheNode;
pub use request::{ChangeSet, ChangedObject, FetchRequest, NewObject};
pub use schema::{
    AttributeField, AttributeKind, EntityModel, EntitySchema, RelationshipCardinality,
    RelationshipField,
};
pub use value::{
    raw_record, AttributeMap, AttributeValue, NodeValues, RawRecord, RawValue, RelatedRef,
    RelationshipValue,
};
