//! Cache Node
//!
//! A [`CacheNode`] is the single cached record for one identifier. Nodes are
//! immutable once built: every mutation (merge, invalidation, promotion to a
//! more derived entity) produces a fresh node that the identity cache swaps in
//! atomically under its lock. Readers holding an `Arc<CacheNode>` therefore
//! never observe a half-merged record.
//!
//! # Versions
//!
//! - `0` - placeholder: referenced but never fetched (or invalidated)
//! - `1` - first real values
//! - `> 1` - every accepted update bumps the version
//!
//! # Examples
//!
//! ```rust
//! use mirrorstore_core::models::{CacheNode, Identifier, NodeValues};
//!
//! let id = Identifier::parse("a1").unwrap();
//! let placeholder = CacheNode::placeholder("Document", id.clone());
//! assert!(placeholder.is_placeholder());
//!
//! let node = CacheNode::with_values(
//!     "Document",
//!     id,
//!     NodeValues::new().with_attribute("name", "Quote 12"),
//!     1,
//! );
//! assert_eq!(node.version(), 1);
//! assert_eq!(node.reference_key().to_string(), "Document://A1");
//! ```

use super::identifier::{Identifier, ReferenceKey};
use super::schema::EntityModel;
use super::value::{AttributeMap, NodeValues, RelationshipValue};
use std::sync::OnceLock;

/// Versioned cache record for one `(entity, identifier)` pair
#[derive(Debug)]
pub struct CacheNode {
    identifier: Identifier,
    entity: String,
    values: NodeValues,
    version: u64,
    projection: OnceLock<AttributeMap>,
}

impl CacheNode {
    /// Create a version-0 placeholder with no values
    pub fn placeholder(entity: impl Into<String>, identifier: Identifier) -> Self {
        Self::with_values(entity, identifier, NodeValues::default(), 0)
    }

    /// Create a node holding real values
    pub fn with_values(
        entity: impl Into<String>,
        identifier: Identifier,
        values: NodeValues,
        version: u64,
    ) -> Self {
        Self {
            identifier,
            entity: entity.into(),
            values,
            version,
            projection: OnceLock::new(),
        }
    }

    pub fn identifier(&self) -> &Identifier {
        &self.identifier
    }

    /// Concrete (most derived known) entity of the record
    pub fn entity(&self) -> &str {
        &self.entity
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn is_placeholder(&self) -> bool {
        self.version == 0
    }

    pub fn reference_key(&self) -> ReferenceKey {
        ReferenceKey::new(self.entity.clone(), self.identifier.clone())
    }

    /// Raw stored values (attributes and relationship references)
    pub fn values(&self) -> &NodeValues {
        &self.values
    }

    pub fn relationship_value(&self, name: &str) -> Option<&RelationshipValue> {
        self.values.relationships.get(name)
    }

    /// Typed projection: the attributes the concrete entity declares
    ///
    /// Computed on first access and cached for the lifetime of this node value.
    /// Keys never stored are absent; explicitly nulled keys are present as null.
    pub fn attribute_values(&self, model: &EntityModel) -> &AttributeMap {
        self.projection.get_or_init(|| {
            model
                .attributes(&self.entity)
                .into_iter()
                .filter_map(|field| {
                    self.values
                        .attributes
                        .get(&field.name)
                        .map(|value| (field.name.clone(), value.clone()))
                })
                .collect()
        })
    }

    /// New node with `incoming` merged over the current values
    pub(crate) fn merged(&self, entity: &str, incoming: &NodeValues, version: u64) -> Self {
        let mut values = self.values.clone();
        values.merge(incoming);
        Self::with_values(entity, self.identifier.clone(), values, version)
    }

    /// New node reset to version 0, keeping the stale values
    pub(crate) fn invalidated(&self) -> Self {
        Self::with_values(
            self.entity.clone(),
            self.identifier.clone(),
            self.values.clone(),
            0,
        )
    }

    /// New node retyped to a more derived entity, values and version kept
    pub(crate) fn promoted(&self, entity: &str) -> Self {
        Self::with_values(entity, self.identifier.clone(), self.values.clone(), self.version)
    }
}
