//! Entity Metadata
//!
//! This module contains the read-only description of the object graph that the
//! engine mirrors: entity names, attribute kinds, relationship cardinality and
//! destination, and the single-inheritance superentity chain.
//!
//! The model is supplied by the graph framework and never mutated by the engine.
//! It is serde-deserialisable so it can be loaded from configuration.
//!
//! ## Example Model
//!
//! ```json
//! [
//!   {
//!     "name": "Document",
//!     "table": "documents",
//!     "attributes": [
//!       { "name": "number", "type": "string" },
//!       { "name": "issuedAt", "type": "date" }
//!     ],
//!     "relationships": [
//!       { "name": "lines", "destination": "Line", "cardinality": "many" }
//!     ]
//!   },
//!   {
//!     "name": "Invoice",
//!     "superentity": "Document",
//!     "attributes": [ { "name": "total", "type": "decimal" } ]
//!   },
//!   {
//!     "name": "Line",
//!     "attributes": [ { "name": "quantity", "type": "integer32" } ],
//!     "relationships": [
//!       { "name": "document", "destination": "Document", "cardinality": "one" }
//!     ]
//!   }
//! ]
//! ```

use crate::db::{StoreError, StoreResult};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Declared kind of an attribute
///
/// Drives value coercion at the parser boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AttributeKind {
    String,
    Boolean,
    Integer16,
    Integer32,
    Integer64,
    Decimal,
    Double,
    Float,
    Date,
    Uuid,
    /// Structured/opaque value (arbitrary JSON)
    Transformable,
}

impl AttributeKind {
    /// Whether wire values for this kind must be number-shaped
    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            AttributeKind::Boolean
                | AttributeKind::Integer16
                | AttributeKind::Integer32
                | AttributeKind::Integer64
                | AttributeKind::Decimal
                | AttributeKind::Double
                | AttributeKind::Float
        )
    }
}

/// Relationship cardinality from the source entity's perspective
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelationshipCardinality {
    One,
    Many,
}

/// Definition of a single attribute
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeField {
    /// Attribute name (also the wire key)
    pub name: String,

    /// Declared kind
    #[serde(rename = "type")]
    pub kind: AttributeKind,
}

/// Definition of a single relationship
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationshipField {
    /// Relationship name (also the wire key)
    pub name: String,

    /// Destination entity name
    pub destination: String,

    /// To-one or to-many
    pub cardinality: RelationshipCardinality,

    /// Inverse relationship name on the destination, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inverse: Option<String>,
}

impl RelationshipField {
    pub fn is_to_many(&self) -> bool {
        self.cardinality == RelationshipCardinality::Many
    }
}

/// Complete description of one entity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitySchema {
    /// Entity name (unique within the model)
    pub name: String,

    /// Direct parent entity in the inheritance hierarchy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub superentity: Option<String>,

    /// Remote table/collection the entity is written to
    ///
    /// Only meaningful on a base entity; subentities write to their base
    /// entity's table.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,

    /// Attributes declared directly on this entity (not inherited ones)
    #[serde(default)]
    pub attributes: Vec<AttributeField>,

    /// Relationships declared directly on this entity (not inherited ones)
    #[serde(default)]
    pub relationships: Vec<RelationshipField>,
}

impl EntitySchema {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            superentity: None,
            table: None,
            attributes: Vec::new(),
            relationships: Vec::new(),
        }
    }

    pub fn with_superentity(mut self, superentity: impl Into<String>) -> Self {
        self.superentity = Some(superentity.into());
        self
    }

    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    pub fn with_attribute(mut self, name: impl Into<String>, kind: AttributeKind) -> Self {
        self.attributes.push(AttributeField {
            name: name.into(),
            kind,
        });
        self
    }

    pub fn with_to_one(mut self, name: impl Into<String>, destination: impl Into<String>) -> Self {
        self.relationships.push(RelationshipField {
            name: name.into(),
            destination: destination.into(),
            cardinality: RelationshipCardinality::One,
            inverse: None,
        });
        self
    }

    pub fn with_to_many(mut self, name: impl Into<String>, destination: impl Into<String>) -> Self {
        self.relationships.push(RelationshipField {
            name: name.into(),
            destination: destination.into(),
            cardinality: RelationshipCardinality::Many,
            inverse: None,
        });
        self
    }
}

/// The full entity model consumed by the engine
///
/// Validated on construction: every superentity and relationship destination
/// must exist and the inheritance graph must be acyclic, so chain walks always
/// terminate.
#[derive(Debug, Clone, Default)]
pub struct EntityModel {
    entities: HashMap<String, EntitySchema>,
}

impl EntityModel {
    /// Build and validate a model
    pub fn new(entities: impl IntoIterator<Item = EntitySchema>) -> StoreResult<Self> {
        let mut map = HashMap::new();
        for entity in entities {
            if entity.name.is_empty() {
                return Err(StoreError::invalid_request("entity name cannot be empty"));
            }
            if map.insert(entity.name.clone(), entity).is_some() {
                return Err(StoreError::invalid_request("duplicate entity name in model"));
            }
        }

        let model = Self { entities: map };
        model.validate()?;
        Ok(model)
    }

    /// Load a model from its JSON representation (an array of entities)
    pub fn from_json(value: serde_json::Value) -> StoreResult<Self> {
        let entities: Vec<EntitySchema> = serde_json::from_value(value)
            .map_err(|e| StoreError::invalid_request(format!("invalid entity model: {}", e)))?;
        Self::new(entities)
    }

    fn validate(&self) -> StoreResult<()> {
        for entity in self.entities.values() {
            if let Some(parent) = &entity.superentity {
                if !self.entities.contains_key(parent) {
                    return Err(StoreError::unknown_entity(parent));
                }
            }
            for rel in &entity.relationships {
                if !self.entities.contains_key(&rel.destination) {
                    return Err(StoreError::unknown_entity(&rel.destination));
                }
            }

            let mut seen = HashSet::new();
            let mut current = Some(entity.name.as_str());
            while let Some(name) = current {
                if !seen.insert(name) {
                    return Err(StoreError::invalid_request(format!(
                        "inheritance cycle through entity '{}'",
                        name
                    )));
                }
                current = self
                    .entities
                    .get(name)
                    .and_then(|e| e.superentity.as_deref());
            }
        }
        Ok(())
    }

    /// Look up an entity by name
    pub fn entity(&self, name: &str) -> StoreResult<&EntitySchema> {
        self.entities
            .get(name)
            .ok_or_else(|| StoreError::unknown_entity(name))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entities.contains_key(name)
    }

    /// The entity followed by every ancestor, nearest first
    ///
    /// Returns an empty chain for unknown entities.
    pub fn entity_chain(&self, name: &str) -> Vec<&str> {
        let mut chain = Vec::new();
        let mut current = self.entities.get(name);
        while let Some(entity) = current {
            chain.push(entity.name.as_str());
            current = entity
                .superentity
                .as_deref()
                .and_then(|parent| self.entities.get(parent));
        }
        chain
    }

    /// Ancestors of an entity, nearest first (excluding the entity itself)
    pub fn ancestors(&self, name: &str) -> Vec<&str> {
        self.entity_chain(name).into_iter().skip(1).collect()
    }

    /// Whether `entity` is `ancestor` or one of its descendants
    pub fn is_kind_of(&self, entity: &str, ancestor: &str) -> bool {
        self.entity_chain(entity).contains(&ancestor)
    }

    /// Root of the entity's inheritance chain
    pub fn base_entity<'a>(&'a self, name: &'a str) -> &'a str {
        self.entity_chain(name).last().copied().unwrap_or(name)
    }

    /// Remote table the entity is written to
    pub fn table_name(&self, name: &str) -> String {
        let base = self.base_entity(name);
        self.entities
            .get(base)
            .and_then(|e| e.table.clone())
            .unwrap_or_else(|| base.to_string())
    }

    /// Find an attribute declared on the entity or inherited from an ancestor
    pub fn attribute(&self, entity: &str, name: &str) -> Option<&AttributeField> {
        self.attributes(entity).into_iter().find(|a| a.name == name)
    }

    /// Find a relationship declared on the entity or inherited from an ancestor
    pub fn relationship(&self, entity: &str, name: &str) -> Option<&RelationshipField> {
        self.relationships(entity)
            .into_iter()
            .find(|r| r.name == name)
    }

    /// All attributes of an entity, including inherited ones
    ///
    /// A subentity redeclaring an inherited name shadows the ancestor's field.
    pub fn attributes(&self, entity: &str) -> Vec<&AttributeField> {
        let mut seen = HashSet::new();
        let mut fields = Vec::new();
        for name in self.entity_chain(entity) {
            if let Some(schema) = self.entities.get(name) {
                for field in &schema.attributes {
                    if seen.insert(field.name.as_str()) {
                        fields.push(field);
                    }
                }
            }
        }
        fields
    }

    /// All relationships of an entity, including inherited ones
    pub fn relationships(&self, entity: &str) -> Vec<&RelationshipField> {
        let mut seen = HashSet::new();
        let mut fields = Vec::new();
        for name in self.entity_chain(entity) {
            if let Some(schema) = self.entities.get(name) {
                for field in &schema.relationships {
                    if seen.insert(field.name.as_str()) {
                        fields.push(field);
                    }
                }
            }
        }
        fields
    }

    /// Iterate over every entity in the model
    pub fn entities(&self) -> impl Iterator<Item = &EntitySchema> {
        self.entities.values()
    }
}
