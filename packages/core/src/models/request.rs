//! Request Descriptors
//!
//! Fetch and save descriptors handed to the engine by the graph framework.
//! Predicate, sort, limit and offset are opaque pass-through values for the
//! remote collaborator; the engine only interprets the entity, the explicit
//! identifier list and the relationship prefetch key paths.

use super::identifier::Identifier;
use super::schema::EntityModel;
use super::value::NodeValues;
use crate::db::{StoreError, StoreResult};
use serde::{Deserialize, Serialize};

/// Fetch descriptor
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchRequest {
    /// Nominal entity; results may be instances of any subentity
    pub entity: String,

    /// Explicit identifiers to fetch (empty = whatever the predicate selects)
    #[serde(default)]
    pub identifiers: Vec<Identifier>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub predicate: Option<serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort: Option<serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<usize>,

    /// Relationship key paths to expand into nested parsing, e.g. `"lines.taxes"`
    #[serde(default)]
    pub prefetch: Vec<String>,
}

impl FetchRequest {
    pub fn new(entity: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            ..Default::default()
        }
    }

    /// Batched fetch of specific records by identifier
    pub fn for_identifiers(entity: impl Into<String>, identifiers: Vec<Identifier>) -> Self {
        Self {
            entity: entity.into(),
            identifiers,
            ..Default::default()
        }
    }

    pub fn with_predicate(mut self, predicate: serde_json::Value) -> Self {
        self.predicate = Some(predicate);
        self
    }

    pub fn with_sort(mut self, sort: serde_json::Value) -> Self {
        self.sort = Some(sort);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn with_prefetch(mut self, path: impl Into<String>) -> Self {
        self.prefetch.push(path.into());
        self
    }

    /// Validate the descriptor against the entity model
    ///
    /// Every prefetch path segment must name a relationship reachable from the
    /// previous segment's destination.
    pub fn validate(&self, model: &EntityModel) -> StoreResult<()> {
        model.entity(&self.entity)?;

        if self.limit == Some(0) {
            return Err(StoreError::invalid_request("fetch limit must be positive"));
        }

        for path in &self.prefetch {
            let mut entity = self.entity.clone();
            for segment in path.split('.') {
                if segment.is_empty() {
                    return Err(StoreError::invalid_request(format!(
                        "empty segment in prefetch path '{}'",
                        path
                    )));
                }
                let rel = model.relationship(&entity, segment).ok_or_else(|| {
                    StoreError::invalid_request(format!(
                        "prefetch path '{}': {} has no relationship '{}'",
                        path, entity, segment
                    ))
                })?;
                entity = rel.destination.clone();
            }
        }

        Ok(())
    }
}

/// A pending change to one object, as captured by the graph framework
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangedObject {
    pub entity: String,
    pub identifier: Identifier,

    /// Changed values only (empty for deletes)
    #[serde(default)]
    pub changes: NodeValues,
}

impl ChangedObject {
    pub fn new(entity: impl Into<String>, identifier: Identifier, changes: NodeValues) -> Self {
        Self {
            entity: entity.into(),
            identifier,
            changes,
        }
    }

    pub fn deleted(entity: impl Into<String>, identifier: Identifier) -> Self {
        Self::new(entity, identifier, NodeValues::default())
    }
}

/// The graph framework's pending change set for one save
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeSet {
    #[serde(default)]
    pub inserted: Vec<ChangedObject>,
    #[serde(default)]
    pub updated: Vec<ChangedObject>,
    #[serde(default)]
    pub deleted: Vec<ChangedObject>,
}

impl ChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(mut self, object: ChangedObject) -> Self {
        self.inserted.push(object);
        self
    }

    pub fn update(mut self, object: ChangedObject) -> Self {
        self.updated.push(object);
        self
    }

    pub fn delete(mut self, entity: impl Into<String>, identifier: Identifier) -> Self {
        self.deleted.push(ChangedObject::deleted(entity, identifier));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.inserted.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inserted.len() + self.updated.len() + self.deleted.len()
    }
}

/// A newly created object that still needs a stable identifier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewObject {
    pub entity: String,
    #[serde(default)]
    pub values: NodeValues,
}

impl NewObject {
    pub fn new(entity: impl Into<String>, values: NodeValues) -> Self {
        Self {
            entity: entity.into(),
            values,
        }
    }
}
