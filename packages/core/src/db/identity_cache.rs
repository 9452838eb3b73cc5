//! Identity Cache
//!
//! Thread-safe map from [`ReferenceKey`] to [`CacheNode`]: the single source of
//! truth for "do we already know this object".
//!
//! # Architecture
//!
//! - **One node per identifier**: a record cached under a concrete entity is
//!   registered under every entity of its inheritance chain. All aliases hold
//!   the same `Arc<CacheNode>`, so a supertype lookup and a subtype lookup return
//!   the identical node.
//! - **Copy-on-write nodes**: merges build a new node and swap every alias in a
//!   single critical section. Readers keep whatever `Arc` they already hold.
//! - **Serialization domain**: all state sits behind one `tokio::sync::RwLock`
//!   per cache instance. No method performs I/O while holding it.
//! - **Tombstones**: identifiers whose delete is in flight are recorded against
//!   their base entity; fetched values for them are discarded.
//!
//! # Version Gate
//!
//! `apply_fetched_values` only merges when the incoming version is strictly
//! greater than the cached one, which makes re-applying a response a no-op.

use crate::db::{StoreError, StoreResult};
use crate::models::{
    CacheNode, EntityModel, Identifier, NodeValues, ReferenceKey, RelationshipValue,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Result of merging fetched values into the cache
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// No node existed; one was created
    Inserted,
    /// Values merged and version bumped
    Updated,
    /// Incoming version was not newer; nothing changed
    Unchanged,
    /// Record has a delete in flight; values dropped
    Discarded,
}

impl MergeOutcome {
    pub fn changed(&self) -> bool {
        matches!(self, MergeOutcome::Inserted | MergeOutcome::Updated)
    }
}

/// Snapshot of cache occupancy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Index entries, aliases included
    pub keys: usize,
    /// Distinct nodes
    pub nodes: usize,
    /// Distinct nodes still at version 0
    pub placeholders: usize,
    /// Records with a delete in flight
    pub tombstones: usize,
}

#[derive(Default)]
struct CacheState {
    nodes: HashMap<ReferenceKey, Arc<CacheNode>>,
    deleting: HashSet<ReferenceKey>,
}

/// Identity map of cached records for one store instance
pub struct IdentityCache {
    model: Arc<EntityModel>,
    state: RwLock<CacheState>,
}

impl IdentityCache {
    pub fn new(model: Arc<EntityModel>) -> Self {
        Self {
            model,
            state: RwLock::new(CacheState::default()),
        }
    }

    pub fn model(&self) -> &Arc<EntityModel> {
        &self.model
    }

    /// Exact-key lookup; never performs I/O
    pub async fn lookup(&self, entity: &str, identifier: &Identifier) -> Option<Arc<CacheNode>> {
        let state = self.state.read().await;
        state
            .nodes
            .get(&ReferenceKey::new(entity, identifier.clone()))
            .cloned()
    }

    /// Return the cached node, creating a version-0 placeholder if absent
    ///
    /// A placeholder already cached under an ancestor entity is retyped to the
    /// more derived `entity` instead of creating a second node. While a delete
    /// is in flight the placeholder is returned without being cached.
    pub async fn insert_placeholder(
        &self,
        entity: &str,
        identifier: &Identifier,
    ) -> StoreResult<Arc<CacheNode>> {
        self.model.entity(entity)?;

        let mut state = self.state.write().await;
        if state.deleting.contains(&self.tombstone_key(entity, identifier)) {
            return Ok(Arc::new(CacheNode::placeholder(entity, identifier.clone())));
        }
        if let Some(existing) = self.find_existing(&state, entity, identifier) {
            if existing.entity() != entity && self.model.is_kind_of(entity, existing.entity()) {
                let promoted = Arc::new(existing.promoted(entity));
                self.bind(&mut state, promoted.clone());
                return Ok(promoted);
            }
            return Ok(existing);
        }

        let node = Arc::new(CacheNode::placeholder(entity, identifier.clone()));
        self.bind(&mut state, node.clone());
        debug!("Cached placeholder {}", node.reference_key());
        Ok(node)
    }

    /// Merge values that arrived from the remote source
    ///
    /// Creates the node when absent; otherwise merges only when `version` is
    /// strictly greater than the cached version. Records with a delete in
    /// flight are discarded.
    pub async fn apply_fetched_values(
        &self,
        entity: &str,
        identifier: &Identifier,
        values: NodeValues,
        version: u64,
    ) -> StoreResult<MergeOutcome> {
        self.model.entity(entity)?;
        let version = version.max(1);

        let mut state = self.state.write().await;
        if state.deleting.contains(&self.tombstone_key(entity, identifier)) {
            debug!(
                "Discarding fetched values for {}://{} (delete in flight)",
                entity, identifier
            );
            return Ok(MergeOutcome::Discarded);
        }

        match self.find_existing(&state, entity, identifier) {
            None => {
                let node = Arc::new(CacheNode::with_values(
                    entity,
                    identifier.clone(),
                    values,
                    version,
                ));
                debug!("Cached {} at version {}", node.reference_key(), version);
                self.bind(&mut state, node);
                Ok(MergeOutcome::Inserted)
            }
            Some(existing) if version > existing.version() => {
                let target = self.more_derived(existing.entity(), entity);
                let node = Arc::new(existing.merged(&target, &values, version));
                debug!(
                    "Merged {} version {} -> {}",
                    node.reference_key(),
                    existing.version(),
                    version
                );
                self.bind(&mut state, node);
                Ok(MergeOutcome::Updated)
            }
            Some(_) => Ok(MergeOutcome::Unchanged),
        }
    }

    /// Echo locally saved changes into the cache
    ///
    /// Absent records are cached at version 1; existing records merge the
    /// changes at `version + 1`. Changes are checked against the entity model
    /// first. Returns `None`, caching nothing, while a delete is in flight.
    pub async fn apply_local_changes(
        &self,
        entity: &str,
        identifier: &Identifier,
        changes: &NodeValues,
    ) -> StoreResult<Option<Arc<CacheNode>>> {
        self.check_changes(entity, changes)?;

        let mut state = self.state.write().await;
        if state.deleting.contains(&self.tombstone_key(entity, identifier)) {
            debug!(
                "Skipping local echo for {}://{} (delete in flight)",
                entity, identifier
            );
            return Ok(None);
        }
        let node = match self.find_existing(&state, entity, identifier) {
            None => Arc::new(CacheNode::with_values(
                entity,
                identifier.clone(),
                changes.clone(),
                1,
            )),
            Some(existing) => {
                let target = self.more_derived(existing.entity(), entity);
                Arc::new(existing.merged(&target, changes, existing.version() + 1))
            }
        };
        self.bind(&mut state, node.clone());
        Ok(Some(node))
    }

    /// Reject attributes and relationships the entity does not declare, and
    /// values that do not fit the declared kind or cardinality
    pub fn check_changes(&self, entity: &str, changes: &NodeValues) -> StoreResult<()> {
        self.model.entity(entity)?;

        for (name, value) in &changes.attributes {
            let field = self.model.attribute(entity, name).ok_or_else(|| {
                StoreError::invalid_request(format!("{} has no attribute '{}'", entity, name))
            })?;
            if !value.fits(field.kind) {
                return Err(StoreError::invalid_value_type(entity, name, value));
            }
        }

        for (name, value) in &changes.relationships {
            let field = self.model.relationship(entity, name).ok_or_else(|| {
                StoreError::invalid_request(format!("{} has no relationship '{}'", entity, name))
            })?;
            if field.is_to_many() != matches!(value, RelationshipValue::ToMany(_)) {
                return Err(StoreError::invalid_value_type(entity, name, value));
            }
        }
        Ok(())
    }

    /// Reset a cached record to version 0, keeping its stale values
    ///
    /// Returns `false` when nothing is cached under the key.
    pub async fn invalidate(&self, entity: &str, identifier: &Identifier) -> bool {
        let mut state = self.state.write().await;
        let key = ReferenceKey::new(entity, identifier.clone());
        match state.nodes.get(&key).cloned() {
            Some(existing) => {
                self.bind(&mut state, Arc::new(existing.invalidated()));
                debug!("Invalidated {}", key);
                true
            }
            None => false,
        }
    }

    /// Remove a record and every alias of it
    ///
    /// Returns the removed keys (empty when nothing was cached).
    pub async fn evict(&self, entity: &str, identifier: &Identifier) -> Vec<ReferenceKey> {
        let mut state = self.state.write().await;
        let key = ReferenceKey::new(entity, identifier.clone());

        let concrete = match state.nodes.get(&key) {
            Some(node) => node.entity().to_string(),
            None => return Vec::new(),
        };

        let removed: Vec<ReferenceKey> = self
            .model
            .entity_chain(&concrete)
            .into_iter()
            .map(|name| ReferenceKey::new(name, identifier.clone()))
            .filter(|alias| state.nodes.remove(alias).is_some())
            .collect();

        debug!("Evicted {} ({} keys)", key, removed.len());
        removed
    }

    /// Record that a delete for this record is in flight
    pub async fn mark_deleting(&self, entity: &str, identifier: &Identifier) {
        let key = self.tombstone_key(entity, identifier);
        self.state.write().await.deleting.insert(key);
    }

    pub async fn is_deleting(&self, entity: &str, identifier: &Identifier) -> bool {
        let key = self.tombstone_key(entity, identifier);
        self.state.read().await.deleting.contains(&key)
    }

    /// Drop the tombstone, e.g. after the delete failed or was cancelled
    pub async fn clear_deleting(&self, entity: &str, identifier: &Identifier) -> bool {
        let key = self.tombstone_key(entity, identifier);
        self.state.write().await.deleting.remove(&key)
    }

    pub async fn stats(&self) -> CacheStats {
        let state = self.state.read().await;
        let mut stats = CacheStats {
            keys: state.nodes.len(),
            tombstones: state.deleting.len(),
            ..CacheStats::default()
        };
        for (key, node) in &state.nodes {
            if key.entity == node.entity() {
                stats.nodes += 1;
                if node.is_placeholder() {
                    stats.placeholders += 1;
                }
            }
        }
        stats
    }

    pub async fn len(&self) -> usize {
        self.stats().await.nodes
    }

    pub async fn is_empty(&self) -> bool {
        self.state.read().await.nodes.is_empty()
    }

    /// Find the node for `identifier` at `entity` or any of its ancestors
    fn find_existing(
        &self,
        state: &CacheState,
        entity: &str,
        identifier: &Identifier,
    ) -> Option<Arc<CacheNode>> {
        self.model.entity_chain(entity).into_iter().find_map(|name| {
            state
                .nodes
                .get(&ReferenceKey::new(name, identifier.clone()))
                .cloned()
        })
    }

    /// Register `node` under every entity of its chain, replacing older aliases
    fn bind(&self, state: &mut CacheState, node: Arc<CacheNode>) {
        for name in self.model.entity_chain(node.entity()) {
            state.nodes.insert(
                ReferenceKey::new(name, node.identifier().clone()),
                node.clone(),
            );
        }
    }

    fn more_derived(&self, current: &str, incoming: &str) -> String {
        if self.model.is_kind_of(incoming, current) {
            incoming.to_string()
        } else {
            current.to_string()
        }
    }

    fn tombstone_key(&self, entity: &str, identifier: &Identifier) -> ReferenceKey {
        ReferenceKey::new(self.model.base_entity(entity), identifier.clone())
    }
}

impl std::fmt::Debug for IdentityCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityCache").finish_non_exhaustive()
    }
}
