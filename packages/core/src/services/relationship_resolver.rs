//! Relationship Resolution
//!
//! Turns the references stored in a node's relationship into destination
//! identifiers, faulting in every destination that is not cached yet (or is
//! still a placeholder) with a single batched fetch.
//!
//! # Failure Semantics
//!
//! - Unresolvable to-one reference: [`StoreError::DanglingRelationshipReference`]
//! - Unresolvable to-many entry: logged and left out of the result
//! - Materialised object references are used as-is, without fetching

use crate::db::{IdentityCache, RemoteDelegate, StoreError, StoreResult};
use crate::models::{CacheNode, FetchRequest, Identifier, RelatedRef, RelationshipField};
use crate::services::parser::{MergeReport, PrefetchTree, ResponseParser};
use std::collections::HashSet;
use tracing::{debug, warn};

/// Result of resolving one relationship
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resolution {
    /// Resolved destination identifiers in stored order
    pub identifiers: Vec<Identifier>,
    /// To-many entries that could not be resolved even after fetching
    pub dangling: Vec<Identifier>,
    /// Number of remote fetches issued (0 or 1)
    pub fetches: usize,
    /// Cache changes caused by the fault fetch
    pub report: MergeReport,
}

/// Resolves relationships through the identity cache
pub struct RelationshipResolver<'a> {
    cache: &'a IdentityCache,
    delegate: Option<&'a dyn RemoteDelegate>,
    entity_key: &'a str,
}

impl<'a> RelationshipResolver<'a> {
    pub fn new(
        cache: &'a IdentityCache,
        delegate: Option<&'a dyn RemoteDelegate>,
        entity_key: &'a str,
    ) -> Self {
        Self {
            cache,
            delegate,
            entity_key,
        }
    }

    /// Resolve `relationship` of `node` to destination identifiers
    pub async fn resolve(
        &self,
        node: &CacheNode,
        relationship: &RelationshipField,
    ) -> StoreResult<Resolution> {
        let Some(value) = node.relationship_value(&relationship.name) else {
            return Ok(Resolution::default());
        };
        let refs = value.refs();
        let destination = relationship.destination.as_str();

        let mut faulted = Vec::new();
        let mut seen = HashSet::new();
        for related in &refs {
            if let RelatedRef::Identifier { identifier } = related {
                if !self.is_resolved(destination, identifier).await && seen.insert(identifier) {
                    faulted.push(identifier.clone());
                }
            }
        }

        let mut resolution = Resolution::default();
        let mut unresolved = HashSet::new();
        if !faulted.is_empty() {
            resolution.report = self.fetch_batch(destination, faulted.clone()).await?;
            resolution.fetches = 1;

            for identifier in faulted {
                if !self.is_resolved(destination, &identifier).await {
                    unresolved.insert(identifier);
                }
            }
        }

        for related in refs {
            let target = related.target();
            if !unresolved.contains(target) {
                resolution.identifiers.push(target.clone());
                continue;
            }

            if !relationship.is_to_many() {
                return Err(StoreError::dangling_reference(
                    node.entity(),
                    &relationship.name,
                    target.as_str(),
                ));
            }
            warn!(
                "Dangling reference {}.{} -> {}, skipping",
                node.reference_key(),
                relationship.name,
                target
            );
            resolution.dangling.push(target.clone());
        }

        Ok(resolution)
    }

    async fn is_resolved(&self, entity: &str, identifier: &Identifier) -> bool {
        self.cache
            .lookup(entity, identifier)
            .await
            .is_some_and(|node| !node.is_placeholder())
    }

    /// Fetch every faulted destination in one request and merge the response
    async fn fetch_batch(
        &self,
        destination: &str,
        identifiers: Vec<Identifier>,
    ) -> StoreResult<MergeReport> {
        let delegate = self.delegate.ok_or(StoreError::DelegateUnavailable)?;
        let request = FetchRequest::for_identifiers(destination, identifiers);
        debug!(
            "Faulting {} {} record(s) in one batch",
            request.identifiers.len(),
            destination
        );

        let Some(remote) = delegate.fetch_request(&request) else {
            return Ok(MergeReport::default());
        };
        let items = remote
            .execute()
            .await
            .map_err(|e| StoreError::remote_request_failed(format!("fetch {}", destination), e))?;

        ResponseParser::new(self.cache, delegate, self.entity_key)
            .apply_items(&items, destination, &PrefetchTree::default())
            .await
    }
}
