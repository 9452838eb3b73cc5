//! Remote Collaborator Abstraction
//!
//! This module defines the seam between the engine and the remote data source.
//! The engine never speaks a transport protocol: it asks a [`RemoteDelegate`]
//! for request objects and executes them.
//!
//! # Architecture
//!
//! - **RemoteDelegate**: factory for fetch/insert/update/delete requests plus
//!   identifier minting and per-record identifier/version extraction
//! - **RemoteRequest**: one executable request returning raw records
//! - **OutboundRequest**: a write request with the identifiers it depends on
//!
//! # Design Decisions
//!
//! 1. **Async-First**: `execute` is async so both in-process and network
//!    collaborators fit behind the same trait
//! 2. **Error Handling**: collaborators return `anyhow::Result`; the engine wraps
//!    failures into [`StoreError::RemoteRequestFailed`](crate::db::StoreError)
//! 3. **Optional Requests**: returning `None` from a request factory means the
//!    collaborator has nothing to send for that object; the engine treats it as
//!    an empty successful response

use crate::models::{ChangedObject, FetchRequest, Identifier, NewObject, RawRecord, RawValue};
use anyhow::Result;
use async_trait::async_trait;

/// Key read by the default identifier extractor
pub const IDENTIFIER_KEY: &str = "identifier";

/// Key read by the default version extractor
pub const VERSION_KEY: &str = "version";

/// One executable remote request
#[async_trait]
pub trait RemoteRequest: Send + Sync {
    /// Execute the request, returning the raw records of the response
    ///
    /// Write requests may return the stored record (fed back into the cache)
    /// or an empty list.
    async fn execute(&self) -> Result<Vec<RawRecord>>;
}

/// A write request plus the ordering constraints it declares
pub struct OutboundRequest {
    pub request: Box<dyn RemoteRequest>,

    /// Identifiers whose pending operations must complete first
    pub dependencies: Vec<Identifier>,

    /// Remote table override; defaults to the entity's base table
    pub table: Option<String>,
}

impl OutboundRequest {
    pub fn new(request: impl RemoteRequest + 'static) -> Self {
        Self {
            request: Box::new(request),
            dependencies: Vec::new(),
            table: None,
        }
    }

    pub fn depends_on(mut self, identifier: Identifier) -> Self {
        if !self.dependencies.contains(&identifier) {
            self.dependencies.push(identifier);
        }
        self
    }

    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }
}

impl std::fmt::Debug for OutboundRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboundRequest")
            .field("dependencies", &self.dependencies)
            .field("table", &self.table)
            .finish_non_exhaustive()
    }
}

/// The remote collaborator
///
/// Implementations must be `Send + Sync`; the write-back pipeline builds
/// requests on the caller's task and executes them on worker tasks.
pub trait RemoteDelegate: Send + Sync {
    /// Build a request fetching the records selected by `request`
    fn fetch_request(&self, request: &FetchRequest) -> Option<Box<dyn RemoteRequest>>;

    /// Build a request creating `object` remotely
    fn insert_request(&self, object: &ChangedObject) -> Option<OutboundRequest>;

    /// Build a request updating `object` remotely
    fn update_request(&self, object: &ChangedObject) -> Option<OutboundRequest>;

    /// Build a request deleting `object` remotely
    fn delete_request(&self, object: &ChangedObject) -> Option<OutboundRequest>;

    /// Mint a stable identifier for a newly created object
    fn identifier_for_object(&self, object: &NewObject) -> Option<String>;

    /// Extract the identifier token from a raw record
    fn identifier_from_item(&self, _entity: &str, item: &RawRecord) -> Option<String> {
        match item.get(IDENTIFIER_KEY)? {
            RawValue::String(s) => Some(s.clone()),
            RawValue::Uuid(u) => Some(u.to_string()),
            RawValue::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    /// Extract the record version; records without one are at version 1
    fn version_from_item(&self, _entity: &str, item: &RawRecord) -> u64 {
        match item.get(VERSION_KEY) {
            Some(RawValue::Number(n)) => n.as_u64().unwrap_or(1),
            Some(RawValue::String(s)) => s.trim().parse().unwrap_or(1),
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::raw_record;
    use serde_json::json;

    struct NoopDelegate;

    impl RemoteDelegate for NoopDelegate {
        fn fetch_request(&self, _request: &FetchRequest) -> Option<Box<dyn RemoteRequest>> {
            None
        }
        fn insert_request(&self, _object: &ChangedObject) -> Option<OutboundRequest> {
            None
        }
        fn update_request(&self, _object: &ChangedObject) -> Option<OutboundRequest> {
            None
        }
        fn delete_request(&self, _object: &ChangedObject) -> Option<OutboundRequest> {
            None
        }
        fn identifier_for_object(&self, _object: &NewObject) -> Option<String> {
            None
        }
    }

    struct EmptyRequest;

    #[async_trait]
    impl RemoteRequest for EmptyRequest {
        async fn execute(&self) -> Result<Vec<RawRecord>> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn test_default_extractors() {
        let delegate = NoopDelegate;
        let item = raw_record(json!({ "identifier": "a1", "version": 7 })).unwrap();
        assert_eq!(
            delegate.identifier_from_item("Document", &item),
            Some("a1".to_string())
        );
        assert_eq!(delegate.version_from_item("Document", &item), 7);

        let item = raw_record(json!({ "name": "no id" })).unwrap();
        assert_eq!(delegate.identifier_from_item("Document", &item), None);
        assert_eq!(delegate.version_from_item("Document", &item), 1);
    }

    #[test]
    fn test_outbound_request_dependencies_are_unique() {
        let parent = Identifier::parse("d1").unwrap();
        let request = OutboundRequest::new(EmptyRequest)
            .depends_on(parent.clone())
            .depends_on(parent)
            .with_table("lines");
        assert_eq!(request.dependencies.len(), 1);
        assert_eq!(request.table.as_deref(), Some("lines"));
    }
}
