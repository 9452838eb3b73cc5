//! Mirror Store
//!
//! The entry point used by the graph framework. A `MirrorStore` owns one
//! identity cache, one write-back scheduler and one event channel; multiple
//! stores are fully independent.
//!
//! # Control Flow
//!
//! 1. `values_for` - cache lookup; placeholders and unknown records are fetched
//!    through the remote delegate first
//! 2. `relationship_values_for` - relationship resolution with batched fault
//!    fetching of destinations
//! 3. `save` - local echo into the cache, then ordered write-back through the
//!    scheduler; responses are merged back like fetch responses
//!
//! # Examples
//!
//! ```rust,no_run
//! use mirrorstore_core::config::StoreConfig;
//! use mirrorstore_core::models::{EntityModel, EntitySchema, AttributeKind, Identifier};
//! use mirrorstore_core::services::MirrorStore;
//! use std::sync::Arc;
//!
//! # async fn example(delegate: Arc<dyn mirrorstore_core::db::RemoteDelegate>) -> anyhow::Result<()> {
//! let model = EntityModel::new(vec![
//!     EntitySchema::new("Document").with_attribute("number", AttributeKind::String),
//! ])?;
//! let store = MirrorStore::new(model, StoreConfig::default())?.with_delegate(delegate);
//!
//! let id = Identifier::parse("3f2504e0-4f89-11d3-9a0c-0305e82c3301").unwrap();
//! if let Some(values) = store.values_for("Document", &id).await? {
//!     println!("number = {:?}", values.get("number"));
//! }
//! # Ok(())
//! # }
//! ```

use crate::config::{ConnectionMode, StoreConfig};
use crate::db::{
    IdentityCache, OutboundRequest, RemoteDelegate, StoreError, StoreEvent, StoreResult,
};
use crate::models::{
    AttributeMap, CacheNode, ChangeSet, ChangedObject, EntityModel, FetchRequest, Identifier,
    NewObject, ReferenceKey,
};
use crate::operations::{
    OperationKind, PendingOperation, SaveReport, WriteBackContext, WriteBackScheduler,
};
use crate::services::parser::{MergeReport, PrefetchTree, ResponseParser};
use crate::services::relationship_resolver::RelationshipResolver;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Identity cache, relationship resolver and write-back pipeline for one object graph
pub struct MirrorStore {
    model: Arc<EntityModel>,
    cache: Arc<IdentityCache>,
    delegate: Option<Arc<dyn RemoteDelegate>>,
    config: StoreConfig,
    scheduler: WriteBackScheduler,
    events: broadcast::Sender<StoreEvent>,
    background: Mutex<Vec<JoinHandle<StoreResult<SaveReport>>>>,
}

impl MirrorStore {
    /// Create a store without a remote delegate
    ///
    /// Until a delegate is attached, anything that needs the remote source
    /// fails with `DelegateUnavailable`.
    pub fn new(model: EntityModel, config: StoreConfig) -> StoreResult<Self> {
        config.validate()?;

        let model = Arc::new(model);
        let (events, _) = broadcast::channel(config.event_capacity);
        Ok(Self {
            cache: Arc::new(IdentityCache::new(model.clone())),
            model,
            delegate: None,
            scheduler: WriteBackScheduler::new(config.max_concurrent_operations),
            config,
            events,
            background: Mutex::new(Vec::new()),
        })
    }

    pub fn with_delegate(mut self, delegate: Arc<dyn RemoteDelegate>) -> Self {
        self.delegate = Some(delegate);
        self
    }

    pub fn model(&self) -> &Arc<EntityModel> {
        &self.model
    }

    pub fn cache(&self) -> &Arc<IdentityCache> {
        &self.cache
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Subscribe to store events
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    fn delegate(&self) -> StoreResult<&Arc<dyn RemoteDelegate>> {
        self.delegate.as_ref().ok_or(StoreError::DelegateUnavailable)
    }

    fn emit(&self, event: StoreEvent) {
        debug!("Store event {}", event.event_type());
        let _ = self.events.send(event);
    }

    fn emit_refresh(&self, report: &MergeReport) {
        if let Some(event) = report.refresh_event() {
            self.emit(event);
        }
    }

    /// Execute a fetch request and merge the results into the cache
    pub async fn fetch(&self, request: &FetchRequest) -> StoreResult<MergeReport> {
        request.validate(&self.model)?;
        let delegate = self.delegate()?;

        let Some(remote) = delegate.fetch_request(request) else {
            return Ok(MergeReport::default());
        };
        let items = remote.execute().await.map_err(|e| {
            StoreError::remote_request_failed(format!("fetch {}", request.entity), e)
        })?;

        let prefetch = PrefetchTree::from_paths(&request.prefetch);
        let report = ResponseParser::new(&self.cache, &**delegate, &self.config.entity_key)
            .apply_items(&items, &request.entity, &prefetch)
            .await?;
        debug!(
            "Fetched {} {} record(s): {} inserted, {} updated",
            report.objects.len(),
            request.entity,
            report.inserted.len(),
            report.updated.len()
        );
        self.emit_refresh(&report);
        Ok(report)
    }

    /// Cached node with real values, fetching it through the delegate if needed
    ///
    /// Returns `None` when the remote source does not know the record.
    pub async fn materialize(
        &self,
        entity: &str,
        identifier: &Identifier,
    ) -> StoreResult<Option<Arc<CacheNode>>> {
        self.model.entity(entity)?;

        if let Some(node) = self.cache.lookup(entity, identifier).await {
            if !node.is_placeholder() {
                return Ok(Some(node));
            }
        }

        self.cache.insert_placeholder(entity, identifier).await?;
        self.fetch(&FetchRequest::for_identifiers(entity, vec![identifier.clone()]))
            .await?;

        Ok(self
            .cache
            .lookup(entity, identifier)
            .await
            .filter(|node| !node.is_placeholder()))
    }

    /// Typed attribute values of a record (fetch-through for placeholders)
    pub async fn values_for(
        &self,
        entity: &str,
        identifier: &Identifier,
    ) -> StoreResult<Option<AttributeMap>> {
        Ok(self
            .materialize(entity, identifier)
            .await?
            .map(|node| node.attribute_values(&self.model).clone()))
    }

    /// Destination identifiers of a relationship, faulting in missing destinations
    pub async fn relationship_values_for(
        &self,
        entity: &str,
        identifier: &Identifier,
        relationship: &str,
    ) -> StoreResult<Vec<Identifier>> {
        let field = self
            .model
            .relationship(entity, relationship)
            .ok_or_else(|| {
                StoreError::invalid_request(format!(
                    "{} has no relationship '{}'",
                    entity, relationship
                ))
            })?;

        let node = self
            .materialize(entity, identifier)
            .await?
            .ok_or_else(|| {
                StoreError::invalid_request(format!("{}://{} not found", entity, identifier))
            })?;

        let resolver = RelationshipResolver::new(
            &self.cache,
            self.delegate.as_deref(),
            &self.config.entity_key,
        );
        let resolution = resolver.resolve(&node, field).await?;
        self.emit_refresh(&resolution.report);
        Ok(resolution.identifiers)
    }

    /// Persist a change set
    ///
    /// Changes are echoed into the cache immediately. In synchronous mode the
    /// call waits for the write-back pipeline and returns its first hard
    /// failure. In asynchronous mode the batch runs in the background, an empty
    /// report is returned, and failures surface from [`drain`](Self::drain).
    pub async fn save(&self, changes: ChangeSet) -> StoreResult<SaveReport> {
        let delegate = self.delegate()?.clone();
        let operations = self.prepare(delegate.as_ref(), changes).await?;

        let ctx = WriteBackContext {
            cache: self.cache.clone(),
            delegate,
            entity_key: Arc::from(self.config.entity_key.as_str()),
            events: self.events.clone(),
        };

        match self.config.connection_mode {
            ConnectionMode::Synchronous => {
                self.scheduler.submit(ctx, operations).await?.into_result()
            }
            ConnectionMode::Asynchronous => {
                let batch = self.scheduler.schedule(ctx, operations).await?;
                let handle = tokio::spawn(async move { batch.run().await.into_result() });
                self.background.lock().await.push(handle);
                Ok(SaveReport::default())
            }
        }
    }

    /// Wait for every background save; returns the first failure
    pub async fn drain(&self) -> StoreResult<()> {
        let handles: Vec<_> = std::mem::take(&mut *self.background.lock().await);
        let mut first_error = None;

        for handle in handles {
            let result = match handle.await {
                Ok(result) => result.map(|_| ()),
                Err(e) => Err(StoreError::remote_request_failed(
                    "background save",
                    anyhow::anyhow!(e),
                )),
            };
            if let Err(e) = result {
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Build the batch's operations and echo the changes into the cache
    async fn prepare(
        &self,
        delegate: &dyn RemoteDelegate,
        changes: ChangeSet,
    ) -> StoreResult<Vec<PendingOperation>> {
        for object in changes
            .inserted
            .iter()
            .chain(&changes.updated)
            .chain(&changes.deleted)
        {
            self.model.entity(&object.entity)?;
        }
        for object in changes.inserted.iter().chain(&changes.updated) {
            self.cache.check_changes(&object.entity, &object.changes)?;
        }

        info!("Preparing save of {} changed object(s)", changes.len());
        let mut operations = Vec::with_capacity(changes.len());

        for object in &changes.inserted {
            if object.changes.is_empty() {
                continue;
            }
            let outbound = delegate.insert_request(object);
            self.cache
                .apply_local_changes(&object.entity, &object.identifier, &object.changes)
                .await?;
            if let Some(outbound) = outbound {
                operations.push(self.pending(OperationKind::Insert, object, outbound));
            }
        }

        for object in &changes.updated {
            if object.changes.is_empty() {
                continue;
            }
            let outbound = delegate.update_request(object);
            self.cache
                .apply_local_changes(&object.entity, &object.identifier, &object.changes)
                .await?;
            if let Some(outbound) = outbound {
                operations.push(self.pending(OperationKind::Update, object, outbound));
            }
        }

        for object in &changes.deleted {
            let outbound = delegate.delete_request(object);
            self.cache
                .mark_deleting(&object.entity, &object.identifier)
                .await;
            let evicted = self.cache.evict(&object.entity, &object.identifier).await;
            if !evicted.is_empty() {
                self.emit(StoreEvent::ObjectsEvicted { keys: evicted });
            }
            if let Some(outbound) = outbound {
                operations.push(self.pending(OperationKind::Delete, object, outbound));
            }
        }

        Ok(operations)
    }

    fn pending(
        &self,
        kind: OperationKind,
        object: &ChangedObject,
        outbound: OutboundRequest,
    ) -> PendingOperation {
        let table = outbound
            .table
            .unwrap_or_else(|| self.model.table_name(&object.entity));
        PendingOperation::new(
            kind,
            object.entity.clone(),
            object.identifier.clone(),
            table,
            outbound.request,
        )
        .with_dependencies(outbound.dependencies)
    }

    /// Force the next read of a record to refetch it
    pub async fn invalidate(&self, entity: &str, identifier: &Identifier) -> bool {
        let invalidated = self.cache.invalidate(entity, identifier).await;
        if invalidated {
            self.emit(StoreEvent::ObjectsInvalidated {
                key: ReferenceKey::new(entity, identifier.clone()),
            });
        }
        invalidated
    }

    /// Create placeholders for objects the graph framework now tracks
    pub async fn register_objects(&self, keys: &[ReferenceKey]) -> StoreResult<()> {
        for key in keys {
            self.cache
                .insert_placeholder(&key.entity, &key.identifier)
                .await?;
        }
        Ok(())
    }

    /// Evict objects the graph framework no longer tracks
    pub async fn unregister_objects(&self, keys: &[ReferenceKey]) -> Vec<ReferenceKey> {
        let mut evicted = Vec::new();
        for key in keys {
            evicted.extend(self.cache.evict(&key.entity, &key.identifier).await);
        }
        if !evicted.is_empty() {
            self.emit(StoreEvent::ObjectsEvicted {
                keys: evicted.clone(),
            });
        }
        evicted
    }

    /// Ask the delegate for stable identifiers of newly created objects
    pub fn obtain_stable_identifiers(&self, objects: &[NewObject]) -> StoreResult<Vec<Identifier>> {
        let delegate = self.delegate()?;
        objects
            .iter()
            .map(|object| {
                self.model.entity(&object.entity)?;
                delegate
                    .identifier_for_object(object)
                    .and_then(|raw| Identifier::parse(&raw))
                    .ok_or_else(|| StoreError::missing_identifier(&object.entity))
            })
            .collect()
    }
}

impl std::fmt::Debug for MirrorStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MirrorStore")
            .field("config", &self.config)
            .field("has_delegate", &self.delegate.is_some())
            .finish_non_exhaustive()
    }
}
