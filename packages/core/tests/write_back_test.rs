//! Write-Back Pipeline Tests
//!
//! Verifies save ordering (per identifier, declared dependencies, table/kind
//! grouping), bounded concurrency, fail-fast cancellation, tombstones and the
//! asynchronous connection mode.

mod common;

#[cfg(test)]
mod write_back_tests {
    use super::common::{document_model, id, init_tracing, InMemoryRemote};
    use anyhow::Result;
    use mirrorstore_core::config::{ConnectionMode, StoreConfig};
    use mirrorstore_core::db::{IdentityCache, RemoteDelegate, StoreError, StoreEvent};
    use mirrorstore_core::models::{
        AttributeValue, ChangeSet, ChangedObject, Identifier, NodeValues,
    };
    use mirrorstore_core::operations::{
        OperationKind, OperationState, PendingOperation, WriteBackContext, WriteBackScheduler,
    };
    use mirrorstore_core::services::MirrorStore;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::broadcast;
    use tokio_test::assert_ok;

    fn create_test_store(config: StoreConfig) -> (MirrorStore, InMemoryRemote) {
        init_tracing();
        let remote = InMemoryRemote::new(document_model());
        let store = MirrorStore::new(document_model(), config)
            .expect("valid store")
            .with_delegate(Arc::new(remote.clone()));
        (store, remote)
    }

    fn document(identifier: &str, number: &str) -> ChangedObject {
        ChangedObject::new(
            "Document",
            id(identifier),
            NodeValues::new().with_attribute("number", number),
        )
    }

    fn line(identifier: &str, document: &str) -> ChangedObject {
        ChangedObject::new(
            "Line",
            id(identifier),
            NodeValues::new()
                .with_attribute("quantity", 1i64)
                .with_to_one("document", Some(id(document))),
        )
    }

    fn customer(identifier: &str) -> ChangedObject {
        ChangedObject::new(
            "Customer",
            id(identifier),
            NodeValues::new().with_attribute("name", "ACME"),
        )
    }

    fn label(kind: &str, identifier: &str) -> String {
        format!("{} {}", kind, id(identifier))
    }

    // ========================================================================
    // Ordering
    // ========================================================================

    #[tokio::test]
    async fn test_declared_dependency_runs_parent_first() -> Result<()> {
        let config = StoreConfig::default().with_max_concurrent_operations(4);
        let (store, remote) = create_test_store(config);
        remote.depend(id("L1"), id("D1"));
        remote.delay(id("D1"), Duration::from_millis(20));

        // Line submitted before its document
        let report = store
            .save(
                ChangeSet::new()
                    .insert(line("L1", "D1"))
                    .insert(document("D1", "A-1")),
            )
            .await?;

        assert_eq!(
            remote.executions(),
            vec![label("insert", "D1"), label("insert", "L1")]
        );
        assert_eq!(report.count(OperationState::Succeeded), 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_same_identifier_never_runs_concurrently() -> Result<()> {
        let config = StoreConfig::default().with_max_concurrent_operations(8);
        let (store, remote) = create_test_store(config);
        remote.delay(id("X"), Duration::from_millis(20));

        store
            .save(
                ChangeSet::new()
                    .insert(document("X", "draft"))
                    .update(document("X", "final")),
            )
            .await?;

        assert_eq!(
            remote.completions(),
            vec![label("insert", "X"), label("update", "X")]
        );
        assert_eq!(remote.peak_concurrency(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_serial_pipeline_groups_by_table_then_kind() -> Result<()> {
        let (store, remote) = create_test_store(StoreConfig::default());
        store
            .cache()
            .apply_fetched_values("Document", &id("D9"), NodeValues::new(), 1)
            .await?;

        let report = store
            .save(
                ChangeSet::new()
                    .insert(document("D1", "A-1"))
                    .insert(customer("C1"))
                    .insert(line("L1", "D1"))
                    .update(document("D2", "A-2"))
                    .delete("Document", id("D9")),
            )
            .await?;

        assert_eq!(
            remote.executions(),
            vec![
                label("insert", "C1"),
                label("insert", "L1"),
                label("insert", "D1"),
                label("update", "D2"),
                label("delete", "D9"),
            ]
        );
        assert_eq!(report.execution_order.len(), 5);
        assert_eq!(remote.peak_concurrency(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_pipeline_width_bounds_concurrency() -> Result<()> {
        let config = StoreConfig::default().with_max_concurrent_operations(2);
        let (store, remote) = create_test_store(config);

        let mut changes = ChangeSet::new();
        for n in 0..6 {
            let name = format!("D{}", n);
            remote.delay(id(&name), Duration::from_millis(15));
            changes = changes.insert(document(&name, "A"));
        }
        store.save(changes).await?;

        assert_eq!(remote.executions().len(), 6);
        assert!(remote.peak_concurrency() <= 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_later_batch_waits_for_earlier_operation() -> Result<()> {
        let config = StoreConfig::default()
            .with_max_concurrent_operations(4)
            .with_connection_mode(ConnectionMode::Asynchronous);
        let (store, remote) = create_test_store(config);
        remote.delay(id("X"), Duration::from_millis(30));

        store
            .save(ChangeSet::new().insert(document("X", "draft")))
            .await?;
        store
            .save(ChangeSet::new().update(document("X", "final")))
            .await?;
        store.drain().await?;

        assert_eq!(
            remote.completions(),
            vec![label("insert", "X"), label("update", "X")]
        );
        assert_eq!(remote.peak_concurrency(), 1);
        Ok(())
    }

    // ========================================================================
    // Failure Handling
    // ========================================================================

    fn create_test_context(remote: &InMemoryRemote) -> WriteBackContext {
        let (events, _) = broadcast::channel(16);
        WriteBackContext {
            cache: Arc::new(IdentityCache::new(Arc::new(document_model()))),
            delegate: Arc::new(remote.clone()),
            entity_key: Arc::from("classname"),
            events,
        }
    }

    fn pending(remote: &InMemoryRemote, object: &ChangedObject) -> PendingOperation {
        let outbound = remote.insert_request(object).expect("insert request");
        PendingOperation::new(
            OperationKind::Insert,
            object.entity.clone(),
            object.identifier.clone(),
            "documents",
            outbound.request,
        )
        .with_dependencies(outbound.dependencies)
    }

    #[tokio::test]
    async fn test_failure_cancels_operations_not_yet_started() -> Result<()> {
        init_tracing();
        let remote = InMemoryRemote::new(document_model());
        remote.fail(id("D2"));
        let scheduler = WriteBackScheduler::new(1);

        let operations: Vec<PendingOperation> = ["D1", "D2", "D3"]
            .iter()
            .map(|name| pending(&remote, &document(name, "A")))
            .collect();
        let report = scheduler
            .submit(create_test_context(&remote), operations)
            .await?;

        let states: Vec<OperationState> = report.operations.iter().map(|o| o.state).collect();
        assert_eq!(
            states,
            vec![
                OperationState::Succeeded,
                OperationState::Failed,
                OperationState::Cancelled
            ]
        );
        assert!(matches!(
            report.error,
            Some(StoreError::RemoteRequestFailed { .. })
        ));
        assert_eq!(
            remote.executions(),
            vec![label("insert", "D1"), label("insert", "D2")]
        );
        // Nothing is rolled back
        assert!(remote.record(&id("D1")).is_some());
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_prerequisite_cancels_dependent() -> Result<()> {
        init_tracing();
        let remote = InMemoryRemote::new(document_model());
        remote.fail(id("D1"));
        remote.depend(id("L1"), id("D1"));
        let scheduler = WriteBackScheduler::new(4);

        let operations = vec![
            pending(&remote, &document("D1", "A")),
            pending(&remote, &line("L1", "D1")),
        ];
        let report = scheduler
            .submit(create_test_context(&remote), operations)
            .await?;

        assert_eq!(report.count(OperationState::Failed), 1);
        assert_eq!(report.count(OperationState::Cancelled), 1);
        assert_eq!(remote.executions(), vec![label("insert", "D1")]);
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_save_surfaces_error_and_event() -> Result<()> {
        let (store, remote) = create_test_store(StoreConfig::default());
        remote.fail(id("D1"));
        let mut events = store.subscribe();

        let result = store
            .save(ChangeSet::new().insert(document("D1", "A")))
            .await;
        assert!(matches!(result, Err(StoreError::RemoteRequestFailed { .. })));

        let mut saw_failure = false;
        while let Ok(event) = events.try_recv() {
            if let StoreEvent::SaveFailed { error } = event {
                assert!(error.contains("D1"));
                saw_failure = true;
            }
        }
        assert!(saw_failure);
        Ok(())
    }

    #[tokio::test]
    async fn test_async_save_failure_reported_by_drain() -> Result<()> {
        let config = StoreConfig::default().with_connection_mode(ConnectionMode::Asynchronous);
        let (store, remote) = create_test_store(config);
        remote.fail(id("D1"));

        let report = assert_ok!(store.save(ChangeSet::new().insert(document("D1", "A"))).await);
        assert!(report.operations.is_empty());

        let drained = store.drain().await;
        assert!(matches!(drained, Err(StoreError::RemoteRequestFailed { .. })));
        assert!(store.drain().await.is_ok());
        Ok(())
    }

    #[tokio::test]
    async fn test_save_cancelled_by_earlier_failure_is_an_error() -> Result<()> {
        let config = StoreConfig::default().with_max_concurrent_operations(4);
        let (store, remote) = create_test_store(config);
        remote.fail(id("X"));
        remote.delay(id("X"), Duration::from_millis(40));
        let store = Arc::new(store);

        let first = {
            let store = store.clone();
            tokio::spawn(async move {
                store
                    .save(ChangeSet::new().insert(document("X", "draft")))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let second = store
            .save(ChangeSet::new().update(document("X", "final")))
            .await;

        assert!(matches!(second, Err(StoreError::OperationCancelled { .. })));
        assert!(matches!(
            first.await?,
            Err(StoreError::RemoteRequestFailed { .. })
        ));
        assert_eq!(remote.executions(), vec![label("insert", "X")]);
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_batch_does_not_cancel_unrelated_batch() -> Result<()> {
        let config = StoreConfig::default().with_connection_mode(ConnectionMode::Asynchronous);
        let (store, remote) = create_test_store(config);
        remote.fail(id("A1"));
        remote.delay(id("A1"), Duration::from_millis(30));

        store
            .save(ChangeSet::new().insert(document("A1", "A")))
            .await?;
        store
            .save(ChangeSet::new().insert(document("B1", "B")))
            .await?;

        let drained = store.drain().await;
        assert!(matches!(drained, Err(StoreError::RemoteRequestFailed { .. })));

        // Serial pipeline: B1 still waits for A1 to finish
        assert_eq!(
            remote.completions(),
            vec![label("insert", "A1"), label("insert", "B1")]
        );
        assert!(remote.record(&id("B1")).is_some());
        assert!(remote.record(&id("A1")).is_none());
        Ok(())
    }

    // ========================================================================
    // Local Echo, Tombstones and Response Feedback
    // ========================================================================

    #[tokio::test]
    async fn test_insert_echoed_into_cache() -> Result<()> {
        let (store, _remote) = create_test_store(StoreConfig::default());
        store
            .save(ChangeSet::new().insert(document("D1", "A-1")))
            .await?;

        let node = store.cache().lookup("Document", &id("D1")).await.unwrap();
        assert_eq!(node.version(), 1);
        assert_eq!(
            node.values().attribute("number"),
            Some(&AttributeValue::from("A-1"))
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_mistyped_changes_rejected_before_echo() -> Result<()> {
        let (store, remote) = create_test_store(StoreConfig::default());
        let mistyped = ChangedObject::new(
            "Line",
            id("L1"),
            NodeValues::new().with_attribute("quantity", "three"),
        );

        let result = store
            .save(
                ChangeSet::new()
                    .insert(document("D1", "A-1"))
                    .insert(mistyped),
            )
            .await;

        assert!(matches!(result, Err(StoreError::InvalidValueType { .. })));
        assert!(store.cache().lookup("Document", &id("D1")).await.is_none());
        assert!(remote.executions().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_empty_changes_skipped() -> Result<()> {
        let (store, remote) = create_test_store(StoreConfig::default());
        let report = store
            .save(ChangeSet::new().update(ChangedObject::new(
                "Document",
                id("D1"),
                NodeValues::new(),
            )))
            .await?;

        assert!(report.operations.is_empty());
        assert!(remote.executions().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_response_values_fed_back_into_cache() -> Result<()> {
        let (store, remote) = create_test_store(StoreConfig::default());
        remote.put(json!({
            "classname": "Document",
            "identifier": "D1",
            "version": 5,
            "number": "server-side",
        }));

        let update = ChangedObject::new(
            "Document",
            id("D1"),
            NodeValues::new().with_attribute("total", AttributeValue::Decimal(serde_json::Number::from(12i64))),
        );
        let report = store.save(ChangeSet::new().update(update)).await?;

        assert_eq!(report.refreshed.updated.len(), 1);
        let node = store.cache().lookup("Document", &id("D1")).await.unwrap();
        assert_eq!(node.version(), 6);
        assert_eq!(
            node.values().attribute("number"),
            Some(&AttributeValue::from("server-side"))
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_successful_delete_clears_tombstone() -> Result<()> {
        let (store, remote) = create_test_store(StoreConfig::default());
        remote.put(json!({"classname": "Document", "identifier": "D1", "version": 1}));
        store.values_for("Document", &id("D1")).await?;

        store.save(ChangeSet::new().delete("Document", id("D1"))).await?;

        assert!(store.cache().lookup("Document", &id("D1")).await.is_none());
        assert!(!store.cache().is_deleting("Document", &id("D1")).await);
        assert_eq!(store.cache().stats().await.tombstones, 0);

        // A record re-created remotely can be cached again
        remote.put(json!({"classname": "Document", "identifier": "D1", "version": 5, "number": "again"}));
        let values = store.values_for("Document", &id("D1")).await?.unwrap();
        assert_eq!(values.get("number"), Some(&AttributeValue::from("again")));
        assert_eq!(
            store.cache().lookup("Document", &id("D1")).await.unwrap().version(),
            5
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_delete_clears_tombstone() -> Result<()> {
        let (store, remote) = create_test_store(StoreConfig::default());
        remote.put(json!({"classname": "Document", "identifier": "D1", "version": 1}));
        remote.fail(id("D1"));
        store.values_for("Document", &id("D1")).await?;

        let result = store.save(ChangeSet::new().delete("Document", id("D1"))).await;
        assert!(result.is_err());
        assert!(!store.cache().is_deleting("Document", &id("D1")).await);

        // The record can be fetched again
        let values = store.values_for("Document", &id("D1")).await?;
        assert!(values.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn test_fetch_during_delete_does_not_resurrect() -> Result<()> {
        let config = StoreConfig::default().with_connection_mode(ConnectionMode::Asynchronous);
        let (store, remote) = create_test_store(config);
        remote.put(json!({"classname": "Document", "identifier": "D1", "version": 3}));
        remote.delay(id("D1"), Duration::from_millis(40));
        store.values_for("Document", &id("D1")).await?;

        store.save(ChangeSet::new().delete("Document", id("D1"))).await?;
        let values = store.values_for("Document", &id("D1")).await?;
        assert!(values.is_none());

        store.drain().await?;
        assert!(remote.record(&id("D1")).is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_operation_ids_unique_across_batches() -> Result<()> {
        init_tracing();
        let remote = InMemoryRemote::new(document_model());
        let scheduler = WriteBackScheduler::new(2);
        let ctx = create_test_context(&remote);

        let first = scheduler
            .submit(ctx.clone(), vec![pending(&remote, &document("D1", "A"))])
            .await?;
        let second = scheduler
            .submit(ctx, vec![pending(&remote, &document("D2", "B"))])
            .await?;

        let ids: Vec<_> = first
            .operations
            .iter()
            .chain(&second.operations)
            .map(|o| o.id)
            .collect();
        assert_ne!(ids[0], ids[1]);
        let identifiers: Vec<&Identifier> = second.operations.iter().map(|o| &o.key.identifier).collect();
        assert_eq!(identifiers, vec![&id("D2")]);
        Ok(())
    }
}
