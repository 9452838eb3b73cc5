//! Write-Back Pipeline
//!
//! Executes a [`SavePlan`] against the remote collaborator.
//!
//! # Architecture
//!
//! - **One task per operation** in a `JoinSet`. Each task first waits for its
//!   prerequisites (in-batch ones and operations still running from earlier
//!   batches) to reach a terminal state, then takes a permit from the
//!   pipeline-wide `Semaphore`, so at most `max_concurrent_operations`
//!   requests are in flight.
//! - **Gating vs ordering**: a prerequisite for the same identifier or a
//!   declared dependency must succeed, otherwise the operation is cancelled.
//!   The serial edge to the previous batch's tail only orders execution; a
//!   failure there stays inside its own batch.
//! - **Completion handles**: every operation publishes its state on a
//!   `tokio::sync::watch` channel. Dependents observe it through an
//!   [`OperationHandle`]; the handle of the latest operation per identifier
//!   stays registered until the next batch supersedes it.
//! - **Fail-fast**: the first failure sets a batch-wide cancel flag. Operations
//!   that have not started are cancelled, operations already executing run to
//!   completion, and nothing that succeeded is rolled back. A batch whose
//!   operations were cancelled because an earlier batch failed reports
//!   `OperationCancelled`.
//! - **Feedback**: a successful response is parsed and merged into the identity
//!   cache exactly like a fetch response, and subscribers are told which objects
//!   to refresh.

use super::plan::{PlannedOperation, SavePlan};
use super::{OperationHandle, OperationId, OperationKind, OperationState, PendingOperation};
use crate::db::{IdentityCache, RemoteDelegate, StoreError, StoreEvent, StoreResult};
use crate::models::{Identifier, ReferenceKey};
use crate::services::parser::{MergeReport, PrefetchTree, ResponseParser};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch, Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Shared state an operation task needs to apply its result
#[derive(Clone)]
pub struct WriteBackContext {
    pub cache: Arc<IdentityCache>,
    pub delegate: Arc<dyn RemoteDelegate>,
    pub entity_key: Arc<str>,
    pub events: broadcast::Sender<StoreEvent>,
}

/// Final state of one operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationOutcome {
    pub id: OperationId,
    pub kind: OperationKind,
    pub key: ReferenceKey,
    pub state: OperationState,
    pub error: Option<String>,
}

/// Result of one save batch
#[derive(Debug, Default)]
pub struct SaveReport {
    /// Outcomes in plan order
    pub operations: Vec<OperationOutcome>,

    /// Operation ids in the order they started executing
    pub execution_order: Vec<OperationId>,

    /// Cache changes caused by the responses
    pub refreshed: MergeReport,

    /// First hard failure of the batch
    pub error: Option<StoreError>,
}

impl SaveReport {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }

    pub fn count(&self, state: OperationState) -> usize {
        self.operations.iter().filter(|o| o.state == state).count()
    }

    /// Surface the batch failure as an error
    pub fn into_result(mut self) -> StoreResult<Self> {
        match self.error.take() {
            Some(error) => Err(error),
            None => Ok(self),
        }
    }
}

#[derive(Default)]
struct InFlight {
    /// Latest operation per identifier
    by_identifier: HashMap<Identifier, OperationHandle>,
    /// Last operation of the latest batch, for strict global ordering
    tail: Option<OperationHandle>,
}

/// Per-batch shared state
struct Batch {
    cancelled: AtomicBool,
    execution_order: Mutex<Vec<OperationId>>,
}

/// Bounded-concurrency executor for save batches
pub struct WriteBackScheduler {
    permits: Arc<Semaphore>,
    serialize: bool,
    in_flight: Mutex<InFlight>,
    next_id: AtomicU64,
}

impl WriteBackScheduler {
    /// Create a scheduler running at most `max_concurrent` operations at once
    ///
    /// A width of 1 also chains every operation to its predecessor, across
    /// batches too, giving strict global ordering.
    pub fn new(max_concurrent: usize) -> Self {
        let width = max_concurrent.max(1);
        Self {
            permits: Arc::new(Semaphore::new(width)),
            serialize: width == 1,
            in_flight: Mutex::new(InFlight::default()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Plan and execute one batch, waiting for every operation to finish
    pub async fn submit(
        &self,
        ctx: WriteBackContext,
        operations: Vec<PendingOperation>,
    ) -> StoreResult<SaveReport> {
        Ok(self.schedule(ctx, operations).await?.run().await)
    }

    /// Plan a batch and register it with the pipeline without running it
    ///
    /// Registration fixes the batch's place in the per-identifier and serial
    /// orderings, so batches scheduled one after another keep their order even
    /// when their [`ScheduledBatch::run`] futures are polled out of order.
    pub async fn schedule(
        &self,
        ctx: WriteBackContext,
        operations: Vec<PendingOperation>,
    ) -> StoreResult<ScheduledBatch> {
        if operations.is_empty() {
            return Ok(ScheduledBatch {
                ctx,
                permits: self.permits.clone(),
                tasks: Vec::new(),
            });
        }

        let first_id = self
            .next_id
            .fetch_add(operations.len() as u64, Ordering::Relaxed);
        let plan = SavePlan::build(operations, self.serialize, first_id)?;
        debug!("Scheduled save batch of {} operation(s)", plan.len());

        let planned = plan.into_operations();
        let mut senders = Vec::with_capacity(planned.len());
        let mut handles = Vec::with_capacity(planned.len());
        for op in &planned {
            let (tx, rx) = watch::channel(OperationState::Queued);
            senders.push(tx);
            handles.push(OperationHandle::new(op.id, rx));
        }

        let Registration {
            external,
            mut tail,
        } = self.register(&planned, &handles).await;

        let tasks = planned
            .into_iter()
            .zip(senders)
            .zip(external)
            .map(|((op, tx), external)| {
                let in_batch = op.prerequisites.iter().map(|&p| handles[p].clone()).collect();
                ScheduledOperation {
                    planned: op,
                    state: tx,
                    in_batch,
                    external,
                    after: tail.take(),
                }
            })
            .collect();

        Ok(ScheduledBatch {
            ctx,
            permits: self.permits.clone(),
            tasks,
        })
    }

    /// Resolve external prerequisites and register this batch's handles
    async fn register(
        &self,
        planned: &[PlannedOperation],
        handles: &[OperationHandle],
    ) -> Registration {
        let mut in_flight = self.in_flight.lock().await;
        in_flight
            .by_identifier
            .retain(|_, handle| !handle.state().is_terminal());

        let external: Vec<Vec<OperationHandle>> = planned
            .iter()
            .map(|op| {
                op.external
                    .iter()
                    .filter_map(|identifier| in_flight.by_identifier.get(identifier).cloned())
                    .collect()
            })
            .collect();

        let tail = in_flight
            .tail
            .clone()
            .filter(|tail| self.serialize && !tail.state().is_terminal());

        for (op, handle) in planned.iter().zip(handles) {
            in_flight
                .by_identifier
                .insert(op.operation.identifier.clone(), handle.clone());
        }
        in_flight.tail = handles.last().cloned();

        Registration { external, tail }
    }
}

struct Registration {
    /// Cross-batch prerequisites per planned operation
    external: Vec<Vec<OperationHandle>>,
    /// Previous batch's last operation, for serial pipelines
    tail: Option<OperationHandle>,
}

struct ScheduledOperation {
    planned: PlannedOperation,
    state: watch::Sender<OperationState>,
    in_batch: Vec<OperationHandle>,
    external: Vec<OperationHandle>,
    /// Ordering-only edge; its outcome does not matter
    after: Option<OperationHandle>,
}

/// A registered save batch, ready to execute
pub struct ScheduledBatch {
    ctx: WriteBackContext,
    permits: Arc<Semaphore>,
    tasks: Vec<ScheduledOperation>,
}

impl ScheduledBatch {
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Execute every operation, waiting for all of them to finish
    ///
    /// Dropping the future aborts operations that have not finished yet.
    pub async fn run(self) -> SaveReport {
        let ScheduledBatch {
            ctx,
            permits,
            tasks: scheduled,
        } = self;
        if scheduled.is_empty() {
            return SaveReport::default();
        }
        info!("Running save batch of {} operation(s)", scheduled.len());

        let batch = Arc::new(Batch {
            cancelled: AtomicBool::new(false),
            execution_order: Mutex::new(Vec::new()),
        });

        let mut outcomes: Vec<Option<OperationOutcome>> = vec![None; scheduled.len()];
        let mut tasks = JoinSet::new();
        for (position, op) in scheduled.into_iter().enumerate() {
            tasks.spawn(run_operation(
                position,
                op,
                ctx.clone(),
                permits.clone(),
                batch.clone(),
            ));
        }

        let mut report = SaveReport::default();
        let mut first_error: Option<StoreError> = None;
        let mut first_cancellation: Option<StoreError> = None;
        while let Some(joined) = tasks.join_next().await {
            let (position, outcome, result) = match joined {
                Ok(done) => done,
                Err(e) => {
                    batch.cancelled.store(true, Ordering::SeqCst);
                    first_error.get_or_insert_with(|| {
                        StoreError::remote_request_failed("write-back task", anyhow::anyhow!(e))
                    });
                    continue;
                }
            };

            match result {
                Ok(merge) => report.refreshed.extend(merge),
                Err(e) if e.is_cancellation() => {
                    first_cancellation.get_or_insert(e);
                }
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
            outcomes[position] = Some(outcome);
        }

        // Without a failure of its own, a cancellation came from an earlier batch
        let first_error = first_error.or(first_cancellation);

        report.operations = outcomes.into_iter().flatten().collect();
        report.execution_order = std::mem::take(&mut *batch.execution_order.lock().await);

        match &first_error {
            Some(error) => {
                warn!("Save batch failed: {}", error);
                let _ = ctx.events.send(StoreEvent::SaveFailed {
                    error: error.to_string(),
                });
            }
            None => {
                info!("Save batch of {} operation(s) completed", report.operations.len());
                let _ = ctx.events.send(StoreEvent::SaveCompleted {
                    operations: report.operations.len(),
                });
            }
        }
        report.error = first_error;
        report
    }
}

type TaskResult = (usize, OperationOutcome, StoreResult<MergeReport>);

async fn run_operation(
    position: usize,
    scheduled: ScheduledOperation,
    ctx: WriteBackContext,
    permits: Arc<Semaphore>,
    batch: Arc<Batch>,
) -> TaskResult {
    let ScheduledOperation {
        planned,
        state,
        in_batch,
        external,
        after,
    } = scheduled;
    let PlannedOperation { id, operation, .. } = planned;
    let key = operation.reference_key();
    let kind = operation.kind;

    let finish = |state_value: OperationState, result: StoreResult<MergeReport>| {
        let outcome = OperationOutcome {
            id,
            kind,
            key: key.clone(),
            state: state_value,
            error: result.as_ref().err().map(ToString::to_string),
        };
        (position, outcome, result)
    };

    if let Some(mut tail) = after {
        tail.wait().await;
    }

    let mut blocked = false;
    for mut prerequisite in in_batch {
        if prerequisite.wait().await != OperationState::Succeeded {
            blocked = true;
        }
    }
    for mut prerequisite in external {
        if prerequisite.wait().await != OperationState::Succeeded {
            debug!("{} {} blocked by failed {}", kind, key, prerequisite.id());
            batch.cancelled.store(true, Ordering::SeqCst);
            blocked = true;
        }
    }

    if blocked || batch.cancelled.load(Ordering::SeqCst) {
        return cancel(&operation, &state, &ctx, finish).await;
    }
    state.send_replace(OperationState::DependenciesResolved);

    let _permit = match permits.acquire_owned().await {
        Ok(permit) => permit,
        Err(_) => return cancel(&operation, &state, &ctx, finish).await,
    };
    if batch.cancelled.load(Ordering::SeqCst) {
        return cancel(&operation, &state, &ctx, finish).await;
    }

    state.send_replace(OperationState::Executing);
    batch.execution_order.lock().await.push(id);
    debug!("Executing {} {} ({})", kind, key, id);

    let result = match operation.request.execute().await {
        Ok(items) => {
            ResponseParser::new(&ctx.cache, ctx.delegate.as_ref(), &ctx.entity_key)
                .apply_items(&items, &operation.entity, &PrefetchTree::default())
                .await
        }
        Err(e) => Err(StoreError::remote_request_failed(format!("{} {}", kind, key), e)),
    };

    match result {
        Ok(merge) => {
            if kind == OperationKind::Delete {
                ctx.cache
                    .clear_deleting(&operation.entity, &operation.identifier)
                    .await;
            }
            if let Some(event) = merge.refresh_event() {
                let _ = ctx.events.send(event);
            }
            state.send_replace(OperationState::Succeeded);
            finish(OperationState::Succeeded, Ok(merge))
        }
        Err(e) => {
            warn!("{} {} failed: {}", kind, key, e);
            batch.cancelled.store(true, Ordering::SeqCst);
            if kind == OperationKind::Delete {
                ctx.cache
                    .clear_deleting(&operation.entity, &operation.identifier)
                    .await;
            }
            state.send_replace(OperationState::Failed);
            finish(OperationState::Failed, Err(e))
        }
    }
}

async fn cancel(
    operation: &PendingOperation,
    state: &watch::Sender<OperationState>,
    ctx: &WriteBackContext,
    finish: impl FnOnce(OperationState, StoreResult<MergeReport>) -> TaskResult,
) -> TaskResult {
    let key = operation.reference_key();
    debug!("Cancelled {} {}", operation.kind, key);
    if operation.kind == OperationKind::Delete {
        ctx.cache
            .clear_deleting(&operation.entity, &operation.identifier)
            .await;
    }
    state.send_replace(OperationState::Cancelled);
    finish(
        OperationState::Cancelled,
        Err(StoreError::operation_cancelled(key.to_string())),
    )
}
