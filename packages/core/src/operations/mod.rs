//! Write-Back Operations
//!
//! This module provides the outbound half of the engine: every changed object of
//! a save becomes one [`PendingOperation`], the batch is ordered into a
//! dependency graph by [`SavePlan`], and [`WriteBackScheduler`] executes it on a
//! bounded-concurrency pipeline.
//!
//! # Operation Lifecycle
//!
//! ```text
//! queued -> dependenciesResolved -> executing -> { succeeded | failed }
//!    \______________________________/
//!                  \-> cancelled (fail-fast or failed prerequisite)
//! ```
//!
//! Every operation is executed at most once; failed operations are never
//! re-issued.

pub mod plan;
pub mod write_back;

pub use plan::{PlannedOperation, SavePlan};
pub use write_back::{
    OperationOutcome, SaveReport, ScheduledBatch, WriteBackContext, WriteBackScheduler,
};

use crate::db::RemoteRequest;
use crate::models::{Identifier, ReferenceKey};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::watch;

/// Intent of an outbound operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Insert,
    Update,
    Delete,
}

impl OperationKind {
    /// Submission priority within a table: inserts, then updates, then deletes
    pub fn priority(&self) -> u8 {
        match self {
            OperationKind::Insert => 0,
            OperationKind::Update => 1,
            OperationKind::Delete => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Insert => "insert",
            OperationKind::Update => "update",
            OperationKind::Delete => "delete",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State of one operation in the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OperationState {
    Queued,
    DependenciesResolved,
    Executing,
    Succeeded,
    Failed,
    Cancelled,
}

impl OperationState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OperationState::Succeeded | OperationState::Failed | OperationState::Cancelled
        )
    }
}

/// Scheduler-assigned operation id, unique per scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OperationId(pub u64);

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op-{}", self.0)
    }
}

/// An outbound insert/update/delete intent
pub struct PendingOperation {
    pub kind: OperationKind,
    pub entity: String,
    pub identifier: Identifier,

    /// Remote table the operation is grouped under
    pub table: String,

    /// Identifiers whose operations must complete first
    pub dependencies: Vec<Identifier>,

    pub request: Box<dyn RemoteRequest>,
}

impl PendingOperation {
    pub fn new(
        kind: OperationKind,
        entity: impl Into<String>,
        identifier: Identifier,
        table: impl Into<String>,
        request: Box<dyn RemoteRequest>,
    ) -> Self {
        Self {
            kind,
            entity: entity.into(),
            identifier,
            table: table.into(),
            dependencies: Vec::new(),
            request,
        }
    }

    pub fn with_dependencies(mut self, dependencies: Vec<Identifier>) -> Self {
        self.dependencies = dependencies;
        self
    }

    pub fn reference_key(&self) -> ReferenceKey {
        ReferenceKey::new(self.entity.clone(), self.identifier.clone())
    }
}

impl fmt::Debug for PendingOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingOperation")
            .field("kind", &self.kind)
            .field("entity", &self.entity)
            .field("identifier", &self.identifier)
            .field("table", &self.table)
            .field("dependencies", &self.dependencies)
            .finish_non_exhaustive()
    }
}

/// Observer of one operation's state, used as a prerequisite handle
#[derive(Debug, Clone)]
pub struct OperationHandle {
    id: OperationId,
    receiver: watch::Receiver<OperationState>,
}

impl OperationHandle {
    pub(crate) fn new(id: OperationId, receiver: watch::Receiver<OperationState>) -> Self {
        Self { id, receiver }
    }

    pub fn id(&self) -> OperationId {
        self.id
    }

    pub fn state(&self) -> OperationState {
        *self.receiver.borrow()
    }

    /// Wait until the operation reaches a terminal state
    ///
    /// If the pipeline is torn down first, returns the last observed state.
    pub async fn wait(&mut self) -> OperationState {
        loop {
            let state = *self.receiver.borrow_and_update();
            if state.is_terminal() {
                return state;
            }
            if self.receiver.changed().await.is_err() {
                return *self.receiver.borrow();
            }
        }
    }
}
