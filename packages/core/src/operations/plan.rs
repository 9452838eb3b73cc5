//! Save Plan
//!
//! Turns one save batch into an explicit dependency graph, resolved once per
//! batch.
//!
//! # Edges
//!
//! - **Per identifier**: each operation waits for the previous operation
//!   submitted for the same identifier, so insert, update and delete of one
//!   record never run out of order or concurrently.
//! - **Declared dependencies**: an operation waits for the latest operation of
//!   each identifier it depends on that was submitted before it, or the first
//!   one submitted after it when there is none.
//! - **Serial pipelines**: with a pipeline width of 1 every operation also waits
//!   for its predecessor in plan order, giving strict global ordering.
//!
//! Identifiers without an operation in the batch are reported as external
//! prerequisites; the scheduler resolves them against operations still in
//! flight from earlier batches.
//!
//! # Order
//!
//! The plan is a topological order of the graph. Among operations that are
//! ready at the same time, the one with the smallest
//! `(table, kind priority, submission index)` goes first, which groups writes
//! by table and puts inserts before updates before deletes.

use super::{OperationId, OperationKind, PendingOperation};
use crate::db::{StoreError, StoreResult};
use crate::models::{Identifier, ReferenceKey};
use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap};

/// One operation with its position-resolved prerequisites
#[derive(Debug)]
pub struct PlannedOperation {
    pub id: OperationId,
    pub operation: PendingOperation,

    /// Plan positions of in-batch prerequisites (always earlier positions)
    pub prerequisites: Vec<usize>,

    /// Identifiers to wait on from earlier, still running batches
    pub external: Vec<Identifier>,
}

/// Dependency-ordered save batch
#[derive(Debug)]
pub struct SavePlan {
    operations: Vec<PlannedOperation>,
}

impl SavePlan {
    /// Build the plan for a batch
    ///
    /// Operation ids are assigned in submission order starting at `first_id`.
    /// Fails with `InvalidRequest` when the declared dependencies form a cycle.
    pub fn build(
        operations: Vec<PendingOperation>,
        serialize: bool,
        first_id: u64,
    ) -> StoreResult<Self> {
        let count = operations.len();
        let mut prerequisites: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); count];
        let mut external: Vec<Vec<Identifier>> = vec![Vec::new(); count];

        let mut positions: HashMap<&Identifier, Vec<usize>> = HashMap::new();
        for (index, op) in operations.iter().enumerate() {
            positions.entry(&op.identifier).or_default().push(index);
        }

        for (index, op) in operations.iter().enumerate() {
            match previous(&positions, &op.identifier, index) {
                Some(prior) => {
                    prerequisites[index].insert(prior);
                }
                None => external[index].push(op.identifier.clone()),
            }

            for dependency in &op.dependencies {
                if dependency == &op.identifier {
                    continue;
                }
                let prerequisite = previous(&positions, dependency, index)
                    .or_else(|| positions.get(dependency).and_then(|p| p.first().copied()));
                match prerequisite {
                    Some(prior) => {
                        prerequisites[index].insert(prior);
                    }
                    None => {
                        if !external[index].contains(dependency) {
                            external[index].push(dependency.clone());
                        }
                    }
                }
            }
        }

        let order = topological_order(&operations, &prerequisites)?;

        if serialize {
            for pair in order.windows(2) {
                prerequisites[pair[1]].insert(pair[0]);
            }
        }

        let mut position_of = vec![0; count];
        for (position, &index) in order.iter().enumerate() {
            position_of[index] = position;
        }

        let mut planned: Vec<(usize, PlannedOperation)> = operations
            .into_iter()
            .zip(prerequisites)
            .zip(external)
            .enumerate()
            .map(|(index, ((operation, prereqs), external))| {
                let mut prerequisites: Vec<usize> =
                    prereqs.into_iter().map(|p| position_of[p]).collect();
                prerequisites.sort_unstable();
                (
                    position_of[index],
                    PlannedOperation {
                        id: OperationId(first_id + index as u64),
                        operation,
                        prerequisites,
                        external,
                    },
                )
            })
            .collect();
        planned.sort_by_key(|(position, _)| *position);

        Ok(Self {
            operations: planned.into_iter().map(|(_, op)| op).collect(),
        })
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn operations(&self) -> &[PlannedOperation] {
        &self.operations
    }

    pub fn into_operations(self) -> Vec<PlannedOperation> {
        self.operations
    }

    /// Planned submission order
    pub fn order(&self) -> Vec<(OperationKind, ReferenceKey)> {
        self.operations
            .iter()
            .map(|p| (p.operation.kind, p.operation.reference_key()))
            .collect()
    }
}

/// Latest submission index for `identifier` before `index`
fn previous(
    positions: &HashMap<&Identifier, Vec<usize>>,
    identifier: &Identifier,
    index: usize,
) -> Option<usize> {
    positions
        .get(identifier)?
        .iter()
        .rev()
        .find(|&&p| p < index)
        .copied()
}

/// Kahn's algorithm with `(table, kind priority, submission index)` tie-breaking
fn topological_order(
    operations: &[PendingOperation],
    prerequisites: &[BTreeSet<usize>],
) -> StoreResult<Vec<usize>> {
    let count = operations.len();
    let mut indegree: Vec<usize> = prerequisites.iter().map(BTreeSet::len).collect();
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); count];
    for (index, prereqs) in prerequisites.iter().enumerate() {
        for &p in prereqs {
            dependents[p].push(index);
        }
    }

    let rank = |index: usize| {
        let op = &operations[index];
        Reverse((op.table.as_str(), op.kind.priority(), index))
    };

    let mut ready: BinaryHeap<_> = (0..count)
        .filter(|&index| indegree[index] == 0)
        .map(|index| rank(index))
        .collect();

    let mut order = Vec::with_capacity(count);
    while let Some(Reverse((_, _, index))) = ready.pop() {
        order.push(index);
        for &dependent in &dependents[index] {
            indegree[dependent] -= 1;
            if indegree[dependent] == 0 {
                ready.push(rank(dependent));
            }
        }
    }

    if order.len() < count {
        let stuck: Vec<String> = (0..count)
            .filter(|&index| indegree[index] > 0)
            .map(|index| operations[index].reference_key().to_string())
            .collect();
        return Err(StoreError::invalid_request(format!(
            "dependency cycle among {}",
            stuck.join(", ")
        )));
    }

    Ok(order)
}
