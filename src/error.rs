//! Failure Taxonomy
//!
//! Errors surfaced to callers of `ensure_available`/`resolve`. Recoverable
//! conditions are retried internally and never appear here; every variant
//! below is terminal for the object it names (except `WaitTimeout`, which
//! only means the caller's bounded wait elapsed while recovery was still
//! legitimately in flight).
//!
//! Variants are `Clone` because a terminal failure is cached against the
//! object identity and replayed to every current and future waiter.

use std::time::Duration;
use thiserror::Error;

use crate::membership::NodeId;
use crate::object::ObjectId;
use crate::task::{ActorId, TaskId};

#[derive(Debug, Clone, Error, PartialEq)]
pub enum RecoveryError {
    /// Data unreachable and not recoverable: reconstruction is disabled or
    /// no lineage was ever retained for this object.
    #[error("object {0} is lost and cannot be reconstructed")]
    ObjectLost(ObjectId),

    /// The caller explicitly freed the object. Never reconstructable, even
    /// if a valid lineage entry still exists.
    #[error("object {0} was explicitly freed and cannot be reconstructed")]
    ObjectFreed(ObjectId),

    /// A lineage entry existed but was evicted under memory pressure before
    /// reconstruction could use it. Eviction is permanent.
    #[error("lineage for object {0} was evicted under memory pressure")]
    LineageEvicted(ObjectId),

    /// The regenerating task ran and failed deterministically. The original
    /// application failure is what dependents observe.
    #[error("task {task} failed: {reason}")]
    TaskError { task: TaskId, reason: String },

    /// The attempt's worker process terminated abnormally on every try of
    /// the retry budget.
    #[error("worker executing task {task} crashed on node {node}")]
    WorkerCrashed { task: TaskId, node: NodeId },

    /// An upstream input of the regenerating task could not itself be
    /// recomputed.
    #[error("input arguments for task {task} could not be computed: {reason}")]
    DependenciesUnavailable { task: TaskId, reason: String },

    /// The task is bound to an actor whose restart budget is exhausted;
    /// such tasks are non-retryable regardless of their own budget.
    #[error("actor {0} is permanently dead")]
    ActorUnavailable(ActorId),

    /// The caller's bounded wait elapsed while reconstruction was still in
    /// progress. Distinct from every loss outcome: the object is in flight,
    /// not lost.
    #[error("wait of {0:?} elapsed while the object was still being recovered")]
    WaitTimeout(Duration),

    /// A cycle was detected while walking lineage backward. Lineage must be
    /// a DAG; this is a fatal configuration-level bug, never retried.
    #[error("lineage cycle detected while reconstructing object {0}")]
    LineageCycle(ObjectId),
}
