use serde::{Deserialize, Serialize};

use crate::membership::NodeId;
use crate::object::ObjectId;

/// Unique identifier for a task specification.
///
/// Wrapper around a UUID string to ensure global uniqueness.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

/// Unique identifier for a long-lived actor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ActorId(pub String);

impl ActorId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl std::fmt::Display for ActorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Invocation target: a free function or a method bound to an actor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum TaskTarget {
    FreeFunction { name: String },
    ActorMethod { actor: ActorId, name: String },
}

impl TaskTarget {
    /// The handler name the placement layer dispatches on.
    pub fn name(&self) -> &str {
        match self {
            TaskTarget::FreeFunction { name } => name,
            TaskTarget::ActorMethod { name, .. } => name,
        }
    }

    pub fn bound_actor(&self) -> Option<&ActorId> {
        match self {
            TaskTarget::FreeFunction { .. } => None,
            TaskTarget::ActorMethod { actor, .. } => Some(actor),
        }
    }
}

/// One task argument: an inlined value or a reference to another object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TaskArg {
    Inline(serde_json::Value),
    ObjectRef(ObjectId),
}

/// Declared number of return values.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ReturnCount {
    Fixed(u32),
    /// Streaming/unbounded: the task yields values incrementally.
    Streaming,
}

/// Immutable description of one callable invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpecification {
    pub id: TaskId,
    pub target: TaskTarget,
    pub args: Vec<TaskArg>,
    pub returns: ReturnCount,
    /// Declared retry budget; `-1` means unlimited, `None` defers to the
    /// environment override or the platform default.
    pub max_retries: Option<i64>,
    /// The process responsible for freeing/reconstructing this task's
    /// outputs on behalf of all borrowers.
    pub owner: NodeId,
}

impl TaskSpecification {
    /// Object identities of the declared (fixed) return slots.
    ///
    /// Streaming tasks declare their outputs incrementally, so this is
    /// empty for them.
    pub fn return_ids(&self) -> Vec<ObjectId> {
        match self.returns {
            ReturnCount::Fixed(n) => (0..n).map(|i| ObjectId::new(&self.id, i)).collect(),
            ReturnCount::Streaming => Vec::new(),
        }
    }

    /// Arguments that are references to other objects.
    pub fn object_args(&self) -> impl Iterator<Item = &ObjectId> {
        self.args.iter().filter_map(|arg| match arg {
            TaskArg::ObjectRef(id) => Some(id),
            TaskArg::Inline(_) => None,
        })
    }
}

/// Lifecycle state of one (re)submission.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum AttemptStatus {
    WaitingForDependencies,
    Submitted,
    Running,
    Finished,
    Failed,
}

/// Mutable execution record for one (re)submission of a specification.
#[derive(Debug, Clone)]
pub struct TaskAttempt {
    /// 0-based attempt index.
    pub index: u32,
    pub status: AttemptStatus,
    /// Classified outcome, set once the attempt completes.
    pub outcome: Option<AttemptOutcome>,
}

/// One value published by a completed attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProducedCopy {
    pub id: ObjectId,
    pub node: NodeId,
    pub size_bytes: u64,
}

/// Classified result of one attempt, as reported by the placement layer.
#[derive(Debug, Clone)]
pub enum AttemptOutcome {
    Finished { returns: Vec<ProducedCopy> },
    /// The task's own code raised/returned an error. Deterministic.
    ApplicationError { reason: String },
    /// The worker process terminated abnormally before completion.
    WorkerCrashed { node: NodeId },
    /// The bound actor's restart budget is exhausted. Non-retryable.
    ActorUnavailable { actor: ActorId },
}

/// Per-task attempt phase, using the exact labels operational tooling
/// consumes for monitoring reconstruction progress.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum AttemptPhase {
    #[serde(rename = "PENDING_ARGS_AVAIL")]
    WaitingForDependencies,
    #[serde(rename = "SUBMITTED_TO_WORKER")]
    WaitingForExecution,
    #[serde(rename = "FINISHED")]
    Finished,
}

/// Point-in-time snapshot row for one task.
#[derive(Debug, Clone, Serialize)]
pub struct TaskStatusSnapshot {
    pub task: TaskId,
    /// 0-based index of the latest attempt.
    pub attempt: u32,
    pub phase: AttemptPhase,
}
