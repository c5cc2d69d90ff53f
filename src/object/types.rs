use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::membership::NodeId;
use crate::task::TaskId;

/// Unique handle to one task return value.
///
/// Derived deterministically from the owning task specification id and the
/// return-slot index, so a re-executed attempt regenerates the *same*
/// identity it was asked to recover.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ObjectId(pub String);

impl ObjectId {
    pub fn new(task: &TaskId, return_index: u32) -> Self {
        Self(format!("{}:{}", task.0, return_index))
    }

    /// The return-slot index encoded in the identity.
    pub fn return_index(&self) -> u32 {
        self.0
            .rsplit(':')
            .next()
            .and_then(|slot| slot.parse().ok())
            .unwrap_or(0)
    }
}

impl std::fmt::Display for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Data state of one object.
///
/// Transitions are monotonic except for explicit recovery:
/// `Unresolved -> {Available, Spilled} -> Lost -> Reconstructing ->
/// {Available, PermanentlyLost}`. `Freed` is terminal and reachable from any
/// non-terminal state; it is never recoverable by reconstruction.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DataState {
    /// Declared (task submitted) but no copy produced yet.
    Unresolved,
    /// At least one in-memory copy exists on some node.
    Available,
    /// No in-memory copy, but a spilled copy is reachable.
    Spilled,
    /// No copy reachable; candidate for reconstruction.
    Lost,
    /// A reconstruction is in flight for this object.
    Reconstructing,
    /// Reconstruction failed terminally; the classified error is cached.
    PermanentlyLost,
    /// Explicitly released by the caller. Terminal.
    Freed,
}

/// Bookkeeping record for one object identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectRecord {
    /// Id of the task specification that produces this object.
    pub owner_task: TaskId,
    /// Return-slot index within the producing task.
    pub return_index: u32,
    /// Size in bytes, once known.
    pub size_bytes: Option<u64>,
    pub state: DataState,
    /// Nodes currently holding an in-memory copy.
    pub locations: HashSet<NodeId>,
    /// Node holding a spilled copy, if any.
    pub spilled_on: Option<NodeId>,
    /// References held by live callers holding the identity.
    pub direct_refs: u64,
    /// References held as unresolved arguments inside other lineage entries
    /// or nested inside other objects' serialized contents.
    pub indirect_refs: u64,
    /// True while the object is expected from a still-running streaming
    /// attempt rather than from a fresh resubmission.
    pub pending_creation: bool,
}

impl ObjectRecord {
    pub fn new(owner_task: TaskId, return_index: u32) -> Self {
        Self {
            owner_task,
            return_index,
            size_bytes: None,
            state: DataState::Unresolved,
            locations: HashSet::new(),
            spilled_on: None,
            direct_refs: 0,
            indirect_refs: 0,
            pending_creation: false,
        }
    }

    pub fn total_refs(&self) -> u64 {
        self.direct_refs + self.indirect_refs
    }

    /// True when at least one copy (in-memory or spilled) is reachable.
    pub fn is_reachable(&self) -> bool {
        !self.locations.is_empty() || self.spilled_on.is_some()
    }
}

/// Result of a location query against the object table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Available { locations: Vec<NodeId> },
    Spilled { node: NodeId },
    /// Not produced yet, or a reconstruction is in flight.
    Pending,
    Lost,
    PermanentlyLost,
    Freed,
    /// Identity was never registered (or already garbage-collected).
    Unknown,
}
