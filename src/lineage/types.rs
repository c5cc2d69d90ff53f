use serde::Serialize;

use crate::object::ObjectId;
use crate::task::TaskSpecification;

/// The recipe capable of regenerating one object: the producing task
/// specification, keyed by the object's identity.
#[derive(Debug, Clone, Serialize)]
pub struct LineageEntry {
    pub object: ObjectId,
    pub spec: TaskSpecification,
    /// Serialized size charged against the store's byte budget.
    pub serialized_bytes: u64,
}

/// Result of a lineage lookup.
///
/// `Evicted` and `NeverStored` are deliberately distinct: they map to
/// different terminal errors (`LineageEvicted` vs `ObjectLost`).
#[derive(Debug, Clone)]
pub enum LineageLookup {
    Present(LineageEntry),
    /// An entry existed once but was evicted under memory pressure.
    /// Permanent; there is no re-insertion.
    Evicted,
    NeverStored,
}
