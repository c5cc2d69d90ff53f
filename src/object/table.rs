//! Object Table Implementation
//!
//! All mutations on a given object go through `DashMap::get_mut`, which
//! holds the per-key write lock for the duration of the update. That gives
//! the single-writer-at-a-time-per-key discipline the rest of the system
//! relies on: a location read never observes a copy on a node that has
//! already been swept as dead for that copy.

use anyhow::Result;
use dashmap::DashMap;
use std::sync::Arc;

use super::types::{DataState, ObjectId, ObjectRecord, Resolution};
use crate::membership::NodeId;
use crate::task::TaskId;

/// Effect of reporting one copy lost.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LossOutcome {
    /// Identity not registered.
    Unknown,
    /// The named node held no copy, or the object is already terminal.
    Unaffected,
    /// Other copies remain; data is still reachable.
    StillReachable,
    /// Last copy gone while live references exist: the trigger that
    /// schedules reconstruction.
    LostWithReferences,
    /// Last copy gone and nobody holds a reference.
    LostUnreferenced,
}

/// The ground truth for object reachability and reference counts.
pub struct ObjectTable {
    records: DashMap<ObjectId, ObjectRecord>,
}

impl ObjectTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            records: DashMap::new(),
        })
    }

    /// Declares an object identity at task submission time. Idempotent.
    pub fn create(&self, id: ObjectId, owner_task: TaskId, return_index: u32) {
        self.records
            .entry(id)
            .or_insert_with(|| ObjectRecord::new(owner_task, return_index));
    }

    /// Records a fresh in-memory copy on `node`.
    ///
    /// Creates the record on the fly if the identity is unknown (a
    /// streaming attempt may publish values before bookkeeping catches up).
    /// A freed object stays freed.
    pub fn record_available(
        &self,
        id: &ObjectId,
        owner_task: &TaskId,
        return_index: u32,
        node: NodeId,
        size_bytes: u64,
    ) {
        let mut record = self
            .records
            .entry(id.clone())
            .or_insert_with(|| ObjectRecord::new(owner_task.clone(), return_index));

        if record.state == DataState::Freed {
            tracing::debug!("Ignoring copy of freed object {}", id);
            return;
        }

        record.locations.insert(node);
        record.size_bytes = Some(size_bytes);
        record.state = DataState::Available;
        record.pending_creation = false;
    }

    /// Records that the object's bytes were moved to secondary storage on
    /// `node`. The in-memory copy on that node is gone afterwards.
    pub fn record_spilled(&self, id: &ObjectId, node: NodeId) -> Result<()> {
        let mut record = self
            .records
            .get_mut(id)
            .ok_or_else(|| anyhow::anyhow!("Unknown object {}", id))?;

        if record.state == DataState::Freed {
            return Ok(());
        }

        record.locations.remove(&node);
        record.spilled_on = Some(node);
        if record.locations.is_empty() {
            record.state = DataState::Spilled;
        }

        Ok(())
    }

    /// Reports the copy held by `node` unreachable.
    ///
    /// If that was the last reachable copy the object transitions to `Lost`;
    /// the returned outcome tells the caller whether reconstruction should
    /// be scheduled (live references exist) or not.
    pub fn mark_lost(&self, id: &ObjectId, node: &NodeId) -> LossOutcome {
        let Some(mut record) = self.records.get_mut(id) else {
            return LossOutcome::Unknown;
        };

        if matches!(record.state, DataState::Freed | DataState::PermanentlyLost) {
            return LossOutcome::Unaffected;
        }

        let held_primary = record.locations.remove(node);
        let held_spilled = record.spilled_on.as_ref() == Some(node);
        if held_spilled {
            record.spilled_on = None;
        }
        if !held_primary && !held_spilled {
            return LossOutcome::Unaffected;
        }

        if record.is_reachable() {
            return LossOutcome::StillReachable;
        }

        record.state = DataState::Lost;
        tracing::warn!("Object {} lost (last copy was on node {})", id, node);

        if record.total_refs() > 0 {
            LossOutcome::LostWithReferences
        } else {
            LossOutcome::LostUnreferenced
        }
    }

    /// Location query. Linearizable per object.
    pub fn resolve(&self, id: &ObjectId) -> Resolution {
        let Some(record) = self.records.get(id) else {
            return Resolution::Unknown;
        };

        match record.state {
            DataState::Available => Resolution::Available {
                locations: record.locations.iter().cloned().collect(),
            },
            DataState::Spilled => match &record.spilled_on {
                Some(node) => Resolution::Spilled { node: node.clone() },
                None => Resolution::Lost,
            },
            DataState::Unresolved | DataState::Reconstructing => Resolution::Pending,
            DataState::Lost => Resolution::Lost,
            DataState::PermanentlyLost => Resolution::PermanentlyLost,
            DataState::Freed => Resolution::Freed,
        }
    }

    // --- Reference accounting ---

    pub fn add_reference(&self, id: &ObjectId) {
        if let Some(mut record) = self.records.get_mut(id) {
            record.direct_refs += 1;
        }
    }

    /// Drops one direct reference. Returns the remaining total count;
    /// reaching zero makes the object's bytes eligible for eviction.
    pub fn drop_reference(&self, id: &ObjectId) -> u64 {
        match self.records.get_mut(id) {
            Some(mut record) => {
                record.direct_refs = record.direct_refs.saturating_sub(1);
                record.total_refs()
            }
            None => 0,
        }
    }

    /// One more lineage entry (or serialized object) holds this identity as
    /// an unresolved argument.
    pub fn add_lineage_reference(&self, id: &ObjectId) {
        if let Some(mut record) = self.records.get_mut(id) {
            record.indirect_refs += 1;
        }
    }

    pub fn drop_lineage_reference(&self, id: &ObjectId) -> u64 {
        match self.records.get_mut(id) {
            Some(mut record) => {
                record.indirect_refs = record.indirect_refs.saturating_sub(1);
                record.total_refs()
            }
            None => 0,
        }
    }

    /// Removes the record entirely once nothing references it. Returns true
    /// if the record was released.
    pub fn release_if_unreferenced(&self, id: &ObjectId) -> bool {
        self.records
            .remove_if(id, |_, record| record.total_refs() == 0)
            .is_some()
    }

    // --- Recovery transitions ---

    pub fn set_reconstructing(&self, id: &ObjectId) {
        if let Some(mut record) = self.records.get_mut(id)
            && !matches!(record.state, DataState::Freed | DataState::Available)
        {
            record.state = DataState::Reconstructing;
        }
    }

    pub fn set_permanently_lost(&self, id: &ObjectId) {
        if let Some(mut record) = self.records.get_mut(id)
            && record.state != DataState::Freed
        {
            record.state = DataState::PermanentlyLost;
            record.pending_creation = false;
        }
    }

    pub fn set_pending_creation(&self, id: &ObjectId, pending: bool) {
        if let Some(mut record) = self.records.get_mut(id) {
            record.pending_creation = pending;
        }
    }

    /// Explicit, irrevocable release. All copies are forgotten and the state
    /// becomes terminal `Freed`.
    pub fn free(&self, id: &ObjectId) {
        if let Some(mut record) = self.records.get_mut(id) {
            record.locations.clear();
            record.spilled_on = None;
            record.pending_creation = false;
            record.state = DataState::Freed;
            tracing::info!("Object {} freed", id);
        }
    }

    /// Sweeps every copy held by a dead node.
    ///
    /// Returns the identities that became `Lost` while still referenced,
    /// i.e. the reconstruction candidates.
    pub fn handle_node_death(&self, node: &NodeId) -> Vec<ObjectId> {
        let affected: Vec<ObjectId> = self
            .records
            .iter()
            .filter(|entry| {
                entry.value().locations.contains(node)
                    || entry.value().spilled_on.as_ref() == Some(node)
            })
            .map(|entry| entry.key().clone())
            .collect();

        let mut to_reconstruct = Vec::new();
        for id in affected {
            if self.mark_lost(&id, node) == LossOutcome::LostWithReferences {
                to_reconstruct.push(id);
            }
        }

        tracing::info!(
            "Node {} death: {} referenced object(s) need reconstruction",
            node,
            to_reconstruct.len()
        );

        to_reconstruct
    }

    // --- Introspection ---

    pub fn record(&self, id: &ObjectId) -> Option<ObjectRecord> {
        self.records.get(id).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
