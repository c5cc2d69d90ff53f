//! In-Memory Object Store
//!
//! Reference implementation of the physical store: per-node primary copies
//! plus a spilled tier, all in process memory. Structure:
//! `ObjectId -> NodeId -> bytes`.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;

use super::ObjectStore;
use crate::membership::NodeId;
use crate::object::ObjectId;

pub struct InMemoryStore {
    primary: DashMap<ObjectId, DashMap<NodeId, Vec<u8>>>,
    spilled: DashMap<ObjectId, (NodeId, Vec<u8>)>,
}

impl InMemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            primary: DashMap::new(),
            spilled: DashMap::new(),
        })
    }

    /// Drops every copy a dead node held. The object table performs the
    /// corresponding location sweep; this only releases the bytes.
    pub fn fail_node(&self, node: &NodeId) {
        for entry in self.primary.iter() {
            entry.value().remove(node);
        }
        self.spilled.retain(|_, (holder, _)| holder != node);
    }

    pub fn copy_count(&self, id: &ObjectId) -> usize {
        let primaries = self
            .primary
            .get(id)
            .map(|copies| copies.len())
            .unwrap_or(0);
        primaries + usize::from(self.spilled.contains_key(id))
    }
}

#[async_trait]
impl ObjectStore for InMemoryStore {
    async fn put(&self, id: &ObjectId, node: &NodeId, bytes: Vec<u8>) {
        self.primary
            .entry(id.clone())
            .or_default()
            .insert(node.clone(), bytes);
    }

    async fn get(&self, id: &ObjectId) -> Option<Vec<u8>> {
        if let Some(copies) = self.primary.get(id)
            && let Some(copy) = copies.iter().next()
        {
            return Some(copy.value().clone());
        }

        self.spilled.get(id).map(|entry| entry.value().1.clone())
    }

    async fn evict(&self, id: &ObjectId) {
        self.primary.remove(id);
        self.spilled.remove(id);
    }

    async fn spill(&self, id: &ObjectId, node: &NodeId) -> anyhow::Result<()> {
        let copies = self
            .primary
            .get(id)
            .ok_or_else(|| anyhow::anyhow!("No copy of {} to spill", id))?;
        let (_, bytes) = copies
            .remove(node)
            .ok_or_else(|| anyhow::anyhow!("Node {} holds no copy of {}", node, id))?;
        drop(copies);

        self.spilled.insert(id.clone(), (node.clone(), bytes));
        tracing::debug!("Spilled object {} on node {}", id, node);
        Ok(())
    }
}
