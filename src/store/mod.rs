//! Physical Store Seam
//!
//! The byte store (in-memory buffers, spill-to-disk, inter-node transfer)
//! is an external collaborator; reconstruction only needs the
//! put/get/evict/spill contract keyed by object identity. Reachability
//! decisions are never made here; the object table is the ground truth.

pub mod memory;

use async_trait::async_trait;

use crate::membership::NodeId;
use crate::object::ObjectId;

/// The physical object store contract.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Places a copy of the object's bytes on `node`.
    async fn put(&self, id: &ObjectId, node: &NodeId, bytes: Vec<u8>);

    /// Fetches the bytes from any reachable copy (spilled included).
    async fn get(&self, id: &ObjectId) -> Option<Vec<u8>>;

    /// Drops every copy of the object, spilled tier included.
    async fn evict(&self, id: &ObjectId);

    /// Moves the copy held by `node` to secondary storage on that node.
    async fn spill(&self, id: &ObjectId, node: &NodeId) -> anyhow::Result<()>;
}

pub use memory::InMemoryStore;
