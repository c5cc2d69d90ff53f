use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::broadcast;

use super::types::{NodeId, NodeState};

/// Capacity of the node-death broadcast channel. Death events are rare; a
/// lagging subscriber losing one would miss loss notifications, so the
/// buffer is generously sized.
const DEATH_CHANNEL_CAPACITY: usize = 256;

/// The liveness view of the cluster.
///
/// Populated by the external membership service: nodes are registered as
/// they join and reported dead when failure detection declares them gone.
/// Death events are pushed to subscribers (the reconstruction coordinator)
/// over a broadcast channel.
pub struct MembershipView {
    members: DashMap<NodeId, NodeState>,
    deaths: broadcast::Sender<NodeId>,
}

impl MembershipView {
    pub fn new() -> Arc<Self> {
        let (deaths, _) = broadcast::channel(DEATH_CHANNEL_CAPACITY);
        Arc::new(Self {
            members: DashMap::new(),
            deaths,
        })
    }

    /// Registers a node as alive. Idempotent; a dead node stays dead.
    pub fn register(&self, node: NodeId) {
        match self.members.get(&node) {
            Some(state) if *state == NodeState::Dead => {
                tracing::warn!("Ignoring re-registration of dead node {}", node);
            }
            _ => {
                self.members.insert(node, NodeState::Alive);
            }
        }
    }

    pub fn is_alive(&self, node: &NodeId) -> bool {
        self.members
            .get(node)
            .map(|state| *state == NodeState::Alive)
            .unwrap_or(false)
    }

    /// Marks a node dead and pushes the death to all subscribers.
    ///
    /// Reporting an unknown or already-dead node is a no-op, so the
    /// membership service may deliver the same death more than once.
    pub fn report_death(&self, node: &NodeId) {
        let newly_dead = match self.members.get_mut(node) {
            Some(mut state) => {
                if *state == NodeState::Dead {
                    false
                } else {
                    *state = NodeState::Dead;
                    true
                }
            }
            None => false,
        };

        if newly_dead {
            tracing::warn!("Node {} declared DEAD", node);
            // Send fails only when nobody is subscribed, which is fine.
            let _ = self.deaths.send(node.clone());
        }
    }

    /// Subscribes to node-death push notifications.
    pub fn subscribe_deaths(&self) -> broadcast::Receiver<NodeId> {
        self.deaths.subscribe()
    }

    pub fn alive_count(&self) -> usize {
        self.members
            .iter()
            .filter(|entry| *entry.value() == NodeState::Alive)
            .count()
    }
}
