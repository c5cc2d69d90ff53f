//! Reconstruction Coordinator
//!
//! The state machine that, given an unreachable object, walks lineage
//! backward, dedupes concurrent reconstruction requests, resubmits task
//! attempts, and resolves caller waits. Also the crate's facade: embedders
//! record submissions and availability here and block on
//! `ensure_available`.

pub mod coordinator;
pub mod types;

#[cfg(test)]
mod tests;

pub use coordinator::ReconstructionCoordinator;
pub use types::RecoveryState;
