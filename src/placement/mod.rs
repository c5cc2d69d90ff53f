//! Placement Seam
//!
//! The reconstruction coordinator never runs task code itself; it hands a
//! specification and an attempt index to the placement service (the
//! external scheduler) and consumes the classified outcome. Scheduling
//! heuristics and admission control live entirely on the other side of
//! this trait.

pub mod registry;

use async_trait::async_trait;

use crate::task::{AttemptOutcome, TaskSpecification};

/// The external scheduler: assigns a task attempt to a worker and reports
/// how it ended.
#[async_trait]
pub trait PlacementService: Send + Sync {
    /// Submits one attempt for execution. Resolves once the attempt
    /// completes, with its classified outcome.
    async fn submit(&self, spec: &TaskSpecification, attempt: u32) -> AttemptOutcome;
}

pub use registry::ExecutionRegistry;
