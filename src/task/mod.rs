//! Task Specifications and Attempt Tracking
//!
//! Defines the immutable description of one callable invocation
//! (`TaskSpecification`), the mutable per-submission execution records
//! (`TaskAttempt`), the retry-budget arithmetic, and the progress tracking
//! for streaming (generator) tasks.

pub mod generator;
pub mod tracker;
pub mod types;


pub use generator::{GeneratorRegistry, GeneratorStream};
pub use tracker::{NextAttempt, TaskAttemptTracker, resolve_retry_budget};
pub use types::{
    ActorId, AttemptOutcome, AttemptPhase, AttemptStatus, ProducedCopy, ReturnCount, TaskArg,
    TaskAttempt, TaskId, TaskSpecification, TaskStatusSnapshot, TaskTarget,
};
