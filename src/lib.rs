//! Distributed Recovery Core Library
//!
//! This library crate implements the fault-tolerance core of a distributed
//! task-execution platform: it remembers the lineage (recipe) of every
//! distributed value, detects when a value's data becomes unreachable, and
//! transparently re-executes the minimal set of tasks needed to recompute it,
//! while bounding the memory spent on remembering how to do so.
//!
//! ## Architecture Modules
//! The system is composed of the following subsystems, leaves first:
//!
//! - **`membership`**: The cluster liveness view. Consumes node-death
//!   notifications from the external membership service and exposes
//!   `is_alive` plus a death broadcast channel.
//! - **`object`**: The object table. Per-object ownership, location, and
//!   reference-count bookkeeping; the ground truth for "is this object's
//!   data currently reachable".
//! - **`lineage`**: The bounded-size lineage store. Maps object identity to
//!   the task specification that can regenerate it, evicting oldest entries
//!   under a byte budget.
//! - **`task`**: Task specifications, the attempt tracker (retry budgets and
//!   failure classification), and generator stream progress tracking.
//! - **`placement`**: The seam to the external scheduler, plus an in-process
//!   handler registry implementation.
//! - **`store`**: The seam to the physical byte store (put/get/evict/spill)
//!   plus an in-memory implementation.
//! - **`reconstruction`**: The reconstruction coordinator. Walks lineage
//!   backward, dedupes concurrent recoveries, resubmits task attempts, and
//!   resolves caller waits.

pub mod config;
pub mod error;
pub mod lineage;
pub mod membership;
pub mod object;
pub mod placement;
pub mod reconstruction;
pub mod store;
pub mod task;
