//! Object Table
//!
//! Per-object ownership, location, and reference-count bookkeeping. This is
//! the ground truth for "is this object's data currently reachable": the
//! reconstruction coordinator acts only on what this table reports.

pub mod table;
pub mod types;


pub use table::{LossOutcome, ObjectTable};
pub use types::{DataState, ObjectId, ObjectRecord, Resolution};
