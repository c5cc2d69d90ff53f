//! Lineage Store
//!
//! Bounded-size mapping from object identity to the task specification that
//! can regenerate it. Retention is a longer-lived concern than data
//! survival: an object's bytes may be evicted while its lineage entry lives
//! on, and vice versa once the byte budget forces entries out.

pub mod store;
pub mod types;


pub use store::{LineageStore, PutOutcome};
pub use types::{LineageEntry, LineageLookup};
