//! Recovery Configuration
//!
//! Immutable configuration shared by every component constructor. There is
//! no ambient/global state: each service receives the config (or a clone of
//! it) when it is built.

use std::time::Duration;

/// Default retry budget applied when a task specification does not declare
/// its own `max_retries` and no override is in effect.
pub const DEFAULT_MAX_RETRIES: i64 = 3;

/// Default byte budget for retained lineage entries.
pub const DEFAULT_MAX_LINEAGE_BYTES: u64 = 64 * 1024 * 1024;

/// Base pause between a failed attempt and its resubmission.
pub const DEFAULT_TASK_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Tunables for the lineage/reconstruction subsystem.
#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    /// When false, a lost object is never recomputed: callers observe
    /// `ObjectLost` immediately.
    pub reconstruction_enabled: bool,
    /// When false, lineage entries are not retained at all. Reconstruction
    /// then fails as if no lineage ever existed.
    pub lineage_pinning_enabled: bool,
    /// Upper bound on the cumulative serialized size of retained lineage
    /// entries. Exceeding it evicts entries oldest-first.
    pub max_lineage_bytes: u64,
    /// Platform default retry budget; `-1` means unlimited.
    pub max_retries_default: i64,
    /// Base delay between attempt resubmissions (doubled per retry, with
    /// jitter).
    pub task_retry_delay: Duration,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            reconstruction_enabled: true,
            lineage_pinning_enabled: true,
            max_lineage_bytes: DEFAULT_MAX_LINEAGE_BYTES,
            max_retries_default: DEFAULT_MAX_RETRIES,
            task_retry_delay: DEFAULT_TASK_RETRY_DELAY,
        }
    }
}

impl RecoveryConfig {
    /// Config with reconstruction (and lineage retention) fully disabled.
    pub fn disabled() -> Self {
        Self {
            reconstruction_enabled: false,
            lineage_pinning_enabled: false,
            ..Self::default()
        }
    }
}
