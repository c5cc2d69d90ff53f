use crate::error::RecoveryError;

/// State machine per unreachable object.
///
/// `Finished` and `PermanentlyFailed` are terminal; everything prior is
/// recoverable and never surfaced to callers.
#[derive(Debug, Clone)]
pub enum RecoveryState {
    NotStarted,
    /// Recursively ensuring the regenerating task's arguments are present.
    WaitingForDependencies,
    /// The task has been resubmitted for execution.
    WaitingForExecution,
    Finished,
    PermanentlyFailed(RecoveryError),
}

impl RecoveryState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RecoveryState::Finished | RecoveryState::PermanentlyFailed(_)
        )
    }
}
