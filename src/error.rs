//! Engine error types.

use crate::id::Id;
use thiserror::Error;

/// Errors from the state machine engine.
///
/// Recovered faults (a failing condition callback, a replication-lag
/// source mismatch) are logged and never surface here; this type covers
/// contract violations and faults that must halt the affected engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("operation requires the authoritative instance")]
    NotAuthoritative,

    #[error("engine halted by a previous runaway-transition fault")]
    Halted,

    #[error("runaway transitions in state {state}: {limit} applied within one tick")]
    RunawayTransitions { state: Id, limit: usize },

    #[error("state not found: {0}")]
    StateNotFound(Id),

    #[error("transition not found: {0}")]
    TransitionNotFound(Id),

    #[error("invalid snapshot: {reason}")]
    InvalidSnapshot { reason: String },
}

impl EngineError {
    /// Returns whether this error halts further simulation progress for
    /// the engine, as opposed to rejecting a single call.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            EngineError::Halted | EngineError::RunawayTransitions { .. }
        )
    }
}
