//! Error taxonomy of the scheduling services.

use thiserror::Error;

use crate::store::StoreError;

/// Failure reported by an external collaborator (work source or executor).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("collaborator error: {0}")]
pub struct CollaboratorError(pub String);

impl CollaboratorError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// Why a service cycle did not complete.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CycleError {
    /// A store call failed. Transient variants are retried with backoff.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The work source failed; the cycle was skipped without side effects.
    #[error("work source failed: {0}")]
    WorkSource(CollaboratorError),

    /// Every watermark compare-and-swap in this cycle was lost.
    #[error("watermark contention: gave up after {0} attempts")]
    Contention(u32),
}

impl CycleError {
    /// Transient infrastructure failure (counts against liveness).
    pub fn is_transient(&self) -> bool {
        matches!(self, CycleError::Store(e) if e.is_transient())
    }
}
