//! Reconciliation error types.

use thiserror::Error;

/// Errors raised by the reconciliation core itself.
///
/// Provider and queue failures are not errors at this level; they are
/// recorded per action and folded into `Status.last_error`.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// Registry or plan consistency was violated. A programming error.
    #[error("invariant violated: {0}")]
    Invariant(String),

    #[error("state store error: {0}")]
    State(#[from] poolscale_state::StateError),

    #[error("reconcile pass aborted: {0}")]
    PassAborted(String),
}

pub type ReconcileResult<T> = Result<T, ReconcileError>;

pub(crate) fn invariant(message: impl Into<String>) -> ReconcileError {
    ReconcileError::Invariant(message.into())
}
