//! Build-queue error types.

use thiserror::Error;

pub type QueueResult<T> = Result<T, QueueError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("queue request timed out: {0}")]
    Timeout(String),

    #[error("queue transport error: {0}")]
    Transport(String),

    #[error("queue api error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("invalid queue response: {0}")]
    Decode(String),

    #[error("queue unavailable: {0}")]
    Unavailable(String),
}
