//! Provider error types.

use thiserror::Error;

/// Result type alias for provider calls.
pub type ProviderResult<T> = Result<T, ProviderError>;

/// Errors returned by provider adapters.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    /// The call did not complete in time; its outcome is unknown.
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// The connection broke after the request was sent.
    #[error("request interrupted: {0}")]
    Interrupted(String),

    /// The request never reached the provider.
    #[error("transport error: {0}")]
    Transport(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("provider api error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("instance not found: {0}")]
    NotFound(String),

    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("invalid provider response: {0}")]
    Decode(String),

    #[error("unsupported provider: {0}")]
    Unsupported(String),

    #[error("provider configuration error: {0}")]
    Config(String),
}

impl ProviderError {
    /// Whether a failed create may still have produced an instance.
    ///
    /// The next provider listing is authoritative for these.
    pub fn is_ambiguous(&self) -> bool {
        match self {
            ProviderError::Timeout(_) | ProviderError::Interrupted(_) => true,
            ProviderError::Api { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Whether the same call may succeed on a later pass.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProviderError::Timeout(_)
                | ProviderError::Interrupted(_)
                | ProviderError::Transport(_)
                | ProviderError::RateLimited(_)
                | ProviderError::QuotaExceeded(_)
        ) || matches!(self, ProviderError::Api { status, .. } if *status >= 500)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ambiguity_classification() {
        assert!(ProviderError::Timeout("create".into()).is_ambiguous());
        assert!(ProviderError::Interrupted("reset".into()).is_ambiguous());
        assert!(ProviderError::Api { status: 502, message: "bad gateway".into() }.is_ambiguous());
        assert!(!ProviderError::Api { status: 422, message: "bad size".into() }.is_ambiguous());
        assert!(!ProviderError::Transport("refused".into()).is_ambiguous());
        assert!(!ProviderError::RateLimited("slow down".into()).is_ambiguous());
    }

    #[test]
    fn transient_classification() {
        assert!(ProviderError::RateLimited("slow down".into()).is_transient());
        assert!(ProviderError::Transport("refused".into()).is_transient());
        assert!(!ProviderError::Unsupported("amazon".into()).is_transient());
        assert!(!ProviderError::Api { status: 401, message: "unauthorized".into() }.is_transient());
    }
}
