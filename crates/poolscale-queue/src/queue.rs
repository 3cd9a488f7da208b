use async_trait::async_trait;

use poolscale_core::Selector;

use crate::error::QueueResult;

/// Source of the pending-build count for a pool.
#[async_trait]
pub trait BuildQueue: Send + Sync {
    /// Builds waiting for an agent whose labels match `selector`.
    async fn pending(&self, selector: &Selector) -> QueueResult<u32>;
}
