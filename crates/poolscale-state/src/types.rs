//! Persisted status projection of an Autoscaler resource.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Outcome of the most recently completed reconciliation pass.
///
/// Derived and overwritten every pass; never an input to reconciliation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    /// Autoscaler resource name.
    pub autoscaler: String,
    /// Active provider name.
    pub provider: String,
    /// Instances counted toward the pool after the pass.
    pub observed_pool_size: u32,
    /// Target pool size chosen by the pass.
    pub desired_pool_size: u32,
    /// Instances created but not yet confirmed by the provider.
    pub pending: u32,
    /// Instances being destroyed.
    pub draining: u32,
    pub last_reconcile_time: Option<DateTime<Utc>>,
    /// Most recent error of the pass, if any.
    pub last_error: Option<String>,
}

impl Status {
    /// An empty status for a resource that has not completed a pass.
    pub fn new(autoscaler: &str, provider: &str) -> Self {
        Self {
            autoscaler: autoscaler.to_string(),
            provider: provider.to_string(),
            observed_pool_size: 0,
            desired_pool_size: 0,
            pending: 0,
            draining: 0,
            last_reconcile_time: None,
            last_error: None,
        }
    }

    /// Whether the pool has reached its target.
    pub fn converged(&self) -> bool {
        self.observed_pool_size == self.desired_pool_size && self.pending == 0 && self.draining == 0
    }
}
