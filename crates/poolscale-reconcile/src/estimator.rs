//! Demand Estimator: build backlog to target pool size.

use poolscale_queue::QueueResult;

use crate::planner::PlanPolicy;

/// Target size derived from the build-queue signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Estimate {
    /// Target pool size, within the policy bounds.
    pub target: u32,
    /// Pending builds reported by the queue, if it answered.
    pub pending_builds: Option<u32>,
    /// Queue failure that forced a hold-steady target.
    pub error: Option<String>,
}

impl Estimate {
    /// Estimate from a queue answer.
    ///
    /// When the queue failed, the target holds at `current` (clamped)
    /// instead of collapsing to the minimum.
    pub fn from_signal(
        signal: QueueResult<u32>,
        concurrency: u32,
        policy: &PlanPolicy,
        current: u32,
    ) -> Self {
        match signal {
            Ok(pending) => Self {
                target: target_size(pending, concurrency, policy),
                pending_builds: Some(pending),
                error: None,
            },
            Err(e) => Self {
                target: policy.bound(current),
                pending_builds: None,
                error: Some(e.to_string()),
            },
        }
    }

    pub fn held(&self) -> bool {
        self.pending_builds.is_none()
    }
}

/// `ceil(pending / concurrency)` clamped to `[min, max]`.
pub fn target_size(pending: u32, concurrency: u32, policy: &PlanPolicy) -> u32 {
    policy.bound(pending.div_ceil(concurrency.max(1)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use poolscale_queue::QueueError;
    use std::time::Duration;

    fn policy(min: u32, max: u32) -> PlanPolicy {
        PlanPolicy {
            min,
            max,
            min_age: Duration::from_secs(55 * 60),
            recycle: 1,
            max_actions: None,
        }
    }

    #[test]
    fn zero_backlog_yields_minimum() {
        assert_eq!(target_size(0, 2, &policy(2, 4)), 2);
        assert_eq!(target_size(0, 2, &policy(0, 4)), 0);
    }

    #[test]
    fn backlog_rounds_up_and_caps_at_maximum() {
        assert_eq!(target_size(5, 2, &policy(0, 10)), 3);
        assert_eq!(target_size(6, 2, &policy(0, 10)), 3);
        assert_eq!(target_size(12, 2, &policy(2, 4)), 4);
    }

    #[test]
    fn queue_failure_holds_current_size() {
        let estimate = Estimate::from_signal(
            Err(QueueError::Unavailable("connection refused".into())),
            2,
            &policy(2, 4),
            3,
        );
        assert_eq!(estimate.target, 3);
        assert!(estimate.held());
        assert!(estimate.error.unwrap().contains("connection refused"));
    }

    #[test]
    fn held_target_is_still_bounded() {
        let err = || Err(QueueError::Timeout("queue".into()));
        assert_eq!(Estimate::from_signal(err(), 2, &policy(2, 4), 0).target, 2);
        assert_eq!(Estimate::from_signal(err(), 2, &policy(2, 4), 9).target, 4);
    }
}
