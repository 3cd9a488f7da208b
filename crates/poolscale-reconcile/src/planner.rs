//! Capacity Planner: a pure function from registry snapshot and target
//! size to the create/destroy actions of one pass.
//!
//! Rules, in order:
//!
//! 1. The desired size is the target bounded to `[min, max]`.
//! 2. Above desired: destroy the surplus, instances older than `min_age`
//!    first, oldest first within each group. Nothing is created.
//! 3. At or below desired: create the gap. Additionally replace up to
//!    `recycle` instances older than `min_age` (destroy one, create one).
//! 4. Pending, Draining and unconfirmed instances count toward the current
//!    size but are never selected for destruction.
//! 5. `max_actions` caps creates plus destroys. A replacement pair costs two.

use std::collections::HashSet;
use std::time::Duration;

use chrono::{DateTime, Utc};

use poolscale_core::{AutoscalerConfig, Instance, InstanceId, InstanceState};

use crate::error::{ReconcileResult, invariant};
use crate::registry::Snapshot;

/// The pool-shape knobs the planner reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanPolicy {
    pub min: u32,
    pub max: u32,
    /// Age after which an instance is recycled. Zero disables recycling.
    pub min_age: Duration,
    /// Aged instances replaced per pass.
    pub recycle: u32,
    pub max_actions: Option<u32>,
}

impl PlanPolicy {
    pub fn from_config(config: &AutoscalerConfig) -> Self {
        Self {
            min: config.pool.min,
            max: config.pool.max,
            min_age: config.pool.min_age,
            recycle: config.pool.recycle,
            max_actions: config.config.max_actions,
        }
    }

    /// Bound `n` to `[min, max]`. `max` wins when the bounds are inverted.
    pub fn bound(&self, n: u32) -> u32 {
        n.max(self.min).min(self.max)
    }

    fn is_aged(&self, instance: &Instance, now: DateTime<Utc>) -> bool {
        !self.min_age.is_zero() && instance.age(now) > self.min_age
    }
}

/// Actions for one pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Plan {
    /// Bounded target size.
    pub desired: u32,
    /// Pool size the plan was computed from.
    pub current: u32,
    pub to_create: u32,
    /// Instances to destroy, in selection order.
    pub to_destroy: Vec<InstanceId>,
    /// The subset of `to_destroy` being replaced because of age.
    pub recycled: Vec<InstanceId>,
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.to_create == 0 && self.to_destroy.is_empty()
    }

    pub fn action_count(&self) -> u32 {
        self.to_create
            .saturating_add(u32::try_from(self.to_destroy.len()).unwrap_or(u32::MAX))
    }

    /// Check the plan against the snapshot it was computed from.
    pub fn validate(&self, snapshot: &Snapshot) -> ReconcileResult<()> {
        let mut ids = HashSet::new();
        for id in &self.to_destroy {
            if !ids.insert(id.as_str()) {
                return Err(invariant(format!("instance {id} selected twice")));
            }
            match snapshot.get(id) {
                None => return Err(invariant(format!("plan destroys unknown instance {id}"))),
                Some(i) if !matches!(i.state, InstanceState::Running | InstanceState::Errored) => {
                    return Err(invariant(format!(
                        "plan destroys instance {id} in state {:?}",
                        i.state
                    )));
                }
                Some(_) => {}
            }
        }
        if let Some(id) = self.recycled.iter().find(|id| !ids.contains(id.as_str())) {
            return Err(invariant(format!("recycled instance {id} is not destroyed")));
        }
        if self.to_create > 0 && self.to_destroy.len() > self.recycled.len() {
            return Err(invariant("plan both grows and shrinks the pool"));
        }
        Ok(())
    }
}

/// Compute the actions that move `snapshot` toward `target`.
pub fn plan(snapshot: &Snapshot, target: u32, policy: &PlanPolicy, now: DateTime<Utc>) -> Plan {
    let desired = policy.bound(target);
    let current = snapshot.live_count();
    let mut budget = policy.max_actions.unwrap_or(u32::MAX);

    // Snapshot order is oldest first; a stable sort keeps that within groups.
    let mut candidates: Vec<&Instance> = snapshot
        .instances
        .iter()
        .filter(|i| matches!(i.state, InstanceState::Running | InstanceState::Errored))
        .collect();
    candidates.sort_by_key(|i| !policy.is_aged(i, now));

    let mut result = Plan {
        desired,
        current,
        ..Plan::default()
    };

    if current > desired {
        let surplus = (current - desired) as usize;
        let take = surplus.min(candidates.len()).min(budget as usize);
        result.to_destroy = candidates[..take].iter().map(|i| i.id.clone()).collect();
        return result;
    }

    result.to_create = (desired - current).min(budget);
    budget -= result.to_create;

    let aged = candidates.iter().take_while(|i| policy.is_aged(i, now));
    for instance in aged.take(policy.recycle as usize) {
        if budget < 2 {
            break;
        }
        budget -= 2;
        result.to_destroy.push(instance.id.clone());
        result.recycled.push(instance.id.clone());
        result.to_create += 1;
    }
    result
}
