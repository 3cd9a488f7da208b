//! Instance Registry: the in-memory view of one pool.
//!
//! The registry is owned by a single reconciler and never touches the
//! network: provider listings are fed in through [`Registry::reconcile`]
//! and action results through the `record_*`/`mark_*` methods.
//!
//! Lifecycle of an entry:
//!
//! ```text
//! create ok ─▶ Pending ──listed──▶ Running ──planned──▶ Draining ──destroy ok──▶ Terminated ─▶ evicted
//!                 │                  ▲  │                   │
//!                 │                  │  └──unseen > grace───┼──────────────────▶ Terminated
//!                 │                  │                      └──destroy failed──▶ Errored
//!                 └──unseen > grace──┴──────────────────────────────────────────▶ Terminated
//! ```
//!
//! Evicted ids are remembered as tombstones for one grace window so that a
//! listing which still reports a just-destroyed instance cannot bring it back.
//!
//! A create whose outcome is unknown leaves an *unconfirmed* slot. The slot
//! counts toward the pool size until a previously unknown instance shows up
//! in a listing, or the grace window elapses.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::debug;

use poolscale_core::{Instance, InstanceId, InstanceState};

use crate::error::{ReconcileResult, invariant};

/// What a refresh changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshSummary {
    /// Previously unknown instances now tracked as Running.
    pub discovered: Vec<InstanceId>,
    /// Pending or Errored entries confirmed by the listing.
    pub confirmed: Vec<InstanceId>,
    /// Entries missing from listings for longer than the grace window.
    pub lost: Vec<InstanceId>,
    /// Terminated entries removed from the registry.
    pub evicted: Vec<InstanceId>,
    /// Unconfirmed slots claimed by discovered instances.
    pub claimed_unconfirmed: usize,
    /// Unconfirmed slots that outlived the grace window.
    pub expired_unconfirmed: usize,
}

/// Immutable copy of the registry handed to the planner.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    /// Tracked instances, oldest first.
    pub instances: Vec<Instance>,
    /// Creates with an unknown outcome still inside the grace window.
    pub unconfirmed: usize,
}

impl Snapshot {
    pub fn count(&self, state: InstanceState) -> usize {
        self.instances.iter().filter(|i| i.state == state).count()
    }

    /// Instances counted toward the pool size, unconfirmed slots included.
    pub fn live_count(&self) -> u32 {
        let live = self.instances.iter().filter(|i| i.state.is_live()).count();
        u32::try_from(live + self.unconfirmed).unwrap_or(u32::MAX)
    }

    pub fn get(&self, id: &str) -> Option<&Instance> {
        self.instances.iter().find(|i| i.id == id)
    }
}

/// Authoritative in-memory view of the instances of one pool.
#[derive(Debug, Clone)]
pub struct Registry {
    entries: HashMap<InstanceId, Instance>,
    unconfirmed: Vec<DateTime<Utc>>,
    tombstones: HashMap<InstanceId, DateTime<Utc>>,
    grace: Duration,
}

impl Registry {
    pub fn new(grace: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            unconfirmed: Vec::new(),
            tombstones: HashMap::new(),
            grace,
        }
    }

    pub fn set_grace(&mut self, grace: Duration) {
        self.grace = grace;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Instance> {
        self.entries.get(id)
    }

    /// Merge a fresh provider listing taken at `now`.
    pub fn reconcile(&mut self, observed: &[Instance], now: DateTime<Utc>) -> RefreshSummary {
        let mut summary = RefreshSummary::default();
        let grace = self.grace;
        self.tombstones
            .retain(|_, evicted_at| elapsed(*evicted_at, now) <= grace);

        let mut seen: HashSet<&str> = HashSet::with_capacity(observed.len());

        for listed in observed {
            if !seen.insert(listed.id.as_str()) || self.tombstones.contains_key(&listed.id) {
                continue;
            }
            match self.entries.get_mut(&listed.id) {
                Some(entry) => {
                    entry.last_seen_at = now;
                    if listed.address.is_some() {
                        entry.address = listed.address.clone();
                    }
                    match entry.state {
                        InstanceState::Pending | InstanceState::Errored => {
                            entry.state = InstanceState::Running;
                            entry.last_error = None;
                            summary.confirmed.push(entry.id.clone());
                        }
                        InstanceState::Running
                        | InstanceState::Draining
                        | InstanceState::Terminated => {}
                    }
                }
                None => {
                    let mut instance = listed.clone();
                    instance.state = InstanceState::Running;
                    instance.last_seen_at = now;
                    instance.last_error = None;
                    if !self.unconfirmed.is_empty() {
                        self.unconfirmed.remove(0);
                        summary.claimed_unconfirmed += 1;
                    }
                    summary.discovered.push(instance.id.clone());
                    self.entries.insert(instance.id.clone(), instance);
                }
            }
        }

        for entry in self.entries.values_mut() {
            if seen.contains(entry.id.as_str()) {
                continue;
            }
            let candidate = matches!(
                entry.state,
                InstanceState::Pending | InstanceState::Running | InstanceState::Errored
            );
            if candidate && entry.unseen_for(now) > grace {
                entry.state = InstanceState::Terminated;
                summary.lost.push(entry.id.clone());
            }
        }

        let before = self.unconfirmed.len();
        self.unconfirmed.retain(|created| elapsed(*created, now) <= grace);
        summary.expired_unconfirmed = before - self.unconfirmed.len();

        let terminated: Vec<InstanceId> = self
            .entries
            .values()
            .filter(|e| e.state == InstanceState::Terminated)
            .map(|e| e.id.clone())
            .collect();
        for id in terminated {
            self.entries.remove(&id);
            self.tombstones.insert(id.clone(), now);
            summary.evicted.push(id);
        }

        summary.discovered.sort();
        summary.confirmed.sort();
        summary.lost.sort();
        summary.evicted.sort();
        debug!(
            discovered = summary.discovered.len(),
            confirmed = summary.confirmed.len(),
            lost = summary.lost.len(),
            evicted = summary.evicted.len(),
            unconfirmed = self.unconfirmed.len(),
            "registry refreshed"
        );
        summary
    }

    /// Track an instance returned by a successful create.
    pub fn record_created(&mut self, mut instance: Instance, now: DateTime<Utc>) {
        instance.state = InstanceState::Pending;
        instance.last_seen_at = now;
        instance.last_error = None;
        self.tombstones.remove(&instance.id);
        self.entries.insert(instance.id.clone(), instance);
    }

    /// Track a create whose outcome is unknown.
    pub fn record_unconfirmed(&mut self, now: DateTime<Utc>) {
        self.unconfirmed.push(now);
    }

    /// Select an instance for termination.
    pub fn mark_draining(&mut self, id: &str) -> ReconcileResult<()> {
        let entry = self
            .entries
            .get_mut(id)
            .ok_or_else(|| invariant(format!("cannot drain unknown instance {id}")))?;
        match entry.state {
            InstanceState::Running | InstanceState::Errored => {
                entry.state = InstanceState::Draining;
                Ok(())
            }
            state => Err(invariant(format!("cannot drain instance {id} in state {state:?}"))),
        }
    }

    /// Record a successful destroy.
    pub fn mark_terminated(&mut self, id: &str) {
        if let Some(entry) = self.entries.get_mut(id) {
            entry.state = InstanceState::Terminated;
            entry.last_error = None;
        }
    }

    /// Record a failed action against an instance.
    pub fn mark_errored(&mut self, id: &str, error: impl Into<String>) {
        if let Some(entry) = self.entries.get_mut(id) {
            entry.state = InstanceState::Errored;
            entry.last_error = Some(error.into());
        }
    }

    /// Copy of the current view, oldest instance first.
    pub fn snapshot(&self) -> Snapshot {
        let mut instances: Vec<Instance> = self.entries.values().cloned().collect();
        instances.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Snapshot {
            instances,
            unconfirmed: self.unconfirmed.len(),
        }
    }

    /// Consistency checks that must hold right after a refresh.
    pub fn check_invariants(&self) -> ReconcileResult<()> {
        for (id, entry) in &self.entries {
            if *id != entry.id {
                return Err(invariant(format!("entry {id} holds instance {}", entry.id)));
            }
            if entry.state == InstanceState::Terminated {
                return Err(invariant(format!("terminated instance {id} survived a refresh")));
            }
            if self.tombstones.contains_key(id) {
                return Err(invariant(format!("evicted instance {id} is tracked again")));
            }
        }
        Ok(())
    }
}

fn elapsed(since: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (now - since).to_std().unwrap_or(Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use poolscale_core::ProviderKind;

    const GRACE: Duration = Duration::from_secs(600);

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-03-01T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn listed(id: &str, created: DateTime<Utc>, now: DateTime<Utc>) -> Instance {
        Instance::observed(id, format!("agent-{id}"), ProviderKind::Memory, created, now)
    }

    fn mins(m: i64) -> ChronoDuration {
        ChronoDuration::minutes(m)
    }

    #[test]
    fn unknown_instances_are_discovered_as_running() {
        let mut registry = Registry::new(GRACE);
        let now = t0();
        let summary = registry.reconcile(&[listed("a", now - mins(30), now)], now);

        assert_eq!(summary.discovered, vec!["a"]);
        assert_eq!(registry.get("a").unwrap().state, InstanceState::Running);
        assert_eq!(registry.snapshot().live_count(), 1);
    }

    #[test]
    fn pending_is_confirmed_by_listing() {
        let mut registry = Registry::new(GRACE);
        let now = t0();
        registry.record_created(Instance::pending("a", "agent-a", ProviderKind::Memory, now), now);
        assert_eq!(registry.get("a").unwrap().state, InstanceState::Pending);

        let later = now + mins(1);
        let summary = registry.reconcile(&[listed("a", now, later)], later);
        assert_eq!(summary.confirmed, vec!["a"]);
        assert!(summary.discovered.is_empty());
        assert_eq!(registry.get("a").unwrap().state, InstanceState::Running);
        assert_eq!(registry.get("a").unwrap().last_seen_at, later);
    }

    #[test]
    fn unlisted_pending_survives_the_grace_window() {
        let mut registry = Registry::new(GRACE);
        let now = t0();
        registry.record_created(Instance::pending("a", "agent-a", ProviderKind::Memory, now), now);

        registry.reconcile(&[], now + mins(5));
        assert_eq!(registry.get("a").unwrap().state, InstanceState::Pending);
        assert_eq!(registry.snapshot().live_count(), 1);

        let summary = registry.reconcile(&[], now + mins(11));
        assert_eq!(summary.lost, vec!["a"]);
        assert_eq!(summary.evicted, vec!["a"]);
        assert!(registry.is_empty());
    }

    #[test]
    fn running_instance_missing_past_grace_is_evicted() {
        let mut registry = Registry::new(GRACE);
        let now = t0();
        registry.reconcile(&[listed("a", now - mins(60), now)], now);

        let summary = registry.reconcile(&[], now + mins(5));
        assert!(summary.lost.is_empty());
        assert_eq!(registry.get("a").unwrap().state, InstanceState::Running);

        let summary = registry.reconcile(&[], now + mins(15));
        assert_eq!(summary.lost, vec!["a"]);
        assert!(registry.get("a").is_none());
        registry.check_invariants().unwrap();
    }

    #[test]
    fn destroyed_instance_is_not_resurrected_by_stale_listing() {
        let mut registry = Registry::new(GRACE);
        let now = t0();
        registry.reconcile(&[listed("a", now - mins(60), now)], now);
        registry.mark_draining("a").unwrap();
        registry.mark_terminated("a");

        let later = now + mins(1);
        let summary = registry.reconcile(&[listed("a", now - mins(60), later)], later);
        assert_eq!(summary.evicted, vec!["a"]);
        assert!(summary.discovered.is_empty());
        assert!(registry.get("a").is_none());

        let again = later + mins(1);
        let summary = registry.reconcile(&[listed("a", now - mins(60), again)], again);
        assert!(summary.discovered.is_empty());

        // Once the tombstone expires a still-listed instance is tracked again.
        let much_later = later + mins(20);
        let summary = registry.reconcile(&[listed("a", now - mins(60), much_later)], much_later);
        assert_eq!(summary.discovered, vec!["a"]);
    }

    #[test]
    fn unconfirmed_slot_is_claimed_by_discovered_instance() {
        let mut registry = Registry::new(GRACE);
        let now = t0();
        registry.record_unconfirmed(now);
        assert_eq!(registry.snapshot().live_count(), 1);

        registry.reconcile(&[], now + mins(1));
        assert_eq!(registry.snapshot().unconfirmed, 1);

        let later = now + mins(2);
        let summary = registry.reconcile(&[listed("x", now, later)], later);
        assert_eq!(summary.claimed_unconfirmed, 1);
        let snapshot = registry.snapshot();
        assert_eq!(snapshot.unconfirmed, 0);
        assert_eq!(snapshot.live_count(), 1);
    }

    #[test]
    fn unconfirmed_slot_expires_after_grace() {
        let mut registry = Registry::new(GRACE);
        let now = t0();
        registry.record_unconfirmed(now);
        let summary = registry.reconcile(&[], now + mins(11));
        assert_eq!(summary.expired_unconfirmed, 1);
        assert_eq!(registry.snapshot().live_count(), 0);
    }

    #[test]
    fn errored_instance_is_restored_when_listed() {
        let mut registry = Registry::new(GRACE);
        let now = t0();
        registry.reconcile(&[listed("a", now - mins(60), now)], now);
        registry.mark_draining("a").unwrap();
        registry.mark_errored("a", "rate limited");
        assert_eq!(registry.get("a").unwrap().state, InstanceState::Errored);
        assert_eq!(registry.snapshot().live_count(), 1);

        let later = now + mins(5);
        let summary = registry.reconcile(&[listed("a", now - mins(60), later)], later);
        assert_eq!(summary.confirmed, vec!["a"]);
        let entry = registry.get("a").unwrap();
        assert_eq!(entry.state, InstanceState::Running);
        assert!(entry.last_error.is_none());
    }

    #[test]
    fn draining_rejects_unknown_and_pending() {
        let mut registry = Registry::new(GRACE);
        let now = t0();
        registry.record_created(Instance::pending("p", "agent-p", ProviderKind::Memory, now), now);
        assert!(registry.mark_draining("missing").is_err());
        assert!(registry.mark_draining("p").is_err());
    }

    #[test]
    fn snapshot_is_oldest_first_and_detached() {
        let mut registry = Registry::new(GRACE);
        let now = t0();
        registry.reconcile(
            &[
                listed("young", now - mins(5), now),
                listed("old", now - mins(90), now),
                listed("mid", now - mins(30), now),
            ],
            now,
        );
        let snapshot = registry.snapshot();
        let ids: Vec<&str> = snapshot.instances.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["old", "mid", "young"]);

        registry.mark_draining("old").unwrap();
        assert_eq!(snapshot.get("old").unwrap().state, InstanceState::Running);
        assert_eq!(registry.snapshot().count(InstanceState::Draining), 1);
    }
}
