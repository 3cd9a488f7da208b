//! In-process provider for dry runs and tests.
//!
//! Keeps instances in a map and lets callers script failures: a failing or
//! ambiguous create, a failing destroy for one id, a failing list, or an
//! instance that is hidden from listings for a while.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::debug;

use poolscale_core::{Instance, InstanceId, InstanceState, ProviderKind};

use crate::error::{ProviderError, ProviderResult};
use crate::provider::{InstanceRequest, Provider};

/// Number of calls seen per operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub create: u32,
    pub destroy: u32,
    pub list: u32,
}

#[derive(Default)]
struct Inner {
    instances: BTreeMap<InstanceId, Instance>,
    hidden: HashSet<InstanceId>,
    next_id: u64,
    create_failures: VecDeque<ProviderError>,
    ambiguous_creates: u32,
    destroy_failures: HashMap<InstanceId, ProviderError>,
    list_failures: VecDeque<ProviderError>,
    calls: CallCounts,
}

/// Provider backed by an in-memory instance map.
#[derive(Default)]
pub struct MemoryProvider {
    inner: Mutex<Inner>,
    quota: Option<u32>,
    create_latency: Duration,
    list_latency: Duration,
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail creates with `QuotaExceeded` once `quota` instances exist.
    pub fn with_quota(mut self, quota: Option<u32>) -> Self {
        self.quota = quota;
        self
    }

    pub fn with_create_latency(mut self, latency: Duration) -> Self {
        self.create_latency = latency;
        self
    }

    pub fn with_list_latency(mut self, latency: Duration) -> Self {
        self.list_latency = latency;
        self
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ── Scripting ─────────────────────────────────────────────────

    /// The next create fails with `error` and provisions nothing.
    pub fn fail_next_create(&self, error: ProviderError) {
        self.lock().create_failures.push_back(error);
    }

    /// The next create provisions an instance but reports a timeout.
    pub fn create_ambiguously(&self) {
        self.lock().ambiguous_creates += 1;
    }

    /// Every destroy of `id` fails with `error` until cleared.
    pub fn fail_destroy(&self, id: &str, error: ProviderError) {
        self.lock().destroy_failures.insert(id.to_string(), error);
    }

    pub fn clear_destroy_failure(&self, id: &str) {
        self.lock().destroy_failures.remove(id);
    }

    /// The next list fails with `error`.
    pub fn fail_next_list(&self, error: ProviderError) {
        self.lock().list_failures.push_back(error);
    }

    /// Leave `id` out of listings until revealed.
    pub fn hide(&self, id: &str) {
        self.lock().hidden.insert(id.to_string());
    }

    pub fn reveal(&self, id: &str) {
        self.lock().hidden.remove(id);
    }

    /// Hide every existing instance from listings.
    pub fn hide_all(&self) {
        let mut inner = self.lock();
        let ids: Vec<InstanceId> = inner.instances.keys().cloned().collect();
        inner.hidden.extend(ids);
    }

    pub fn reveal_all(&self) {
        self.lock().hidden.clear();
    }

    /// Remove an instance behind the autoscaler's back.
    pub fn vanish(&self, id: &str) -> bool {
        let mut inner = self.lock();
        inner.hidden.remove(id);
        inner.instances.remove(id).is_some()
    }

    /// Add an instance as if it had been created earlier.
    pub fn insert(&self, instance: Instance) {
        self.lock().instances.insert(instance.id.clone(), instance);
    }

    // ── Inspection ────────────────────────────────────────────────

    /// Every instance that exists, hidden or not, ordered by id.
    pub fn instances(&self) -> Vec<Instance> {
        self.lock().instances.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn calls(&self) -> CallCounts {
        self.lock().calls
    }
}

#[async_trait]
impl Provider for MemoryProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Memory
    }

    async fn create(&self, request: &InstanceRequest) -> ProviderResult<Instance> {
        self.lock().calls.create += 1;
        if !self.create_latency.is_zero() {
            tokio::time::sleep(self.create_latency).await;
        }

        let mut inner = self.lock();
        if let Some(error) = inner.create_failures.pop_front() {
            return Err(error);
        }
        if let Some(quota) = self.quota {
            if inner.instances.len() >= quota as usize {
                return Err(ProviderError::QuotaExceeded(format!(
                    "{} of {quota} instances in use",
                    inner.instances.len()
                )));
            }
        }

        inner.next_id += 1;
        let id = format!("mem-{}", inner.next_id);
        let instance = Instance::pending(
            id.clone(),
            request.name.clone(),
            ProviderKind::Memory,
            Utc::now(),
        );
        inner.instances.insert(id.clone(), instance.clone());

        if inner.ambiguous_creates > 0 {
            inner.ambiguous_creates -= 1;
            debug!(instance = %id, "memory create lost its response");
            return Err(ProviderError::Timeout(format!("create {}", request.name)));
        }
        debug!(instance = %id, name = %request.name, "memory instance created");
        Ok(instance)
    }

    async fn destroy(&self, id: &str) -> ProviderResult<()> {
        let mut inner = self.lock();
        inner.calls.destroy += 1;
        if let Some(error) = inner.destroy_failures.get(id) {
            return Err(error.clone());
        }
        inner.hidden.remove(id);
        let existed = inner.instances.remove(id).is_some();
        debug!(instance = %id, existed, "memory instance destroyed");
        Ok(())
    }

    async fn list(&self) -> ProviderResult<Vec<Instance>> {
        self.lock().calls.list += 1;
        if !self.list_latency.is_zero() {
            tokio::time::sleep(self.list_latency).await;
        }

        let mut inner = self.lock();
        if let Some(error) = inner.list_failures.pop_front() {
            return Err(error);
        }
        let now = Utc::now();
        Ok(inner
            .instances
            .values()
            .filter(|i| !inner.hidden.contains(&i.id))
            .map(|i| Instance {
                state: InstanceState::Running,
                last_seen_at: now,
                last_error: None,
                ..i.clone()
            })
            .collect())
    }
}
