//! Reconciler: one pass of Refresh → Plan → Execute → Report.
//!
//! ```text
//! Idle ─▶ Refreshing ─▶ Planning ─▶ Executing ─▶ Reporting ─▶ Idle
//!              │             │                      ▲
//!              └─ list error, invariant, shutdown ──┘
//! ```
//!
//! Provider and queue failures never escape a pass. They are attributed to
//! the action that hit them, and the most recent one lands in
//! `Status.last_error`.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use poolscale_core::{AutoscalerConfig, InstanceId, InstanceState};
use poolscale_provider::{InstanceRequest, Provider, ProviderError, ProviderResult};
use poolscale_queue::{BuildQueue, QueueError, QueueResult};
use poolscale_state::{StateStore, Status};

use crate::estimator::Estimate;
use crate::planner::{Plan, PlanPolicy, plan};
use crate::registry::{RefreshSummary, Registry};

/// Time source for registry bookkeeping.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Where a pass currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PassPhase {
    Idle,
    Refreshing,
    Planning,
    Executing,
    Reporting,
}

/// Result of one provider action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionOutcome {
    Created { id: InstanceId, name: String },
    CreateFailed { name: String, error: ProviderError, ambiguous: bool },
    Destroyed { id: InstanceId },
    DestroyFailed { id: InstanceId, error: ProviderError },
}

impl ActionOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            ActionOutcome::CreateFailed { .. } | ActionOutcome::DestroyFailed { .. }
        )
    }

    fn describe_failure(&self) -> Option<String> {
        match self {
            ActionOutcome::CreateFailed { name, error, .. } => Some(format!("create {name}: {error}")),
            ActionOutcome::DestroyFailed { id, error } => Some(format!("destroy {id}: {error}")),
            _ => None,
        }
    }
}

/// Everything one pass saw and did.
#[derive(Debug, Clone)]
pub struct PassReport {
    /// `None` when the provider listing failed.
    pub refresh: Option<RefreshSummary>,
    pub estimate: Option<Estimate>,
    pub plan: Option<Plan>,
    pub outcomes: Vec<ActionOutcome>,
    /// The status written at the end of the pass.
    pub status: Status,
    /// Shutdown was requested before the pass reached Executing.
    pub interrupted: bool,
}

impl PassReport {
    pub fn created(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o, ActionOutcome::Created { .. }))
            .count()
    }

    pub fn destroyed(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o, ActionOutcome::Destroyed { .. }))
            .count()
    }

    pub fn failures(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_failure()).count()
    }
}

/// Drives reconciliation passes for one Autoscaler resource.
///
/// Owns the pool's [`Registry`]; nothing else reads or writes it.
pub struct Reconciler {
    name: String,
    provider: Arc<dyn Provider>,
    queue: Arc<dyn BuildQueue>,
    store: StateStore,
    registry: Registry,
    phase: watch::Sender<PassPhase>,
    clock: Clock,
    last_desired: Option<u32>,
}

impl Reconciler {
    pub fn new(
        config: &AutoscalerConfig,
        provider: Arc<dyn Provider>,
        queue: Arc<dyn BuildQueue>,
        store: StateStore,
    ) -> Self {
        let (phase, _) = watch::channel(PassPhase::Idle);
        Self {
            name: config.name.clone(),
            provider,
            queue,
            store,
            registry: Registry::new(config.config.grace),
            phase,
            clock: Arc::new(Utc::now),
            last_desired: None,
        }
    }

    /// Replace the wall clock used for ages and grace windows.
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn provider(&self) -> &Arc<dyn Provider> {
        &self.provider
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn phase(&self) -> PassPhase {
        *self.phase.borrow()
    }

    /// Follow phase changes from outside the pass.
    pub fn subscribe_phase(&self) -> watch::Receiver<PassPhase> {
        self.phase.subscribe()
    }

    fn enter(&self, phase: PassPhase) {
        self.phase.send_replace(phase);
        debug!(autoscaler = %self.name, ?phase, "pass phase");
    }

    /// Run one full pass with `config`.
    ///
    /// `shutdown` is checked between phases; a pass that sees it set skips
    /// ahead to Reporting.
    pub async fn run_pass(
        &mut self,
        config: &AutoscalerConfig,
        shutdown: &watch::Receiver<bool>,
    ) -> PassReport {
        let now = (self.clock)();
        let timeout = config.config.timeout;
        self.registry.set_grace(config.config.grace);

        let mut pass = PassState::default();

        // ── Refreshing ──
        self.enter(PassPhase::Refreshing);
        match bounded(timeout, "list", self.provider.list()).await {
            Ok(observed) => {
                let summary = self.registry.reconcile(&observed, now);
                if !summary.discovered.is_empty() || !summary.lost.is_empty() {
                    info!(
                        autoscaler = %self.name,
                        discovered = ?summary.discovered,
                        lost = ?summary.lost,
                        "pool membership changed"
                    );
                }
                pass.refresh = Some(summary);
            }
            Err(e) => {
                warn!(autoscaler = %self.name, error = %e, "provider listing failed, no actions this pass");
                pass.last_error = Some(format!("list instances: {e}"));
                return self.report(config, pass, now);
            }
        }
        if let Err(e) = self.registry.check_invariants() {
            error!(autoscaler = %self.name, error = %e, "registry invariant violated, pass aborted");
            pass.last_error = Some(e.to_string());
            return self.report(config, pass, now);
        }
        if *shutdown.borrow() {
            pass.interrupted = true;
            return self.report(config, pass, now);
        }

        // ── Planning ──
        self.enter(PassPhase::Planning);
        let snapshot = self.registry.snapshot();
        let policy = PlanPolicy::from_config(config);
        let signal = read_queue(timeout, self.queue.pending(&config.selector)).await;
        let estimate = Estimate::from_signal(
            signal,
            config.agent.concurrency,
            &policy,
            snapshot.live_count(),
        );
        if let Some(e) = &estimate.error {
            warn!(autoscaler = %self.name, error = %e, target = estimate.target, "build queue unavailable, holding pool size");
            pass.last_error = Some(format!("build queue: {e}"));
        }
        let planned = plan(&snapshot, estimate.target, &policy, now);
        debug!(
            autoscaler = %self.name,
            pending_builds = ?estimate.pending_builds,
            current = planned.current,
            desired = planned.desired,
            to_create = planned.to_create,
            to_destroy = ?planned.to_destroy,
            "pass planned"
        );
        self.last_desired = Some(planned.desired);
        pass.estimate = Some(estimate);
        if let Err(e) = planned.validate(&snapshot) {
            error!(autoscaler = %self.name, error = %e, "plan invariant violated, pass aborted");
            pass.last_error = Some(e.to_string());
            pass.plan = Some(planned);
            return self.report(config, pass, now);
        }
        if *shutdown.borrow() {
            pass.interrupted = true;
            pass.plan = Some(planned);
            return self.report(config, pass, now);
        }

        // ── Executing ──
        if !planned.is_empty() {
            self.enter(PassPhase::Executing);
            match self.execute(&planned, config, now).await {
                Ok(outcomes) => {
                    if let Some(msg) = outcomes.iter().rev().find_map(ActionOutcome::describe_failure) {
                        pass.last_error = Some(msg);
                    }
                    pass.outcomes = outcomes;
                }
                Err(e) => {
                    error!(autoscaler = %self.name, error = %e, "execution aborted");
                    pass.last_error = Some(e.to_string());
                }
            }
        }
        pass.plan = Some(planned);

        self.report(config, pass, now)
    }

    /// Destroys first, then creates. Calls within a batch run concurrently
    /// and fail independently.
    async fn execute(
        &mut self,
        plan: &Plan,
        config: &AutoscalerConfig,
        now: DateTime<Utc>,
    ) -> crate::ReconcileResult<Vec<ActionOutcome>> {
        let timeout = config.config.timeout;
        let mut outcomes = Vec::with_capacity(plan.action_count() as usize);

        for id in &plan.to_destroy {
            self.registry.mark_draining(id)?;
        }
        let provider = &self.provider;
        let destroys = plan.to_destroy.iter().map(|id| async move {
            let result = bounded(timeout, "destroy", provider.destroy(id)).await;
            (id.clone(), result)
        });
        let mut failed_recycles = 0u32;
        for (id, result) in join_all(destroys).await {
            match result {
                Ok(()) => {
                    info!(autoscaler = %self.name, instance = %id, "instance destroyed");
                    self.registry.mark_terminated(&id);
                    outcomes.push(ActionOutcome::Destroyed { id });
                }
                Err(error) => {
                    warn!(autoscaler = %self.name, instance = %id, error = %error, "destroy failed");
                    self.registry.mark_errored(&id, error.to_string());
                    if plan.recycled.contains(&id) {
                        failed_recycles += 1;
                    }
                    outcomes.push(ActionOutcome::DestroyFailed { id, error });
                }
            }
        }

        // A replacement whose old instance is still there is not created.
        let creates = plan.to_create.saturating_sub(failed_recycles);
        if creates < plan.to_create {
            debug!(autoscaler = %self.name, skipped = plan.to_create - creates, "replacements skipped");
        }
        let user_data = config.provider.user_data();
        let requests: Vec<InstanceRequest> = (0..creates)
            .map(|_| InstanceRequest::new(instance_name(&self.name)).with_user_data(user_data))
            .collect();
        let provider = &self.provider;
        let calls = requests.iter().map(|request| async move {
            (request, bounded(timeout, "create", provider.create(request)).await)
        });
        for (request, result) in join_all(calls).await {
            match result {
                Ok(instance) => {
                    info!(autoscaler = %self.name, instance = %instance.id, name = %instance.name, "instance created");
                    let id = instance.id.clone();
                    self.registry.record_created(instance, now);
                    outcomes.push(ActionOutcome::Created {
                        id,
                        name: request.name.clone(),
                    });
                }
                Err(error) => {
                    let ambiguous = error.is_ambiguous();
                    if ambiguous {
                        warn!(autoscaler = %self.name, name = %request.name, error = %error, "create outcome unknown, waiting for the next listing");
                        self.registry.record_unconfirmed(now);
                    } else {
                        warn!(autoscaler = %self.name, name = %request.name, error = %error, "create failed");
                    }
                    outcomes.push(ActionOutcome::CreateFailed {
                        name: request.name.clone(),
                        error,
                        ambiguous,
                    });
                }
            }
        }
        Ok(outcomes)
    }

    fn report(&mut self, config: &AutoscalerConfig, pass: PassState, now: DateTime<Utc>) -> PassReport {
        self.enter(PassPhase::Reporting);
        let snapshot = self.registry.snapshot();
        let observed = snapshot.instances.iter().filter(|i| i.state.is_live()).count();
        let pending = snapshot.count(InstanceState::Pending) + snapshot.unconfirmed;

        let status = Status {
            observed_pool_size: to_u32(observed),
            desired_pool_size: self
                .last_desired
                .unwrap_or_else(|| PlanPolicy::from_config(config).bound(snapshot.live_count())),
            pending: to_u32(pending),
            draining: to_u32(snapshot.count(InstanceState::Draining)),
            last_reconcile_time: Some(now),
            last_error: pass.last_error,
            ..Status::new(&self.name, self.provider.kind().as_str())
        };
        if let Err(e) = self.store.put_status(&status) {
            warn!(autoscaler = %self.name, error = %e, "failed to write status");
        }
        info!(
            autoscaler = %self.name,
            observed = status.observed_pool_size,
            desired = status.desired_pool_size,
            pending = status.pending,
            error = status.last_error.as_deref().unwrap_or(""),
            "pass complete"
        );
        self.enter(PassPhase::Idle);

        PassReport {
            refresh: pass.refresh,
            estimate: pass.estimate,
            plan: pass.plan,
            outcomes: pass.outcomes,
            status,
            interrupted: pass.interrupted,
        }
    }
}

#[derive(Default)]
struct PassState {
    refresh: Option<RefreshSummary>,
    estimate: Option<Estimate>,
    plan: Option<Plan>,
    outcomes: Vec<ActionOutcome>,
    last_error: Option<String>,
    interrupted: bool,
}

/// Bound a provider call; an elapsed call is a `Timeout`.
async fn bounded<T>(
    limit: Duration,
    op: &str,
    call: impl Future<Output = ProviderResult<T>>,
) -> ProviderResult<T> {
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(ProviderError::Timeout(format!("{op} exceeded {limit:?}"))),
    }
}

async fn read_queue(limit: Duration, call: impl Future<Output = QueueResult<u32>>) -> QueueResult<u32> {
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(QueueError::Timeout(format!("queue read exceeded {limit:?}"))),
    }
}

/// `<pool>-agent-<8 hex chars>`.
pub fn instance_name(pool: &str) -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("{pool}-agent-{}", &id[..8])
}

fn to_u32(n: usize) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}
