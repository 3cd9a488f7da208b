//! Scheduler Driver: runs one reconciler on its interval.
//!
//! At most one pass is in flight. A tick that finds the previous pass still
//! running is skipped and logged, never queued. Config updates arrive on a
//! watch channel and apply from the next pass on; an invalid update pauses
//! the resource until a valid one arrives. On shutdown no new pass starts
//! and an in-flight pass is allowed to finish.

use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use poolscale_core::AutoscalerConfig;
use poolscale_state::{StateStore, Status};

use crate::error::{ReconcileError, ReconcileResult};
use crate::reconciler::{PassReport, Reconciler};

/// Tick period while a resource has never had a valid config.
const PAUSED_PERIOD: Duration = Duration::from_secs(60);

/// A resolved resource as pushed by the config loader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigUpdate {
    Valid(Box<AutoscalerConfig>),
    /// The resource file no longer resolves; carries the error.
    Invalid(String),
}

/// Counters returned when the driver stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DriverStats {
    pub passes: u64,
    pub skipped_ticks: u64,
}

type InFlight = JoinHandle<(Reconciler, PassReport)>;

/// Owns the cadence of one Autoscaler resource.
pub struct Driver {
    reconciler: Reconciler,
    store: StateStore,
    updates: watch::Receiver<ConfigUpdate>,
    shutdown: watch::Receiver<bool>,
    reports: Option<mpsc::UnboundedSender<PassReport>>,
}

impl Driver {
    pub fn new(
        reconciler: Reconciler,
        store: StateStore,
        updates: watch::Receiver<ConfigUpdate>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            reconciler,
            store,
            updates,
            shutdown,
            reports: None,
        }
    }

    /// Forward every completed pass report to `tx`.
    pub fn with_reports(mut self, tx: mpsc::UnboundedSender<PassReport>) -> Self {
        self.reports = Some(tx);
        self
    }

    /// Run until shutdown. Fails only when a pass panics.
    pub async fn run(self) -> ReconcileResult<DriverStats> {
        let Driver {
            reconciler,
            store,
            mut updates,
            mut shutdown,
            reports,
        } = self;
        let name = reconciler.name().to_string();
        let provider = reconciler.provider().kind();

        let mut idle = Some(reconciler);
        let mut in_flight: Option<InFlight> = None;
        let mut stats = DriverStats::default();
        let mut last_status: Option<Status> = None;
        let mut updates_open = true;
        // Set while paused; a pass finishing after the pause must not clear it.
        let mut paused: Option<String> = None;

        let initial = updates.borrow_and_update().clone();
        let mut config = match initial {
            ConfigUpdate::Valid(config) => Some(*config),
            ConfigUpdate::Invalid(reason) => {
                pause(&store, &name, provider.as_str(), &mut last_status, &reason);
                paused = Some(reason);
                None
            }
        };
        let period = config.as_ref().map_or(PAUSED_PERIOD, |c| c.config.interval);
        let mut ticker = pass_ticker(period, false);

        info!(autoscaler = %name, interval = ?ticker.period(), "reconcile loop started");

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {
                    let Some(current) = config.clone() else {
                        debug!(autoscaler = %name, "resource paused, tick ignored");
                        continue;
                    };
                    match idle.take() {
                        Some(mut reconciler) => {
                            let shutdown = shutdown.clone();
                            in_flight = Some(tokio::spawn(async move {
                                let report = reconciler.run_pass(&current, &shutdown).await;
                                (reconciler, report)
                            }));
                        }
                        None => {
                            stats.skipped_ticks += 1;
                            warn!(autoscaler = %name, "previous pass still running, tick skipped");
                        }
                    }
                }
                Some(joined) = join_in_flight(&mut in_flight) => {
                    let (reconciler, report) = finished(&name, joined)?;
                    idle = Some(reconciler);
                    stats.passes += 1;
                    last_status = Some(report.status.clone());
                    if let Some(reason) = &paused {
                        pause(&store, &name, provider.as_str(), &mut last_status, reason);
                    }
                    if let Some(tx) = &reports {
                        let _ = tx.send(report);
                    }
                }
                changed = updates.changed(), if updates_open => {
                    if changed.is_err() {
                        updates_open = false;
                        continue;
                    }
                    let update = updates.borrow_and_update().clone();
                    match update {
                        ConfigUpdate::Valid(next) => {
                            let next = *next;
                            let interval = next.config.interval;
                            let resumed = config.is_none();
                            let changed_interval =
                                config.as_ref().is_some_and(|c| c.config.interval != interval);
                            if resumed || changed_interval {
                                ticker = pass_ticker(interval, !resumed);
                            }
                            info!(autoscaler = %name, resumed, ?interval, "configuration applied");
                            config = Some(next);
                            paused = None;
                        }
                        ConfigUpdate::Invalid(reason) => {
                            pause(&store, &name, provider.as_str(), &mut last_status, &reason);
                            paused = Some(reason);
                            config = None;
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        if let Some(handle) = in_flight.take() {
            debug!(autoscaler = %name, "waiting for in-flight pass");
            let (_, report) = finished(&name, handle.await)?;
            stats.passes += 1;
            if let Some(reason) = &paused {
                last_status = Some(report.status.clone());
                pause(&store, &name, provider.as_str(), &mut last_status, reason);
            }
            if let Some(tx) = &reports {
                let _ = tx.send(report);
            }
        }
        info!(
            autoscaler = %name,
            passes = stats.passes,
            skipped_ticks = stats.skipped_ticks,
            "reconcile loop stopped"
        );
        Ok(stats)
    }
}

/// A paused resource keeps its ticker; the ticks are ignored.
fn pass_ticker(period: Duration, delay_first: bool) -> Interval {
    let start = if delay_first {
        Instant::now() + period
    } else {
        Instant::now()
    };
    let mut ticker = tokio::time::interval_at(start, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker
}

async fn join_in_flight(
    slot: &mut Option<InFlight>,
) -> Option<Result<(Reconciler, PassReport), JoinError>> {
    match slot {
        Some(handle) => {
            let joined = handle.await;
            *slot = None;
            Some(joined)
        }
        None => std::future::pending().await,
    }
}

fn finished(
    name: &str,
    joined: Result<(Reconciler, PassReport), JoinError>,
) -> ReconcileResult<(Reconciler, PassReport)> {
    joined.map_err(|e| {
        error!(autoscaler = %name, error = %e, "reconcile pass panicked");
        ReconcileError::PassAborted(e.to_string())
    })
}

fn pause(store: &StateStore, name: &str, provider: &str, last: &mut Option<Status>, reason: &str) {
    error!(autoscaler = %name, error = %reason, "invalid configuration, resource paused");
    let mut status = last.clone().unwrap_or_else(|| Status::new(name, provider));
    status.last_error = Some(format!("invalid configuration: {reason}"));
    if let Err(e) = store.put_status(&status) {
        warn!(autoscaler = %name, error = %e, "failed to write status");
    }
    *last = Some(status);
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use poolscale_provider::MemoryProvider;
    use poolscale_queue::StaticQueue;

    use super::*;
    use crate::testing::test_config;

    struct Harness {
        provider: Arc<MemoryProvider>,
        store: StateStore,
        updates: watch::Sender<ConfigUpdate>,
        shutdown: watch::Sender<bool>,
        reports: mpsc::UnboundedReceiver<PassReport>,
        handle: JoinHandle<ReconcileResult<DriverStats>>,
    }

    fn start(initial: ConfigUpdate, provider: MemoryProvider, pending_builds: u32) -> Harness {
        let provider = Arc::new(provider);
        let store = StateStore::open_in_memory().unwrap();
        let reconciler = Reconciler::new(
            &test_config(2, 4),
            provider.clone(),
            Arc::new(StaticQueue::new(pending_builds)),
            store.clone(),
        );
        let (updates, updates_rx) = watch::channel(initial);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let (tx, reports) = mpsc::unbounded_channel();
        let driver = Driver::new(reconciler, store.clone(), updates_rx, shutdown_rx).with_reports(tx);
        Harness {
            provider,
            store,
            updates,
            shutdown,
            reports,
            handle: tokio::spawn(driver.run()),
        }
    }

    fn valid(config: AutoscalerConfig) -> ConfigUpdate {
        ConfigUpdate::Valid(Box::new(config))
    }

    #[tokio::test(start_paused = true)]
    async fn passes_run_on_the_interval() {
        let mut h = start(valid(test_config(2, 4)), MemoryProvider::new(), 0);

        let first = h.reports.recv().await.unwrap();
        assert_eq!(first.created(), 2);
        let started = Instant::now();

        let second = h.reports.recv().await.unwrap();
        assert_eq!(started.elapsed(), Duration::from_secs(300));
        assert_eq!(second.refresh.as_ref().unwrap().confirmed.len(), 2);
        assert!(second.plan.as_ref().unwrap().is_empty());
        assert!(second.status.converged());

        h.shutdown.send(true).unwrap();
        let stats = h.handle.await.unwrap().unwrap();
        assert_eq!(stats, DriverStats { passes: 2, skipped_ticks: 0 });
        assert_eq!(h.provider.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn tick_during_a_running_pass_is_skipped() {
        let mut config = test_config(2, 4);
        config.config.timeout = Duration::from_secs(600);
        let provider = MemoryProvider::new().with_list_latency(Duration::from_secs(7 * 60));
        let mut h = start(valid(config), provider, 0);

        let report = h.reports.recv().await.unwrap();
        assert_eq!(report.created(), 2);

        h.shutdown.send(true).unwrap();
        let stats = h.handle.await.unwrap().unwrap();
        assert_eq!(stats, DriverStats { passes: 1, skipped_ticks: 1 });
        assert_eq!(h.provider.calls().list, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_config_pauses_until_fixed() {
        let mut h = start(
            ConfigUpdate::Invalid("pool.min (5) exceeds pool.max (4)".into()),
            MemoryProvider::new(),
            0,
        );

        tokio::time::sleep(Duration::from_secs(30 * 60)).await;
        assert!(h.reports.try_recv().is_err());
        assert_eq!(h.provider.calls().list, 0);
        let status = h.store.get_status("linux").unwrap().unwrap();
        assert!(status.last_error.unwrap().contains("exceeds pool.max"));

        h.updates.send(valid(test_config(2, 4))).unwrap();
        let report = h.reports.recv().await.unwrap();
        assert_eq!(report.created(), 2);
        assert!(report.status.last_error.is_none());

        h.updates
            .send(ConfigUpdate::Invalid("no provider configured".into()))
            .unwrap();
        tokio::time::sleep(Duration::from_secs(30 * 60)).await;
        assert!(h.reports.try_recv().is_err());
        let status = h.store.get_status("linux").unwrap().unwrap();
        assert_eq!(status.observed_pool_size, 2);
        assert!(status.last_error.unwrap().contains("no provider configured"));

        h.shutdown.send(true).unwrap();
        assert_eq!(h.handle.await.unwrap().unwrap().passes, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reloaded_bounds_apply_on_the_next_pass() {
        let mut h = start(valid(test_config(2, 4)), MemoryProvider::new(), 0);
        assert_eq!(h.reports.recv().await.unwrap().created(), 2);

        h.updates.send(valid(test_config(3, 4))).unwrap();
        let report = h.reports.recv().await.unwrap();
        assert_eq!(report.plan.as_ref().unwrap().desired, 3);
        assert_eq!(report.created(), 1);

        h.shutdown.send(true).unwrap();
        h.handle.await.unwrap().unwrap();
        assert_eq!(h.provider.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn pause_during_a_pass_survives_its_status_write() {
        let provider = MemoryProvider::new().with_list_latency(Duration::from_secs(20));
        let mut h = start(valid(test_config(2, 4)), provider, 0);

        tokio::time::sleep(Duration::from_secs(5)).await;
        h.updates
            .send(ConfigUpdate::Invalid("pool.min (5) exceeds pool.max (4)".into()))
            .unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        let status = h.store.get_status("linux").unwrap().unwrap();
        assert!(status.last_error.unwrap().starts_with("invalid configuration"));

        let report = h.reports.recv().await.unwrap();
        assert_eq!(report.created(), 2);
        let status = h.store.get_status("linux").unwrap().unwrap();
        assert_eq!(status.observed_pool_size, 2);
        assert!(
            status
                .last_error
                .unwrap()
                .contains("pool.min (5) exceeds pool.max (4)")
        );

        h.shutdown.send(true).unwrap();
        assert_eq!(h.handle.await.unwrap().unwrap().passes, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_lets_the_in_flight_pass_finish() {
        let provider = MemoryProvider::new().with_list_latency(Duration::from_secs(20));
        let mut h = start(valid(test_config(2, 4)), provider, 0);

        tokio::time::sleep(Duration::from_secs(5)).await;
        h.shutdown.send(true).unwrap();

        let stats = h.handle.await.unwrap().unwrap();
        assert_eq!(stats.passes, 1);
        let report = h.reports.recv().await.unwrap();
        assert!(report.interrupted);
        assert!(report.outcomes.is_empty());
        assert!(h.provider.is_empty());
        assert!(h.store.get_status("linux").unwrap().is_some());
    }
}
