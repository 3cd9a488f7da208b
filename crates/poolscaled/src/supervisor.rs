//! Supervisor: one reconcile task per resource file in the config directory.
//!
//! Each `*.toml` file owns at most one [`Driver`] task. A reload compares the
//! freshly resolved file against what its task runs:
//!
//! - unchanged: nothing happens
//! - hot change (selector, loop, pool or agent settings): pushed to the
//!   task's watch channel and applied between passes
//! - name, server or provider change: the task is stopped and restarted
//!   with new clients
//! - the file no longer resolves: the task is paused
//! - the file is gone: the task is stopped and its status removed
//!
//! A file that resolves but whose provider or build queue cannot be built
//! gets a status carrying the error and no task.

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use poolscale_core::config::{load_dir, process_env};
use poolscale_core::AutoscalerConfig;
use poolscale_provider::Provider;
use poolscale_queue::{BuildQueue, DroneQueue};
use poolscale_reconcile::{ConfigUpdate, Driver, DriverStats, ReconcileResult, Reconciler};
use poolscale_state::{StateStore, Status};

/// Builds the external clients a resource needs.
pub trait Backends: Send + Sync {
    fn provider(&self, config: &AutoscalerConfig) -> anyhow::Result<Arc<dyn Provider>>;
    fn queue(&self, config: &AutoscalerConfig) -> anyhow::Result<Arc<dyn BuildQueue>>;
}

/// The configured cloud provider and the Drone server queue.
pub struct LiveBackends;

impl Backends for LiveBackends {
    fn provider(&self, config: &AutoscalerConfig) -> anyhow::Result<Arc<dyn Provider>> {
        Ok(poolscale_provider::build(&config.name, &config.provider)?)
    }

    fn queue(&self, config: &AutoscalerConfig) -> anyhow::Result<Arc<dyn BuildQueue>> {
        Ok(Arc::new(DroneQueue::new(&config.server)?))
    }
}

/// What a reload changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReloadSummary {
    pub started: Vec<String>,
    pub updated: Vec<String>,
    pub restarted: Vec<String>,
    pub paused: Vec<String>,
    pub stopped: Vec<String>,
    /// Resources that resolved but could not be started.
    pub failed: Vec<String>,
}

impl ReloadSummary {
    pub fn is_empty(&self) -> bool {
        self.started.is_empty()
            && self.updated.is_empty()
            && self.restarted.is_empty()
            && self.paused.is_empty()
            && self.stopped.is_empty()
            && self.failed.is_empty()
    }
}

type Env = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

struct Task {
    /// Last config pushed to the driver; `None` while paused.
    config: Option<AutoscalerConfig>,
    /// Config the task's clients were built from.
    origin: AutoscalerConfig,
    updates: watch::Sender<ConfigUpdate>,
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<ReconcileResult<DriverStats>>,
}

/// Per-file state of a resource that has no running task.
#[derive(Debug, PartialEq, Eq)]
enum Blocked {
    Invalid(String),
    Failed(Box<AutoscalerConfig>),
}

pub struct Supervisor {
    config_dir: PathBuf,
    store: StateStore,
    backends: Arc<dyn Backends>,
    env: Env,
    tasks: BTreeMap<PathBuf, Task>,
    blocked: BTreeMap<PathBuf, Blocked>,
}

impl Supervisor {
    pub fn new(config_dir: impl Into<PathBuf>, store: StateStore) -> Self {
        Self {
            config_dir: config_dir.into(),
            store,
            backends: Arc::new(LiveBackends),
            env: Arc::new(process_env),
            tasks: BTreeMap::new(),
            blocked: BTreeMap::new(),
        }
    }

    pub fn with_backends(mut self, backends: Arc<dyn Backends>) -> Self {
        self.backends = backends;
        self
    }

    /// Replace the environment lookup used for secret overrides.
    pub fn with_env(
        mut self,
        env: impl Fn(&str) -> Option<String> + Send + Sync + 'static,
    ) -> Self {
        self.env = Arc::new(env);
        self
    }

    /// Names of the resources with a running task, sorted.
    pub fn running(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tasks.values().map(|t| t.origin.name.clone()).collect();
        names.sort();
        names
    }

    /// Names of running resources currently paused by an invalid file.
    pub fn paused(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .tasks
            .values()
            .filter(|t| t.config.is_none())
            .map(|t| t.origin.name.clone())
            .collect();
        names.sort();
        names
    }

    /// Re-read the config directory and bring the tasks in line with it.
    ///
    /// Every task that has to go is stopped before any task starts, so a
    /// resource never has two loops on its pool.
    pub async fn reload(&mut self) -> anyhow::Result<ReloadSummary> {
        let env = self.env.clone();
        let loaded = load_dir(&self.config_dir, &|key: &str| env(key))
            .with_context(|| format!("reading config directory {}", self.config_dir.display()))?;

        let mut summary = ReloadSummary::default();
        let present: Vec<PathBuf> = loaded.iter().map(|r| r.path.clone()).collect();
        let in_use: HashSet<String> = loaded
            .iter()
            .filter_map(|r| r.result.as_ref().ok())
            .map(|config| config.name.clone())
            .collect();

        // ── Stop ──
        let mut restarting = HashSet::new();
        let mut stopped_names = Vec::new();
        let paths: Vec<PathBuf> = self.tasks.keys().cloned().collect();
        for path in paths {
            let next = loaded.iter().find(|r| r.path == path).map(|r| &r.result);
            let restart = match next {
                None => false,
                Some(Ok(config)) => self
                    .tasks
                    .get(&path)
                    .is_some_and(|task| task.origin.requires_restart(config)),
                Some(Err(_)) => continue,
            };
            let Some(task) = self.tasks.remove(&path) else {
                continue;
            };
            let name = task.origin.name.clone();
            if restart {
                info!(autoscaler = %name, path = ?path, "resource needs new clients, restarting");
                restarting.insert(path);
            } else {
                info!(autoscaler = %name, path = ?path, "resource file removed");
                summary.stopped.push(name.clone());
            }
            stop(task).await;
            stopped_names.push(name);
        }

        let gone: Vec<PathBuf> = self
            .blocked
            .keys()
            .filter(|path| !present.contains(path))
            .cloned()
            .collect();
        for path in gone {
            if let Some(Blocked::Failed(config)) = self.blocked.remove(&path) {
                stopped_names.push(config.name);
            }
        }
        for name in stopped_names {
            if !in_use.contains(&name) {
                self.forget_status(&name);
            }
        }

        // ── Apply ──
        for resource in loaded {
            match resource.result {
                Ok(config) => {
                    let restart = restarting.contains(&resource.path);
                    self.apply(resource.path, config, restart, &mut summary);
                }
                Err(e) => self.reject(resource.path, e.to_string(), &mut summary),
            }
        }

        if !summary.is_empty() {
            debug!(?summary, "config directory reloaded");
        }
        Ok(summary)
    }

    /// Start, update or leave alone the task of a resolved file. Tasks that
    /// need new clients were already stopped by the caller.
    fn apply(
        &mut self,
        path: PathBuf,
        config: AutoscalerConfig,
        restart: bool,
        summary: &mut ReloadSummary,
    ) {
        let Some(task) = self.tasks.get_mut(&path) else {
            if matches!(self.blocked.get(&path), Some(Blocked::Failed(failed)) if **failed == config) {
                return;
            }
            let name = config.name.clone();
            match self.start(&config) {
                Ok(task) => {
                    self.blocked.remove(&path);
                    self.tasks.insert(path, task);
                    if restart {
                        summary.restarted.push(name);
                    } else {
                        summary.started.push(name);
                    }
                }
                Err(e) => self.block(path, config, e, summary),
            }
            return;
        };

        if task.config.as_ref() == Some(&config) {
            return;
        }

        info!(autoscaler = %config.name, "pushing updated configuration");
        task.updates.send_replace(ConfigUpdate::Valid(Box::new(config.clone())));
        task.config = Some(config.clone());
        summary.updated.push(config.name);
    }

    fn reject(&mut self, path: PathBuf, reason: String, summary: &mut ReloadSummary) {
        match self.tasks.get_mut(&path) {
            Some(task) => {
                let unchanged = matches!(
                    &*task.updates.borrow(),
                    ConfigUpdate::Invalid(current) if *current == reason
                );
                if unchanged {
                    return;
                }
                task.updates.send_replace(ConfigUpdate::Invalid(reason));
                task.config = None;
                summary.paused.push(task.origin.name.clone());
            }
            None => {
                let blocked = Blocked::Invalid(reason.clone());
                if self.blocked.get(&path) != Some(&blocked) {
                    error!(path = ?path, error = %reason, "invalid resource file");
                    self.blocked.insert(path, blocked);
                }
            }
        }
    }

    fn block(
        &mut self,
        path: PathBuf,
        config: AutoscalerConfig,
        e: anyhow::Error,
        summary: &mut ReloadSummary,
    ) {
        let name = config.name.clone();
        error!(autoscaler = %name, error = %format!("{e:#}"), "resource cannot be started");
        let mut status = Status::new(&name, config.provider.kind().as_str());
        status.last_error = Some(format!("{e:#}"));
        self.write_status(&status);
        self.blocked.insert(path, Blocked::Failed(Box::new(config)));
        summary.failed.push(name);
    }

    fn start(&self, config: &AutoscalerConfig) -> anyhow::Result<Task> {
        let provider = self
            .backends
            .provider(config)
            .with_context(|| format!("building {} provider", config.provider.kind()))?;
        let queue = self
            .backends
            .queue(config)
            .context("building build queue client")?;

        let reconciler = Reconciler::new(config, provider, queue, self.store.clone());
        let (updates, updates_rx) = watch::channel(ConfigUpdate::Valid(Box::new(config.clone())));
        let (shutdown, shutdown_rx) = watch::channel(false);
        let driver = Driver::new(reconciler, self.store.clone(), updates_rx, shutdown_rx);
        let handle = tokio::spawn(driver.run());

        info!(
            autoscaler = %config.name,
            provider = %config.provider.kind(),
            min = config.pool.min,
            max = config.pool.max,
            "resource started"
        );
        Ok(Task {
            config: Some(config.clone()),
            origin: config.clone(),
            updates,
            shutdown,
            handle,
        })
    }

    fn write_status(&self, status: &Status) {
        if let Err(e) = self.store.put_status(status) {
            warn!(autoscaler = %status.autoscaler, error = %e, "failed to write status");
        }
    }

    fn forget_status(&self, name: &str) {
        if let Err(e) = self.store.delete_status(name) {
            warn!(autoscaler = %name, error = %e, "failed to delete status");
        }
    }

    /// Stop every task, letting in-flight passes finish.
    pub async fn stop_all(&mut self) {
        let tasks = std::mem::take(&mut self.tasks);
        for (_, task) in tasks {
            stop(task).await;
        }
    }

    /// Reload every `reload` until `shutdown` is set, then stop all tasks.
    pub async fn run(
        mut self,
        reload: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let mut ticker = tokio::time::interval(reload);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(dir = ?self.config_dir, ?reload, "supervisor started");

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.reload().await {
                        error!(error = %format!("{e:#}"), "config reload failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!(tasks = self.tasks.len(), "supervisor stopping");
        self.stop_all().await;
        Ok(())
    }
}

async fn stop(task: Task) {
    let name = task.origin.name;
    task.shutdown.send_replace(true);
    match task.handle.await {
        Ok(Ok(stats)) => debug!(autoscaler = %name, passes = stats.passes, "task stopped"),
        Ok(Err(e)) => error!(autoscaler = %name, error = %e, "task failed"),
        Err(e) => error!(autoscaler = %name, error = %e, "task panicked"),
    }
}
