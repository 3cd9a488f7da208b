#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use poolscale_core::AutoscalerConfig;
use poolscale_provider::{MemoryProvider, Provider};
use poolscale_queue::{BuildQueue, StaticQueue};
use poolscale_state::{StateStore, Status};
use poolscaled::Backends;

/// One memory provider per resource name and a shared scripted queue.
pub struct MemoryBackends {
    providers: Mutex<BTreeMap<String, Arc<MemoryProvider>>>,
    pub queue: Arc<StaticQueue>,
    pub builds: AtomicUsize,
    /// Resource names whose provider fails to build.
    pub broken: Mutex<Vec<String>>,
}

impl MemoryBackends {
    pub fn new(pending_builds: u32) -> Arc<Self> {
        Arc::new(Self {
            providers: Mutex::new(BTreeMap::new()),
            queue: Arc::new(StaticQueue::new(pending_builds)),
            builds: AtomicUsize::new(0),
            broken: Mutex::new(Vec::new()),
        })
    }

    pub fn provider_for(&self, name: &str) -> Arc<MemoryProvider> {
        let mut providers = self.providers.lock().unwrap();
        providers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(MemoryProvider::new()))
            .clone()
    }

    pub fn builds(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }
}

impl Backends for MemoryBackends {
    fn provider(&self, config: &AutoscalerConfig) -> anyhow::Result<Arc<dyn Provider>> {
        if self.broken.lock().unwrap().contains(&config.name) {
            anyhow::bail!("credentials rejected");
        }
        self.builds.fetch_add(1, Ordering::SeqCst);
        Ok(self.provider_for(&config.name))
    }

    fn queue(&self, _config: &AutoscalerConfig) -> anyhow::Result<Arc<dyn BuildQueue>> {
        Ok(self.queue.clone())
    }
}

/// A memory-provider resource file.
pub fn resource(name: &str, min: u32, max: u32) -> String {
    format!(
        r#"
name = "{name}"

[config]
interval = "30s"
timeout = "5s"

[pool]
min = {min}
max = {max}

[server]
host = "drone.example.com"
token = "secret"

[provider.memory]
"#
    )
}

pub fn write(dir: &Path, file: &str, content: &str) {
    std::fs::write(dir.join(file), content).unwrap();
}

pub fn no_env(_: &str) -> Option<String> {
    None
}

/// Sleep in one-second steps of (paused) time until `check` accepts the
/// resource's status, or panic after `limit`.
pub async fn wait_for_status(
    store: &StateStore,
    name: &str,
    limit: Duration,
    check: impl Fn(&Status) -> bool,
) -> Status {
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if let Some(status) = store.get_status(name).unwrap()
            && check(&status)
        {
            return status;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "status of {name} never matched: {:?}",
            store.get_status(name).unwrap()
        );
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}
