//! Multi-pass convergence of supervised resources against the in-memory
//! provider, under paused time.

mod common;

use std::time::Duration;

use tokio::sync::watch;

use poolscale_state::StateStore;
use poolscaled::Supervisor;

use common::{MemoryBackends, no_env, resource, wait_for_status, write};

const LIMIT: Duration = Duration::from_secs(300);

#[tokio::test(start_paused = true)]
async fn pool_converges_scales_up_and_follows_hot_reload() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "linux.toml", &resource("linux", 2, 4));

    let store = StateStore::open_in_memory().unwrap();
    let backends = MemoryBackends::new(0);
    let mut supervisor = Supervisor::new(dir.path(), store.clone())
        .with_backends(backends.clone())
        .with_env(no_env);
    assert_eq!(supervisor.reload().await.unwrap().started, vec!["linux"]);

    // Cold start fills the minimum.
    let status = wait_for_status(&store, "linux", LIMIT, |s| {
        s.converged() && s.observed_pool_size == 2
    })
    .await;
    assert_eq!(status.desired_pool_size, 2);
    assert_eq!(status.provider, "memory");
    assert!(status.last_error.is_none());
    let provider = backends.provider_for("linux");
    assert_eq!(provider.len(), 2);

    // A backlog of 7 builds at concurrency 2 wants 4 agents.
    backends.queue.set(Ok(7));
    wait_for_status(&store, "linux", LIMIT, |s| {
        s.converged() && s.observed_pool_size == 4
    })
    .await;
    assert_eq!(provider.len(), 4);

    // Lowering the maximum applies without new clients.
    write(dir.path(), "linux.toml", &resource("linux", 2, 3));
    let summary = supervisor.reload().await.unwrap();
    assert_eq!(summary.updated, vec!["linux"]);
    assert_eq!(backends.builds(), 1);

    let status = wait_for_status(&store, "linux", LIMIT, |s| {
        s.converged() && s.observed_pool_size == 3
    })
    .await;
    assert_eq!(status.desired_pool_size, 3);
    assert_eq!(provider.len(), 3);
    assert_eq!(provider.calls().destroy, 1);

    supervisor.stop_all().await;
}

#[tokio::test(start_paused = true)]
async fn invalid_reload_pauses_until_fixed() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "linux.toml", &resource("linux", 1, 2));

    let store = StateStore::open_in_memory().unwrap();
    let backends = MemoryBackends::new(0);
    let mut supervisor = Supervisor::new(dir.path(), store.clone())
        .with_backends(backends.clone())
        .with_env(no_env);
    supervisor.reload().await.unwrap();
    wait_for_status(&store, "linux", LIMIT, |s| s.converged() && s.observed_pool_size == 1).await;

    write(dir.path(), "linux.toml", "name = \"linux\"\n[pool]\nmin = \"many\"\n");
    let summary = supervisor.reload().await.unwrap();
    assert_eq!(summary.paused, vec!["linux"]);
    assert_eq!(supervisor.paused(), vec!["linux"]);

    let status = wait_for_status(&store, "linux", LIMIT, |s| s.last_error.is_some()).await;
    assert!(status.last_error.unwrap().starts_with("invalid configuration"));

    // Paused resources take no actions while the backlog grows.
    backends.queue.set(Ok(4));
    tokio::time::sleep(Duration::from_secs(120)).await;
    let provider = backends.provider_for("linux");
    assert_eq!(provider.len(), 1);

    // Re-reading the same broken file changes nothing.
    assert!(supervisor.reload().await.unwrap().is_empty());

    write(dir.path(), "linux.toml", &resource("linux", 1, 2));
    let summary = supervisor.reload().await.unwrap();
    assert_eq!(summary.updated, vec!["linux"]);
    assert!(supervisor.paused().is_empty());

    let status = wait_for_status(&store, "linux", LIMIT, |s| {
        s.last_error.is_none() && s.converged() && s.observed_pool_size == 2
    })
    .await;
    assert_eq!(status.desired_pool_size, 2);
    assert_eq!(backends.builds(), 1);

    supervisor.stop_all().await;
}

#[tokio::test(start_paused = true)]
async fn provider_change_restarts_and_rediscovers_the_pool() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "linux.toml", &resource("linux", 2, 4));

    let store = StateStore::open_in_memory().unwrap();
    let backends = MemoryBackends::new(0);
    let mut supervisor = Supervisor::new(dir.path(), store.clone())
        .with_backends(backends.clone())
        .with_env(no_env);
    supervisor.reload().await.unwrap();
    wait_for_status(&store, "linux", LIMIT, |s| s.converged() && s.observed_pool_size == 2).await;

    let provider = backends.provider_for("linux");
    let created = provider.calls().create;

    let mut content = resource("linux", 2, 4);
    content.push_str("quota = 10\n");
    write(dir.path(), "linux.toml", &content);
    let summary = supervisor.reload().await.unwrap();
    assert_eq!(summary.restarted, vec!["linux"]);
    assert_eq!(backends.builds(), 2);

    // The fresh registry discovers the running agents instead of
    // provisioning new ones.
    tokio::time::sleep(Duration::from_secs(5)).await;
    let status = wait_for_status(&store, "linux", LIMIT, |s| s.converged()).await;
    assert_eq!(status.observed_pool_size, 2);
    assert_eq!(provider.calls().create, created);

    supervisor.stop_all().await;
}

#[tokio::test(start_paused = true)]
async fn renamed_and_removed_resources_drop_their_status() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "pool.toml", &resource("linux", 1, 2));

    let store = StateStore::open_in_memory().unwrap();
    let mut supervisor = Supervisor::new(dir.path(), store.clone())
        .with_backends(MemoryBackends::new(0))
        .with_env(no_env);
    supervisor.reload().await.unwrap();
    wait_for_status(&store, "linux", LIMIT, |s| s.observed_pool_size == 1).await;

    write(dir.path(), "pool.toml", &resource("arm", 1, 2));
    let summary = supervisor.reload().await.unwrap();
    assert_eq!(summary.restarted, vec!["arm"]);
    assert!(store.get_status("linux").unwrap().is_none());
    wait_for_status(&store, "arm", LIMIT, |s| s.observed_pool_size == 1).await;

    std::fs::remove_file(dir.path().join("pool.toml")).unwrap();
    let summary = supervisor.reload().await.unwrap();
    assert_eq!(summary.stopped, vec!["arm"]);
    assert!(supervisor.running().is_empty());
    assert!(store.list_statuses().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn run_picks_up_new_files_and_stops_on_shutdown() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "linux.toml", &resource("linux", 1, 2));

    let store = StateStore::open_in_memory().unwrap();
    let supervisor = Supervisor::new(dir.path(), store.clone())
        .with_backends(MemoryBackends::new(0))
        .with_env(no_env);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(supervisor.run(Duration::from_secs(10), shutdown_rx));

    wait_for_status(&store, "linux", LIMIT, |s| s.observed_pool_size == 1).await;

    write(dir.path(), "windows.toml", &resource("windows", 2, 2));
    wait_for_status(&store, "windows", LIMIT, |s| s.converged() && s.observed_pool_size == 2).await;

    shutdown_tx.send(true).unwrap();
    handle.await.unwrap().unwrap();
}
