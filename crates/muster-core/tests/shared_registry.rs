//! Two coordination cores sharing one memory backend, standing in for two
//! processes: workers registered in one become selectable in the other.

#![allow(clippy::doc_markdown)]

use std::{sync::Arc, time::Duration};

use muster_core::{
    config::MemoryConfig,
    memory::{ChannelListener, MemoryEvent},
    store::{InMemoryAssignmentStore, InMemoryBackend},
    workers::HealthStatus,
    CoordinationCore, CoreConfig, Error, ManualClock, Result, TaskDescriptor, Worker,
};

fn core(backend: &InMemoryBackend, store: &InMemoryAssignmentStore, process: &str, clock: &ManualClock) -> Result<CoordinationCore> {
    let config = CoreConfig {
        root: "m".into(),
        memory: MemoryConfig {
            // Polls are driven by hand below.
            remote_poll_interval_ms: 60_000,
            ..MemoryConfig::default()
        },
        ..CoreConfig::default()
    };
    CoordinationCore::with_clock(
        config,
        Arc::new(store.clone()),
        Arc::new(backend.clone()),
        process,
        Arc::new(clock.clone()),
    )
}

/// Wait for the dispatcher to hand `worker_id` to `core`'s registry in a state accepted by `ready`.
async fn wait_for_worker<F>(core: &CoordinationCore, worker_id: &str, ready: F) -> Result<Worker>
where
    F: Fn(&Worker) -> bool,
{
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if let Ok(worker) = core.registry().get(worker_id).await {
                if ready(&worker) {
                    return worker;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .map_err(|_| Error::not_found(format!("worker {worker_id} never reached the peer registry")))
}

#[tokio::test]
async fn worker_published_by_one_core_is_selectable_in_another() -> Result<()> {
    let backend = InMemoryBackend::new();
    let store = InMemoryAssignmentStore::new();
    let clock = ManualClock::starting_now();
    let a = core(&backend, &store, "proc-a", &clock)?;
    let b = core(&backend, &store, "proc-b", &clock)?;

    let (listener, mut events) = ChannelListener::channel();
    b.memory().subscribe("m/workers/**", Arc::new(listener))?;
    b.start().await?;
    assert!(b.registry().list().await.is_empty());

    let worker = a.registry().register("node-a", ["rust"], 4).await?;
    a.registry().update_task_count(&worker.id, 1).await?;
    a.publish_heartbeat(&worker.id, vec!["t1".into()]).await?;
    a.memory().force_sync().await?;

    // Capacity, heartbeat and status keys.
    assert_eq!(b.memory().poll_remote().await?, 3);

    let seen = wait_for_worker(&b, &worker.id, |_| true).await?;
    assert_eq!(seen.node_id, "node-a");
    assert_eq!(seen.current_load, 1);
    assert_eq!(seen.health_status, HealthStatus::Healthy);

    let selection = b
        .select_worker(&TaskDescriptor::new("t2").with_capabilities(["rust"]))
        .await?;
    assert_eq!(selection.worker.id, worker.id);

    let mut writers = Vec::new();
    while writers.len() < 3 {
        match tokio::time::timeout(Duration::from_secs(1), events.recv()).await {
            Ok(Some(MemoryEvent::Changed(change))) => writers.push(change.writer_worker_id),
            _ => break,
        }
    }
    assert_eq!(writers, vec!["proc-a"; 3]);

    b.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn later_heartbeat_refreshes_peer_view() -> Result<()> {
    let backend = InMemoryBackend::new();
    let store = InMemoryAssignmentStore::new();
    let clock = ManualClock::starting_now();
    let a = core(&backend, &store, "proc-a", &clock)?;
    let b = core(&backend, &store, "proc-b", &clock)?;
    b.start().await?;

    let worker = a.registry().register("node-a", ["rust"], 2).await?;
    a.publish_heartbeat(&worker.id, Vec::new()).await?;
    a.memory().force_sync().await?;
    b.memory().poll_remote().await?;
    wait_for_worker(&b, &worker.id, |_| true).await?;

    clock.advance(chrono::Duration::minutes(11));
    assert_eq!(b.registry().get(&worker.id).await?.health_status, HealthStatus::Degraded);

    a.registry().update_task_count(&worker.id, 2).await?;
    a.publish_heartbeat(&worker.id, Vec::new()).await?;
    a.memory().force_sync().await?;
    b.memory().poll_remote().await?;

    let refreshed = wait_for_worker(&b, &worker.id, |w| w.health_status == HealthStatus::Healthy).await?;
    assert_eq!(refreshed.current_load, 2);

    b.shutdown().await?;
    Ok(())
}
