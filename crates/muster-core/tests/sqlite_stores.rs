//! Two store handles on one SQLite file, standing in for two processes.

#![allow(clippy::doc_markdown)]

use std::sync::Arc;

use muster_core::{
    config::{LockConfig, MemoryConfig},
    store::{InMemoryAssignmentStore, SqliteAssignmentStore, SqliteMemoryBackend},
    AcquireStrategy, Error, LockManager, LockOwner, LockStatus, MemorySyncManager, Result,
};
use serde_json::json;
use tempfile::TempDir;

fn url(dir: &TempDir) -> String {
    let path = dir.path().join("muster.db");
    format!("sqlite://{}", path.display())
}

fn tempdir() -> Result<TempDir> {
    tempfile::tempdir().map_err(|e| Error::BackendUnavailable(e.to_string()))
}

#[tokio::test]
async fn lock_is_exclusive_across_handles() -> Result<()> {
    let dir = tempdir()?;
    let first = SqliteAssignmentStore::open(&url(&dir)).await?;
    let second = SqliteAssignmentStore::open(&url(&dir)).await?;

    let a = LockManager::new(Arc::new(first), LockConfig::default())?;
    let b = LockManager::new(Arc::new(second), LockConfig::default())?;

    let owner_a = LockOwner::new("A", "node-a").with_metadata(json!({"pid": 1}));
    assert!(a.acquire("build", &owner_a, &a.options(AcquireStrategy::FailFast)).await.success);

    let denied = b
        .acquire("build", &LockOwner::new("B", "node-b"), &b.options(AcquireStrategy::FailFast))
        .await;
    assert!(matches!(denied.error, Some(Error::LockConflict { ref holder, .. }) if holder == "A"));

    // B sees A's lock, metadata included.
    match b.get_status("build").await? {
        LockStatus::Locked(lock) => {
            assert_eq!(lock.owner_node_id, "node-a");
            assert_eq!(lock.metadata, json!({"pid": 1}));
        }
        other => return Err(Error::not_found(format!("expected a live lock, got {other:?}"))),
    }

    a.release("build", "A").await?;
    assert!(b
        .acquire("build", &LockOwner::new("B", "node-b"), &b.options(AcquireStrategy::FailFast))
        .await
        .success);
    b.shutdown().await;
    a.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn memory_written_by_one_handle_is_read_by_another() -> Result<()> {
    let dir = tempdir()?;
    let first = SqliteMemoryBackend::open(&url(&dir)).await?;
    let second = SqliteMemoryBackend::open(&url(&dir)).await?;

    let locks = LockManager::new(Arc::new(InMemoryAssignmentStore::new()), LockConfig::default())?;
    let a = MemorySyncManager::new("A", "m", MemoryConfig::default(), Arc::new(first), locks.clone())?;
    let b = MemorySyncManager::new("B", "m", MemoryConfig::default(), Arc::new(second), locks)?;

    a.write("m/tasks/1/progress", json!({"done": 3, "total": 10}), None).await?;
    assert_eq!(b.read("m/tasks/1/progress").await?, None);

    a.force_sync().await?;
    assert_eq!(
        b.read("m/tasks/1/progress").await?,
        Some(json!({"done": 3, "total": 10}))
    );

    let entry = b
        .read_entry("m/tasks/1/progress")
        .await?
        .ok_or_else(|| Error::not_found("m/tasks/1/progress"))?;
    assert_eq!(entry.writer_worker_id, "A");
    assert_eq!(entry.vector_clock.get("A"), 1);

    assert_eq!(b.keys("m/tasks/").await?, vec!["m/tasks/1/progress".to_string()]);
    Ok(())
}
