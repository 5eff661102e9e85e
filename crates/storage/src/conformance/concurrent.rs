use std::future::Future;
use std::sync::Arc;

use super::{make_node, TestResult};
use crate::batch::WriteBatch;
use crate::record::{EntityKey, EntityKind};
use crate::{StorageError, TimelineStorage};

/// Number of concurrent tasks to spawn in each test.
const N: usize = 10;

pub(super) async fn run_concurrent_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: TimelineStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let mut results = Vec::new();

    results.push(TestResult::from_result(
        "concurrent",
        "different_entities_all_commit",
        different_entities_all_commit(factory).await,
    ));
    results.push(TestResult::from_result(
        "concurrent",
        "same_entity_read_modify_write_serialized",
        same_entity_read_modify_write_serialized(factory).await,
    ));

    results
}

/// N tasks each create a different entity; every commit succeeds.
async fn different_entities_all_commit<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: TimelineStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = Arc::new(factory().await);

    let mut handles = Vec::new();
    for i in 0..N {
        let s = storage.clone();
        handles.push(tokio::spawn(async move {
            let row = make_node(&format!("R5-CN{i}"), "A", 1_000);
            let mut snap = s.begin_snapshot().await?;
            let mut batch = WriteBatch::new();
            batch.insert_active(row.clone()).insert_history(row);
            if let Err(e) = s.execute_batch(&mut snap, batch).await {
                let _ = s.abort_snapshot(snap).await;
                return Err(e);
            }
            s.commit_snapshot(snap).await
        }));
    }
    for handle in handles {
        handle
            .await
            .map_err(|e| format!("task panic: {e}"))?
            .map_err(|e: StorageError| format!("storage error: {e}"))?;
    }

    let rows = storage
        .list_active(EntityKind::ComputeNode, None)
        .await
        .map_err(|e| e.to_string())?;
    if rows.len() != N {
        return Err(format!("expected {N} active rows, got {}", rows.len()));
    }
    Ok(())
}

/// N tasks each read the same entity's active row, then advance it by one
/// and append a history row at the new timestamp. Snapshots that read a row
/// are serialized with snapshots writing it, so no increment is lost and
/// every history row lands at a distinct timestamp.
async fn same_entity_read_modify_write_serialized<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: TimelineStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = Arc::new(factory().await);
    let key = EntityKey::new(EntityKind::ComputeNode, "R5-SHARED");
    {
        let mut snap = storage
            .begin_snapshot()
            .await
            .map_err(|e| format!("begin: {e}"))?;
        let mut batch = WriteBatch::new();
        batch.insert_active(make_node(&key.id, "A", 0));
        storage
            .execute_batch(&mut snap, batch)
            .await
            .map_err(|e| format!("seed: {e}"))?;
        storage
            .commit_snapshot(snap)
            .await
            .map_err(|e| format!("commit seed: {e}"))?;
    }

    let mut handles = Vec::new();
    for _ in 0..N {
        let s = storage.clone();
        let key = key.clone();
        handles.push(tokio::spawn(async move {
            let mut snap = s.begin_snapshot().await?;
            let result = async {
                let mut row = s
                    .get_active_for_update(&mut snap, &key)
                    .await?
                    .ok_or_else(|| StorageError::EntityNotFound { key: key.clone() })?;
                row.change_ts += 1;
                row.db_updated_ts = row.change_ts;
                let mut batch = WriteBatch::new();
                batch.update_active(row.clone()).insert_history(row);
                s.execute_batch(&mut snap, batch).await
            }
            .await;
            match result {
                Ok(_) => s.commit_snapshot(snap).await,
                Err(e) => {
                    let _ = s.abort_snapshot(snap).await;
                    Err(e)
                }
            }
        }));
    }
    for handle in handles {
        handle
            .await
            .map_err(|e| format!("task panic: {e}"))?
            .map_err(|e: StorageError| format!("storage error: {e}"))?;
    }

    let active = storage
        .get_active(&key)
        .await
        .map_err(|e| e.to_string())?
        .ok_or("shared row missing")?;
    if active.change_ts != N as i64 {
        return Err(format!(
            "expected change_ts {N} after {N} increments, got {}",
            active.change_ts
        ));
    }
    let history = storage.list_history(&key).await.map_err(|e| e.to_string())?;
    let stamps: Vec<_> = history.iter().map(|r| r.change_ts).collect();
    let expected: Vec<_> = (1..=N as i64).collect();
    if stamps != expected {
        return Err(format!("expected history at {expected:?}, got {stamps:?}"));
    }
    Ok(())
}
