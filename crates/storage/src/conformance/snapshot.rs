use std::future::Future;

use super::{commit_batch, make_node, TestResult};
use crate::batch::WriteBatch;
use crate::record::{EntityKey, EntityKind};
use crate::TimelineStorage;

pub(super) async fn run_snapshot_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: TimelineStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let mut results = Vec::new();

    results.push(TestResult::from_result(
        "snapshot",
        "commit_empty_snapshot",
        commit_empty_snapshot(factory).await,
    ));
    results.push(TestResult::from_result(
        "snapshot",
        "committed_active_row_visible",
        committed_active_row_visible(factory).await,
    ));
    results.push(TestResult::from_result(
        "snapshot",
        "uncommitted_active_row_invisible",
        uncommitted_active_row_invisible(factory).await,
    ));
    results.push(TestResult::from_result(
        "snapshot",
        "uncommitted_history_invisible",
        uncommitted_history_invisible(factory).await,
    ));
    results.push(TestResult::from_result(
        "snapshot",
        "abort_discards_batch",
        abort_discards_batch(factory).await,
    ));
    results.push(TestResult::from_result(
        "snapshot",
        "snapshot_reads_own_writes",
        snapshot_reads_own_writes(factory).await,
    ));
    results.push(TestResult::from_result(
        "snapshot",
        "sequential_snapshots_accumulate",
        sequential_snapshots_accumulate(factory).await,
    ));

    results
}

/// Beginning and committing a snapshot with no writes succeeds.
async fn commit_empty_snapshot<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: TimelineStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
    s.commit_snapshot(snap).await.map_err(|e| e.to_string())
}

/// After insert+commit, get_active returns the row with all its fields.
async fn committed_active_row_visible<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: TimelineStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let mut row = make_node("R0-CH0-CN0", "A", 1_000);
    row.fields
        .insert("environment".to_string(), serde_json::json!("prod"));
    let mut batch = WriteBatch::new();
    batch.insert_active(row.clone());
    commit_batch(&s, batch).await?;

    let got = s
        .get_active(&row.key)
        .await
        .map_err(|e| e.to_string())?
        .ok_or("committed row not visible")?;
    if got != row {
        return Err(format!("expected {row:?}, got {got:?}"));
    }
    Ok(())
}

/// An active row written in an open snapshot is invisible to get_active.
async fn uncommitted_active_row_invisible<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: TimelineStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let row = make_node("R0-CH0-CN1", "A", 1_000);
    let mut snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
    let mut batch = WriteBatch::new();
    batch.insert_active(row.clone());
    if let Err(e) = s.execute_batch(&mut snap, batch).await {
        let _ = s.abort_snapshot(snap).await;
        return Err(e.to_string());
    }

    let visible = s.get_active(&row.key).await;
    let _ = s.abort_snapshot(snap).await;
    match visible {
        Ok(None) => Ok(()),
        other => Err(format!("expected no committed row, got {other:?}")),
    }
}

/// History written in an open snapshot is invisible to list_history.
async fn uncommitted_history_invisible<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: TimelineStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let row = make_node("R0-CH0-CN2", "A", 1_000);
    let mut snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
    let mut batch = WriteBatch::new();
    batch.insert_history(row.clone());
    if let Err(e) = s.execute_batch(&mut snap, batch).await {
        let _ = s.abort_snapshot(snap).await;
        return Err(e.to_string());
    }

    let visible = s.list_history(&row.key).await;
    let _ = s.abort_snapshot(snap).await;
    match visible {
        Ok(rows) if rows.is_empty() => Ok(()),
        other => Err(format!("expected empty history, got {other:?}")),
    }
}

/// Aborting a snapshot discards every write of its executed batches.
async fn abort_discards_batch<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: TimelineStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let row = make_node("R0-CH0-CN3", "A", 1_000);
    let mut snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
    let mut batch = WriteBatch::new();
    batch.insert_active(row.clone()).insert_history(row.clone());
    s.execute_batch(&mut snap, batch)
        .await
        .map_err(|e| e.to_string())?;
    s.abort_snapshot(snap).await.map_err(|e| e.to_string())?;

    if s.get_active(&row.key)
        .await
        .map_err(|e| e.to_string())?
        .is_some()
    {
        return Err("active row survived abort".to_string());
    }
    let history = s.list_history(&row.key).await.map_err(|e| e.to_string())?;
    if !history.is_empty() {
        return Err(format!("history survived abort: {history:?}"));
    }
    Ok(())
}

/// Reads inside a snapshot observe the snapshot's own executed batches.
async fn snapshot_reads_own_writes<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: TimelineStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let row = make_node("R0-CH0-CN4", "A", 5_000);
    let mut snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
    let mut batch = WriteBatch::new();
    batch.insert_active(row.clone()).insert_history(row.clone());
    let result = async {
        s.execute_batch(&mut snap, batch)
            .await
            .map_err(|e| e.to_string())?;
        let active = s
            .get_active_for_update(&mut snap, &row.key)
            .await
            .map_err(|e| e.to_string())?;
        if active.as_ref() != Some(&row) {
            return Err(format!("expected own active row, got {active:?}"));
        }
        let probed = s
            .history_exists_at(&mut snap, &row.key, 5_000)
            .await
            .map_err(|e| e.to_string())?;
        if !probed {
            return Err("own history row not found by probe".to_string());
        }
        Ok(())
    }
    .await;
    let _ = s.abort_snapshot(snap).await;
    result
}

/// Separate committed snapshots build on each other.
async fn sequential_snapshots_accumulate<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: TimelineStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    for (i, id) in ["R1-CN0", "R1-CN1", "R1-CN2"].iter().enumerate() {
        let mut batch = WriteBatch::new();
        batch.insert_active(make_node(id, "A", 100 * i as i64));
        commit_batch(&s, batch).await?;
    }
    let rows = s
        .list_active(EntityKind::ComputeNode, None)
        .await
        .map_err(|e| e.to_string())?;
    let ids: Vec<_> = rows.iter().map(|r| r.key.id.as_str()).collect();
    if ids != ["R1-CN0", "R1-CN1", "R1-CN2"] {
        return Err(format!("expected three rows in id order, got {ids:?}"));
    }
    let missing = EntityKey::new(EntityKind::ComputeNode, "R1-CN9");
    if s.get_active(&missing)
        .await
        .map_err(|e| e.to_string())?
        .is_some()
    {
        return Err("unexpected row for unknown key".to_string());
    }
    Ok(())
}
