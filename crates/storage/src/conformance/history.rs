use std::future::Future;

use super::{commit_batch, make_entity, make_node, make_work_item, TestResult};
use crate::batch::WriteBatch;
use crate::record::{EntityKey, EntityKind, WorkItemHistoryRecord, WorkItemState};
use crate::{StorageError, TimelineStorage};

pub(super) async fn run_history_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: TimelineStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let mut results = Vec::new();

    results.push(TestResult::from_result(
        "history",
        "duplicate_timestamp_rejected",
        duplicate_timestamp_rejected(factory).await,
    ));
    results.push(TestResult::from_result(
        "history",
        "same_timestamp_on_other_key_allowed",
        same_timestamp_on_other_key_allowed(factory).await,
    ));
    results.push(TestResult::from_result(
        "history",
        "list_history_ordered_by_timestamp",
        list_history_ordered_by_timestamp(factory).await,
    ));
    results.push(TestResult::from_result(
        "history",
        "preceding_history_is_strictly_before",
        preceding_history_is_strictly_before(factory).await,
    ));
    results.push(TestResult::from_result(
        "history",
        "history_probe_covers_work_items",
        history_probe_covers_work_items(factory).await,
    ));
    results.push(TestResult::from_result(
        "history",
        "list_active_children_filters_parent",
        list_active_children_filters_parent(factory).await,
    ));

    results
}

/// A second history row at the same `(key, ts)` fails with DuplicateHistory.
async fn duplicate_timestamp_rejected<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: TimelineStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let row = make_node("R3-CN0", "A", 1_000);
    let mut batch = WriteBatch::new();
    batch.insert_history(row.clone());
    commit_batch(&s, batch).await?;

    let mut dup = row.clone();
    dup.state = "E".to_string();
    let mut batch = WriteBatch::new();
    batch.insert_history(dup);
    let mut snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
    let result = s.execute_batch(&mut snap, batch).await;
    let _ = s.abort_snapshot(snap).await;
    match result {
        Err(StorageError::DuplicateHistory { key, ts }) if key == row.key && ts == 1_000 => Ok(()),
        other => Err(format!("expected DuplicateHistory, got {other:?}")),
    }
}

async fn same_timestamp_on_other_key_allowed<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: TimelineStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let mut batch = WriteBatch::new();
    batch
        .insert_history(make_node("R3-CN1", "A", 1_000))
        .insert_history(make_node("R3-CN2", "A", 1_000))
        .insert_history(make_entity(EntityKind::Job, "R3-CN1", "T", 1_000));
    commit_batch(&s, batch).await
}

async fn list_history_ordered_by_timestamp<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: TimelineStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let mut batch = WriteBatch::new();
    for ts in [300, 100, 200] {
        batch.insert_history(make_node("R3-CN3", "A", ts));
    }
    commit_batch(&s, batch).await?;

    let key = EntityKey::new(EntityKind::ComputeNode, "R3-CN3");
    let history = s.list_history(&key).await.map_err(|e| e.to_string())?;
    let stamps: Vec<_> = history.iter().map(|r| r.change_ts).collect();
    if stamps != [100, 200, 300] {
        return Err(format!("expected ascending timestamps, got {stamps:?}"));
    }
    Ok(())
}

/// `preceding_history` returns the latest row strictly before `ts`.
async fn preceding_history_is_strictly_before<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: TimelineStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let mut batch = WriteBatch::new();
    batch
        .insert_history(make_node("R3-CN4", "A", 100))
        .insert_history(make_node("R3-CN4", "M", 200));
    commit_batch(&s, batch).await?;

    let key = EntityKey::new(EntityKind::ComputeNode, "R3-CN4");
    let mut snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
    let result = async {
        let at_200 = s
            .preceding_history(&mut snap, &key, 200)
            .await
            .map_err(|e| e.to_string())?;
        if at_200.as_ref().map(|r| r.change_ts) != Some(100) {
            return Err(format!("expected row at 100, got {at_200:?}"));
        }
        let at_250 = s
            .preceding_history(&mut snap, &key, 250)
            .await
            .map_err(|e| e.to_string())?;
        if at_250.as_ref().map(|r| r.state.as_str()) != Some("M") {
            return Err(format!("expected row M at 200, got {at_250:?}"));
        }
        let at_100 = s
            .preceding_history(&mut snap, &key, 100)
            .await
            .map_err(|e| e.to_string())?;
        if at_100.is_some() {
            return Err(format!("expected no row before 100, got {at_100:?}"));
        }
        Ok(())
    }
    .await;
    let _ = s.abort_snapshot(snap).await;
    result
}

/// `history_exists_at` with a work item key probes work item history.
async fn history_probe_covers_work_items<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: TimelineStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let item = make_work_item(7, "RAS", WorkItemState::Queued, 500);
    let mut batch = WriteBatch::new();
    batch.insert_work_item_history(WorkItemHistoryRecord::transition(item));
    commit_batch(&s, batch).await?;

    let mut snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
    let result = async {
        let key = EntityKey::work_item(7);
        let hit = s
            .history_exists_at(&mut snap, &key, 500)
            .await
            .map_err(|e| e.to_string())?;
        let miss = s
            .history_exists_at(&mut snap, &key, 501)
            .await
            .map_err(|e| e.to_string())?;
        let other = s
            .history_exists_at(&mut snap, &EntityKey::work_item(8), 500)
            .await
            .map_err(|e| e.to_string())?;
        if !hit || miss || other {
            return Err(format!(
                "probe results hit={hit} miss={miss} other={other}, expected true/false/false"
            ));
        }
        Ok(())
    }
    .await;
    let _ = s.abort_snapshot(snap).await;
    result
}

async fn list_active_children_filters_parent<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: TimelineStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let mut batch = WriteBatch::new();
    for (id, parent) in [
        ("R3-CN5-P1", "R3-CN5"),
        ("R3-CN5-P0", "R3-CN5"),
        ("R3-CN6-P0", "R3-CN6"),
    ] {
        let mut part = make_entity(EntityKind::Component, id, "A", 10);
        part.parent_id = Some(parent.to_string());
        batch.insert_active(part);
    }
    commit_batch(&s, batch).await?;

    let mut snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
    let children = s
        .list_active_children(&mut snap, EntityKind::Component, "R3-CN5")
        .await;
    let _ = s.abort_snapshot(snap).await;
    let children = children.map_err(|e| e.to_string())?;
    let ids: Vec<_> = children.iter().map(|r| r.key.id.as_str()).collect();
    if ids != ["R3-CN5-P0", "R3-CN5-P1"] {
        return Err(format!("expected two children in id order, got {ids:?}"));
    }
    Ok(())
}
