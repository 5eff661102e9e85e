use std::future::Future;

use super::{commit_batch, make_work_item, make_worker, TestResult};
use crate::batch::WriteBatch;
use crate::record::{WorkItemHistoryRecord, WorkItemState};
use crate::TimelineStorage;

pub(super) async fn run_work_item_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: TimelineStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let mut results = Vec::new();

    results.push(TestResult::from_result(
        "work_item",
        "active_row_lifecycle",
        active_row_lifecycle(factory).await,
    ));
    results.push(TestResult::from_result(
        "work_item",
        "list_in_state_filters_and_orders",
        list_in_state_filters_and_orders(factory).await,
    ));
    results.push(TestResult::from_result(
        "work_item",
        "replace_history_moves_row",
        replace_history_moves_row(factory).await,
    ));
    results.push(TestResult::from_result(
        "work_item",
        "replace_missing_history_affects_nothing",
        replace_missing_history_affects_nothing(factory).await,
    ));
    results.push(TestResult::from_result(
        "work_item",
        "latest_history_matches_state_and_owner",
        latest_history_matches_state_and_owner(factory).await,
    ));
    results.push(TestResult::from_result(
        "work_item",
        "next_id_strictly_increases",
        next_id_strictly_increases(factory).await,
    ));
    results.push(TestResult::from_result(
        "work_item",
        "worker_registry_upsert_and_delete",
        worker_registry_upsert_and_delete(factory).await,
    ));

    results
}

/// Insert, update and delete of a work item's active row.
async fn active_row_lifecycle<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: TimelineStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let queued = make_work_item(1, "RAS", WorkItemState::Queued, 100);
    let mut batch = WriteBatch::new();
    batch.insert_work_item(queued.clone());
    commit_batch(&s, batch).await?;

    let mut working = queued.clone();
    working.state = WorkItemState::Working;
    working.working_adapter_id = Some(3);
    working.db_updated_ts = 200;
    let mut batch = WriteBatch::new();
    batch.update_work_item(working.clone());
    commit_batch(&s, batch).await?;

    let got = s.get_work_item(1).await.map_err(|e| e.to_string())?;
    if got.as_ref() != Some(&working) {
        return Err(format!("expected updated row, got {got:?}"));
    }

    let mut batch = WriteBatch::new();
    batch.delete_work_item(1);
    commit_batch(&s, batch).await?;
    if s.get_work_item(1)
        .await
        .map_err(|e| e.to_string())?
        .is_some()
    {
        return Err("deleted work item still visible".to_string());
    }
    Ok(())
}

async fn list_in_state_filters_and_orders<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: TimelineStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let mut batch = WriteBatch::new();
    batch
        .insert_work_item(make_work_item(12, "RAS", WorkItemState::Working, 10))
        .insert_work_item(make_work_item(10, "RAS", WorkItemState::Working, 10))
        .insert_work_item(make_work_item(11, "RAS", WorkItemState::Queued, 10));
    commit_batch(&s, batch).await?;

    let mut snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
    let working = s
        .list_work_items_in_state(&mut snap, WorkItemState::Working)
        .await;
    let _ = s.abort_snapshot(snap).await;
    let ids: Vec<_> = working
        .map_err(|e| e.to_string())?
        .iter()
        .map(|w| w.id)
        .collect();
    if ids != [10, 12] {
        return Err(format!("expected working ids [10, 12], got {ids:?}"));
    }
    Ok(())
}

/// Replacing a history row at `at_ts` with a record at a later timestamp
/// leaves exactly one row, at the new timestamp.
async fn replace_history_moves_row<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: TimelineStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let mut item = make_work_item(2, "RAS", WorkItemState::Working, 100);
    item.working_adapter_id = Some(5);
    let mut batch = WriteBatch::new();
    batch.insert_work_item_history(WorkItemHistoryRecord::transition(item.clone()));
    commit_batch(&s, batch).await?;

    item.db_updated_ts = 150;
    item.working_results = Some("step-2".to_string());
    let replacement = WorkItemHistoryRecord {
        item,
        checkpoint: true,
        coalesced: true,
    };
    let mut batch = WriteBatch::new();
    batch.replace_work_item_history(100, replacement.clone());
    commit_batch(&s, batch).await?;

    let history = s
        .list_work_item_history(2)
        .await
        .map_err(|e| e.to_string())?;
    if history != [replacement] {
        return Err(format!("expected only the replacement row, got {history:?}"));
    }
    Ok(())
}

async fn replace_missing_history_affects_nothing<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: TimelineStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let item = make_work_item(3, "RAS", WorkItemState::Working, 100);
    let mut batch = WriteBatch::new();
    batch.replace_work_item_history(100, WorkItemHistoryRecord::transition(item));

    let mut snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
    let result = s.execute_batch(&mut snap, batch).await;
    let _ = s.abort_snapshot(snap).await;
    if result.is_ok() {
        return Err("replace of a missing history row succeeded".to_string());
    }
    Ok(())
}

/// The newest row in the requested state with the requested owner is found;
/// rows of other owners and states are skipped.
async fn latest_history_matches_state_and_owner<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: TimelineStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let mut batch = WriteBatch::new();
    let mut ts = 100;
    for (state, owner) in [
        (WorkItemState::Queued, None),
        (WorkItemState::Working, Some(1)),
        (WorkItemState::Working, Some(1)),
        (WorkItemState::Requeued, None),
        (WorkItemState::Working, Some(2)),
    ] {
        let mut item = make_work_item(4, "RAS", state, ts);
        item.working_adapter_id = owner;
        batch.insert_work_item_history(WorkItemHistoryRecord::transition(item));
        ts += 100;
    }
    commit_batch(&s, batch).await?;

    let mut snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
    let result = async {
        let owner_one = s
            .latest_work_item_history(&mut snap, 4, WorkItemState::Working, Some(1))
            .await
            .map_err(|e| e.to_string())?;
        if owner_one.as_ref().map(|h| h.ts()) != Some(300) {
            return Err(format!("expected owner 1 row at 300, got {owner_one:?}"));
        }
        let owner_three = s
            .latest_work_item_history(&mut snap, 4, WorkItemState::Working, Some(3))
            .await
            .map_err(|e| e.to_string())?;
        if owner_three.is_some() {
            return Err(format!("expected no row for owner 3, got {owner_three:?}"));
        }
        Ok(())
    }
    .await;
    let _ = s.abort_snapshot(snap).await;
    result
}

/// Reserved ids strictly increase across snapshots, including aborted ones.
async fn next_id_strictly_increases<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: TimelineStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let mut ids = Vec::new();
    for commit in [true, false, true] {
        let mut snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
        let id = s.next_work_item_id(&mut snap).await;
        if commit {
            s.commit_snapshot(snap).await.map_err(|e| e.to_string())?;
        } else {
            s.abort_snapshot(snap).await.map_err(|e| e.to_string())?;
        }
        ids.push(id.map_err(|e| e.to_string())?);
    }
    if !ids.windows(2).all(|w| w[0] < w[1]) {
        return Err(format!("ids not strictly increasing: {ids:?}"));
    }
    Ok(())
}

async fn worker_registry_upsert_and_delete<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: TimelineStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let mut moved = make_worker("RAS", 1);
    moved.lctn = "SN1".to_string();
    let mut batch = WriteBatch::new();
    batch
        .upsert_worker(make_worker("WLM", 2))
        .upsert_worker(make_worker("RAS", 1))
        .upsert_worker(moved.clone());
    commit_batch(&s, batch).await?;

    let workers = s.list_workers().await.map_err(|e| e.to_string())?;
    let keys: Vec<_> = workers.iter().map(|w| (w.kind.as_str(), w.id)).collect();
    if keys != [("RAS", 1), ("WLM", 2)] {
        return Err(format!("expected RAS/1 then WLM/2, got {keys:?}"));
    }
    if workers[0] != moved {
        return Err(format!("upsert did not replace RAS/1: {:?}", workers[0]));
    }

    // Deleting an unknown worker is admitted (ZeroOrOne).
    let mut batch = WriteBatch::new();
    batch.delete_worker("WLM", 2).delete_worker("WLM", 99);
    commit_batch(&s, batch).await?;

    let mut snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
    let live = s.list_live_workers(&mut snap).await;
    let _ = s.abort_snapshot(snap).await;
    let live = live.map_err(|e| e.to_string())?;
    if live != [moved] {
        return Err(format!("expected only RAS/1 live, got {live:?}"));
    }
    Ok(())
}
