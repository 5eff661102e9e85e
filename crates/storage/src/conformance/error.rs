use std::future::Future;

use super::{commit_batch, make_node, make_work_item, TestResult};
use crate::batch::{Expect, WriteBatch};
use crate::record::{EntityKey, EntityKind, WorkItemState};
use crate::{StorageError, TimelineStorage};

pub(super) async fn run_error_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: TimelineStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let mut results = Vec::new();

    results.push(TestResult::from_result(
        "error",
        "insert_existing_active_row",
        insert_existing_active_row(factory).await,
    ));
    results.push(TestResult::from_result(
        "error",
        "insert_existing_work_item",
        insert_existing_work_item(factory).await,
    ));
    results.push(TestResult::from_result(
        "error",
        "delete_missing_work_item",
        delete_missing_work_item(factory).await,
    ));
    results.push(TestResult::from_result(
        "error",
        "reads_of_missing_rows_are_empty",
        reads_of_missing_rows_are_empty(factory).await,
    ));

    results
}

/// Run `batch` in a throwaway snapshot and return the error it produced.
async fn batch_error<S: TimelineStorage>(s: &S, batch: WriteBatch) -> Result<StorageError, String> {
    let mut snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
    let result = s.execute_batch(&mut snap, batch).await;
    let _ = s.abort_snapshot(snap).await;
    match result {
        Ok(outcomes) => Err(format!("expected an error, batch returned {outcomes:?}")),
        Err(e) => Ok(e),
    }
}

async fn insert_existing_active_row<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: TimelineStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let row = make_node("R4-CN0", "A", 10);
    let mut batch = WriteBatch::new();
    batch.insert_active(row.clone());
    commit_batch(&s, batch).await?;

    let mut batch = WriteBatch::new();
    batch.insert_active(row.clone());
    match batch_error(&s, batch).await? {
        StorageError::AlreadyExists { key } if key == row.key => Ok(()),
        other => Err(format!("expected AlreadyExists, got {other:?}")),
    }
}

async fn insert_existing_work_item<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: TimelineStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let item = make_work_item(21, "RAS", WorkItemState::Queued, 10);
    let mut batch = WriteBatch::new();
    batch.insert_work_item(item.clone()).insert_work_item(item);
    match batch_error(&s, batch).await? {
        StorageError::AlreadyExists { key } if key == EntityKey::work_item(21) => Ok(()),
        other => Err(format!("expected AlreadyExists, got {other:?}")),
    }
}

async fn delete_missing_work_item<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: TimelineStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let mut batch = WriteBatch::new();
    batch.delete_work_item(404);
    match batch_error(&s, batch).await? {
        StorageError::ExpectationViolated {
            index: 0,
            op: "delete_work_item",
            expected: Expect::ExactlyOne,
            actual: 0,
        } => Ok(()),
        other => Err(format!("expected ExpectationViolated, got {other:?}")),
    }
}

/// Missing rows read as `None` or an empty list, never as an error.
async fn reads_of_missing_rows_are_empty<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: TimelineStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let key = EntityKey::new(EntityKind::Job, "no-such-job");

    let mut snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
    let in_snapshot = async {
        let active = s
            .get_active_for_update(&mut snap, &key)
            .await
            .map_err(|e| e.to_string())?;
        let item = s
            .get_work_item_for_update(&mut snap, 404)
            .await
            .map_err(|e| e.to_string())?;
        let prior = s
            .preceding_history(&mut snap, &key, i64::MAX)
            .await
            .map_err(|e| e.to_string())?;
        if active.is_some() || item.is_some() || prior.is_some() {
            return Err("snapshot read returned a row for a missing key".to_string());
        }
        Ok(())
    }
    .await;
    let _ = s.abort_snapshot(snap).await;
    in_snapshot?;

    let history = s.list_history(&key).await.map_err(|e| e.to_string())?;
    let wi_history = s
        .list_work_item_history(404)
        .await
        .map_err(|e| e.to_string())?;
    let jobs = s
        .list_active(EntityKind::Job, None)
        .await
        .map_err(|e| e.to_string())?;
    if !history.is_empty() || !wi_history.is_empty() || !jobs.is_empty() {
        return Err("query returned rows on an empty store".to_string());
    }
    Ok(())
}
