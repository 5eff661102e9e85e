use std::future::Future;

use super::{commit_batch, make_node, TestResult};
use crate::batch::{Expect, WriteBatch, WriteOp};
use crate::record::EntityKey;
use crate::{StorageError, TimelineStorage};

pub(super) async fn run_batch_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: TimelineStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let mut results = Vec::new();

    results.push(TestResult::from_result(
        "batch",
        "writes_apply_in_order",
        writes_apply_in_order(factory).await,
    ));
    results.push(TestResult::from_result(
        "batch",
        "outcomes_report_rows_affected",
        outcomes_report_rows_affected(factory).await,
    ));
    results.push(TestResult::from_result(
        "batch",
        "violated_expectation_fails_batch",
        violated_expectation_fails_batch(factory).await,
    ));
    results.push(TestResult::from_result(
        "batch",
        "failed_batch_is_all_or_nothing",
        failed_batch_is_all_or_nothing(factory).await,
    ));
    results.push(TestResult::from_result(
        "batch",
        "empty_batch_succeeds",
        empty_batch_succeeds(factory).await,
    ));

    results
}

/// Insert, update and delete of the same key in one batch run in order.
async fn writes_apply_in_order<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: TimelineStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let first = make_node("R2-CN0", "A", 10);
    let mut second = first.clone();
    second.state = "M".to_string();
    second.change_ts = 20;

    let mut batch = WriteBatch::new();
    batch
        .insert_active(first.clone())
        .update_active(second.clone())
        .insert_history(first.clone())
        .insert_history(second.clone());
    commit_batch(&s, batch).await?;

    let active = s
        .get_active(&first.key)
        .await
        .map_err(|e| e.to_string())?
        .ok_or("active row missing")?;
    if active.state != "M" || active.change_ts != 20 {
        return Err(format!("update did not apply after insert: {active:?}"));
    }

    let mut batch = WriteBatch::new();
    batch.delete_active(first.key.clone());
    commit_batch(&s, batch).await?;
    if s.get_active(&first.key)
        .await
        .map_err(|e| e.to_string())?
        .is_some()
    {
        return Err("delete did not remove the active row".to_string());
    }
    let history = s.list_history(&first.key).await.map_err(|e| e.to_string())?;
    if history.len() != 2 {
        return Err(format!("expected 2 history rows, got {}", history.len()));
    }
    Ok(())
}

/// `execute_batch` returns one outcome per write with the affected rows.
async fn outcomes_report_rows_affected<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: TimelineStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let row = make_node("R2-CN1", "A", 10);
    let missing = EntityKey::new(row.key.kind, "R2-CN-MISSING");

    let mut batch = WriteBatch::new();
    batch
        .insert_active(row.clone())
        .push(WriteOp::DeleteActive(missing), Expect::ZeroOrOne)
        .push(WriteOp::UpdateActive(row.clone()), Expect::Any);

    let mut snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
    let outcomes = match s.execute_batch(&mut snap, batch).await {
        Ok(o) => o,
        Err(e) => {
            let _ = s.abort_snapshot(snap).await;
            return Err(e.to_string());
        }
    };
    s.commit_snapshot(snap).await.map_err(|e| e.to_string())?;

    let rows: Vec<_> = outcomes.iter().map(|o| o.rows_affected).collect();
    if rows != [1, 0, 1] {
        return Err(format!("expected rows [1, 0, 1], got {rows:?}"));
    }
    Ok(())
}

/// An update of a missing row under `ExactlyOne` reports the failing write.
async fn violated_expectation_fails_batch<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: TimelineStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let mut batch = WriteBatch::new();
    batch
        .insert_history(make_node("R2-CN2", "A", 10))
        .update_active(make_node("R2-CN2", "A", 10));

    let mut snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
    let result = s.execute_batch(&mut snap, batch).await;
    let _ = s.abort_snapshot(snap).await;
    match result {
        Err(StorageError::ExpectationViolated {
            index: 1,
            op: "update_active",
            expected: Expect::ExactlyOne,
            actual: 0,
        }) => Ok(()),
        other => Err(format!(
            "expected ExpectationViolated at write #1, got {other:?}"
        )),
    }
}

/// Writes preceding a violation in the same batch never become visible,
/// even when the caller commits the snapshot afterwards.
async fn failed_batch_is_all_or_nothing<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: TimelineStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let row = make_node("R2-CN3", "A", 10);
    let mut batch = WriteBatch::new();
    batch
        .insert_active(row.clone())
        .insert_history(row.clone())
        .delete_active(EntityKey::new(row.key.kind, "R2-CN-MISSING"));

    let mut snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
    if s.execute_batch(&mut snap, batch).await.is_ok() {
        let _ = s.abort_snapshot(snap).await;
        return Err("batch with a missing delete target succeeded".to_string());
    }
    s.commit_snapshot(snap).await.map_err(|e| e.to_string())?;

    if s.get_active(&row.key)
        .await
        .map_err(|e| e.to_string())?
        .is_some()
    {
        return Err("insert from failed batch is visible".to_string());
    }
    let history = s.list_history(&row.key).await.map_err(|e| e.to_string())?;
    if !history.is_empty() {
        return Err("history from failed batch is visible".to_string());
    }
    Ok(())
}

async fn empty_batch_succeeds<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: TimelineStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let mut snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
    let outcomes = s
        .execute_batch(&mut snap, WriteBatch::new())
        .await
        .map_err(|e| e.to_string())?;
    s.commit_snapshot(snap).await.map_err(|e| e.to_string())?;
    if !outcomes.is_empty() {
        return Err(format!("expected no outcomes, got {outcomes:?}"));
    }
    Ok(())
}
