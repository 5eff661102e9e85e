//! End-to-end behaviour of a timeline on the in-memory backend.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde_json::json;
use timeline_core::{
    ChangeOutcome, ChangeRequest, CreateRequest, EnqueueRequest, ManualClock, OutOfOrder,
    Requester, Timeline, TimelineConfig,
};
use timeline_storage::{
    EntityKey, EntityKind, Fields, InMemoryStorage, Micros, TimelineStorage, WorkItemState,
};

fn timeline() -> Timeline<InMemoryStorage> {
    Timeline::with_clock(
        InMemoryStorage::new(),
        TimelineConfig::default(),
        Arc::new(ManualClock::new(1_700_000_000_000_000)),
    )
}

async fn create_node(tl: &Timeline<InMemoryStorage>, id: &str, ts: Micros) -> EntityKey {
    let key = EntityKey::new(EntityKind::ComputeNode, id);
    tl.create_entity(CreateRequest {
        key: key.clone(),
        parent_id: None,
        state: "A".to_string(),
        fields: Fields::from([("environment".to_string(), json!("prod"))]),
        ts: Some(ts),
        requester: Requester::new("PROVISIONER"),
    })
    .await
    .unwrap();
    key
}

fn change(key: &EntityKey, state: &str, ts: Micros) -> ChangeRequest {
    ChangeRequest {
        key: key.clone(),
        state: Some(state.to_string()),
        fields: Fields::new(),
        ts: Some(ts),
        requester: Requester::new("RAS"),
    }
}

fn enqueue(kind: &str, notify: bool) -> EnqueueRequest {
    EnqueueRequest {
        queue: "default".to_string(),
        worker_kind: kind.to_string(),
        work_to_be_done: "Inventory".to_string(),
        parameters: String::new(),
        notify_when_finished: notify,
        requester: Requester::new("CONTROL"),
    }
}

#[tokio::test]
async fn slack_tolerance_keeps_active_timestamp() {
    let tl = timeline();
    let key = create_node(&tl, "R0-CH0-CN0", 10_000_000).await;

    let outcome = tl.apply_change(change(&key, "M", 9_000_000)).await.unwrap();
    assert_eq!(outcome, ChangeOutcome::AppliedWithinSlack);
    assert_eq!(outcome.code(), 2);

    let active = tl.storage().get_active(&key).await.unwrap().unwrap();
    assert_eq!(active.change_ts, 10_000_000);
    let stamps: Vec<_> = tl
        .storage()
        .list_history(&key)
        .await
        .unwrap()
        .iter()
        .map(|r| r.change_ts)
        .collect();
    assert_eq!(stamps, [9_000_000, 10_000_000]);
}

#[tokio::test]
async fn rejection_without_baseline_writes_nothing() {
    let tl = timeline();
    let key = create_node(&tl, "R0-CH0-CN1", 10_000_000).await;

    let outcome = tl.apply_change(change(&key, "M", 2_000_000)).await.unwrap();
    assert_eq!(
        outcome,
        ChangeOutcome::RejectedOutOfOrder(OutOfOrder::NoHistoricalBaseline)
    );
    assert_eq!(outcome.code(), 1);
    assert_eq!(tl.storage().list_history(&key).await.unwrap().len(), 1);
    assert_eq!(
        tl.storage().get_active(&key).await.unwrap().unwrap().state,
        "A"
    );
}

#[tokio::test]
async fn stale_change_with_baseline_lands_in_history_only() {
    let tl = timeline();
    let key = create_node(&tl, "R0-CH0-CN2", 1_000_000).await;
    tl.apply_change(change(&key, "M", 10_000_000)).await.unwrap();

    let outcome = tl.apply_change(change(&key, "E", 5_000_000)).await.unwrap();
    assert_eq!(outcome, ChangeOutcome::RejectedOutOfOrder(OutOfOrder::HistoryOnly));

    let active = tl.storage().get_active(&key).await.unwrap().unwrap();
    assert_eq!((active.state.as_str(), active.change_ts), ("M", 10_000_000));
    let history = tl.storage().list_history(&key).await.unwrap();
    assert_eq!(history.len(), 3);
    assert_eq!(history[1].state, "E");
    assert_eq!(history[1].fields["environment"], json!("prod"));
}

#[tokio::test]
async fn resubmitted_change_gets_the_next_microsecond() {
    let tl = timeline();
    let key = create_node(&tl, "R0-CH0-CN3", 1_000).await;

    let first = tl.apply_change(change(&key, "M", 2_000)).await.unwrap();
    let second = tl.apply_change(change(&key, "M", 2_000)).await.unwrap();
    assert_eq!(first, ChangeOutcome::Applied);
    assert_eq!(second, ChangeOutcome::Applied);

    let stamps: Vec<_> = tl
        .storage()
        .list_history(&key)
        .await
        .unwrap()
        .iter()
        .map(|r| r.change_ts)
        .collect();
    assert_eq!(stamps, [1_000, 2_000, 2_001]);
}

#[tokio::test]
async fn zombie_sweep_requeues_only_orphaned_work() {
    let tl = timeline();
    tl.register_worker("RAS", 5, "SN0", 100).await.unwrap();
    tl.register_worker("RAS", 9, "SN1", 200).await.unwrap();

    let seven = tl.enqueue_work_item(enqueue("RAS", false)).await.unwrap();
    let eight = tl.enqueue_work_item(enqueue("RAS", false)).await.unwrap();
    assert_eq!(tl.start_work("RAS", 5, None).await.unwrap().unwrap().id, seven);
    assert_eq!(tl.start_work("RAS", 9, None).await.unwrap().unwrap().id, eight);
    assert!(tl.deregister_worker("RAS", 9).await.unwrap());

    let before = tl.storage().get_work_item(seven).await.unwrap();
    let reclaimed = tl.sweep_zombies("RAS").await.unwrap();
    assert_eq!(reclaimed.len(), 1);
    assert_eq!(reclaimed[0].id, eight);
    assert_eq!(reclaimed[0].previous_owner, Some(9));

    let eight_row = tl.storage().get_work_item(eight).await.unwrap().unwrap();
    assert_eq!(eight_row.state, WorkItemState::Requeued);
    assert_eq!(eight_row.working_adapter_id, None);
    let last = tl
        .storage()
        .list_work_item_history(eight)
        .await
        .unwrap()
        .pop()
        .unwrap();
    assert_eq!(last.item.state, WorkItemState::Requeued);

    assert_eq!(tl.storage().get_work_item(seven).await.unwrap(), before);
}

#[tokio::test]
async fn notify_false_finish_collapses_to_done() {
    let tl = timeline();
    let id = tl.enqueue_work_item(enqueue("RAS", false)).await.unwrap();
    tl.start_work("RAS", 1, None).await.unwrap();

    let done = tl.finish(id, "42 nodes", true).await.unwrap();
    assert_eq!(done.state, WorkItemState::Done);
    assert!(tl.storage().get_work_item(id).await.unwrap().is_none());

    let history = tl.storage().list_work_item_history(id).await.unwrap();
    let done_rows = history
        .iter()
        .filter(|h| h.item.state == WorkItemState::Done)
        .count();
    assert_eq!(done_rows, 1);
    assert!(history
        .iter()
        .all(|h| h.item.state != WorkItemState::Finished));
    assert_eq!(history.last().unwrap().item.results.as_deref(), Some("42 nodes"));
}

#[tokio::test]
async fn concurrent_changes_to_one_entity_all_land() {
    let tl = Arc::new(timeline());
    let key = create_node(&tl, "R1-CN0", 1_000).await;

    let mut handles = Vec::new();
    for i in 0..20 {
        let tl = tl.clone();
        let key = key.clone();
        handles.push(tokio::spawn(async move {
            tl.apply_change(change(&key, "A", 5_000 + (i % 4))).await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let history = tl.storage().list_history(&key).await.unwrap();
    assert_eq!(history.len(), 21);
    let unique: BTreeSet<_> = history.iter().map(|r| r.change_ts).collect();
    assert_eq!(unique.len(), history.len());
}

#[tokio::test]
async fn unchanged_component_change_still_moves_active_forward() {
    let tl = timeline();
    let key = EntityKey::new(EntityKind::Component, "R0-CH0-CN0-P0");
    tl.create_entity(CreateRequest {
        key: key.clone(),
        parent_id: Some("R0-CH0-CN0".to_string()),
        state: "A".to_string(),
        fields: Fields::new(),
        ts: Some(1_000),
        requester: Requester::new("INVENTORY"),
    })
    .await
    .unwrap();

    let outcome = tl.apply_change(change(&key, "A", 5_000_000)).await.unwrap();
    assert_eq!(outcome.code(), 0);

    let active = tl.storage().get_active(&key).await.unwrap().unwrap();
    assert_eq!(active.change_ts, 5_000_000);
    assert_eq!(tl.storage().list_history(&key).await.unwrap().len(), 2);
}
