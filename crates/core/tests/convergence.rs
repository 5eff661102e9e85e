//! Arrival-order independence of reconciliation.

use std::collections::BTreeSet;
use std::sync::Arc;

use proptest::prelude::*;
use timeline_core::{
    ChangeRequest, CreateRequest, ManualClock, Requester, Timeline, TimelineConfig,
};
use timeline_storage::{EntityKey, EntityKind, Fields, InMemoryStorage, Micros, TimelineStorage};

const CREATED_AT: Micros = 1_000;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

/// Distinct change timestamps on a millisecond grid, in arbitrary order.
fn arrivals() -> impl Strategy<Value = Vec<Micros>> {
    prop::collection::btree_set(2u32..5_000, 1..40)
        .prop_map(|set| set.into_iter().map(|ms| Micros::from(ms) * 1_000).collect::<Vec<_>>())
        .prop_shuffle()
}

/// Apply `arrivals` to a fresh job; return (codes, active ts, history stamps).
async fn replay(arrivals: &[Micros], slack_window_us: Micros) -> (Vec<u8>, Micros, Vec<Micros>) {
    let mut config = TimelineConfig::default();
    config.reconcile.slack_window_us = slack_window_us;
    let tl = Timeline::with_clock(
        InMemoryStorage::new(),
        config,
        Arc::new(ManualClock::new(9_000_000_000)),
    );
    let key = EntityKey::new(EntityKind::Job, "job-prop");
    tl.create_entity(CreateRequest {
        key: key.clone(),
        parent_id: None,
        state: "S".to_string(),
        fields: Fields::new(),
        ts: Some(CREATED_AT),
        requester: Requester::new("WLM"),
    })
    .await
    .unwrap();

    let mut codes = Vec::new();
    for ts in arrivals {
        let outcome = tl
            .apply_change(ChangeRequest {
                key: key.clone(),
                state: Some(format!("S{ts}")),
                fields: Fields::new(),
                ts: Some(*ts),
                requester: Requester::new("WLM"),
            })
            .await
            .unwrap();
        codes.push(outcome.code());
    }
    let active = tl.storage().get_active(&key).await.unwrap().unwrap();
    let history = tl
        .storage()
        .list_history(&key)
        .await
        .unwrap()
        .iter()
        .map(|r| r.change_ts)
        .collect();
    (codes, active.change_ts, history)
}

proptest! {
    #[test]
    fn active_timestamp_is_max_applied(arrivals in arrivals(), slack in 0i64..3_000_000) {
        let (codes, active_ts, _) = runtime().block_on(replay(&arrivals, slack));
        let max_applied = arrivals
            .iter()
            .zip(&codes)
            .filter(|(_, code)| **code == 0)
            .map(|(ts, _)| *ts)
            .max()
            .unwrap_or(CREATED_AT);
        prop_assert_eq!(active_ts, max_applied);
        // The latest arrival by timestamp always wins the active row.
        prop_assert_eq!(active_ts, *arrivals.iter().max().unwrap());
    }

    #[test]
    fn history_timestamps_are_unique(arrivals in arrivals(), slack in 0i64..3_000_000) {
        let (codes, _, history) = runtime().block_on(replay(&arrivals, slack));
        let unique: BTreeSet<_> = history.iter().collect();
        prop_assert_eq!(unique.len(), history.len());
        // Creation row plus one row for every change that wrote history.
        let written = codes.iter().filter(|c| **c != 1).count();
        prop_assert!(history.len() > written);
    }

    #[test]
    fn resubmission_never_duplicates_a_row(ts in 2_000i64..10_000_000, repeats in 2usize..6) {
        let arrivals = vec![ts; repeats];
        let (codes, _, history) = runtime().block_on(replay(&arrivals, 1_500_000));
        prop_assert!(codes.iter().all(|c| *c == 0));
        let expected: Vec<_> = std::iter::once(CREATED_AT)
            .chain((0..repeats as i64).map(|i| ts + i))
            .collect();
        prop_assert_eq!(history, expected);
    }
}
