//! Conformance test suite for `TimelineStorage` implementations.
//!
//! This module provides a backend-agnostic test suite that any
//! `TimelineStorage` implementation can run to verify correctness. The suite
//! covers:
//!
//! - **Snapshot isolation**: uncommitted writes invisible, abort discards writes
//! - **Batches**: in-order application, row-count expectations, all-or-nothing
//! - **History**: uniqueness of `(key, ts)`, preceding-row lookup, probes
//! - **Work items**: active rows, history rows, in-place history rewrite, ids
//! - **Workers**: registry upsert/delete and live listing
//! - **Error handling**: correct error variants for invalid writes
//! - **Concurrency**: snapshots on the same and on different entities
//!
//! # Usage
//!
//! Backend crates call [`run_conformance_suite`] with a factory function that
//! creates a fresh, empty storage instance for each test:
//!
//! ```ignore
//! use timeline_storage::conformance::run_conformance_suite;
//!
//! #[tokio::test]
//! async fn postgres_conformance() {
//!     let report = run_conformance_suite(|| async {
//!         create_test_postgres_storage().await
//!     }).await;
//!     assert!(report.failed == 0, "{report}");
//! }
//! ```

mod batch;
mod concurrent;
mod error;
mod history;
mod snapshot;
mod work_item;

use std::fmt;
use std::future::Future;

use crate::batch::WriteBatch;
use crate::record::{
    EntityKey, EntityKind, EntityRecord, Fields, Micros, WorkItemRecord, WorkItemState,
    WorkerRecord,
};
use crate::TimelineStorage;

/// Result of a single conformance test.
#[derive(Debug, Clone)]
pub struct TestResult {
    /// Test category (e.g. "snapshot", "batch", "history").
    pub category: String,
    /// Test name (e.g. "abort_discards_batch").
    pub name: String,
    /// Whether the test passed.
    pub passed: bool,
    /// Error message if the test failed.
    pub message: Option<String>,
}

impl TestResult {
    fn pass(category: &str, name: &str) -> Self {
        Self {
            category: category.to_string(),
            name: name.to_string(),
            passed: true,
            message: None,
        }
    }

    fn fail(category: &str, name: &str, msg: String) -> Self {
        Self {
            category: category.to_string(),
            name: name.to_string(),
            passed: false,
            message: Some(msg),
        }
    }

    fn from_result(category: &str, name: &str, result: Result<(), String>) -> Self {
        match result {
            Ok(()) => Self::pass(category, name),
            Err(msg) => Self::fail(category, name, msg),
        }
    }
}

/// Aggregated report from a full conformance suite run.
#[derive(Debug, Clone)]
pub struct ConformanceReport {
    pub results: Vec<TestResult>,
    pub passed: usize,
    pub failed: usize,
    pub total: usize,
}

impl fmt::Display for ConformanceReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Conformance: {}/{} passed ({} failed)",
            self.passed, self.total, self.failed
        )?;
        for r in &self.results {
            if !r.passed {
                writeln!(
                    f,
                    "  FAIL [{}/{}]: {}",
                    r.category,
                    r.name,
                    r.message.as_deref().unwrap_or("(no message)")
                )?;
            }
        }
        Ok(())
    }
}

/// Run the full conformance suite against a storage backend.
///
/// The `factory` function is called once per test to create a fresh, empty
/// storage instance, ensuring test isolation.
pub async fn run_conformance_suite<S, F, Fut>(factory: F) -> ConformanceReport
where
    S: TimelineStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let mut results = Vec::new();

    results.extend(snapshot::run_snapshot_tests(&factory).await);
    results.extend(batch::run_batch_tests(&factory).await);
    results.extend(history::run_history_tests(&factory).await);
    results.extend(work_item::run_work_item_tests(&factory).await);
    results.extend(error::run_error_tests(&factory).await);
    results.extend(concurrent::run_concurrent_tests(&factory).await);

    let passed = results.iter().filter(|r| r.passed).count();
    let total = results.len();

    ConformanceReport {
        results,
        passed,
        failed: total - passed,
        total,
    }
}

// ── Helpers: record constructors with sensible defaults ──────────────────────

fn make_entity(kind: EntityKind, id: &str, state: &str, ts: Micros) -> EntityRecord {
    EntityRecord {
        key: EntityKey::new(kind, id),
        parent_id: None,
        state: state.to_string(),
        change_ts: ts,
        db_updated_ts: ts,
        last_chg_adapter_type: "CONFORMANCE".to_string(),
        last_chg_work_item_id: -1,
        fields: Fields::new(),
    }
}

fn make_node(id: &str, state: &str, ts: Micros) -> EntityRecord {
    make_entity(EntityKind::ComputeNode, id, state, ts)
}

fn make_work_item(id: i64, worker_kind: &str, state: WorkItemState, ts: Micros) -> WorkItemRecord {
    WorkItemRecord {
        id,
        queue: "conformance".to_string(),
        worker_kind: worker_kind.to_string(),
        work_to_be_done: "Probe".to_string(),
        parameters: String::new(),
        notify_when_finished: false,
        state,
        requesting_work_item_id: -1,
        requesting_adapter_type: "CONFORMANCE".to_string(),
        working_adapter_id: None,
        working_results: None,
        results: None,
        start_ts: ts,
        db_updated_ts: ts,
        end_ts: None,
    }
}

fn make_worker(kind: &str, id: i64) -> WorkerRecord {
    WorkerRecord {
        kind: kind.to_string(),
        id,
        lctn: "SN0".to_string(),
        pid: 1000 + id,
        started_ts: 0,
    }
}

/// Execute `batch` in a fresh snapshot and commit it.
async fn commit_batch<S: TimelineStorage>(s: &S, batch: WriteBatch) -> Result<(), String> {
    let mut snap = s.begin_snapshot().await.map_err(|e| format!("begin: {e}"))?;
    if let Err(e) = s.execute_batch(&mut snap, batch).await {
        let _ = s.abort_snapshot(snap).await;
        return Err(format!("execute: {e}"));
    }
    s.commit_snapshot(snap)
        .await
        .map_err(|e| format!("commit: {e}"))
}
