//! Live-worker registry.

use timeline_storage::{TimelineStorage, WorkerRecord, WriteBatch};
use tracing::info;

use crate::error::TimelineError;
use crate::timeline::Timeline;

impl<S: TimelineStorage> Timeline<S> {
    /// Record a live worker. Re-registering the same `(kind, id)` replaces
    /// the entry.
    pub async fn register_worker(
        &self,
        kind: &str,
        id: i64,
        lctn: &str,
        pid: i64,
    ) -> Result<WorkerRecord, TimelineError> {
        let worker = WorkerRecord {
            kind: kind.to_uppercase(),
            id,
            lctn: lctn.to_string(),
            pid,
            started_ts: self.now(),
        };
        let mut batch = WriteBatch::new();
        batch.upsert_worker(worker.clone());

        let mut snap = self.storage.begin_snapshot().await?;
        let result = self
            .storage
            .execute_batch(&mut snap, batch)
            .await
            .map_err(TimelineError::from);
        self.settle(snap, result).await?;
        info!(kind = %worker.kind, id, lctn, pid, "worker registered");
        Ok(worker)
    }

    /// Remove a worker from the registry. Returns whether it was registered.
    pub async fn deregister_worker(&self, kind: &str, id: i64) -> Result<bool, TimelineError> {
        let kind = kind.to_uppercase();
        let mut batch = WriteBatch::new();
        batch.delete_worker(kind.as_str(), id);

        let mut snap = self.storage.begin_snapshot().await?;
        let result = self
            .storage
            .execute_batch(&mut snap, batch)
            .await
            .map_err(TimelineError::from);
        let outcomes = self.settle(snap, result).await?;
        let removed = outcomes.first().is_some_and(|o| o.rows_affected == 1);
        info!(%kind, id, removed, "worker deregistered");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use timeline_storage::{InMemoryStorage, TimelineStorage};

    use crate::config::TimelineConfig;
    use crate::timeline::Timeline;

    #[tokio::test]
    async fn kinds_are_normalized_to_upper_case() {
        let tl = Timeline::new(InMemoryStorage::new(), TimelineConfig::default());
        let worker = tl.register_worker("ras", 5, "SN0", 4242).await.unwrap();
        assert_eq!(worker.kind, "RAS");
        assert_eq!(tl.storage().list_workers().await.unwrap(), vec![worker]);

        assert!(tl.deregister_worker("Ras", 5).await.unwrap());
        assert!(!tl.deregister_worker("RAS", 5).await.unwrap());
        assert!(tl.storage().list_workers().await.unwrap().is_empty());
    }
}
