//! Persistence contract used by the ping cycle.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::models::{MonitoredTarget, Status};
use super::store::{DbError, Store};

/// What the ping cycle needs from durable storage.
///
/// `commit_probe_outcome` must update the target's status pair and append a
/// history entry as one atomic unit, failing without side effects when the
/// target no longer exists.
#[async_trait]
pub trait StatusGateway: Send + Sync {
    async fn list_all_targets(&self) -> Result<Vec<MonitoredTarget>, DbError>;

    async fn commit_probe_outcome(
        &self,
        target_id: i64,
        status: Status,
        latency_millis: Option<i64>,
        observed_at: DateTime<Utc>,
    ) -> Result<(), DbError>;

    async fn record_cycle(
        &self,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        targets_processed: usize,
        targets_failed: usize,
    ) -> Result<(), DbError>;

    async fn last_cycle_finished_at(&self) -> Result<Option<DateTime<Utc>>, DbError>;
}

/// Run blocking store work off the async runtime.
pub async fn run_blocking<T, F>(f: F) -> Result<T, DbError>
where
    F: FnOnce() -> Result<T, DbError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| DbError::Task(e.to_string()))?
}

#[async_trait]
impl StatusGateway for Store {
    async fn list_all_targets(&self) -> Result<Vec<MonitoredTarget>, DbError> {
        let store = self.clone();
        run_blocking(move || store.get_targets()).await
    }

    async fn commit_probe_outcome(
        &self,
        target_id: i64,
        status: Status,
        latency_millis: Option<i64>,
        observed_at: DateTime<Utc>,
    ) -> Result<(), DbError> {
        let store = self.clone();
        run_blocking(move || {
            store
                .commit_probe_outcome(target_id, status, latency_millis, observed_at)
                .map(|_| ())
        })
        .await
    }

    async fn record_cycle(
        &self,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        targets_processed: usize,
        targets_failed: usize,
    ) -> Result<(), DbError> {
        let store = self.clone();
        run_blocking(move || {
            store
                .record_cycle(started_at, finished_at, targets_processed, targets_failed)
                .map(|_| ())
        })
        .await
    }

    async fn last_cycle_finished_at(&self) -> Result<Option<DateTime<Utc>>, DbError> {
        let store = self.clone();
        run_blocking(move || Ok(store.last_cycle()?.map(|c| c.finished_at))).await
    }
}
