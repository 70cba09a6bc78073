//! Scheduler module: the ping cycle and the timer that drives it.

mod timer;

pub use timer::*;

use crate::config::CycleConfig;
use crate::db::{DbError, MonitoredTarget, StatusGateway};
use crate::probe::{classify, ProbeError, ProbeOutcome, Prober};

use chrono::Utc;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// Summary of one ping cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleReport {
    pub targets_processed: usize,
    /// Probe failures, commit failures and checks cut off by the cycle budget.
    pub targets_failed: usize,
}

/// A failure that aborts the whole cycle.
#[derive(Error, Debug)]
pub enum CycleError {
    #[error("failed to load targets: {0}")]
    ListTargets(#[source] DbError),
}

/// How a single target's check ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CheckResult {
    /// Probe got a response and the result was committed.
    Committed,
    /// Probe failed; a `down` result was still committed.
    ProbeFailed,
    /// Nothing was written for this target.
    CommitFailed,
}

/// Runs ping cycles: probe every target concurrently, commit each result on
/// its own.
pub struct PingOrchestrator {
    gateway: Arc<dyn StatusGateway>,
    prober: Arc<dyn Prober>,
    config: CycleConfig,
}

impl PingOrchestrator {
    pub fn new(gateway: Arc<dyn StatusGateway>, prober: Arc<dyn Prober>, config: CycleConfig) -> Self {
        Self {
            gateway,
            prober,
            config,
        }
    }

    pub fn gateway(&self) -> &Arc<dyn StatusGateway> {
        &self.gateway
    }

    /// Run one cycle over every monitored target.
    ///
    /// Only failing to load the target set is an error. Per-target failures
    /// are counted in the report and logged. When the cycle budget runs out,
    /// unfinished checks are cancelled and counted as failed; anything
    /// already committed stays committed.
    pub async fn run_ping_cycle(&self) -> Result<CycleReport, CycleError> {
        let started_at = Utc::now();
        let deadline = tokio::time::Instant::now() + self.config.cycle_budget;

        tracing::info!("Starting ping cycle at {}", started_at.to_rfc3339());

        let targets = self
            .gateway
            .list_all_targets()
            .await
            .map_err(CycleError::ListTargets)?;

        if targets.is_empty() {
            tracing::info!("No targets to ping");
            self.record(started_at, CycleReport::default()).await;
            return Ok(CycleReport::default());
        }

        let mut report = CycleReport {
            targets_processed: targets.len(),
            ..Default::default()
        };

        // Ids of targets whose check has not reported back yet
        let mut pending: HashSet<i64> = targets.iter().map(|t| t.id).collect();

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_probes.max(1)));
        let mut tasks = JoinSet::new();

        for target in targets {
            let gateway = self.gateway.clone();
            let prober = self.prober.clone();
            let semaphore = semaphore.clone();
            let config = self.config;

            tasks.spawn(async move {
                let result = match semaphore.acquire_owned().await {
                    Ok(_permit) => check_target(&*prober, &*gateway, &target, config).await,
                    Err(_) => CheckResult::CommitFailed,
                };
                (target.id, result)
            });
        }

        let mut budget_exceeded = false;
        loop {
            let joined = if budget_exceeded {
                tasks.join_next().await
            } else {
                match tokio::time::timeout_at(deadline, tasks.join_next()).await {
                    Ok(joined) => joined,
                    Err(_) => {
                        tracing::warn!(
                            "Ping cycle exceeded its {:?} budget, cancelling {} unfinished checks",
                            self.config.cycle_budget,
                            pending.len()
                        );
                        budget_exceeded = true;
                        tasks.abort_all();
                        continue;
                    }
                }
            };

            match joined {
                Some(Ok((target_id, result))) => {
                    pending.remove(&target_id);
                    match result {
                        CheckResult::Committed => {}
                        CheckResult::ProbeFailed | CheckResult::CommitFailed => report.targets_failed += 1,
                    }
                }
                Some(Err(e)) if e.is_cancelled() => {}
                Some(Err(e)) => tracing::error!("Ping task failed: {}", e),
                None => break,
            }
        }

        // Cancelled or panicked checks never reported back
        for target_id in &pending {
            tracing::error!(target_id, "Check did not complete in this cycle");
        }
        report.targets_failed += pending.len();

        tracing::info!(
            targets_processed = report.targets_processed,
            targets_failed = report.targets_failed,
            "Ping cycle completed"
        );

        self.record(started_at, report).await;
        Ok(report)
    }

    async fn record(&self, started_at: chrono::DateTime<Utc>, report: CycleReport) {
        if let Err(e) = self
            .gateway
            .record_cycle(started_at, Utc::now(), report.targets_processed, report.targets_failed)
            .await
        {
            tracing::warn!("Failed to record ping cycle: {}", e);
        }
    }
}

/// Probe one target and commit the classified result.
async fn check_target(
    prober: &dyn Prober,
    gateway: &dyn StatusGateway,
    target: &MonitoredTarget,
    config: CycleConfig,
) -> CheckResult {
    let outcome = match tokio::time::timeout(config.probe_timeout, prober.probe(&target.url)).await {
        Ok(outcome) => outcome,
        Err(_) => ProbeError::Timeout(config.probe_timeout).into(),
    };

    let probe_failed = match &outcome {
        ProbeOutcome::Failed { reason } => {
            tracing::warn!(target_id = target.id, url = %target.url, reason = %reason, "Ping failed");
            true
        }
        ProbeOutcome::Responded { status_code, elapsed_millis } => {
            tracing::debug!(target_id = target.id, url = %target.url, status_code, elapsed_millis, "Ping responded");
            false
        }
    };

    let classification = classify(&outcome);
    let observed_at = Utc::now();

    match gateway
        .commit_probe_outcome(target.id, classification.status, classification.latency_millis, observed_at)
        .await
    {
        Ok(()) if probe_failed => CheckResult::ProbeFailed,
        Ok(()) => CheckResult::Committed,
        Err(e) => {
            tracing::error!(target_id = target.id, url = %target.url, error = %e, "Failed to commit ping result");
            CheckResult::CommitFailed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Status, Store};
    use async_trait::async_trait;
    use chrono::DateTime;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::NamedTempFile;

    #[derive(Clone)]
    enum Script {
        Respond(u16, u64),
        Fail(&'static str),
        Hang,
        Panic,
        /// Delete the target from the store, then respond.
        DeleteThenRespond(Store, i64),
        /// Sleep, then respond 200.
        Slow(Duration),
    }

    #[derive(Default)]
    struct ScriptedProber {
        script: HashMap<String, Script>,
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl ScriptedProber {
        fn with(mut self, url: &str, script: Script) -> Self {
            self.script.insert(url.to_string(), script);
            self
        }
    }

    #[async_trait]
    impl Prober for ScriptedProber {
        async fn probe(&self, url: &str) -> ProbeOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);

            let outcome = match self.script.get(url).cloned() {
                Some(Script::Respond(status_code, elapsed_millis)) => ProbeOutcome::Responded {
                    status_code,
                    elapsed_millis,
                },
                Some(Script::Fail(reason)) => ProbeOutcome::Failed {
                    reason: reason.to_string(),
                },
                Some(Script::Hang) => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    unreachable!()
                }
                Some(Script::Panic) => panic!("prober blew up on {}", url),
                Some(Script::DeleteThenRespond(store, id)) => {
                    store.delete_target(id).unwrap();
                    ProbeOutcome::Responded {
                        status_code: 200,
                        elapsed_millis: 5,
                    }
                }
                Some(Script::Slow(delay)) => {
                    tokio::time::sleep(delay).await;
                    ProbeOutcome::Responded {
                        status_code: 200,
                        elapsed_millis: delay.as_millis() as u64,
                    }
                }
                None => ProbeOutcome::Failed {
                    reason: "unscripted".to_string(),
                },
            };

            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            outcome
        }
    }

    /// Wraps a store and fails commits for chosen targets, or every listing.
    struct FlakyGateway {
        inner: Store,
        fail_commits: HashSet<i64>,
        fail_list: bool,
        commits: Mutex<Vec<i64>>,
    }

    impl FlakyGateway {
        fn new(inner: Store) -> Self {
            Self {
                inner,
                fail_commits: HashSet::new(),
                fail_list: false,
                commits: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl StatusGateway for FlakyGateway {
        async fn list_all_targets(&self) -> Result<Vec<MonitoredTarget>, DbError> {
            if self.fail_list {
                return Err(DbError::Unavailable("database offline".to_string()));
            }
            self.inner.list_all_targets().await
        }

        async fn commit_probe_outcome(
            &self,
            target_id: i64,
            status: Status,
            latency_millis: Option<i64>,
            observed_at: DateTime<Utc>,
        ) -> Result<(), DbError> {
            if self.fail_commits.contains(&target_id) {
                return Err(DbError::Unavailable("write failed".to_string()));
            }
            self.commits.lock().unwrap().push(target_id);
            StatusGateway::commit_probe_outcome(&self.inner, target_id, status, latency_millis, observed_at).await
        }

        async fn record_cycle(
            &self,
            started_at: DateTime<Utc>,
            finished_at: DateTime<Utc>,
            targets_processed: usize,
            targets_failed: usize,
        ) -> Result<(), DbError> {
            StatusGateway::record_cycle(&self.inner, started_at, finished_at, targets_processed, targets_failed).await
        }

        async fn last_cycle_finished_at(&self) -> Result<Option<DateTime<Utc>>, DbError> {
            self.inner.last_cycle_finished_at().await
        }
    }

    fn temp_store() -> (NamedTempFile, Store) {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();
        (tmp, store)
    }

    fn fast_config() -> CycleConfig {
        CycleConfig {
            probe_timeout: Duration::from_millis(200),
            cycle_budget: Duration::from_secs(10),
            max_concurrent_probes: 16,
        }
    }

    fn orchestrator(gateway: Arc<dyn StatusGateway>, prober: Arc<ScriptedProber>, config: CycleConfig) -> PingOrchestrator {
        PingOrchestrator::new(gateway, prober, config)
    }

    fn history_len(store: &Store, id: i64) -> usize {
        store.get_history(id, 1000).unwrap().len()
    }

    #[tokio::test]
    async fn test_empty_target_set() {
        let (_tmp, store) = temp_store();
        let prober = Arc::new(ScriptedProber::default());
        let orch = orchestrator(Arc::new(store.clone()), prober.clone(), fast_config());

        let report = orch.run_ping_cycle().await.unwrap();
        assert_eq!(report.targets_processed, 0);
        assert_eq!(report.targets_failed, 0);
        assert_eq!(prober.calls.load(Ordering::SeqCst), 0);
        assert!(store.last_cycle().unwrap().is_some());
    }

    #[tokio::test]
    async fn test_good_and_timed_out_targets() {
        let (_tmp, store) = temp_store();
        let good = store.register_target("alice", "https://good.example", 20).unwrap();
        let bad = store.register_target("alice", "https://bad.example", 20).unwrap();

        let prober = Arc::new(
            ScriptedProber::default()
                .with(&good.url, Script::Respond(200, 50))
                .with(&bad.url, Script::Hang),
        );
        let orch = orchestrator(Arc::new(store.clone()), prober, fast_config());

        let report = orch.run_ping_cycle().await.unwrap();
        assert_eq!(report.targets_processed, 2);
        assert_eq!(report.targets_failed, 1);

        let good_now = store.get_target(good.id).unwrap();
        assert_eq!(good_now.current_status, Status::Up);
        assert!(good_now.last_checked_at.is_some());
        let good_history = store.get_history(good.id, 10).unwrap();
        assert_eq!(good_history.len(), 1);
        assert_eq!(good_history[0].latency_millis, Some(50));

        let bad_now = store.get_target(bad.id).unwrap();
        assert_eq!(bad_now.current_status, Status::Down);
        let bad_history = store.get_history(bad.id, 10).unwrap();
        assert_eq!(bad_history.len(), 1);
        assert_eq!(bad_history[0].status, Status::Down);
        assert_eq!(bad_history[0].latency_millis, None);

        let cycle = store.last_cycle().unwrap().unwrap();
        assert_eq!((cycle.targets_processed, cycle.targets_failed), (2, 1));
    }

    #[tokio::test]
    async fn test_probe_failures_commit_down_and_count_as_failed() {
        let (_tmp, store) = temp_store();
        let mut prober = ScriptedProber::default();
        let mut ids = Vec::new();
        for i in 0..6 {
            let t = store
                .register_target("alice", &format!("https://site{}.example", i), 20)
                .unwrap();
            let script = match i {
                0 => Script::Fail("connection refused"),
                1 => Script::Hang,
                2 => Script::Respond(503, 12),
                _ => Script::Respond(204, 8),
            };
            prober = prober.with(&t.url, script);
            ids.push(t.id);
        }
        let orch = orchestrator(Arc::new(store.clone()), Arc::new(prober), fast_config());

        let report = orch.run_ping_cycle().await.unwrap();
        assert_eq!(report.targets_processed, 6);
        // A 503 is a response, not a probe failure.
        assert_eq!(report.targets_failed, 2);

        for (i, id) in ids.iter().enumerate() {
            assert_eq!(history_len(&store, *id), 1, "target {}", i);
            let expected = if i < 3 { Status::Down } else { Status::Up };
            assert_eq!(store.get_target(*id).unwrap().current_status, expected, "target {}", i);
        }
    }

    #[tokio::test]
    async fn test_commit_failure_is_isolated() {
        let (_tmp, store) = temp_store();
        let a = store.register_target("alice", "https://a.example", 20).unwrap();
        let b = store.register_target("alice", "https://b.example", 20).unwrap();
        let c = store.register_target("bob", "https://c.example", 20).unwrap();

        let mut gateway = FlakyGateway::new(store.clone());
        gateway.fail_commits.insert(b.id);
        let gateway = Arc::new(gateway);

        let prober = Arc::new(
            ScriptedProber::default()
                .with(&a.url, Script::Respond(200, 10))
                .with(&b.url, Script::Respond(200, 10))
                .with(&c.url, Script::Fail("dns failure")),
        );
        let orch = orchestrator(gateway.clone(), prober, fast_config());

        let report = orch.run_ping_cycle().await.unwrap();
        assert_eq!(report.targets_processed, 3);
        assert_eq!(report.targets_failed, 2);
        let cycle = store.last_cycle().unwrap().unwrap();
        assert_eq!((cycle.targets_processed, cycle.targets_failed), (3, 2));

        assert_eq!(store.get_target(a.id).unwrap().current_status, Status::Up);
        let b_now = store.get_target(b.id).unwrap();
        assert_eq!(b_now.current_status, Status::Pending);
        assert_eq!(b_now.last_checked_at, None);
        assert_eq!(history_len(&store, b.id), 0);
        assert_eq!(store.get_target(c.id).unwrap().current_status, Status::Down);
        assert_eq!(history_len(&store, c.id), 1);

        let mut committed = gateway.commits.lock().unwrap().clone();
        committed.sort();
        assert_eq!(committed, vec![a.id, c.id]);
    }

    #[tokio::test]
    async fn test_listing_failure_is_fatal() {
        let (_tmp, store) = temp_store();
        store.register_target("alice", "https://a.example", 20).unwrap();

        let mut gateway = FlakyGateway::new(store.clone());
        gateway.fail_list = true;
        let prober = Arc::new(ScriptedProber::default());
        let orch = orchestrator(Arc::new(gateway), prober.clone(), fast_config());

        let err = orch.run_ping_cycle().await.unwrap_err();
        assert!(matches!(err, CycleError::ListTargets(DbError::Unavailable(_))));
        assert_eq!(prober.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_target_deleted_mid_cycle() {
        let (_tmp, store) = temp_store();
        let doomed = store.register_target("alice", "https://doomed.example", 20).unwrap();
        let other = store.register_target("alice", "https://other.example", 20).unwrap();

        let prober = Arc::new(
            ScriptedProber::default()
                .with(&doomed.url, Script::DeleteThenRespond(store.clone(), doomed.id))
                .with(&other.url, Script::Respond(200, 30)),
        );
        let orch = orchestrator(Arc::new(store.clone()), prober, fast_config());

        let report = orch.run_ping_cycle().await.unwrap();
        assert_eq!(report.targets_processed, 2);
        assert_eq!(report.targets_failed, 1);

        assert!(matches!(store.get_target(doomed.id), Err(DbError::NotFound)));
        assert_eq!(history_len(&store, doomed.id), 0);
        assert_eq!(store.get_target(other.id).unwrap().current_status, Status::Up);
        assert_eq!(history_len(&store, other.id), 1);
    }

    #[tokio::test]
    async fn test_panicking_probe_does_not_abort_cycle() {
        let (_tmp, store) = temp_store();
        let boom = store.register_target("alice", "https://boom.example", 20).unwrap();
        let fine = store.register_target("alice", "https://fine.example", 20).unwrap();

        let prober = Arc::new(
            ScriptedProber::default()
                .with(&boom.url, Script::Panic)
                .with(&fine.url, Script::Respond(301, 3)),
        );
        let orch = orchestrator(Arc::new(store.clone()), prober, fast_config());

        let report = orch.run_ping_cycle().await.unwrap();
        assert_eq!(report.targets_processed, 2);
        assert_eq!(report.targets_failed, 1);
        assert_eq!(store.get_target(boom.id).unwrap().current_status, Status::Pending);
        assert_eq!(store.get_target(fine.id).unwrap().current_status, Status::Up);
    }

    #[tokio::test]
    async fn test_cycle_budget_cancels_unfinished_checks() {
        let (_tmp, store) = temp_store();
        let quick = store.register_target("alice", "https://quick.example", 20).unwrap();
        let stuck = store.register_target("alice", "https://stuck.example", 20).unwrap();

        let prober = Arc::new(
            ScriptedProber::default()
                .with(&quick.url, Script::Respond(200, 1))
                .with(&stuck.url, Script::Hang),
        );
        let config = CycleConfig {
            probe_timeout: Duration::from_secs(30),
            cycle_budget: Duration::from_millis(300),
            max_concurrent_probes: 4,
        };
        let orch = orchestrator(Arc::new(store.clone()), prober, config);

        let started = std::time::Instant::now();
        let report = orch.run_ping_cycle().await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));

        assert_eq!(report.targets_processed, 2);
        assert_eq!(report.targets_failed, 1);
        assert_eq!(store.get_target(quick.id).unwrap().current_status, Status::Up);
        let stuck_now = store.get_target(stuck.id).unwrap();
        assert_eq!(stuck_now.current_status, Status::Pending);
        assert_eq!(history_len(&store, stuck.id), 0);
    }

    #[tokio::test]
    async fn test_fan_out_respects_concurrency_bound() {
        let (_tmp, store) = temp_store();
        let mut prober = ScriptedProber::default();
        for i in 0..10 {
            let t = store
                .register_target("alice", &format!("https://n{}.example", i), 20)
                .unwrap();
            prober = prober.with(&t.url, Script::Slow(Duration::from_millis(40)));
        }
        let prober = Arc::new(prober);
        let config = CycleConfig {
            max_concurrent_probes: 3,
            ..fast_config()
        };
        let orch = orchestrator(Arc::new(store.clone()), prober.clone(), config);

        let report = orch.run_ping_cycle().await.unwrap();
        assert_eq!(report.targets_processed, 10);
        assert_eq!(report.targets_failed, 0);
        assert_eq!(prober.calls.load(Ordering::SeqCst), 10);
        let max = prober.max_in_flight.load(Ordering::SeqCst);
        assert!(max <= 3, "max in flight was {}", max);
        assert!(max > 1, "probes never overlapped");
    }

    #[tokio::test]
    async fn test_repeated_cycles_append_one_entry_each() {
        let (_tmp, store) = temp_store();
        let a = store.register_target("alice", "https://a.example", 20).unwrap();
        let b = store.register_target("bob", "https://b.example", 20).unwrap();
        let prober = Arc::new(
            ScriptedProber::default()
                .with(&a.url, Script::Respond(200, 5))
                .with(&b.url, Script::Respond(200, 6)),
        );
        let orch = orchestrator(Arc::new(store.clone()), prober, fast_config());

        orch.run_ping_cycle().await.unwrap();
        let first = store.get_target(a.id).unwrap().last_checked_at.unwrap();
        assert_eq!(history_len(&store, a.id), 1);

        orch.run_ping_cycle().await.unwrap();
        let a_now = store.get_target(a.id).unwrap();
        assert_eq!(a_now.current_status, Status::Up);
        assert!(a_now.last_checked_at.unwrap() > first);
        assert_eq!(history_len(&store, a.id), 2);
        assert_eq!(history_len(&store, b.id), 2);
    }

    #[test]
    fn test_report_serializes_camel_case() {
        let report = CycleReport {
            targets_processed: 4,
            targets_failed: 1,
        };
        let json = serde_json::to_value(report).unwrap();
        assert_eq!(json, serde_json::json!({"targetsProcessed": 4, "targetsFailed": 1}));
    }
}
