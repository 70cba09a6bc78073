//! Built-in timer trigger for ping cycles.

use super::PingOrchestrator;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Upper bound on the random delay before a timer-driven cycle.
const MAX_JITTER_MS: u64 = 1000;

/// Periodically runs ping cycles in the background.
pub struct CycleTimer {
    orchestrator: Arc<PingOrchestrator>,
    interval: Duration,
    stop: Arc<Mutex<Option<tokio::sync::broadcast::Sender<()>>>>,
}

impl CycleTimer {
    pub fn new(orchestrator: Arc<PingOrchestrator>, interval: Duration) -> Self {
        Self {
            orchestrator,
            interval,
            stop: Arc::new(Mutex::new(None)),
        }
    }

    /// Start the timer background task.
    pub async fn start(&self) {
        let (tx, mut rx) = tokio::sync::broadcast::channel(1);
        {
            let mut stop_guard = self.stop.lock().await;
            *stop_guard = Some(tx);
        }

        let orchestrator = self.orchestrator.clone();
        let period = self.interval;
        let max_jitter = jitter_bound(period);

        tracing::info!("CycleTimer: running a ping cycle every {:?}", period);

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            // When this timer's own last cycle finished
            let mut own_last: Option<DateTime<Utc>> = None;

            loop {
                tokio::select! {
                    _ = rx.recv() => break,
                    _ = interval.tick() => {
                        // Add jitter to avoid lockstep with other schedulers
                        let jitter = rand::random::<u64>() % max_jitter;
                        tokio::select! {
                            _ = rx.recv() => break,
                            _ = tokio::time::sleep(Duration::from_millis(jitter)) => {}
                        }
                        run_if_due(&orchestrator, period, &mut own_last).await;
                    }
                }
            }

            tracing::info!("CycleTimer: stopped");
        });
    }

    /// Stop the timer.
    pub async fn stop(&self) {
        let stop = self.stop.lock().await;
        if let Some(tx) = stop.as_ref() {
            let _ = tx.send(());
        }
    }
}

/// Jitter stays under a tenth of the period, capped at `MAX_JITTER_MS`.
fn jitter_bound(period: Duration) -> u64 {
    let tenth = u64::try_from(period.as_millis() / 10).unwrap_or(u64::MAX);
    tenth.clamp(1, MAX_JITTER_MS)
}

async fn run_if_due(orchestrator: &PingOrchestrator, period: Duration, own_last: &mut Option<DateTime<Utc>>) {
    let last = match orchestrator.gateway().last_cycle_finished_at().await {
        Ok(last) => last,
        Err(e) => {
            tracing::warn!("CycleTimer: could not read last cycle time: {}", e);
            None
        }
    };

    if completed_elsewhere(last, *own_last, Utc::now(), period) {
        tracing::debug!("CycleTimer: skipping tick, another trigger ran a cycle recently");
        return;
    }

    if let Err(e) = orchestrator.run_ping_cycle().await {
        tracing::error!("CycleTimer: ping cycle failed: {}", e);
    }
    // The ledger entry of this cycle was written before now
    *own_last = Some(Utc::now());
}

/// True when the ledger's latest cycle is not this timer's own and finished
/// less than half a period before `now`.
pub fn completed_elsewhere(
    ledger_last: Option<DateTime<Utc>>,
    own_last: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    period: Duration,
) -> bool {
    let Some(last) = ledger_last else {
        return false;
    };
    if own_last.is_some_and(|own| last <= own) {
        return false;
    }
    ChronoDuration::from_std(period / 2)
        .map(|half| now - last < half)
        .unwrap_or(true)
}
