//! Background sweep of idle safety state and expired ledger records.

use super::remediation::{ActionRecorder, SweepReport};
use super::safety::SafetyController;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub safety_entries_purged: usize,
    pub records: SweepReport,
}

/// One sweep over both stores
pub fn sweep_once(
    safety: &SafetyController,
    recorder: &ActionRecorder,
    now: DateTime<Utc>,
    cancel: &CancellationToken,
) -> CleanupReport {
    let safety_entries_purged = safety.purge(now);
    let records = recorder.sweep(now, cancel);
    CleanupReport {
        safety_entries_purged,
        records,
    }
}

/// Sweep every `interval` until `cancel` fires
pub async fn run_cleanup_loop(
    safety: Arc<SafetyController>,
    recorder: Arc<ActionRecorder>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick completes immediately; nothing is stale at startup.
    ticker.tick().await;

    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                info!("Cleanup loop stopped");
                return;
            }
            _ = ticker.tick() => {}
        }

        let report = sweep_once(&safety, &recorder, Utc::now(), &cancel);
        if report.safety_entries_purged > 0
            || report.records.actions_evicted > 0
            || report.records.decisions_evicted > 0
        {
            info!(
                safety_entries = report.safety_entries_purged,
                actions_evicted = report.records.actions_evicted,
                decisions_evicted = report.records.decisions_evicted,
                interrupted = report.records.interrupted,
                "Cleanup sweep finished"
            );
        } else {
            debug!("Cleanup sweep found nothing to evict");
        }
    }
}
