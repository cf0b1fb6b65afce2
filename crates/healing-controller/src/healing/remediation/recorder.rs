//! Append-only audit ledgers for executions and admission decisions.
//!
//! Records are never edited after they are written; retention is the only
//! thing that removes them. Both ledgers sit behind [`RecordStore`] so a
//! persistent backend can replace the in-memory one.

use crate::crds::{ActionOutcome, ActionType, PolicyRef, TargetRef};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

/// One terminal execution outcome
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionRecord {
    pub id: Uuid,
    pub action_id: String,
    pub policy: PolicyRef,
    pub target: TargetRef,
    pub action_type: ActionType,
    pub outcome: ActionOutcome,
    pub attempts: u32,
    pub simulated: bool,
    pub detail: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

/// One admission decision
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionRecord {
    pub action_id: String,
    pub policy: PolicyRef,
    pub target: TargetRef,
    pub approved: bool,
    pub simulated: bool,
    pub reason: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

/// Anything a ledger can hold
pub trait LedgerEntry: Clone + Send + Sync + 'static {
    fn ledger_key(&self) -> &str;
    fn recorded_at(&self) -> DateTime<Utc>;
}

impl LedgerEntry for ActionRecord {
    fn ledger_key(&self) -> &str {
        &self.action_id
    }

    fn recorded_at(&self) -> DateTime<Utc> {
        self.recorded_at
    }
}

impl LedgerEntry for DecisionRecord {
    fn ledger_key(&self) -> &str {
        &self.action_id
    }

    fn recorded_at(&self) -> DateTime<Utc> {
        self.recorded_at
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Eviction {
    pub evicted: usize,
    /// Cancellation stopped the pass before every key was visited
    pub interrupted: bool,
}

pub trait RecordStore<R: LedgerEntry>: Send + Sync {
    fn append(&self, entry: R);
    fn entries(&self, key: &str) -> Vec<R>;
    fn evict_older_than(&self, cutoff: DateTime<Utc>, cancel: &CancellationToken) -> Eviction;
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// `DashMap`-backed ledger keyed by action id
pub struct InMemoryLedger<R> {
    entries: DashMap<String, Vec<R>>,
}

impl<R> Default for InMemoryLedger<R> {
    fn default() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }
}

impl<R: LedgerEntry> RecordStore<R> for InMemoryLedger<R> {
    fn append(&self, entry: R) {
        self.entries
            .entry(entry.ledger_key().to_string())
            .or_default()
            .push(entry);
    }

    fn entries(&self, key: &str) -> Vec<R> {
        self.entries
            .get(key)
            .map(|bucket| bucket.clone())
            .unwrap_or_default()
    }

    fn evict_older_than(&self, cutoff: DateTime<Utc>, cancel: &CancellationToken) -> Eviction {
        let keys: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        let mut report = Eviction::default();

        for key in keys {
            if cancel.is_cancelled() {
                report.interrupted = true;
                break;
            }
            // Guard is scoped to this block so it is released on every path.
            let emptied = {
                let Some(mut bucket) = self.entries.get_mut(&key) else {
                    continue;
                };
                let before = bucket.len();
                bucket.retain(|entry| entry.recorded_at() >= cutoff);
                report.evicted += before - bucket.len();
                bucket.is_empty()
            };
            if emptied {
                self.entries.remove_if(&key, |_, bucket| bucket.is_empty());
            }
        }

        report
    }

    fn len(&self) -> usize {
        self.entries.iter().map(|bucket| bucket.len()).sum()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub actions_evicted: usize,
    pub decisions_evicted: usize,
    pub interrupted: bool,
}

pub struct ActionRecorder {
    actions: Arc<dyn RecordStore<ActionRecord>>,
    decisions: Arc<dyn RecordStore<DecisionRecord>>,
    action_retention: Duration,
    decision_retention: Duration,
}

impl ActionRecorder {
    /// In-memory recorder with the given retention windows
    #[must_use]
    pub fn in_memory(action_retention: Duration, decision_retention: Duration) -> Self {
        Self::new(
            Arc::new(InMemoryLedger::default()),
            Arc::new(InMemoryLedger::default()),
            action_retention,
            decision_retention,
        )
    }

    #[must_use]
    pub fn new(
        actions: Arc<dyn RecordStore<ActionRecord>>,
        decisions: Arc<dyn RecordStore<DecisionRecord>>,
        action_retention: Duration,
        decision_retention: Duration,
    ) -> Self {
        Self {
            actions,
            decisions,
            action_retention,
            decision_retention,
        }
    }

    /// Append a terminal outcome
    pub fn record(&self, record: ActionRecord) {
        info!(
            action = %record.action_id,
            policy = %record.policy,
            target = %record.target,
            action_type = record.action_type.as_label(),
            outcome = record.outcome.as_label(),
            attempts = record.attempts,
            simulated = record.simulated,
            "Recorded action outcome"
        );
        self.actions.append(record);
    }

    pub fn record_decision(&self, decision: DecisionRecord) {
        debug!(
            action = %decision.action_id,
            approved = decision.approved,
            reason = decision.reason.as_deref().unwrap_or(""),
            "Recorded admission decision"
        );
        self.decisions.append(decision);
    }

    /// Most recent terminal outcome for `action_id`
    #[must_use]
    pub fn terminal_record(&self, action_id: &str) -> Option<ActionRecord> {
        self.actions.entries(action_id).pop()
    }

    #[must_use]
    pub fn history(&self, action_id: &str) -> Vec<ActionRecord> {
        self.actions.entries(action_id)
    }

    #[must_use]
    pub fn decisions(&self, action_id: &str) -> Vec<DecisionRecord> {
        self.decisions.entries(action_id)
    }

    #[must_use]
    pub fn action_count(&self) -> usize {
        self.actions.len()
    }

    #[must_use]
    pub fn decision_count(&self) -> usize {
        self.decisions.len()
    }

    /// Evict records past their retention, stopping early on cancellation
    pub fn sweep(&self, now: DateTime<Utc>, cancel: &CancellationToken) -> SweepReport {
        let actions = self
            .actions
            .evict_older_than(now - self.action_retention, cancel);
        let decisions = self
            .decisions
            .evict_older_than(now - self.decision_retention, cancel);
        SweepReport {
            actions_evicted: actions.evicted,
            decisions_evicted: decisions.evicted,
            interrupted: actions.interrupted || decisions.interrupted,
        }
    }
}
