//! Shared fakes and fixtures for the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Duration as ChronoDuration;
use healing_controller::crds::{
    ActionPhase, ActionTemplate, ActionType, Comparator, HealingAction, HealingActionStatus,
    HealingPolicy, HealingPolicySpec, PolicyRef, SafetySpec, TargetKind, TargetRef,
    TargetSelector, TriggerSpec,
};
use healing_controller::healing::metrics::HealingMetrics;
use healing_controller::healing::remediation::{
    ActionRecorder, ClusterError, ClusterOps, RemediationEngine, RetryPolicy, StatusSink,
    StatusUpdate,
};
use healing_controller::healing::safety::{ActionStore, SafetyController};
use healing_controller::healing::signals::TargetMetrics;
use healing_controller::healing::Result;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// =============================================================================
// Fake cluster
// =============================================================================

/// Cluster that answers from a script and counts every mutation
#[derive(Default)]
pub struct FakeCluster {
    /// Results handed out in order; `Ok(())` once exhausted
    script: Mutex<VecDeque<std::result::Result<(), ClusterError>>>,
    pub mutations: AtomicUsize,
}

impl FakeCluster {
    pub fn scripted(results: Vec<std::result::Result<(), ClusterError>>) -> Self {
        Self {
            script: Mutex::new(results.into()),
            mutations: AtomicUsize::new(0),
        }
    }

    pub fn mutation_count(&self) -> usize {
        self.mutations.load(Ordering::SeqCst)
    }

    fn next(&self) -> std::result::Result<(), ClusterError> {
        self.mutations.fetch_add(1, Ordering::SeqCst);
        self.script.lock().unwrap().pop_front().unwrap_or(Ok(()))
    }
}

#[async_trait]
impl ClusterOps for FakeCluster {
    async fn restart_pod(&self, _target: &TargetRef) -> std::result::Result<(), ClusterError> {
        self.next()
    }

    async fn restart_workload(
        &self,
        _target: &TargetRef,
        _stamp: &str,
    ) -> std::result::Result<(), ClusterError> {
        self.next()
    }

    async fn scale(&self, _target: &TargetRef, _replicas: i32) -> std::result::Result<(), ClusterError> {
        self.next()
    }

    async fn patch(
        &self,
        _target: &TargetRef,
        _patch: &serde_json::Value,
    ) -> std::result::Result<(), ClusterError> {
        self.next()
    }

    async fn cordon(&self, _node: &TargetRef) -> std::result::Result<(), ClusterError> {
        self.next()
    }

    async fn rollback(&self, _target: &TargetRef, _stamp: &str) -> std::result::Result<(), ClusterError> {
        self.next()
    }
}

// =============================================================================
// Status sink
// =============================================================================

/// Keeps every status write in memory
#[derive(Default)]
pub struct RecordingSink {
    pub updates: Mutex<Vec<StatusUpdate>>,
}

impl RecordingSink {
    pub fn phases(&self) -> Vec<ActionPhase> {
        self.updates.lock().unwrap().iter().map(|u| u.phase).collect()
    }

    /// Apply the last write to `action` the way the API server would
    pub fn apply_last(&self, action: &mut HealingAction) {
        let updates = self.updates.lock().unwrap();
        let Some(last) = updates.last() else {
            return;
        };
        let mut status = action.status.clone().unwrap_or_default();
        status.phase = last.phase;
        status.attempts = last.attempts;
        status.outcome = last.outcome;
        status.reason.clone_from(&last.reason);
        status.message.clone_from(&last.message);
        if let Some(simulated) = last.simulated {
            status.simulated = simulated;
        }
        action.status = Some(status);
    }
}

#[async_trait]
impl StatusSink for RecordingSink {
    async fn update(&self, _action: &HealingAction, update: StatusUpdate) -> Result<()> {
        self.updates.lock().unwrap().push(update);
        Ok(())
    }
}

// =============================================================================
// Fixtures
// =============================================================================

pub fn policy_ref() -> PolicyRef {
    PolicyRef {
        namespace: "apps".to_string(),
        name: "cpu-guard".to_string(),
    }
}

pub fn deployment(name: &str) -> TargetRef {
    TargetRef::new(TargetKind::Deployment, Some("apps"), name)
}

/// "CPU > 90%" restarting the workload, 5 minute cooldown, one at a time
pub fn cpu_policy_spec() -> HealingPolicySpec {
    HealingPolicySpec {
        triggers: vec![TriggerSpec {
            name: "cpu-high".to_string(),
            metric: Some("cpu_utilization".to_string()),
            operator: Comparator::Gt,
            threshold: Some(90.0),
            alert: None,
        }],
        target: TargetSelector {
            kind: TargetKind::Deployment,
            namespace: None,
            match_labels: BTreeMap::new(),
        },
        actions: vec![ActionTemplate {
            name: Some("restart".to_string()),
            action_type: ActionType::RestartWorkload,
            triggers: vec![],
            replicas: None,
            patch: None,
        }],
        safety: SafetySpec {
            cooldown_seconds: 300,
            max_concurrent_actions: 1,
            ..SafetySpec::default()
        },
        evaluation_interval_seconds: None,
        suspend: false,
    }
}

pub fn cpu_policy() -> HealingPolicy {
    let mut policy = HealingPolicy::new(&policy_ref().name, cpu_policy_spec());
    policy.metadata.namespace = Some(policy_ref().namespace);
    policy.metadata.uid = Some("2f9c0d4e-policy".to_string());
    policy
}

/// Snapshot with one `cpu_utilization` reading per deployment
pub fn cpu_snapshot(readings: &[(&str, f64)]) -> BTreeMap<TargetRef, std::result::Result<TargetMetrics, String>> {
    readings
        .iter()
        .map(|(name, value)| {
            let mut metrics = TargetMetrics::new();
            metrics.insert("cpu_utilization".to_string(), *value);
            (deployment(name), Ok(metrics))
        })
        .collect()
}

pub fn with_phase(mut action: HealingAction, phase: ActionPhase) -> HealingAction {
    action.status = Some(HealingActionStatus {
        phase,
        ..action.status.unwrap_or_default()
    });
    action
}

pub fn safety(force_dry_run: bool) -> Arc<SafetyController> {
    Arc::new(SafetyController::new(
        Arc::new(ActionStore::new(4)),
        force_dry_run,
        Arc::new(HealingMetrics::new()),
    ))
}

pub fn recorder() -> Arc<ActionRecorder> {
    Arc::new(ActionRecorder::in_memory(
        ChronoDuration::hours(24),
        ChronoDuration::hours(1),
    ))
}

pub fn engine(cluster: Arc<FakeCluster>, recorder: Arc<ActionRecorder>, max_attempts: u32) -> RemediationEngine {
    RemediationEngine::new(
        cluster,
        recorder,
        Arc::new(HealingMetrics::new()),
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
        },
    )
}
