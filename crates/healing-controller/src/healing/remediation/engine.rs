//! Executes admitted actions with bounded retry.

use super::cluster::{ClusterError, ClusterOps};
use super::recorder::{ActionRecord, ActionRecorder};
use crate::crds::{ActionOutcome, ActionPhase, ActionType, HealingAction, TargetRef};
use crate::healing::action::state::{check_transition, PhaseExt};
use crate::healing::config::RetryConfig;
use crate::healing::metrics::HealingMetrics;
use crate::healing::safety::InFlightPermit;
use crate::healing::types::Result;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Retry ceiling and exponential backoff
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Delay after the given failed attempt (1-based): `base * 2^(attempt-1)`, capped
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1_u32 << exponent)
            .min(self.max_delay)
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }
}

/// One status write requested by the engine
#[derive(Debug, Clone, PartialEq)]
pub struct StatusUpdate {
    pub phase: ActionPhase,
    pub reason: Option<String>,
    pub message: Option<String>,
    pub attempts: u32,
    pub outcome: Option<ActionOutcome>,
    pub simulated: Option<bool>,
}

impl StatusUpdate {
    #[must_use]
    pub fn phase(phase: ActionPhase, attempts: u32) -> Self {
        Self {
            phase,
            reason: None,
            message: None,
            attempts,
            outcome: None,
            simulated: None,
        }
    }

    #[must_use]
    pub fn with_reason(mut self, reason: &str, message: impl Into<String>) -> Self {
        self.reason = Some(reason.to_string());
        self.message = Some(message.into());
        self
    }
}

/// Where the engine persists phase changes
#[async_trait]
pub trait StatusSink: Send + Sync {
    async fn update(&self, action: &HealingAction, update: StatusUpdate) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    Completed(ActionOutcome),
    /// Shutdown arrived mid-backoff; the action stays resumable
    Interrupted { attempts: u32 },
}

pub struct RemediationEngine {
    cluster: Arc<dyn ClusterOps>,
    recorder: Arc<ActionRecorder>,
    metrics: Arc<HealingMetrics>,
    retry: RetryPolicy,
}

struct Attempt<'a> {
    action: &'a HealingAction,
    phase: ActionPhase,
    attempts: u32,
}

impl RemediationEngine {
    #[must_use]
    pub fn new(
        cluster: Arc<dyn ClusterOps>,
        recorder: Arc<ActionRecorder>,
        metrics: Arc<HealingMetrics>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            cluster,
            recorder,
            metrics,
            retry,
        }
    }

    #[must_use]
    pub fn recorder(&self) -> &Arc<ActionRecorder> {
        &self.recorder
    }

    /// Run an admitted action to a terminal phase.
    ///
    /// Exactly one ledger record is written per action. An action whose
    /// outcome is already recorded only has its status re-synced.
    #[instrument(skip_all, fields(action = %action.action_id(), action_type = %action.spec.action_type))]
    pub async fn execute(
        &self,
        action: &HealingAction,
        permit: InFlightPermit,
        status: &dyn StatusSink,
        cancel: &CancellationToken,
    ) -> Result<ExecutionOutcome> {
        let action_id = action.action_id();

        if let Some(record) = self.recorder.terminal_record(&action_id) {
            info!(outcome = record.outcome.as_label(), "Outcome already recorded, syncing status");
            permit.abandon();
            let phase = terminal_phase(record.outcome);
            if !action.phase().is_terminal() {
                if !action.phase().can_transition_to(phase) {
                    status
                        .update(action, StatusUpdate::phase(ActionPhase::Executing, record.attempts))
                        .await?;
                }
                let mut update = StatusUpdate::phase(phase, record.attempts);
                update.outcome = Some(record.outcome);
                update.message = record.detail.clone();
                status.update(action, update).await?;
            }
            return Ok(ExecutionOutcome::Completed(record.outcome));
        }

        if permit.is_simulated() {
            return self.simulate(action, permit, status).await;
        }

        let resumed = matches!(action.phase(), ActionPhase::Executing | ActionPhase::Retrying);
        let mut attempt = Attempt {
            action,
            phase: action.phase(),
            attempts: action.attempts(),
        };

        let (outcome, detail) = loop {
            if attempt.attempts >= self.retry.max_attempts {
                break (
                    ActionOutcome::Failed,
                    format!("retry ceiling of {} attempts reached", self.retry.max_attempts),
                );
            }
            attempt.attempts += 1;
            let n = attempt.attempts;
            self.transition(&mut attempt, StatusUpdate::phase(ActionPhase::Executing, n), status)
                .await?;

            match self.apply(action, n, resumed).await {
                Ok(()) => {
                    let outcome = if action.spec.action_type == ActionType::Rollback {
                        ActionOutcome::RolledBack
                    } else {
                        ActionOutcome::Succeeded
                    };
                    break (outcome, format!("{} applied to {}", action.spec.action_type, action.spec.target));
                }
                Err(err) if err.is_transient() && attempt.attempts < self.retry.max_attempts => {
                    let delay = self.retry.backoff(attempt.attempts);
                    warn!(
                        attempt = attempt.attempts,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %err,
                        "Transient failure, retrying"
                    );
                    let retrying = StatusUpdate::phase(ActionPhase::Retrying, n)
                        .with_reason(err.reason(), err.to_string());
                    self.transition(&mut attempt, retrying, status).await?;
                    tokio::select! {
                        () = tokio::time::sleep(delay) => {}
                        () = cancel.cancelled() => {
                            info!(attempts = attempt.attempts, "Shutdown during backoff, leaving action resumable");
                            permit.abandon();
                            return Ok(ExecutionOutcome::Interrupted { attempts: attempt.attempts });
                        }
                    }
                }
                Err(err) => {
                    warn!(attempt = attempt.attempts, error = %err, "Execution failed");
                    break (ActionOutcome::Failed, err.to_string());
                }
            }
        };

        self.finish(&mut attempt, outcome, detail, false, status, permit).await
    }

    async fn simulate(
        &self,
        action: &HealingAction,
        permit: InFlightPermit,
        status: &dyn StatusSink,
    ) -> Result<ExecutionOutcome> {
        let mut attempt = Attempt {
            action,
            phase: action.phase(),
            attempts: action.attempts().max(1),
        };
        let mut executing = StatusUpdate::phase(ActionPhase::Executing, attempt.attempts);
        executing.simulated = Some(true);
        self.transition(&mut attempt, executing, status).await?;
        let detail = format!(
            "dry run: would have applied {} to {}",
            action.spec.action_type, action.spec.target
        );
        info!("{detail}");
        self.finish(&mut attempt, ActionOutcome::Succeeded, detail, true, status, permit)
            .await
    }

    async fn finish(
        &self,
        attempt: &mut Attempt<'_>,
        outcome: ActionOutcome,
        detail: String,
        simulated: bool,
        status: &dyn StatusSink,
        permit: InFlightPermit,
    ) -> Result<ExecutionOutcome> {
        let action = attempt.action;
        self.recorder.record(ActionRecord {
            id: Uuid::new_v4(),
            action_id: action.action_id(),
            policy: action.spec.policy_ref.clone(),
            target: action.spec.target.clone(),
            action_type: action.spec.action_type,
            outcome,
            attempts: attempt.attempts,
            simulated,
            detail: Some(detail.clone()),
            recorded_at: Utc::now(),
        });
        permit.complete(outcome);

        let label = if simulated { "dry_run" } else { outcome.as_label() };
        self.metrics.record_action(
            action.spec.action_type,
            action.spec.target.namespace.as_deref().unwrap_or(""),
            label,
        );

        let mut update = StatusUpdate::phase(terminal_phase(outcome), attempt.attempts);
        update.outcome = Some(outcome);
        update.message = Some(detail);
        update.simulated = simulated.then_some(true);
        if outcome == ActionOutcome::Failed {
            update.reason = Some("ExecutionFailed".to_string());
        }
        self.transition(attempt, update, status).await?;
        Ok(ExecutionOutcome::Completed(outcome))
    }

    async fn transition(
        &self,
        attempt: &mut Attempt<'_>,
        update: StatusUpdate,
        status: &dyn StatusSink,
    ) -> Result<()> {
        check_transition(attempt.phase, update.phase)?;
        let next = update.phase;
        status.update(attempt.action, update).await?;
        attempt.phase = next;
        Ok(())
    }

    async fn apply(
        &self,
        action: &HealingAction,
        attempt: u32,
        resumed: bool,
    ) -> Result<(), ClusterError> {
        let target: &TargetRef = &action.spec.target;
        let stamp = action.action_id();
        match action.spec.action_type {
            ActionType::RestartPod => match self.cluster.restart_pod(target).await {
                // Gone after an earlier attempt or before a restart: the delete landed.
                Err(ClusterError::NotFound(_)) if resumed || attempt > 1 => Ok(()),
                other => other,
            },
            ActionType::RestartWorkload => self.cluster.restart_workload(target, &stamp).await,
            ActionType::Scale => {
                let replicas = action
                    .spec
                    .replicas
                    .ok_or_else(|| ClusterError::Invalid("scale action without replicas".to_string()))?;
                self.cluster.scale(target, replicas).await
            }
            ActionType::Patch => {
                let patch = action
                    .spec
                    .patch
                    .as_ref()
                    .ok_or_else(|| ClusterError::Invalid("patch action without body".to_string()))?;
                self.cluster.patch(target, patch).await
            }
            ActionType::Cordon => self.cluster.cordon(target).await,
            ActionType::Rollback => self.cluster.rollback(target, &stamp).await,
        }
    }
}

fn terminal_phase(outcome: ActionOutcome) -> ActionPhase {
    if outcome.is_success() {
        ActionPhase::Succeeded
    } else {
        ActionPhase::Failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crds::{HealingActionSpec, HealingActionStatus, PolicyRef, SafetySpec, TargetKind};
    use crate::healing::remediation::cluster::MockClusterOps;
    use crate::healing::safety::{ActionStore, SafetyController, SafetyKey, ValidationRequest, Verdict};
    use chrono::Duration as ChronoDuration;
    use std::sync::Mutex;

    #[derive(Default)]
    struct CapturingSink {
        updates: Mutex<Vec<StatusUpdate>>,
    }

    #[async_trait]
    impl StatusSink for CapturingSink {
        async fn update(&self, _action: &HealingAction, update: StatusUpdate) -> Result<()> {
            self.updates.lock().unwrap().push(update);
            Ok(())
        }
    }

    impl CapturingSink {
        fn phases(&self) -> Vec<ActionPhase> {
            self.updates.lock().unwrap().iter().map(|u| u.phase).collect()
        }
    }

    fn action(action_type: ActionType, phase: ActionPhase, attempts: u32) -> HealingAction {
        let mut action = HealingAction::new(
            "heal-cpu-1",
            HealingActionSpec {
                policy_ref: PolicyRef {
                    namespace: "apps".to_string(),
                    name: "cpu".to_string(),
                },
                trigger: "cpu-high".to_string(),
                action_type,
                target: TargetRef::new(TargetKind::Deployment, Some("apps"), "web"),
                replicas: Some(3),
                patch: None,
                template: None,
                analysis: None,
            },
        );
        action.metadata.namespace = Some("apps".to_string());
        action.status = Some(HealingActionStatus {
            phase,
            attempts,
            ..HealingActionStatus::default()
        });
        action
    }

    fn engine(cluster: MockClusterOps, max_attempts: u32) -> RemediationEngine {
        RemediationEngine::new(
            Arc::new(cluster),
            Arc::new(ActionRecorder::in_memory(ChronoDuration::hours(24), ChronoDuration::hours(1))),
            Arc::new(HealingMetrics::new()),
            RetryPolicy {
                max_attempts,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
            },
        )
    }

    fn permit(dry_run: bool, action: &HealingAction) -> (SafetyController, InFlightPermit) {
        let safety = SafetyController::new(Arc::new(ActionStore::new(4)), dry_run, Arc::new(HealingMetrics::new()));
        let key = SafetyKey::new(action.spec.policy_ref.clone(), action.spec.target.clone());
        let spec = SafetySpec::default();
        let id = action.action_id();
        let verdict = safety.validate(
            &ValidationRequest {
                action_id: &id,
                key: &key,
                safety: &spec,
            },
            Utc::now(),
        );
        let Verdict::Approved(permit) = verdict else {
            panic!("fresh store admits");
        };
        (safety, permit)
    }

    fn conflict() -> ClusterError {
        ClusterError::Conflict("object modified".to_string())
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let retry = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(retry.backoff(1), Duration::from_millis(100));
        assert_eq!(retry.backoff(2), Duration::from_millis(200));
        assert_eq!(retry.backoff(3), Duration::from_millis(350));
    }

    #[tokio::test]
    async fn transient_conflict_then_success_records_once() {
        let mut cluster = MockClusterOps::new();
        let mut calls = 0;
        cluster.expect_scale().times(2).returning(move |_, _| {
            calls += 1;
            if calls == 1 {
                Err(ClusterError::Conflict("object modified".to_string()))
            } else {
                Ok(())
            }
        });
        let engine = engine(cluster, 3);
        let action = action(ActionType::Scale, ActionPhase::Approved, 0);
        let (safety, permit) = permit(false, &action);
        let sink = CapturingSink::default();

        let outcome = engine
            .execute(&action, permit, &sink, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome, ExecutionOutcome::Completed(ActionOutcome::Succeeded));
        assert_eq!(
            sink.phases(),
            vec![
                ActionPhase::Executing,
                ActionPhase::Retrying,
                ActionPhase::Executing,
                ActionPhase::Succeeded
            ]
        );
        let history = engine.recorder().history(&action.action_id());
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].attempts, 2);
        assert_eq!(safety.store().in_flight_total(), 0);
    }

    #[tokio::test]
    async fn terminal_error_fails_without_retry() {
        let mut cluster = MockClusterOps::new();
        cluster
            .expect_scale()
            .times(1)
            .returning(|_, _| Err(ClusterError::Forbidden("rbac".to_string())));
        let engine = engine(cluster, 3);
        let action = action(ActionType::Scale, ActionPhase::Approved, 0);
        let (safety, permit) = permit(false, &action);
        let sink = CapturingSink::default();

        let outcome = engine
            .execute(&action, permit, &sink, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome, ExecutionOutcome::Completed(ActionOutcome::Failed));
        assert_eq!(sink.phases(), vec![ActionPhase::Executing, ActionPhase::Failed]);
        let key = SafetyKey::new(action.spec.policy_ref.clone(), action.spec.target.clone());
        assert_eq!(safety.store().snapshot(&key).unwrap().consecutive_failures, 1);
    }

    #[tokio::test]
    async fn retry_ceiling_is_never_exceeded() {
        let mut cluster = MockClusterOps::new();
        cluster.expect_scale().times(3).returning(|_, _| Err(conflict()));
        let engine = engine(cluster, 3);
        let action = action(ActionType::Scale, ActionPhase::Approved, 0);
        let (_safety, permit) = permit(false, &action);
        let sink = CapturingSink::default();

        let outcome = engine
            .execute(&action, permit, &sink, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome, ExecutionOutcome::Completed(ActionOutcome::Failed));
        assert_eq!(engine.recorder().history(&action.action_id())[0].attempts, 3);
    }

    #[tokio::test]
    async fn dry_run_never_touches_the_cluster() {
        let cluster = MockClusterOps::new();
        let engine = engine(cluster, 3);
        let action = action(ActionType::Scale, ActionPhase::Approved, 0);
        let (_safety, permit) = permit(true, &action);
        let sink = CapturingSink::default();

        let outcome = engine
            .execute(&action, permit, &sink, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome, ExecutionOutcome::Completed(ActionOutcome::Succeeded));
        let record = engine.recorder().terminal_record(&action.action_id()).unwrap();
        assert!(record.simulated);
        assert!(record.detail.unwrap().contains("would have"));
    }

    #[tokio::test]
    async fn rollback_success_records_rolled_back() {
        let mut cluster = MockClusterOps::new();
        cluster
            .expect_rollback()
            .withf(|_, stamp| stamp == "apps/heal-cpu-1")
            .times(1)
            .returning(|_, _| Ok(()));
        let engine = engine(cluster, 3);
        let action = action(ActionType::Rollback, ActionPhase::Approved, 0);
        let (_safety, permit) = permit(false, &action);
        let sink = CapturingSink::default();

        let outcome = engine
            .execute(&action, permit, &sink, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome, ExecutionOutcome::Completed(ActionOutcome::RolledBack));
        assert_eq!(sink.phases().last(), Some(&ActionPhase::Succeeded));
    }

    #[tokio::test]
    async fn recorded_outcome_only_resyncs_status() {
        let cluster = MockClusterOps::new();
        let engine = engine(cluster, 3);
        let action = action(ActionType::Scale, ActionPhase::Executing, 1);
        engine.recorder().record(ActionRecord {
            id: Uuid::new_v4(),
            action_id: action.action_id(),
            policy: action.spec.policy_ref.clone(),
            target: action.spec.target.clone(),
            action_type: ActionType::Scale,
            outcome: ActionOutcome::Succeeded,
            attempts: 1,
            simulated: false,
            detail: None,
            recorded_at: Utc::now(),
        });
        let (_safety, permit) = permit(false, &action);
        let sink = CapturingSink::default();

        engine
            .execute(&action, permit, &sink, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(sink.phases(), vec![ActionPhase::Succeeded]);
        assert_eq!(engine.recorder().history(&action.action_id()).len(), 1);
    }

    #[tokio::test]
    async fn resumed_pod_restart_treats_missing_pod_as_done() {
        let mut cluster = MockClusterOps::new();
        cluster
            .expect_restart_pod()
            .times(1)
            .returning(|_| Err(ClusterError::NotFound("pod".to_string())));
        let engine = engine(cluster, 3);
        let mut action = action(ActionType::RestartPod, ActionPhase::Executing, 1);
        action.spec.target = TargetRef::new(TargetKind::Pod, Some("apps"), "web-0");
        let (_safety, permit) = permit(false, &action);
        let sink = CapturingSink::default();

        let outcome = engine
            .execute(&action, permit, &sink, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome, ExecutionOutcome::Completed(ActionOutcome::Succeeded));
    }

    #[tokio::test]
    async fn unadmitted_action_is_refused_before_touching_the_cluster() {
        let cluster = MockClusterOps::new();
        let engine = engine(cluster, 3);
        let action = action(ActionType::Scale, ActionPhase::Pending, 0);
        let (_safety, permit) = permit(false, &action);
        let sink = CapturingSink::default();

        let result = engine
            .execute(&action, permit, &sink, &CancellationToken::new())
            .await;

        assert!(matches!(result, Err(crate::healing::Error::IllegalTransition(_))));
        assert!(sink.phases().is_empty());
        assert!(engine.recorder().terminal_record(&action.action_id()).is_none());
    }

    #[tokio::test]
    async fn recorded_outcome_resyncs_approved_action_through_executing() {
        let cluster = MockClusterOps::new();
        let engine = engine(cluster, 3);
        let action = action(ActionType::Scale, ActionPhase::Approved, 0);
        engine.recorder().record(ActionRecord {
            id: Uuid::new_v4(),
            action_id: action.action_id(),
            policy: action.spec.policy_ref.clone(),
            target: action.spec.target.clone(),
            action_type: ActionType::Scale,
            outcome: ActionOutcome::Succeeded,
            attempts: 1,
            simulated: false,
            detail: None,
            recorded_at: Utc::now(),
        });
        let (_safety, permit) = permit(false, &action);
        let sink = CapturingSink::default();

        engine
            .execute(&action, permit, &sink, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(sink.phases(), vec![ActionPhase::Executing, ActionPhase::Succeeded]);
    }

    #[tokio::test]
    async fn cancellation_during_backoff_leaves_action_resumable() {
        let mut cluster = MockClusterOps::new();
        cluster.expect_scale().times(1).returning(|_, _| Err(conflict()));
        let mut engine = engine(cluster, 3);
        engine.retry.base_delay = Duration::from_secs(60);
        engine.retry.max_delay = Duration::from_secs(60);
        let action = action(ActionType::Scale, ActionPhase::Approved, 0);
        let (safety, permit) = permit(false, &action);
        let sink = CapturingSink::default();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = engine.execute(&action, permit, &sink, &cancel).await.unwrap();

        assert_eq!(outcome, ExecutionOutcome::Interrupted { attempts: 1 });
        assert!(engine.recorder().terminal_record(&action.action_id()).is_none());
        assert_eq!(sink.phases().last(), Some(&ActionPhase::Retrying));
        assert_eq!(safety.store().in_flight_total(), 0);
    }
}
