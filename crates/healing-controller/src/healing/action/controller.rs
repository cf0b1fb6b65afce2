use super::state::{check_transition, PhaseExt};
use crate::crds::{ActionPhase, HealingAction, HealingActionStatus, HealingPolicy, PolicyRef, SafetySpec};
use crate::healing::metrics::HealingMetrics;
use crate::healing::remediation::{
    DecisionRecord, ExecutionOutcome, RemediationEngine, StatusSink, StatusUpdate,
};
use crate::healing::safety::{
    DenyReason, InFlightPermit, SafetyController, SafetyKey, ValidationRequest, Verdict,
};
use crate::healing::types::{Context, Error, Result, ANNOTATION_APPROVAL};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kube::api::{Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::{Api, Client, ResourceExt};
use serde_json::{json, Map, Value};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

const AWAITING_APPROVAL: &str = "AwaitingApproval";

/// Operator decision read from the approval annotation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Approval {
    Approved,
    Rejected,
    Awaiting,
}

fn approval_of(action: &HealingAction) -> Approval {
    let decision = action
        .annotations()
        .get(ANNOTATION_APPROVAL)
        .map(|value| value.trim().to_ascii_lowercase());
    match decision.as_deref() {
        Some("approved") => Approval::Approved,
        Some("rejected") => Approval::Rejected,
        _ => Approval::Awaiting,
    }
}

/// Safety settings of the policy owning an action
#[async_trait]
pub trait PolicySource: Send + Sync {
    /// `None` once the policy is gone
    async fn safety_for(&self, policy: &PolicyRef) -> Result<Option<SafetySpec>>;
}

pub struct KubePolicySource {
    client: Client,
}

impl KubePolicySource {
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PolicySource for KubePolicySource {
    async fn safety_for(&self, policy: &PolicyRef) -> Result<Option<SafetySpec>> {
        let api: Api<HealingPolicy> = Api::namespaced(self.client.clone(), &policy.namespace);
        Ok(api.get_opt(&policy.name).await?.map(|p| p.spec.safety))
    }
}

#[instrument(skip(ctx), fields(action = %action.name_any(), namespace = %action.namespace().unwrap_or_default(), phase = %action.phase()))]
pub async fn reconcile_action(action: Arc<HealingAction>, ctx: Arc<Context>) -> Result<Action> {
    let namespace = action.namespace().ok_or(Error::MissingObjectKey)?;
    if action.phase().is_terminal() {
        return Ok(Action::await_change());
    }

    let sink = KubeStatusSink::new(Api::namespaced(ctx.client.clone(), &namespace));
    let policies = KubePolicySource::new(ctx.client.clone());
    ActionDriver {
        safety: &ctx.safety,
        engine: &ctx.engine,
        metrics: &ctx.metrics,
        policies: &policies,
        sink: &sink,
        shutdown: &ctx.shutdown,
        retry_after: ctx.config.evaluation.error_requeue(),
    }
    .drive(&action)
    .await
}

/// Collaborators of one action reconcile
pub struct ActionDriver<'a> {
    pub safety: &'a SafetyController,
    pub engine: &'a RemediationEngine,
    pub metrics: &'a HealingMetrics,
    pub policies: &'a dyn PolicySource,
    pub sink: &'a dyn StatusSink,
    pub shutdown: &'a CancellationToken,
    /// Requeue delay after an interrupted execution
    pub retry_after: Duration,
}

impl ActionDriver<'_> {
    /// Move `action` as far through its lifecycle as this reconcile allows
    pub async fn drive(&self, action: &HealingAction) -> Result<Action> {
        let mut phase = action.phase();
        if phase.is_terminal() {
            return Ok(Action::await_change());
        }
        let key = SafetyKey::new(action.spec.policy_ref.clone(), action.spec.target.clone());
        let action_id = action.action_id();

        if phase.is_admitted() {
            // Resumed after a restart or requeued after an interrupted backoff.
            let simulated = action.status.as_ref().is_some_and(|s| s.simulated);
            let permit = self.safety.adopt(&key, &action_id, simulated);
            return self.execute(action, permit).await;
        }

        // The cached copy can trail writes made by an earlier reconcile.
        let recorder = self.engine.recorder();
        if let Some(record) = recorder.terminal_record(&action_id) {
            debug!(outcome = record.outcome.as_label(), "Outcome already recorded, cached phase is stale");
            return Ok(Action::await_change());
        }
        if let Some(decision) = recorder.decisions(&action_id).pop() {
            if !decision.approved {
                debug!(
                    reason = decision.reason.as_deref().unwrap_or_default(),
                    "Denial already recorded, cached phase is stale"
                );
                return Ok(Action::await_change());
            }
            // Admitted, but the Approved write was lost or is not visible yet.
            info!("Resuming action admitted by an earlier reconcile");
            let permit = self.safety.adopt(&key, &action_id, decision.simulated);
            return self.execute(&as_admitted(action, decision.simulated), permit).await;
        }

        let Some(safety) = self.policies.safety_for(&action.spec.policy_ref).await? else {
            self.metrics.record_validation("denied");
            return self.deny(action, phase, &key, DenyReason::PolicyNotFound).await;
        };

        if safety.require_approval {
            match approval_of(action) {
                Approval::Approved => debug!("Operator approved the action"),
                Approval::Rejected => {
                    self.metrics.record_validation("denied");
                    return self.deny(action, phase, &key, DenyReason::RejectedByOperator).await;
                }
                Approval::Awaiting => {
                    let waiting = action
                        .status
                        .as_ref()
                        .and_then(|s| s.reason.as_deref())
                        == Some(AWAITING_APPROVAL);
                    if phase == ActionPhase::Pending && !waiting {
                        info!("Action awaits operator approval");
                        self.sink
                            .update(
                                action,
                                StatusUpdate::phase(ActionPhase::Pending, 0).with_reason(
                                    AWAITING_APPROVAL,
                                    format!("annotate with {ANNOTATION_APPROVAL}=approved to proceed"),
                                ),
                            )
                            .await?;
                    }
                    return Ok(Action::await_change());
                }
            }
        }

        if phase == ActionPhase::Pending {
            self.sink
                .update(action, StatusUpdate::phase(ActionPhase::Validating, 0))
                .await?;
            phase = ActionPhase::Validating;
        }

        let verdict = self.safety.validate(
            &ValidationRequest {
                action_id: &action_id,
                key: &key,
                safety: &safety,
            },
            Utc::now(),
        );
        let permit = match verdict {
            Verdict::Approved(permit) => permit,
            Verdict::Denied(reason) => return self.deny(action, phase, &key, reason).await,
        };

        let simulated = permit.is_simulated();
        recorder.record_decision(DecisionRecord {
            action_id: action_id.clone(),
            policy: key.policy.clone(),
            target: key.target.clone(),
            approved: true,
            simulated,
            reason: None,
            recorded_at: Utc::now(),
        });

        let mut approved = StatusUpdate::phase(ActionPhase::Approved, 0);
        approved.simulated = Some(simulated);
        self.sink.update(action, approved).await?;

        self.execute(&as_admitted(action, simulated), permit).await
    }

    async fn execute(&self, action: &HealingAction, permit: InFlightPermit) -> Result<Action> {
        match self.engine.execute(action, permit, self.sink, self.shutdown).await? {
            ExecutionOutcome::Completed(outcome) => {
                debug!(outcome = outcome.as_label(), "Action reached a terminal phase");
                Ok(Action::await_change())
            }
            ExecutionOutcome::Interrupted { attempts } => {
                info!(attempts, "Action interrupted, will resume");
                Ok(Action::requeue(self.retry_after))
            }
        }
    }

    /// Record a denial and drive the action to `Denied`
    async fn deny(
        &self,
        action: &HealingAction,
        phase: ActionPhase,
        key: &SafetyKey,
        reason: DenyReason,
    ) -> Result<Action> {
        if phase == ActionPhase::Pending {
            self.sink
                .update(action, StatusUpdate::phase(ActionPhase::Validating, 0))
                .await?;
        }
        self.engine.recorder().record_decision(DecisionRecord {
            action_id: action.action_id(),
            policy: key.policy.clone(),
            target: key.target.clone(),
            approved: false,
            simulated: false,
            reason: Some(reason.reason().to_string()),
            recorded_at: Utc::now(),
        });
        self.metrics.record_action(
            action.spec.action_type,
            key.target.namespace.as_deref().unwrap_or(""),
            "denied",
        );
        self.sink
            .update(
                action,
                StatusUpdate::phase(ActionPhase::Denied, action.attempts())
                    .with_reason(reason.reason(), reason.to_string()),
            )
            .await?;
        Ok(Action::await_change())
    }
}

/// Local view of `action` once admitted, handed to the engine
fn as_admitted(action: &HealingAction, simulated: bool) -> HealingAction {
    let mut admitted = action.clone();
    admitted.status = Some(HealingActionStatus {
        phase: ActionPhase::Approved,
        simulated,
        ..action.status.clone().unwrap_or_default()
    });
    admitted
}

pub fn error_action(action: Arc<HealingAction>, error: &Error, ctx: Arc<Context>) -> Action {
    warn!(action = %action.name_any(), error = %error, "Action reconcile failed");
    if error.is_config_error() {
        Action::await_change()
    } else {
        Action::requeue(ctx.config.evaluation.error_requeue())
    }
}

/// Writes action phase changes to the status subresource.
///
/// Every write carries the last resourceVersion this sink observed, so a
/// write computed from a stale copy is rejected with a conflict.
pub struct KubeStatusSink {
    api: Api<HealingAction>,
    last_write: Mutex<Option<LastWrite>>,
}

#[derive(Debug, Clone)]
struct LastWrite {
    phase: ActionPhase,
    resource_version: Option<String>,
    started: bool,
}

impl KubeStatusSink {
    #[must_use]
    pub fn new(api: Api<HealingAction>) -> Self {
        Self {
            api,
            last_write: Mutex::new(None),
        }
    }
}

#[async_trait]
impl StatusSink for KubeStatusSink {
    async fn update(&self, action: &HealingAction, update: StatusUpdate) -> Result<()> {
        let last = self
            .last_write
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let (from, resource_version, started) = match last {
            Some(last) => (last.phase, last.resource_version, last.started),
            None => (action.phase(), action.resource_version(), false),
        };
        check_transition(from, update.phase)?;

        let mut status = status_patch(action, &update, Utc::now());
        if started {
            if let Value::Object(fields) = &mut status {
                fields.remove("startedAt");
            }
        }
        let started = started || status.get("startedAt").is_some();

        let mut patch = json!({ "status": status });
        if let Some(resource_version) = resource_version {
            patch["metadata"] = json!({ "resourceVersion": resource_version });
        }
        let patched = self
            .api
            .patch_status(&action.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await?;

        *self.last_write.lock().unwrap_or_else(PoisonError::into_inner) = Some(LastWrite {
            phase: update.phase,
            resource_version: patched.resource_version(),
            started,
        });
        debug!(action = %action.name_any(), phase = %update.phase, attempts = update.attempts, "Updated action status");
        Ok(())
    }
}

/// Merge-patch body for one status write. Unset reason and message are
/// written as null so a stale value from an earlier phase is cleared.
fn status_patch(action: &HealingAction, update: &StatusUpdate, now: DateTime<Utc>) -> Value {
    let stamp = Value::String(now.to_rfc3339());
    let mut status = Map::new();
    status.insert("phase".to_string(), json!(update.phase));
    status.insert("attempts".to_string(), json!(update.attempts));
    status.insert("reason".to_string(), json!(update.reason));
    status.insert("message".to_string(), json!(update.message));
    status.insert("lastUpdate".to_string(), stamp.clone());

    if let Some(outcome) = update.outcome {
        status.insert("outcome".to_string(), json!(outcome));
    }
    if let Some(simulated) = update.simulated {
        status.insert("simulated".to_string(), Value::Bool(simulated));
    }

    let current = action.status.as_ref();
    match update.phase {
        ActionPhase::Approved | ActionPhase::Denied => {
            status.insert("validatedAt".to_string(), stamp.clone());
        }
        ActionPhase::Executing if current.and_then(|s| s.started_at.as_ref()).is_none() => {
            status.insert("startedAt".to_string(), stamp.clone());
        }
        _ => {}
    }
    if update.phase.is_terminal() {
        status.insert("completedAt".to_string(), stamp);
    }

    Value::Object(status)
}
