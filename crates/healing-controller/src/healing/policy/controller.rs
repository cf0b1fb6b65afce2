use super::evaluator::{self, EvaluationPlan};
use super::naming::ActionNaming;
use crate::crds::{
    HealingAction, HealingPolicy, HealingPolicyStatus, PolicyPhase, PolicyRef,
};
use crate::healing::signals::AnalysisContext;
use crate::healing::types::{Context, Error, Result, LABEL_POLICY};
use chrono::{DateTime, Utc};
use kube::api::{ListParams, Patch, PatchParams, PostParams};
use kube::runtime::controller::Action;
use kube::{Api, ResourceExt};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

#[instrument(skip(ctx), fields(policy = %policy.name_any(), namespace = %policy.namespace().unwrap_or_default()))]
pub async fn reconcile_policy(policy: Arc<HealingPolicy>, ctx: Arc<Context>) -> Result<Action> {
    let namespace = policy.namespace().ok_or(Error::MissingObjectKey)?;
    let name = policy.name_any();
    let policies: Api<HealingPolicy> = Api::namespaced(ctx.client.clone(), &namespace);
    let now = Utc::now();
    let interval = ctx
        .config
        .evaluation
        .interval_for(policy.spec.evaluation_interval_seconds);

    if let Err(reason) = policy.spec.validate() {
        warn!(reason = %reason, "Policy is invalid");
        ctx.metrics.record_evaluation("invalid");
        update_policy_status(
            &policies,
            &policy,
            HealingPolicyStatus {
                phase: Some(PolicyPhase::Invalid),
                message: Some(reason),
                observed_generation: policy.metadata.generation,
                ..HealingPolicyStatus::default()
            },
        )
        .await?;
        return Ok(Action::await_change());
    }

    if policy.spec.suspend {
        debug!("Policy is suspended");
        ctx.metrics.record_evaluation("suspended");
        update_policy_status(
            &policies,
            &policy,
            HealingPolicyStatus {
                phase: Some(PolicyPhase::Suspended),
                message: Some("evaluation suspended".to_string()),
                observed_generation: policy.metadata.generation,
                ..HealingPolicyStatus::default()
            },
        )
        .await?;
        return Ok(Action::await_change());
    }

    // Status writes and owned-action churn wake the controller early.
    let retry_after = ctx.config.evaluation.error_requeue();
    if let Some(remaining) = not_due_for(&policy, interval, retry_after, now) {
        debug!(remaining_secs = remaining.as_secs(), "Evaluation not due yet");
        return Ok(Action::requeue(remaining));
    }

    let policy_ref = PolicyRef {
        namespace: namespace.clone(),
        name: name.clone(),
    };
    let target_namespace = policy
        .spec
        .target
        .namespace
        .clone()
        .unwrap_or_else(|| namespace.clone());
    let mut signals: Vec<String> = policy
        .spec
        .triggers
        .iter()
        .filter_map(crate::crds::TriggerSpec::signal_name)
        .collect();
    signals.sort();
    signals.dedup();

    let snapshot = match ctx
        .metrics_source
        .fetch_metrics(&target_namespace, &policy.spec.target, &signals)
        .await
    {
        Ok(snapshot) => snapshot,
        Err(e) => {
            warn!(error = %e, "Metrics fetch failed, skipping this evaluation");
            ctx.metrics.record_evaluation("error");
            update_policy_status(
                &policies,
                &policy,
                HealingPolicyStatus {
                    phase: Some(PolicyPhase::Degraded),
                    message: Some(e.to_string()),
                    last_evaluation_time: Some(now.to_rfc3339()),
                    last_result: Some("error".to_string()),
                    observed_generation: policy.metadata.generation,
                    ..policy.status.clone().unwrap_or_default()
                },
            )
            .await?;
            return Ok(Action::requeue(retry_after));
        }
    };

    let actions: Api<HealingAction> = Api::namespaced(ctx.client.clone(), &namespace);
    let selector = format!("{LABEL_POLICY}={}", ActionNaming::label_value(&name));
    let existing = actions
        .list(&ListParams::default().labels(&selector))
        .await?;

    let safety = &policy.spec.safety;
    let plan = evaluator::plan(
        &policy_ref,
        &policy.spec,
        &snapshot.targets,
        &existing.items,
        |key| ctx.safety.cooldown_remaining(key, safety, now),
    );
    for (target, error) in &plan.target_errors {
        warn!(target = %target, error = %error, "Skipping target with failed metrics");
    }
    for suppressed in &plan.suppressed {
        debug!(
            target = %suppressed.target,
            trigger = %suppressed.trigger,
            reason = ?suppressed.reason,
            "Candidate suppressed"
        );
    }

    let outcome = materialize_candidates(&policy, &plan, &actions, &ctx).await?;

    let result = if outcome.created > 0 {
        "triggered"
    } else if plan.triggered() || outcome.analyzer_suppressed > 0 {
        "suppressed"
    } else {
        "idle"
    };
    ctx.metrics.record_evaluation(result);
    info!(
        result,
        targets = snapshot.len(),
        created = outcome.created,
        suppressed = plan.suppressed.len() + outcome.analyzer_suppressed,
        target_errors = plan.target_errors.len(),
        "Policy evaluated"
    );

    let message = if plan.target_errors.is_empty() {
        format!("evaluated {} target(s)", snapshot.len())
    } else {
        format!(
            "evaluated {} target(s), {} failed metric collection",
            snapshot.len(),
            plan.target_errors.len()
        )
    };
    update_policy_status(
        &policies,
        &policy,
        HealingPolicyStatus {
            phase: Some(PolicyPhase::Active),
            message: Some(message),
            last_evaluation_time: Some(now.to_rfc3339()),
            active_actions: u32::try_from(plan.active_actions + outcome.created).unwrap_or(u32::MAX),
            last_result: Some(result.to_string()),
            analyzer_degraded: outcome.analyzer_degraded,
            observed_generation: policy.metadata.generation,
        },
    )
    .await?;

    Ok(Action::requeue(interval))
}

#[derive(Debug, Default)]
struct Materialized {
    created: usize,
    analyzer_suppressed: usize,
    analyzer_degraded: bool,
}

async fn materialize_candidates(
    policy: &HealingPolicy,
    plan: &EvaluationPlan,
    actions: &Api<HealingAction>,
    ctx: &Context,
) -> Result<Materialized> {
    let mut outcome = Materialized::default();

    for candidate in &plan.candidates {
        let candidate = if ctx.analyzer.is_enabled() {
            let consultation = ctx
                .analyzer
                .consult(&AnalysisContext {
                    policy: candidate.key.policy.clone(),
                    trigger: candidate.trigger.clone(),
                    target: candidate.key.target.clone(),
                    proposed_action: candidate.action_type,
                    metrics: candidate.metrics.clone(),
                })
                .await;
            outcome.analyzer_degraded |= consultation.degraded;
            match evaluator::apply_consultation(candidate.clone(), &consultation, &policy.spec) {
                Some(adjusted) => adjusted,
                None => {
                    info!(target = %candidate.key.target, trigger = %candidate.trigger, "Analyzer suppressed candidate");
                    outcome.analyzer_suppressed += 1;
                    continue;
                }
            }
        } else {
            candidate.clone()
        };

        let object = evaluator::materialize(policy, &candidate);
        let action_name = object.name_any();
        match actions.create(&PostParams::default(), &object).await {
            Ok(_) => {
                info!(
                    action = %action_name,
                    target = %candidate.key.target,
                    action_type = %candidate.action_type,
                    "Created HealingAction"
                );
                outcome.created += 1;
            }
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                debug!(action = %action_name, "HealingAction already exists");
            }
            Err(e) => return Err(e.into()),
        }
    }

    Ok(outcome)
}

/// Time left until the next evaluation, if the last one is still fresh.
/// A degraded pass is retried after `retry_after` instead of the interval.
fn not_due_for(
    policy: &HealingPolicy,
    interval: Duration,
    retry_after: Duration,
    now: DateTime<Utc>,
) -> Option<Duration> {
    let status = policy.status.as_ref()?;
    if status.observed_generation != policy.metadata.generation {
        return None;
    }
    let interval = match status.phase {
        Some(PolicyPhase::Active) => interval,
        Some(PolicyPhase::Degraded) => retry_after,
        _ => return None,
    };
    let last = status
        .last_evaluation_time
        .as_deref()
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())?
        .with_timezone(&Utc);
    let elapsed = (now - last).to_std().ok()?;
    interval.checked_sub(elapsed).filter(|left| !left.is_zero())
}

async fn update_policy_status(
    api: &Api<HealingPolicy>,
    policy: &HealingPolicy,
    status: HealingPolicyStatus,
) -> Result<()> {
    if policy.status.as_ref() == Some(&status) {
        return Ok(());
    }
    let patch = json!({ "status": status });
    api.patch_status(&policy.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

pub fn error_policy(policy: Arc<HealingPolicy>, error: &Error, ctx: Arc<Context>) -> Action {
    warn!(policy = %policy.name_any(), error = %error, "Policy reconcile failed");
    ctx.metrics.record_evaluation("error");
    if error.is_config_error() {
        Action::await_change()
    } else {
        Action::requeue(ctx.config.evaluation.error_requeue())
    }
}
