//! Pure evaluation of one policy against one metrics snapshot.
//!
//! Nothing here talks to the cluster, so the same inputs always produce the
//! same plan. Targets are visited in key order and triggers in declared
//! order; a target yields at most one candidate per evaluation.

use super::naming::ActionNaming;
use crate::crds::{
    ActionType, AnalysisNote, HealingAction, HealingActionSpec, HealingPolicy, HealingPolicySpec,
    PolicyRef, TargetRef,
};
use crate::healing::action::state::PhaseExt;
use crate::healing::safety::SafetyKey;
use crate::healing::signals::{Consultation, Recommendation, TargetMetrics};
use crate::healing::types::{
    LABEL_ACTION_KEY, LABEL_ACTION_SEQUENCE, LABEL_ACTION_TYPE, LABEL_POLICY,
};
use chrono::Duration;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{Resource, ResourceExt};
use std::collections::BTreeMap;

/// An action the policy wants to materialize
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub key: SafetyKey,
    pub trigger: String,
    pub template: Option<String>,
    pub action_type: ActionType,
    pub replicas: Option<i32>,
    pub patch: Option<serde_json::Value>,
    pub metrics: TargetMetrics,
    pub key_hash: String,
    /// Number of actions already materialized for this key
    pub sequence: usize,
    pub analysis: Option<AnalysisNote>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Suppression {
    /// A non-terminal action for the same key exists
    ActiveAction(String),
    Cooldown { remaining_seconds: i64 },
    NoTemplate,
    /// An earlier trigger already produced a candidate for this target
    Superseded,
    AnalyzerSuppressed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Suppressed {
    pub target: TargetRef,
    pub trigger: String,
    pub reason: Suppression,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EvaluationPlan {
    pub candidates: Vec<Candidate>,
    pub suppressed: Vec<Suppressed>,
    pub target_errors: Vec<(TargetRef, String)>,
    /// Non-terminal actions already owned by the policy
    pub active_actions: usize,
}

impl EvaluationPlan {
    /// Any trigger held on any target
    #[must_use]
    pub fn triggered(&self) -> bool {
        !self.candidates.is_empty() || !self.suppressed.is_empty()
    }
}

/// Build the evaluation plan.
///
/// `cooldown` reports the remaining cooldown for a key, if any.
pub fn plan(
    policy: &PolicyRef,
    spec: &HealingPolicySpec,
    targets: &BTreeMap<TargetRef, Result<TargetMetrics, String>>,
    existing: &[HealingAction],
    cooldown: impl Fn(&SafetyKey) -> Option<Duration>,
) -> EvaluationPlan {
    let mut plan = EvaluationPlan::default();

    let owned: Vec<&HealingAction> = existing
        .iter()
        .filter(|action| &action.spec.policy_ref == policy)
        .collect();
    plan.active_actions = owned.iter().filter(|a| !a.phase().is_terminal()).count();

    for (target, collected) in targets {
        let metrics = match collected {
            Ok(metrics) => metrics,
            Err(error) => {
                plan.target_errors.push((target.clone(), error.clone()));
                continue;
            }
        };

        let mut produced = false;
        for trigger in &spec.triggers {
            let Some(signal) = trigger.signal_name() else {
                continue;
            };
            let Some(value) = metrics.get(&signal) else {
                continue;
            };
            if !trigger.is_satisfied_by(*value) {
                continue;
            }

            let mut suppress = |reason| {
                plan.suppressed.push(Suppressed {
                    target: target.clone(),
                    trigger: trigger.name.clone(),
                    reason,
                });
            };

            if produced {
                suppress(Suppression::Superseded);
                continue;
            }

            let same_key: Vec<&&HealingAction> = owned
                .iter()
                .filter(|a| &a.spec.target == target && a.spec.trigger == trigger.name)
                .collect();
            if let Some(active) = same_key.iter().find(|a| !a.phase().is_terminal()) {
                suppress(Suppression::ActiveAction(active.action_id()));
                continue;
            }

            let Some(template) = spec.template_for(&trigger.name) else {
                suppress(Suppression::NoTemplate);
                continue;
            };

            let key = SafetyKey::new(policy.clone(), target.clone());
            if let Some(remaining) = cooldown(&key) {
                suppress(Suppression::Cooldown {
                    remaining_seconds: remaining.num_seconds().max(1),
                });
                continue;
            }

            plan.candidates.push(Candidate {
                key_hash: ActionNaming::key_hash(policy, target, &trigger.name),
                key,
                trigger: trigger.name.clone(),
                template: template.name.clone(),
                action_type: template.action_type,
                replicas: template.replicas,
                patch: template.patch.clone(),
                metrics: metrics.clone(),
                sequence: next_sequence(&same_key),
                analysis: None,
            });
            produced = true;
        }
    }

    plan
}

/// One past the highest sequence among `same_key`. Older actions may have
/// been garbage-collected, so the count alone can collide with a survivor.
fn next_sequence(same_key: &[&&HealingAction]) -> usize {
    same_key
        .iter()
        .filter_map(|action| sequence_of(action))
        .max()
        .map_or(same_key.len(), |highest| highest + 1)
}

/// Sequence an existing action was created with, from its label or name suffix
fn sequence_of(action: &HealingAction) -> Option<usize> {
    action
        .labels()
        .get(LABEL_ACTION_SEQUENCE)
        .and_then(|value| value.parse().ok())
        .or_else(|| action.name_any().rsplit('-').next()?.parse().ok())
}

/// Fold an analyzer consultation into a candidate. `None` drops it.
///
/// A substitution is only taken when the new type fits the target and, for
/// types that need parameters, the policy declares a template to borrow them
/// from.
#[must_use]
pub fn apply_consultation(
    mut candidate: Candidate,
    consultation: &Consultation,
    spec: &HealingPolicySpec,
) -> Option<Candidate> {
    let model = consultation.model.clone().unwrap_or_default();
    match &consultation.recommendation {
        Recommendation::NoOpinion => Some(candidate),
        Recommendation::Suppress { .. } => None,
        Recommendation::Confirm { confidence } => {
            candidate.analysis = Some(AnalysisNote {
                model,
                recommendation: "confirm".to_string(),
                confidence: *confidence,
                original_action_type: None,
            });
            Some(candidate)
        }
        Recommendation::Substitute {
            action_type,
            confidence,
        } => {
            if *action_type == candidate.action_type
                || !action_type.supports(candidate.key.target.kind)
            {
                return Some(candidate);
            }
            let (replicas, patch) = match action_type {
                ActionType::Scale | ActionType::Patch => {
                    let Some(donor) = spec.actions.iter().find(|t| t.action_type == *action_type)
                    else {
                        return Some(candidate);
                    };
                    (donor.replicas, donor.patch.clone())
                }
                _ => (None, None),
            };
            candidate.analysis = Some(AnalysisNote {
                model,
                recommendation: "substitute".to_string(),
                confidence: *confidence,
                original_action_type: Some(candidate.action_type),
            });
            candidate.action_type = *action_type;
            candidate.replicas = replicas;
            candidate.patch = patch;
            Some(candidate)
        }
    }
}

/// Turn a candidate into the `HealingAction` object to create
#[must_use]
pub fn materialize(policy: &HealingPolicy, candidate: &Candidate) -> HealingAction {
    let policy_ref = &candidate.key.policy;
    let name = ActionNaming::action_name(&policy_ref.name, &candidate.key_hash, candidate.sequence);

    let mut labels = BTreeMap::new();
    labels.insert(LABEL_POLICY.to_string(), ActionNaming::label_value(&policy_ref.name));
    labels.insert(LABEL_ACTION_KEY.to_string(), candidate.key_hash.clone());
    labels.insert(LABEL_ACTION_SEQUENCE.to_string(), candidate.sequence.to_string());
    labels.insert(
        LABEL_ACTION_TYPE.to_string(),
        candidate.action_type.as_label().replace('_', "-"),
    );

    let owner = policy.controller_owner_ref(&()).into_iter().collect::<Vec<_>>();

    HealingAction {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: Some(policy_ref.namespace.clone()),
            labels: Some(labels),
            owner_references: (!owner.is_empty()).then_some(owner),
            ..ObjectMeta::default()
        },
        spec: HealingActionSpec {
            policy_ref: policy_ref.clone(),
            trigger: candidate.trigger.clone(),
            action_type: candidate.action_type,
            target: candidate.key.target.clone(),
            replicas: candidate.replicas,
            patch: candidate.patch.clone(),
            template: candidate.template.clone(),
            analysis: candidate.analysis.clone(),
        },
        status: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crds::{
        ActionPhase, ActionTemplate, Comparator, HealingActionStatus, SafetySpec, TargetKind,
        TargetSelector, TriggerSpec,
    };

    fn policy_ref() -> PolicyRef {
        PolicyRef {
            namespace: "apps".to_string(),
            name: "cpu".to_string(),
        }
    }

    fn spec() -> HealingPolicySpec {
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
            safety: SafetySpec::default(),
            evaluation_interval_seconds: None,
            suspend: false,
        }
    }

    fn snapshot(values: &[(&str, f64)]) -> BTreeMap<TargetRef, Result<TargetMetrics, String>> {
        values
            .iter()
            .map(|(name, cpu)| {
                let mut metrics = TargetMetrics::new();
                metrics.insert("cpu_utilization".to_string(), *cpu);
                (TargetRef::new(TargetKind::Deployment, Some("apps"), name), Ok(metrics))
            })
            .collect()
    }

    fn no_cooldown(_: &SafetyKey) -> Option<Duration> {
        None
    }

    fn policy() -> HealingPolicy {
        let mut policy = HealingPolicy::new("cpu", spec());
        policy.metadata.namespace = Some("apps".to_string());
        policy.metadata.uid = Some("0b7f6c1e-1111-2222-3333-444455556666".to_string());
        policy
    }

    #[test]
    fn satisfied_trigger_yields_candidate() {
        let plan = plan(&policy_ref(), &spec(), &snapshot(&[("web", 95.0), ("api", 40.0)]), &[], no_cooldown);
        assert_eq!(plan.candidates.len(), 1);
        let candidate = &plan.candidates[0];
        assert_eq!(candidate.key.target.name, "web");
        assert_eq!(candidate.action_type, ActionType::RestartWorkload);
        assert_eq!(candidate.sequence, 0);
    }

    #[test]
    fn evaluation_is_idempotent_against_materialized_actions() {
        let snapshot = snapshot(&[("web", 95.0)]);
        let first = plan(&policy_ref(), &spec(), &snapshot, &[], no_cooldown);
        let existing: Vec<HealingAction> =
            first.candidates.iter().map(|c| materialize(&policy(), c)).collect();

        let second = plan(&policy_ref(), &spec(), &snapshot, &existing, no_cooldown);

        assert!(second.candidates.is_empty());
        assert!(matches!(second.suppressed[0].reason, Suppression::ActiveAction(_)));
        assert_eq!(second.active_actions, 1);
    }

    #[test]
    fn terminal_actions_bump_the_sequence() {
        let snapshot = snapshot(&[("web", 95.0)]);
        let first = plan(&policy_ref(), &spec(), &snapshot, &[], no_cooldown);
        let mut done = materialize(&policy(), &first.candidates[0]);
        done.status = Some(HealingActionStatus {
            phase: ActionPhase::Succeeded,
            ..HealingActionStatus::default()
        });

        let second = plan(&policy_ref(), &spec(), &snapshot, &[done.clone()], no_cooldown);

        assert_eq!(second.candidates.len(), 1);
        assert_eq!(second.candidates[0].sequence, 1);
        assert_ne!(
            materialize(&policy(), &second.candidates[0]).metadata.name,
            done.metadata.name
        );
    }

    #[test]
    fn sequence_skips_past_survivors_after_garbage_collection() {
        let snapshot = snapshot(&[("web", 95.0)]);
        let mut candidate = plan(&policy_ref(), &spec(), &snapshot, &[], no_cooldown)
            .candidates
            .remove(0);
        // Sequence 0 is gone; only the later action is still around.
        candidate.sequence = 1;
        let mut survivor = materialize(&policy(), &candidate);
        survivor.status = Some(HealingActionStatus {
            phase: ActionPhase::Failed,
            ..HealingActionStatus::default()
        });

        let next = plan(&policy_ref(), &spec(), &snapshot, &[survivor.clone()], no_cooldown);

        assert_eq!(next.candidates[0].sequence, 2);
        assert_ne!(
            materialize(&policy(), &next.candidates[0]).metadata.name,
            survivor.metadata.name
        );
    }

    #[test]
    fn sequence_falls_back_to_the_name_suffix() {
        let snapshot = snapshot(&[("web", 95.0)]);
        let mut candidate = plan(&policy_ref(), &spec(), &snapshot, &[], no_cooldown)
            .candidates
            .remove(0);
        candidate.sequence = 4;
        let mut unlabeled = materialize(&policy(), &candidate);
        unlabeled.metadata.labels.as_mut().unwrap().remove(LABEL_ACTION_SEQUENCE);
        unlabeled.status = Some(HealingActionStatus {
            phase: ActionPhase::Succeeded,
            ..HealingActionStatus::default()
        });

        let next = plan(&policy_ref(), &spec(), &snapshot, &[unlabeled], no_cooldown);

        assert_eq!(next.candidates[0].sequence, 5);
    }

    #[test]
    fn cooldown_suppresses() {
        let plan = plan(&policy_ref(), &spec(), &snapshot(&[("web", 95.0)]), &[], |_| {
            Some(Duration::seconds(120))
        });
        assert!(plan.candidates.is_empty());
        assert_eq!(
            plan.suppressed[0].reason,
            Suppression::Cooldown {
                remaining_seconds: 120
            }
        );
    }

    #[test]
    fn failed_targets_are_isolated() {
        let mut targets = snapshot(&[("web", 95.0)]);
        targets.insert(
            TargetRef::new(TargetKind::Deployment, Some("apps"), "broken"),
            Err("query timed out".to_string()),
        );
        let plan = plan(&policy_ref(), &spec(), &targets, &[], no_cooldown);
        assert_eq!(plan.candidates.len(), 1);
        assert_eq!(plan.target_errors.len(), 1);
    }

    #[test]
    fn substitution_borrows_parameters_from_template() {
        let mut spec = spec();
        spec.actions.push(ActionTemplate {
            name: Some("scale-out".to_string()),
            action_type: ActionType::Scale,
            triggers: vec!["cpu-high".to_string()],
            replicas: Some(5),
            patch: None,
        });
        assert!(spec.validate().is_ok());
        let candidate = plan(&policy_ref(), &spec, &snapshot(&[("web", 95.0)]), &[], no_cooldown)
            .candidates
            .remove(0);
        let consultation = Consultation {
            recommendation: Recommendation::Substitute {
                action_type: ActionType::Scale,
                confidence: 0.9,
            },
            degraded: false,
            model: Some("advisor".to_string()),
        };

        let adjusted = apply_consultation(candidate, &consultation, &spec).unwrap();

        assert_eq!(adjusted.action_type, ActionType::Scale);
        assert_eq!(adjusted.replicas, Some(5));
        assert_eq!(
            adjusted.analysis.unwrap().original_action_type,
            Some(ActionType::RestartWorkload)
        );
    }

    #[test]
    fn suppress_drops_candidate() {
        let candidate = plan(&policy_ref(), &spec(), &snapshot(&[("web", 95.0)]), &[], no_cooldown)
            .candidates
            .remove(0);
        let consultation = Consultation {
            recommendation: Recommendation::Suppress { confidence: 0.95 },
            degraded: false,
            model: Some("advisor".to_string()),
        };
        assert!(apply_consultation(candidate, &consultation, &spec()).is_none());
    }

    #[test]
    fn materialized_action_carries_owner_and_labels() {
        let candidate = plan(&policy_ref(), &spec(), &snapshot(&[("web", 95.0)]), &[], no_cooldown)
            .candidates
            .remove(0);
        let action = materialize(&policy(), &candidate);
        let labels = action.metadata.labels.as_ref().unwrap();
        assert_eq!(labels.get(LABEL_POLICY).map(String::as_str), Some("cpu"));
        assert_eq!(labels.get(LABEL_ACTION_TYPE).map(String::as_str), Some("restart-workload"));
        let owners = action.metadata.owner_references.unwrap();
        assert_eq!(owners[0].kind, "HealingPolicy");
        assert_eq!(owners[0].controller, Some(true));
    }
}
