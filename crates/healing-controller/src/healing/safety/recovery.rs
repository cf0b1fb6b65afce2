//! Startup reconstruction of safety state.
//!
//! Counters live in memory only, so after a restart they are rebuilt from
//! the `HealingAction` objects the API server still holds: admitted actions
//! take their in-flight slot back, and recent admissions restore the
//! cooldown anchor plus the rate-limit and blast-radius windows.

use super::{seconds, SafetyController, SafetyKey};
use crate::crds::{ActionPhase, HealingAction, PolicyRef, SafetySpec};
use crate::healing::action::PhaseExt;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryReport {
    /// Admitted actions put back into the in-flight set
    pub adopted: usize,
    /// Admissions replayed into cooldown and window state
    pub restored: usize,
    pub skipped: usize,
}

/// Replay `actions` into `safety`.
///
/// `policies` maps each live policy to its safety settings. Terminal actions
/// of a policy that no longer exists are skipped; admitted ones are still
/// adopted since they will run to completion.
pub fn rebuild(
    safety: &SafetyController,
    actions: &[HealingAction],
    policies: &BTreeMap<PolicyRef, SafetySpec>,
    now: DateTime<Utc>,
) -> RecoveryReport {
    let store = safety.store();
    let mut report = RecoveryReport::default();

    for action in actions {
        let phase = action.phase();
        let admitted = phase.is_admitted();
        let was_admitted = admitted || matches!(phase, ActionPhase::Succeeded | ActionPhase::Failed);
        if !was_admitted {
            report.skipped += 1;
            continue;
        }

        let key = SafetyKey::new(action.spec.policy_ref.clone(), action.spec.target.clone());
        let simulated = action.status.as_ref().is_some_and(|s| s.simulated);
        let action_id = action.action_id();

        if admitted && !simulated {
            store.adopt(&key, &action_id);
            report.adopted += 1;
        }

        let Some(spec) = policies.get(&key.policy) else {
            if !admitted {
                report.skipped += 1;
            }
            continue;
        };
        let admitted_at = admission_time(action).unwrap_or(now);
        let cooldown = seconds(spec.cooldown_seconds);
        let window_len = seconds(spec.window_seconds);
        if admitted_at + cooldown.max(window_len) <= now && !admitted {
            debug!(action = %action_id, "Admission outside every window, not replayed");
            report.skipped += 1;
            continue;
        }

        store.restore_admission(&key, admitted_at, cooldown, window_len, !simulated);
        report.restored += 1;
    }

    info!(
        adopted = report.adopted,
        restored = report.restored,
        skipped = report.skipped,
        "Rebuilt safety state from persisted actions"
    );
    report
}

fn admission_time(action: &HealingAction) -> Option<DateTime<Utc>> {
    let status = action.status.as_ref()?;
    status
        .validated_at
        .as_deref()
        .or(status.started_at.as_deref())
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|at| at.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crds::{ActionType, HealingActionSpec, HealingActionStatus, TargetKind, TargetRef};
    use crate::healing::metrics::HealingMetrics;
    use crate::healing::safety::ActionStore;
    use chrono::Duration;
    use std::sync::Arc;

    fn policy_ref() -> PolicyRef {
        PolicyRef {
            namespace: "apps".to_string(),
            name: "cpu".to_string(),
        }
    }

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    fn action(name: &str, target: &str, phase: ActionPhase, validated: Option<DateTime<Utc>>, simulated: bool) -> HealingAction {
        let mut action = HealingAction::new(
            name,
            HealingActionSpec {
                policy_ref: policy_ref(),
                trigger: "cpu-high".to_string(),
                action_type: ActionType::RestartWorkload,
                target: TargetRef::new(TargetKind::Deployment, Some("apps"), target),
                replicas: None,
                patch: None,
                template: None,
                analysis: None,
            },
        );
        action.metadata.namespace = Some("apps".to_string());
        action.status = Some(HealingActionStatus {
            phase,
            simulated,
            validated_at: validated.map(|t| t.to_rfc3339()),
            ..HealingActionStatus::default()
        });
        action
    }

    fn policies() -> BTreeMap<PolicyRef, SafetySpec> {
        let mut policies = BTreeMap::new();
        policies.insert(
            policy_ref(),
            SafetySpec {
                cooldown_seconds: 300,
                max_concurrent_actions: 1,
                window_seconds: 600,
                max_actions_per_window: 2,
                ..SafetySpec::default()
            },
        );
        policies
    }

    fn safety() -> SafetyController {
        SafetyController::new(Arc::new(ActionStore::new(4)), false, Arc::new(HealingMetrics::new()))
    }

    fn key(target: &str) -> SafetyKey {
        SafetyKey::new(policy_ref(), TargetRef::new(TargetKind::Deployment, Some("apps"), target))
    }

    #[test]
    fn executing_action_holds_its_slot_again() {
        let s = safety();
        let actions = vec![action("heal-cpu-1", "web", ActionPhase::Executing, Some(at(0)), false)];

        let report = rebuild(&s, &actions, &policies(), at(30));

        assert_eq!(report.adopted, 1);
        let state = s.store().snapshot(&key("web")).unwrap();
        assert!(state.in_flight.contains("apps/heal-cpu-1"));
        assert!(s.preview(&key("web"), &policies()[&policy_ref()], at(31)).is_err());
    }

    #[test]
    fn recent_success_restores_cooldown() {
        let s = safety();
        let actions = vec![action("heal-cpu-1", "web", ActionPhase::Succeeded, Some(at(0)), false)];

        rebuild(&s, &actions, &policies(), at(100));

        let spec = &policies()[&policy_ref()];
        let remaining = s.cooldown_remaining(&key("web"), spec, at(100)).unwrap();
        assert_eq!(remaining, Duration::seconds(200));
        assert_eq!(s.store().in_flight_total(), 0);
    }

    #[test]
    fn stale_and_denied_actions_are_ignored() {
        let s = safety();
        let actions = vec![
            action("heal-cpu-1", "web", ActionPhase::Succeeded, Some(at(0)), false),
            action("heal-cpu-2", "api", ActionPhase::Denied, Some(at(5_000)), false),
        ];

        let report = rebuild(&s, &actions, &policies(), at(5_000));

        assert_eq!(report.restored, 0);
        assert_eq!(report.skipped, 2);
        assert!(s.store().is_empty());
    }

    #[test]
    fn simulated_actions_anchor_without_counting() {
        let s = safety();
        let actions = vec![action("heal-cpu-1", "web", ActionPhase::Succeeded, Some(at(0)), true)];

        rebuild(&s, &actions, &policies(), at(10));

        let state = s.store().snapshot(&key("web")).unwrap();
        assert!(state.window.is_empty());
        assert_eq!(state.last_action, Some(at(0)));
    }

    #[test]
    fn orphaned_admitted_action_is_still_adopted() {
        let s = safety();
        let actions = vec![action("heal-cpu-1", "web", ActionPhase::Retrying, Some(at(0)), false)];

        let report = rebuild(&s, &actions, &BTreeMap::new(), at(10));

        assert_eq!((report.adopted, report.restored), (1, 0));
        assert_eq!(s.store().in_flight_total(), 1);
    }
}
