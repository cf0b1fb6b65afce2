//! `HealingPolicy` Custom Resource Definition
//!
//! A policy declares when a workload is unhealthy (triggers), which workloads it
//! covers (target selector), what to do about it (ordered action templates) and the
//! limits any remediation must respect (safety).

use super::healingaction::{ActionType, TargetKind};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

fn default_max_concurrent() -> u32 {
    1
}

fn default_cooldown_seconds() -> u64 {
    300 // 5 minutes
}

fn default_max_actions_per_window() -> u32 {
    5
}

fn default_window_seconds() -> u64 {
    3600 // 1 hour
}

fn default_max_targets_per_window() -> u32 {
    3
}

/// Comparison applied between a metric value and a threshold
#[derive(Deserialize, Serialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq, Default)]
pub enum Comparator {
    #[default]
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
}

impl Comparator {
    #[must_use]
    pub fn holds(self, value: f64, threshold: f64) -> bool {
        match self {
            Comparator::Gt => value > threshold,
            Comparator::Ge => value >= threshold,
            Comparator::Lt => value < threshold,
            Comparator::Le => value <= threshold,
            Comparator::Eq => (value - threshold).abs() < f64::EPSILON,
            Comparator::Ne => (value - threshold).abs() >= f64::EPSILON,
        }
    }
}

impl fmt::Display for Comparator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = match self {
            Comparator::Gt => ">",
            Comparator::Ge => ">=",
            Comparator::Lt => "<",
            Comparator::Le => "<=",
            Comparator::Eq => "==",
            Comparator::Ne => "!=",
        };
        f.write_str(op)
    }
}

/// A single trigger condition: either a metric threshold or a firing alert
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TriggerSpec {
    /// Unique name of the trigger within the policy
    pub name: String,

    /// Metric to compare (e.g. "cpu_utilization")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metric: Option<String>,

    /// Comparison operator for metric triggers
    #[serde(default)]
    pub operator: Comparator,

    /// Threshold for metric triggers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f64>,

    /// Alert name for alert triggers; satisfied while the alert is firing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alert: Option<String>,
}

impl TriggerSpec {
    /// Key under which the metrics source reports the signal for this trigger
    #[must_use]
    pub fn signal_name(&self) -> Option<String> {
        match (&self.metric, &self.alert) {
            (Some(metric), None) => Some(metric.clone()),
            (None, Some(alert)) => Some(alert_signal_name(alert)),
            _ => None,
        }
    }

    /// Whether the trigger is satisfied by the given signal value
    #[must_use]
    pub fn is_satisfied_by(&self, value: f64) -> bool {
        if self.alert.is_some() {
            return value > 0.0;
        }
        self.threshold
            .is_some_and(|threshold| self.operator.holds(value, threshold))
    }
}

/// Metric key used for firing-alert signals
#[must_use]
pub fn alert_signal_name(alert: &str) -> String {
    format!("alert:{alert}")
}

/// Which resources the policy watches
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TargetSelector {
    /// Kind of resource to select
    pub kind: TargetKind,

    /// Namespace to select from (defaults to the policy's namespace)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// Label equality selector
    #[serde(default)]
    pub match_labels: BTreeMap<String, String>,
}

impl TargetSelector {
    /// Render `match_labels` as a Kubernetes label selector string
    #[must_use]
    pub fn label_selector(&self) -> String {
        self.match_labels
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Template used to materialize a `HealingAction`
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ActionTemplate {
    /// Optional template name (recorded on the action)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Remediation to perform
    #[serde(rename = "type")]
    pub action_type: ActionType,

    /// Triggers this template answers; empty means every trigger
    #[serde(default)]
    pub triggers: Vec<String>,

    /// Replica count for `Scale`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    /// Merge patch body for `Patch`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch: Option<serde_json::Value>,
}

impl ActionTemplate {
    #[must_use]
    pub fn applies_to(&self, trigger: &str) -> bool {
        self.triggers.is_empty() || self.triggers.iter().any(|t| t == trigger)
    }
}

/// Safety limits enforced before any remediation runs
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SafetySpec {
    /// Maximum actions in flight per target
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_actions: u32,

    /// Minimum seconds between actions on the same target
    #[serde(default = "default_cooldown_seconds")]
    pub cooldown_seconds: u64,

    /// Simulate every action instead of mutating the cluster
    #[serde(default)]
    pub dry_run: bool,

    /// Hold actions until an operator approves them
    #[serde(default)]
    pub require_approval: bool,

    /// Maximum actions per target inside the rate-limit window
    #[serde(default = "default_max_actions_per_window")]
    pub max_actions_per_window: u32,

    /// Length of the rate-limit and blast-radius window
    #[serde(default = "default_window_seconds")]
    pub window_seconds: u64,

    /// Maximum distinct targets the policy may touch inside the window
    #[serde(default = "default_max_targets_per_window")]
    pub max_targets_per_window: u32,
}

impl Default for SafetySpec {
    fn default() -> Self {
        Self {
            max_concurrent_actions: default_max_concurrent(),
            cooldown_seconds: default_cooldown_seconds(),
            dry_run: false,
            require_approval: false,
            max_actions_per_window: default_max_actions_per_window(),
            window_seconds: default_window_seconds(),
            max_targets_per_window: default_max_targets_per_window(),
        }
    }
}

/// `HealingPolicy` CRD
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(group = "remediation.platform", version = "v1", kind = "HealingPolicy")]
#[kube(namespaced)]
#[kube(status = "HealingPolicyStatus")]
#[kube(printcolumn = r#"{"name":"Target","type":"string","jsonPath":".spec.target.kind"}"#)]
#[kube(printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#)]
#[kube(printcolumn = r#"{"name":"Active","type":"integer","jsonPath":".status.activeActions"}"#)]
#[kube(printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#)]
#[serde(rename_all = "camelCase")]
pub struct HealingPolicySpec {
    /// Conditions that warrant remediation
    pub triggers: Vec<TriggerSpec>,

    /// Resources covered by this policy
    pub target: TargetSelector,

    /// Ordered remediation templates; the first one matching a trigger wins
    pub actions: Vec<ActionTemplate>,

    /// Safety limits
    #[serde(default)]
    pub safety: SafetySpec,

    /// Seconds between evaluation passes (controller default when unset)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evaluation_interval_seconds: Option<u64>,

    /// Pause evaluation without deleting the policy
    #[serde(default)]
    pub suspend: bool,
}

impl HealingPolicySpec {
    /// Validate the policy; errors are surfaced on the policy status and never retried
    pub fn validate(&self) -> Result<(), String> {
        if self.triggers.is_empty() {
            return Err("policy declares no triggers".to_string());
        }
        if self.actions.is_empty() {
            return Err("policy declares no action templates".to_string());
        }

        let mut names = BTreeSet::new();
        for trigger in &self.triggers {
            if trigger.name.trim().is_empty() {
                return Err("trigger name must not be empty".to_string());
            }
            if !names.insert(trigger.name.as_str()) {
                return Err(format!("duplicate trigger name '{}'", trigger.name));
            }
            match (&trigger.metric, &trigger.alert) {
                (Some(_), Some(_)) | (None, None) => {
                    return Err(format!(
                        "trigger '{}' must set exactly one of metric or alert",
                        trigger.name
                    ));
                }
                (Some(_), None) if trigger.threshold.is_none() => {
                    return Err(format!(
                        "metric trigger '{}' requires a threshold",
                        trigger.name
                    ));
                }
                _ => {}
            }
        }

        for template in &self.actions {
            if !template.action_type.supports(self.target.kind) {
                return Err(format!(
                    "action {} cannot target {}",
                    template.action_type, self.target.kind
                ));
            }
            for trigger in &template.triggers {
                if !names.contains(trigger.as_str()) {
                    return Err(format!(
                        "action template references unknown trigger '{trigger}'"
                    ));
                }
            }
            match template.action_type {
                ActionType::Scale if !matches!(template.replicas, Some(r) if r >= 0) => {
                    return Err("scale action requires a non-negative replicas value".to_string());
                }
                ActionType::Patch
                    if !template
                        .patch
                        .as_ref()
                        .is_some_and(serde_json::Value::is_object) =>
                {
                    return Err("patch action requires an object patch body".to_string());
                }
                _ => {}
            }
        }

        if self.safety.max_concurrent_actions == 0 {
            return Err("safety.maxConcurrentActions must be at least 1".to_string());
        }
        if self.safety.window_seconds == 0 {
            return Err("safety.windowSeconds must be greater than zero".to_string());
        }

        Ok(())
    }

    /// First template (in declared order) that answers the trigger
    #[must_use]
    pub fn template_for(&self, trigger: &str) -> Option<&ActionTemplate> {
        self.actions.iter().find(|t| t.applies_to(trigger))
    }
}

/// Phase of a policy as seen by operators
#[derive(Deserialize, Serialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq)]
pub enum PolicyPhase {
    Active,
    Invalid,
    Suspended,
    Degraded,
}

/// Status of the `HealingPolicy`
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HealingPolicyStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<PolicyPhase>,

    /// Human-readable detail about the last pass
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// When the last evaluation pass finished (RFC3339)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_evaluation_time: Option<String>,

    /// Non-terminal actions owned by this policy
    #[serde(default)]
    pub active_actions: u32,

    /// Result label of the last pass (triggered, idle, suppressed, degraded)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_result: Option<String>,

    /// Whether the analyzer failed during the last pass
    #[serde(default)]
    pub analyzer_degraded: bool,

    /// Generation observed by the last pass
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}
