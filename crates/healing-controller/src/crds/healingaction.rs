//! `HealingAction` Custom Resource Definition for materialized remediation intents

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of cluster object a remediation can target
#[derive(Deserialize, Serialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TargetKind {
    Pod,
    Deployment,
    StatefulSet,
    DaemonSet,
    Node,
}

impl TargetKind {
    /// Nodes are cluster scoped, everything else lives in a namespace
    #[must_use]
    pub fn is_namespaced(self) -> bool {
        !matches!(self, TargetKind::Node)
    }

    /// Workload controllers that own a pod template
    #[must_use]
    pub fn is_workload(self) -> bool {
        matches!(
            self,
            TargetKind::Deployment | TargetKind::StatefulSet | TargetKind::DaemonSet
        )
    }
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            TargetKind::Pod => "Pod",
            TargetKind::Deployment => "Deployment",
            TargetKind::StatefulSet => "StatefulSet",
            TargetKind::DaemonSet => "DaemonSet",
            TargetKind::Node => "Node",
        };
        f.write_str(kind)
    }
}

/// Fully resolved reference to a single target resource, keyed by (kind, namespace, name)
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TargetRef {
    pub kind: TargetKind,

    /// Namespace of the target (absent for cluster-scoped kinds)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    pub name: String,
}

impl TargetRef {
    #[must_use]
    pub fn new(kind: TargetKind, namespace: Option<&str>, name: &str) -> Self {
        Self {
            kind,
            namespace: if kind.is_namespaced() {
                namespace.map(ToString::to_string)
            } else {
                None
            },
            name: name.to_string(),
        }
    }
}

impl fmt::Display for TargetRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}/{}", self.kind, ns, self.name),
            None => write!(f, "{}/{}", self.kind, self.name),
        }
    }
}

/// Remediation to perform against the target
#[derive(Deserialize, Serialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq, Hash)]
pub enum ActionType {
    /// Delete a pod so its controller recreates it
    RestartPod,
    /// Rollout restart of a Deployment/StatefulSet/DaemonSet
    RestartWorkload,
    /// Set the replica count of a Deployment/StatefulSet
    Scale,
    /// JSON merge patch against a workload
    Patch,
    /// Mark a node unschedulable
    Cordon,
    /// Revert a Deployment to its previous revision
    Rollback,
}

impl ActionType {
    /// Whether this action can be applied to the given kind of target
    #[must_use]
    pub fn supports(self, kind: TargetKind) -> bool {
        match self {
            ActionType::RestartPod => kind == TargetKind::Pod,
            ActionType::RestartWorkload | ActionType::Patch => kind.is_workload(),
            ActionType::Scale => {
                matches!(kind, TargetKind::Deployment | TargetKind::StatefulSet)
            }
            ActionType::Cordon => kind == TargetKind::Node,
            ActionType::Rollback => kind == TargetKind::Deployment,
        }
    }

    /// Stable lowercase label used in metrics and log fields
    #[must_use]
    pub fn as_label(self) -> &'static str {
        match self {
            ActionType::RestartPod => "restart_pod",
            ActionType::RestartWorkload => "restart_workload",
            ActionType::Scale => "scale",
            ActionType::Patch => "patch",
            ActionType::Cordon => "cordon",
            ActionType::Rollback => "rollback",
        }
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_label())
    }
}

/// Lifecycle of a `HealingAction`
#[derive(Deserialize, Serialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq, Hash, Default)]
pub enum ActionPhase {
    #[default]
    Pending,
    Validating,
    Approved,
    Denied,
    Executing,
    Retrying,
    Succeeded,
    Failed,
}

impl fmt::Display for ActionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Terminal outcome of an execution, as written to the audit ledger
#[derive(Deserialize, Serialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq, Hash)]
pub enum ActionOutcome {
    Succeeded,
    Failed,
    RolledBack,
}

impl ActionOutcome {
    #[must_use]
    pub fn as_label(self) -> &'static str {
        match self {
            ActionOutcome::Succeeded => "succeeded",
            ActionOutcome::Failed => "failed",
            ActionOutcome::RolledBack => "rolled_back",
        }
    }

    #[must_use]
    pub fn is_success(self) -> bool {
        !matches!(self, ActionOutcome::Failed)
    }
}

/// Reference to the owning `HealingPolicy`
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PolicyRef {
    pub namespace: String,
    pub name: String,
}

impl fmt::Display for PolicyRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Analyzer opinion captured when the action was materialized
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisNote {
    /// Model that produced the recommendation
    pub model: String,

    /// "confirm" or "substitute"
    pub recommendation: String,

    /// Confidence score in [0, 1]
    pub confidence: f64,

    /// Rule-based action type that the analyzer replaced, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_action_type: Option<ActionType>,
}

/// `HealingAction` CRD: one remediation attempt derived from a policy
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(group = "remediation.platform", version = "v1", kind = "HealingAction")]
#[kube(namespaced)]
#[kube(status = "HealingActionStatus")]
#[kube(printcolumn = r#"{"name":"Policy","type":"string","jsonPath":".spec.policyRef.name"}"#)]
#[kube(printcolumn = r#"{"name":"Action","type":"string","jsonPath":".spec.actionType"}"#)]
#[kube(printcolumn = r#"{"name":"Target","type":"string","jsonPath":".spec.target.name"}"#)]
#[kube(printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#)]
#[kube(printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#)]
#[serde(rename_all = "camelCase")]
pub struct HealingActionSpec {
    /// Owning policy
    pub policy_ref: PolicyRef,

    /// Name of the trigger that fired
    pub trigger: String,

    /// Remediation to perform
    pub action_type: ActionType,

    /// Resource the remediation applies to
    pub target: TargetRef,

    /// Desired replica count for `Scale`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    /// Merge patch body for `Patch`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch: Option<serde_json::Value>,

    /// Name of the policy action template this was built from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,

    /// Analyzer opinion, when one was given
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analysis: Option<AnalysisNote>,
}

/// Status of the `HealingAction`
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HealingActionStatus {
    /// Current lifecycle phase
    #[serde(default)]
    pub phase: ActionPhase,

    /// Machine-readable reason for the last transition (e.g. Cooldown, NotFound)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Human-readable detail about the current state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Execution attempts made so far
    #[serde(default)]
    pub attempts: u32,

    /// Whether execution was simulated (dry-run)
    #[serde(default)]
    pub simulated: bool,

    /// Terminal outcome once execution finished
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<ActionOutcome>,

    /// When the safety verdict was reached (RFC3339)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validated_at: Option<String>,

    /// When execution first started (RFC3339)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,

    /// When a terminal state was reached (RFC3339)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,

    /// Last status write (RFC3339)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update: Option<String>,
}

impl HealingAction {
    /// Current phase, `Pending` when no status has been written yet
    #[must_use]
    pub fn phase(&self) -> ActionPhase {
        self.status.as_ref().map(|s| s.phase).unwrap_or_default()
    }

    /// Stable identity used by the safety store and the audit ledger
    #[must_use]
    pub fn action_id(&self) -> String {
        format!(
            "{}/{}",
            self.metadata.namespace.as_deref().unwrap_or("default"),
            self.metadata.name.as_deref().unwrap_or_default()
        )
    }

    /// Attempts recorded on the status subresource
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.status.as_ref().map_or(0, |s| s.attempts)
    }
}
