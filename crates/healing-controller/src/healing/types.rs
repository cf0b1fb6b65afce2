use super::action::IllegalTransition;
use super::config::ControllerConfig;
use super::metrics::HealingMetrics;
use super::remediation::cluster::ClusterError;
use super::remediation::{ActionRecorder, RemediationEngine};
use super::safety::SafetyController;
use super::signals::{AnalyzerHandle, MetricsSource, SignalError};
use kube::Client;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Label carrying the owning policy name on every `HealingAction`
pub const LABEL_POLICY: &str = "remediation.platform/policy";
/// Label carrying the hash of the (policy, target, trigger) key
pub const LABEL_ACTION_KEY: &str = "remediation.platform/key";
/// Label carrying the per-key sequence number baked into the action name
pub const LABEL_ACTION_SEQUENCE: &str = "remediation.platform/sequence";
/// Label carrying the action type
pub const LABEL_ACTION_TYPE: &str = "remediation.platform/action-type";
/// Operator approval annotation: "approved" or "rejected"
pub const ANNOTATION_APPROVAL: &str = "remediation.platform/approval";
/// Pod-template annotation stamped by a workload restart (at-most-once marker)
pub const ANNOTATION_RESTARTED_BY: &str = "remediation.platform/restarted-by";
/// Deployment annotation stamped by a rollback (at-most-once marker)
pub const ANNOTATION_ROLLED_BACK_BY: &str = "remediation.platform/rolled-back-by";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Object is missing a name or namespace")]
    MissingObjectKey,

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Metrics collection failed: {0}")]
    SignalError(#[from] SignalError),

    #[error("Cluster operation failed: {0}")]
    ClusterError(#[from] ClusterError),

    #[error("Refusing status write: {0}")]
    IllegalTransition(#[from] IllegalTransition),
}

impl Error {
    /// Configuration errors are surfaced on status and never retried
    #[must_use]
    pub fn is_config_error(&self) -> bool {
        matches!(self, Error::ConfigError(_) | Error::MissingObjectKey)
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Shared state handed to both reconcile loops
#[derive(Clone)]
pub struct Context {
    pub client: Client,
    pub config: Arc<ControllerConfig>,
    pub safety: Arc<SafetyController>,
    pub engine: Arc<RemediationEngine>,
    pub recorder: Arc<ActionRecorder>,
    pub metrics: Arc<HealingMetrics>,
    pub metrics_source: Arc<dyn MetricsSource>,
    pub analyzer: AnalyzerHandle,
    pub shutdown: CancellationToken,
}
