//! Cluster mutations behind a mockable trait.

use crate::crds::{TargetKind, TargetRef};
use crate::healing::types::{ANNOTATION_RESTARTED_BY, ANNOTATION_ROLLED_BACK_BY};
use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, ReplicaSet, StatefulSet};
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::api::{Api, ApiResource, DeleteParams, DynamicObject, ListParams, Patch, PatchParams};
use kube::{Client, ResourceExt};
use serde_json::json;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info};

const REVISION_ANNOTATION: &str = "deployment.kubernetes.io/revision";
const FIELD_MANAGER: &str = "healing-controller";

/// Failure of a single cluster call, split into retryable and terminal kinds
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClusterError {
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("API unavailable: {0}")]
    Unavailable(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("invalid request: {0}")]
    Invalid(String),
}

impl ClusterError {
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ClusterError::Conflict(_)
                | ClusterError::Timeout(_)
                | ClusterError::RateLimited(_)
                | ClusterError::Unavailable(_)
        )
    }

    /// Reason string written to `status.reason`
    #[must_use]
    pub fn reason(&self) -> &'static str {
        match self {
            ClusterError::Conflict(_) => "Conflict",
            ClusterError::Timeout(_) => "Timeout",
            ClusterError::RateLimited(_) => "RateLimited",
            ClusterError::Unavailable(_) => "Unavailable",
            ClusterError::NotFound(_) => "NotFound",
            ClusterError::Forbidden(_) => "Forbidden",
            ClusterError::Invalid(_) => "Invalid",
        }
    }
}

impl From<kube::Error> for ClusterError {
    fn from(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(response) => {
                let message = format!("{} ({})", response.message, response.reason);
                match response.code {
                    409 => ClusterError::Conflict(message),
                    429 => ClusterError::RateLimited(message),
                    404 => ClusterError::NotFound(message),
                    401 | 403 => ClusterError::Forbidden(message),
                    400 | 422 => ClusterError::Invalid(message),
                    code if code >= 500 => ClusterError::Unavailable(message),
                    _ => ClusterError::Invalid(message),
                }
            }
            // Transport-level failures: the API server may come back.
            other => ClusterError::Unavailable(other.to_string()),
        }
    }
}

/// Mutations the remediation engine performs
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ClusterOps: Send + Sync {
    /// Delete a pod so its controller recreates it
    async fn restart_pod(&self, target: &TargetRef) -> Result<(), ClusterError>;

    /// Roll a workload's pods. `stamp` identifies the action; a workload that
    /// already carries it is left alone.
    async fn restart_workload(&self, target: &TargetRef, stamp: &str) -> Result<(), ClusterError>;

    async fn scale(&self, target: &TargetRef, replicas: i32) -> Result<(), ClusterError>;

    /// Apply a JSON merge patch
    async fn patch(&self, target: &TargetRef, patch: &serde_json::Value)
        -> Result<(), ClusterError>;

    async fn cordon(&self, node: &TargetRef) -> Result<(), ClusterError>;

    /// Revert a Deployment to its previous `ReplicaSet` revision, at most once per `stamp`
    async fn rollback(&self, target: &TargetRef, stamp: &str) -> Result<(), ClusterError>;
}

/// `ClusterOps` against a live API server, every call bounded by `api_timeout`
pub struct KubeClusterOps {
    client: Client,
    api_timeout: Duration,
}

impl KubeClusterOps {
    #[must_use]
    pub fn new(client: Client, api_timeout: Duration) -> Self {
        Self {
            client,
            api_timeout,
        }
    }

    async fn bounded<T, F>(&self, op: &str, target: &TargetRef, fut: F) -> Result<T, ClusterError>
    where
        F: Future<Output = Result<T, kube::Error>>,
    {
        match tokio::time::timeout(self.api_timeout, fut).await {
            Ok(result) => result.map_err(ClusterError::from),
            Err(_) => Err(ClusterError::Timeout(format!(
                "{op} on {target} exceeded {}s",
                self.api_timeout.as_secs()
            ))),
        }
    }

    fn namespace<'a>(target: &'a TargetRef) -> Result<&'a str, ClusterError> {
        target
            .namespace
            .as_deref()
            .ok_or_else(|| ClusterError::Invalid(format!("{target} has no namespace")))
    }

    fn workload_api(&self, target: &TargetRef) -> Result<Api<DynamicObject>, ClusterError> {
        let resource = match target.kind {
            TargetKind::Deployment => ApiResource::erase::<Deployment>(&()),
            TargetKind::StatefulSet => ApiResource::erase::<StatefulSet>(&()),
            TargetKind::DaemonSet => ApiResource::erase::<DaemonSet>(&()),
            TargetKind::Pod | TargetKind::Node => {
                return Err(ClusterError::Invalid(format!("{target} is not a workload")));
            }
        };
        let namespace = Self::namespace(target)?;
        Ok(Api::namespaced_with(self.client.clone(), namespace, &resource))
    }

    async fn merge_patch(
        &self,
        op: &str,
        api: &Api<DynamicObject>,
        target: &TargetRef,
        body: &serde_json::Value,
    ) -> Result<(), ClusterError> {
        let params = PatchParams::apply(FIELD_MANAGER);
        self.bounded(op, target, api.patch(&target.name, &params, &Patch::Merge(body)))
            .await
            .map(|_| ())
    }
}

#[async_trait]
impl ClusterOps for KubeClusterOps {
    async fn restart_pod(&self, target: &TargetRef) -> Result<(), ClusterError> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), Self::namespace(target)?);
        self.bounded(
            "delete pod",
            target,
            api.delete(&target.name, &DeleteParams::default()),
        )
        .await?;
        info!(target = %target, "Deleted pod for restart");
        Ok(())
    }

    async fn restart_workload(&self, target: &TargetRef, stamp: &str) -> Result<(), ClusterError> {
        let api = self.workload_api(target)?;
        let current = self.bounded("get workload", target, api.get(&target.name)).await?;

        let existing = current
            .data
            .pointer("/spec/template/metadata/annotations")
            .and_then(|annotations| annotations.get(ANNOTATION_RESTARTED_BY))
            .and_then(serde_json::Value::as_str);
        if existing == Some(stamp) {
            debug!(target = %target, stamp, "Workload already restarted by this action");
            return Ok(());
        }

        let body = json!({
            "spec": {
                "template": {
                    "metadata": {
                        "annotations": {
                            ANNOTATION_RESTARTED_BY: stamp,
                            "kubectl.kubernetes.io/restartedAt": Utc::now().to_rfc3339(),
                        }
                    }
                }
            }
        });
        self.merge_patch("restart workload", &api, target, &body).await?;
        info!(target = %target, "Triggered rolling restart");
        Ok(())
    }

    async fn scale(&self, target: &TargetRef, replicas: i32) -> Result<(), ClusterError> {
        if !matches!(target.kind, TargetKind::Deployment | TargetKind::StatefulSet) {
            return Err(ClusterError::Invalid(format!("{target} cannot be scaled")));
        }
        let api = self.workload_api(target)?;
        let body = json!({ "spec": { "replicas": replicas } });
        self.merge_patch("scale", &api, target, &body).await?;
        info!(target = %target, replicas, "Scaled workload");
        Ok(())
    }

    async fn patch(
        &self,
        target: &TargetRef,
        patch: &serde_json::Value,
    ) -> Result<(), ClusterError> {
        let params = PatchParams::apply(FIELD_MANAGER);
        match target.kind {
            TargetKind::Pod => {
                let api: Api<Pod> = Api::namespaced(self.client.clone(), Self::namespace(target)?);
                self.bounded("patch", target, api.patch(&target.name, &params, &Patch::Merge(patch)))
                    .await?;
            }
            TargetKind::Node => {
                let api: Api<Node> = Api::all(self.client.clone());
                self.bounded("patch", target, api.patch(&target.name, &params, &Patch::Merge(patch)))
                    .await?;
            }
            _ => {
                let api = self.workload_api(target)?;
                self.merge_patch("patch", &api, target, patch).await?;
            }
        }
        info!(target = %target, "Patched target");
        Ok(())
    }

    async fn cordon(&self, node: &TargetRef) -> Result<(), ClusterError> {
        if node.kind != TargetKind::Node {
            return Err(ClusterError::Invalid(format!("{node} is not a node")));
        }
        let api: Api<Node> = Api::all(self.client.clone());
        let body = json!({ "spec": { "unschedulable": true } });
        let params = PatchParams::apply(FIELD_MANAGER);
        self.bounded("cordon", node, api.patch(&node.name, &params, &Patch::Merge(&body)))
            .await?;
        info!(node = %node.name, "Cordoned node");
        Ok(())
    }

    async fn rollback(&self, target: &TargetRef, stamp: &str) -> Result<(), ClusterError> {
        if target.kind != TargetKind::Deployment {
            return Err(ClusterError::Invalid(format!("{target} cannot be rolled back")));
        }
        let namespace = Self::namespace(target)?;
        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        let deployment = self
            .bounded("get deployment", target, deployments.get(&target.name))
            .await?;

        if deployment.annotations().get(ANNOTATION_ROLLED_BACK_BY).map(String::as_str) == Some(stamp) {
            debug!(target = %target, stamp, "Deployment already rolled back by this action");
            return Ok(());
        }

        let current_revision = revision_of(deployment.annotations())
            .ok_or_else(|| ClusterError::Invalid(format!("{target} has no revision annotation")))?;
        let selector = deployment
            .spec
            .as_ref()
            .and_then(|spec| spec.selector.match_labels.as_ref())
            .map(|labels| {
                labels
                    .iter()
                    .map(|(k, v)| format!("{k}={v}"))
                    .collect::<Vec<_>>()
                    .join(",")
            })
            .unwrap_or_default();
        let owner_uid = deployment.uid();

        let replica_sets: Api<ReplicaSet> = Api::namespaced(self.client.clone(), namespace);
        let listed = self
            .bounded(
                "list replicasets",
                target,
                replica_sets.list(&ListParams::default().labels(&selector)),
            )
            .await?;

        let previous = listed
            .items
            .into_iter()
            .filter(|rs| {
                rs.owner_references()
                    .iter()
                    .any(|owner| Some(&owner.uid) == owner_uid.as_ref())
            })
            .filter_map(|rs| revision_of(rs.annotations()).map(|rev| (rev, rs)))
            .filter(|(rev, _)| *rev < current_revision)
            .max_by_key(|(rev, _)| *rev)
            .map(|(_, rs)| rs)
            .ok_or_else(|| {
                ClusterError::Invalid(format!("{target} has no revision before {current_revision}"))
            })?;

        let mut template = previous
            .spec
            .and_then(|spec| spec.template)
            .ok_or_else(|| ClusterError::Invalid(format!("{target} previous revision has no template")))?;
        if let Some(labels) = template.metadata.as_mut().and_then(|m| m.labels.as_mut()) {
            labels.remove("pod-template-hash");
        }

        let body = json!({
            "metadata": { "annotations": { ANNOTATION_ROLLED_BACK_BY: stamp } },
            "spec": { "template": template },
        });
        let params = PatchParams::apply(FIELD_MANAGER);
        self.bounded(
            "rollback",
            target,
            deployments.patch(&target.name, &params, &Patch::Merge(&body)),
        )
        .await?;
        info!(target = %target, from = current_revision, "Rolled back deployment");
        Ok(())
    }
}

fn revision_of(annotations: &std::collections::BTreeMap<String, String>) -> Option<u64> {
    annotations
        .get(REVISION_ANNOTATION)
        .and_then(|raw| raw.trim().parse().ok())
}
