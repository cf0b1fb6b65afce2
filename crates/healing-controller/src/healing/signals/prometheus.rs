//! Prometheus-backed [`MetricsSource`].
//!
//! Targets are resolved through the Kubernetes API from the policy's
//! selector; each signal is then read with an instant query rendered from a
//! configured `PromQL` template.

use super::{MetricsSnapshot, MetricsSource, SignalError, TargetMetrics};
use crate::crds::{alert_signal_name, TargetKind, TargetRef, TargetSelector};
use crate::healing::config::PrometheusConfig;
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::api::{Api, ListParams};
use kube::{Client, ResourceExt};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, warn};

const ALERT_QUERY_KEY: &str = "alert";

#[derive(Debug, Deserialize)]
struct PrometheusResponse {
    status: String,
    data: PrometheusData,
}

#[derive(Debug, Deserialize)]
struct PrometheusData {
    result: Vec<PrometheusResult>,
}

#[derive(Debug, Deserialize)]
struct PrometheusResult {
    value: Option<(f64, String)>,
}

/// Thin instant-query client
#[derive(Debug, Clone)]
pub struct PrometheusClient {
    base_url: String,
    client: reqwest::Client,
}

impl PrometheusClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, SignalError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SignalError::Backend(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    /// First sample of an instant query, `None` when the vector is empty
    pub async fn query_scalar(&self, query: &str) -> Result<Option<f64>, SignalError> {
        let url = format!("{}/api/v1/query", self.base_url);
        debug!(query = %query, "Executing Prometheus query");

        let response = self
            .client
            .get(&url)
            .query(&[("query", query)])
            .send()
            .await
            .map_err(|e| SignalError::Backend(format!("request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(SignalError::Backend(format!(
                "query failed with status {status}: {body}"
            )));
        }

        let parsed: PrometheusResponse = response
            .json()
            .await
            .map_err(|e| SignalError::Backend(format!("unparseable response: {e}")))?;
        if parsed.status != "success" {
            return Err(SignalError::Backend(format!(
                "query returned status {}",
                parsed.status
            )));
        }

        Ok(parsed
            .data
            .result
            .into_iter()
            .find_map(|sample| sample.value)
            .and_then(|(_, raw)| raw.parse::<f64>().ok())
            .filter(|value| value.is_finite()))
    }
}

pub struct PrometheusMetricsSource {
    client: Client,
    prometheus: PrometheusClient,
    queries: BTreeMap<String, String>,
}

impl PrometheusMetricsSource {
    pub fn new(client: Client, config: &PrometheusConfig) -> Result<Self, SignalError> {
        Ok(Self {
            client,
            prometheus: PrometheusClient::new(&config.url, Duration::from_secs(config.timeout_secs))?,
            queries: config.queries.clone(),
        })
    }

    async fn resolve_targets(
        &self,
        namespace: &str,
        selector: &TargetSelector,
    ) -> Result<Vec<TargetRef>, SignalError> {
        let selector_str = selector.label_selector();
        let params = if selector_str.is_empty() {
            ListParams::default()
        } else {
            ListParams::default().labels(&selector_str)
        };

        let names: Vec<String> = match selector.kind {
            TargetKind::Pod => names(Api::<Pod>::namespaced(self.client.clone(), namespace).list(&params).await?.items),
            TargetKind::Deployment => names(
                Api::<Deployment>::namespaced(self.client.clone(), namespace)
                    .list(&params)
                    .await?
                    .items,
            ),
            TargetKind::StatefulSet => names(
                Api::<StatefulSet>::namespaced(self.client.clone(), namespace)
                    .list(&params)
                    .await?
                    .items,
            ),
            TargetKind::DaemonSet => names(
                Api::<DaemonSet>::namespaced(self.client.clone(), namespace)
                    .list(&params)
                    .await?
                    .items,
            ),
            TargetKind::Node => names(Api::<Node>::all(self.client.clone()).list(&params).await?.items),
        };

        Ok(names
            .iter()
            .map(|name| TargetRef::new(selector.kind, Some(namespace), name))
            .collect())
    }

    async fn collect(&self, target: &TargetRef, signals: &[String]) -> Result<TargetMetrics, String> {
        let mut metrics = TargetMetrics::new();
        for signal in signals {
            let query = render_query(&self.queries, signal, target)?;
            match self.prometheus.query_scalar(&query).await {
                Ok(Some(value)) => {
                    metrics.insert(signal.clone(), value);
                }
                Ok(None) => debug!(target = %target, signal = %signal, "No sample for signal"),
                Err(e) => return Err(format!("{signal}: {e}")),
            }
        }
        Ok(metrics)
    }
}

fn names<K: ResourceExt>(items: Vec<K>) -> Vec<String> {
    items.iter().map(ResourceExt::name_any).collect()
}

/// Render the `PromQL` for `signal` against `target`
pub fn render_query(
    queries: &BTreeMap<String, String>,
    signal: &str,
    target: &TargetRef,
) -> Result<String, String> {
    let (template, alert) = match signal.strip_prefix(&alert_signal_name("")) {
        Some(alert) => (queries.get(ALERT_QUERY_KEY), alert),
        None => (queries.get(signal), ""),
    };
    let template = template.ok_or_else(|| format!("no query configured for signal '{signal}'"))?;
    Ok(template
        .replace("{namespace}", target.namespace.as_deref().unwrap_or(""))
        .replace("{name}", &target.name)
        .replace("{alert}", alert))
}

#[async_trait]
impl MetricsSource for PrometheusMetricsSource {
    async fn fetch_metrics(
        &self,
        namespace: &str,
        selector: &TargetSelector,
        signals: &[String],
    ) -> Result<MetricsSnapshot, SignalError> {
        let targets = self.resolve_targets(namespace, selector).await?;
        let mut snapshot = MetricsSnapshot::default();

        for target in targets {
            match self.collect(&target, signals).await {
                Ok(metrics) => snapshot.insert(target, metrics),
                Err(error) => {
                    warn!(target = %target, error = %error, "Metric collection failed for target");
                    snapshot.insert_error(target, error);
                }
            }
        }

        Ok(snapshot)
    }
}
