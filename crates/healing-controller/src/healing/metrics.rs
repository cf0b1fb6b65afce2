//! # Healing Metrics
//!
//! In-process counters for the remediation pipeline. Every observation is also
//! emitted as a structured tracing event under the `healing_metrics` target so
//! a log pipeline can aggregate it; `report()` backs the `/metrics` endpoint.

use crate::crds::ActionType;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

/// Labels for `healing_actions_total`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
struct ActionLabels {
    action_type: String,
    namespace: String,
    status: String,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct LatencySummary {
    pub count: u64,
    pub sum_seconds: f64,
}

/// Central metrics collector
pub struct HealingMetrics {
    actions: DashMap<ActionLabels, u64>,
    evaluations: DashMap<String, u64>,
    validations: DashMap<String, u64>,
    /// key: (model, status)
    analysis: DashMap<(String, String), LatencySummary>,
    start_time: DateTime<Utc>,
}

/// Snapshot served over HTTP
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsReport {
    pub uptime_seconds: i64,
    pub healing_actions_total: BTreeMap<String, u64>,
    pub policy_evaluations_total: BTreeMap<String, u64>,
    pub safety_validations_total: BTreeMap<String, u64>,
    pub ai_analysis_duration_seconds: BTreeMap<String, LatencySummary>,
}

impl Default for HealingMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl HealingMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self {
            actions: DashMap::new(),
            evaluations: DashMap::new(),
            validations: DashMap::new(),
            analysis: DashMap::new(),
            start_time: Utc::now(),
        }
    }

    /// Count a terminal action outcome (`succeeded`, `failed`, `rolled_back`,
    /// `denied`, `dry_run`)
    pub fn record_action(&self, action_type: ActionType, namespace: &str, status: &str) {
        let labels = ActionLabels {
            action_type: action_type.as_label().to_string(),
            namespace: namespace.to_string(),
            status: status.to_string(),
        };
        *self.actions.entry(labels).or_insert(0) += 1;
        debug!(
            target: "healing_metrics",
            metric = "healing_actions_total",
            action_type = action_type.as_label(),
            namespace = %namespace,
            status = %status,
            "Action outcome recorded"
        );
    }

    pub fn record_evaluation(&self, result: &str) {
        *self.evaluations.entry(result.to_string()).or_insert(0) += 1;
        debug!(
            target: "healing_metrics",
            metric = "policy_evaluations_total",
            result = %result,
            "Policy evaluation recorded"
        );
    }

    pub fn record_validation(&self, result: &str) {
        *self.validations.entry(result.to_string()).or_insert(0) += 1;
        debug!(
            target: "healing_metrics",
            metric = "safety_validations_total",
            result = %result,
            "Safety validation recorded"
        );
    }

    pub fn record_analysis(&self, model: &str, status: &str, latency: Duration) {
        let mut entry = self
            .analysis
            .entry((model.to_string(), status.to_string()))
            .or_default();
        entry.count += 1;
        entry.sum_seconds += latency.as_secs_f64();
        drop(entry);
        debug!(
            target: "healing_metrics",
            metric = "ai_analysis_duration_seconds",
            model = %model,
            status = %status,
            latency_ms = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX),
            "Analyzer call recorded"
        );
    }

    #[must_use]
    pub fn action_count(&self, action_type: ActionType, namespace: &str, status: &str) -> u64 {
        let labels = ActionLabels {
            action_type: action_type.as_label().to_string(),
            namespace: namespace.to_string(),
            status: status.to_string(),
        };
        self.actions.get(&labels).map_or(0, |v| *v)
    }

    #[must_use]
    pub fn evaluation_count(&self, result: &str) -> u64 {
        self.evaluations.get(result).map_or(0, |v| *v)
    }

    #[must_use]
    pub fn validation_count(&self, result: &str) -> u64 {
        self.validations.get(result).map_or(0, |v| *v)
    }

    #[must_use]
    pub fn analysis_count(&self, model: &str, status: &str) -> u64 {
        self.analysis
            .get(&(model.to_string(), status.to_string()))
            .map_or(0, |v| v.count)
    }

    #[must_use]
    pub fn report(&self) -> MetricsReport {
        let healing_actions_total = self
            .actions
            .iter()
            .map(|entry| {
                let l = entry.key();
                (
                    format!(
                        "action_type={},namespace={},status={}",
                        l.action_type, l.namespace, l.status
                    ),
                    *entry.value(),
                )
            })
            .collect();
        let ai_analysis_duration_seconds = self
            .analysis
            .iter()
            .map(|entry| {
                let (model, status) = entry.key();
                (format!("model={model},status={status}"), *entry.value())
            })
            .collect();

        MetricsReport {
            uptime_seconds: (Utc::now() - self.start_time).num_seconds(),
            healing_actions_total,
            policy_evaluations_total: labelled(&self.evaluations, "result"),
            safety_validations_total: labelled(&self.validations, "result"),
            ai_analysis_duration_seconds,
        }
    }
}

fn labelled(map: &DashMap<String, u64>, label: &str) -> BTreeMap<String, u64> {
    map.iter()
        .map(|entry| (format!("{label}={}", entry.key()), *entry.value()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_are_keyed_by_labels() {
        let metrics = HealingMetrics::new();
        metrics.record_action(ActionType::Scale, "apps", "succeeded");
        metrics.record_action(ActionType::Scale, "apps", "succeeded");
        metrics.record_action(ActionType::Scale, "other", "failed");

        assert_eq!(metrics.action_count(ActionType::Scale, "apps", "succeeded"), 2);
        assert_eq!(metrics.action_count(ActionType::Scale, "other", "failed"), 1);
        assert_eq!(metrics.action_count(ActionType::Cordon, "apps", "succeeded"), 0);
    }

    #[test]
    fn report_renders_label_strings() {
        let metrics = HealingMetrics::new();
        metrics.record_evaluation("triggered");
        metrics.record_validation("approved");
        metrics.record_analysis("advisor", "timeout", Duration::from_millis(1500));
        metrics.record_analysis("advisor", "timeout", Duration::from_millis(500));

        let report = metrics.report();
        assert_eq!(report.policy_evaluations_total.get("result=triggered"), Some(&1));
        assert_eq!(report.safety_validations_total.get("result=approved"), Some(&1));
        let latency = report
            .ai_analysis_duration_seconds
            .get("model=advisor,status=timeout")
            .unwrap();
        assert_eq!(latency.count, 2);
        assert!((latency.sum_seconds - 2.0).abs() < 1e-9);
    }
}
