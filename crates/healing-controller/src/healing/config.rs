//! Healing Controller Configuration
//!
//! Loaded from a mounted YAML file (normally a `ConfigMap` volume). Every
//! section has defaults so an empty document yields a working controller.

use super::safety::store::MAX_BACKOFF_EXPONENT;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::warn;

/// Main controller configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ControllerConfig {
    /// Process-wide dry-run; overrides every policy's own setting
    #[serde(default)]
    pub dry_run: bool,

    /// Restrict both watchers to one namespace (all namespaces when unset)
    #[serde(default)]
    pub watch_namespace: Option<String>,

    #[serde(default)]
    pub evaluation: EvaluationConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub cluster: ClusterConfig,

    #[serde(default)]
    pub retention: RetentionConfig,

    #[serde(default)]
    pub safety: SafetyConfig,

    #[serde(default)]
    pub analyzer: AnalyzerConfig,

    #[serde(default)]
    pub prometheus: PrometheusConfig,

    #[serde(default)]
    pub server: ServerConfig,
}

/// Policy evaluation cadence
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationConfig {
    /// Used when a policy does not set `evaluationIntervalSeconds`
    #[serde(default = "default_evaluation_interval")]
    pub default_interval_seconds: u64,

    /// Requeue delay after a reconcile error
    #[serde(default = "default_error_requeue")]
    pub error_requeue_seconds: u64,
}

/// Execution retry ceiling and backoff
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

/// Cluster API call settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterConfig {
    /// Upper bound on a single mutating API call
    #[serde(default = "default_api_timeout")]
    pub api_timeout_seconds: u64,
}

/// Ledger retention and sweep cadence
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetentionConfig {
    #[serde(default = "default_action_record_hours")]
    pub action_record_hours: u64,

    #[serde(default = "default_decision_record_minutes")]
    pub decision_record_minutes: u64,

    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_seconds: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SafetyConfig {
    /// Highest exponent applied to the cooldown after consecutive failures
    #[serde(default = "default_failure_backoff_cap")]
    pub failure_backoff_cap: u32,
}

/// Optional AI analyzer endpoint
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyzerConfig {
    /// No analyzer is consulted when unset
    #[serde(default)]
    pub endpoint: Option<String>,

    #[serde(default = "default_analyzer_model")]
    pub model: String,

    #[serde(default = "default_analyzer_timeout_ms")]
    pub timeout_ms: u64,

    /// Recommendations below this confidence are treated as no opinion
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,
}

/// Prometheus metrics source
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrometheusConfig {
    #[serde(default = "default_prometheus_url")]
    pub url: String,

    #[serde(default = "default_prometheus_timeout")]
    pub timeout_secs: u64,

    /// Metric name to `PromQL` template. `{namespace}`, `{name}` and
    /// `{alert}` are substituted per target.
    #[serde(default = "default_queries")]
    pub queries: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
}

fn default_evaluation_interval() -> u64 {
    60
}

fn default_error_requeue() -> u64 {
    30
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_api_timeout() -> u64 {
    30
}

fn default_action_record_hours() -> u64 {
    24
}

fn default_decision_record_minutes() -> u64 {
    60
}

fn default_sweep_interval() -> u64 {
    300
}

fn default_failure_backoff_cap() -> u32 {
    4
}

fn default_analyzer_model() -> String {
    "remediation-advisor".to_string()
}

fn default_analyzer_timeout_ms() -> u64 {
    2_000
}

fn default_min_confidence() -> f64 {
    0.7
}

fn default_prometheus_url() -> String {
    "http://prometheus-server.observability.svc:80".to_string()
}

fn default_prometheus_timeout() -> u64 {
    10
}

fn default_bind_address() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_queries() -> BTreeMap<String, String> {
    let mut queries = BTreeMap::new();
    queries.insert(
        "cpu_utilization".to_string(),
        r#"100 * sum(rate(container_cpu_usage_seconds_total{namespace="{namespace}",pod=~"{name}.*",container!=""}[5m])) / sum(kube_pod_container_resource_limits{namespace="{namespace}",pod=~"{name}.*",resource="cpu"})"#.to_string(),
    );
    queries.insert(
        "memory_utilization".to_string(),
        r#"100 * sum(container_memory_working_set_bytes{namespace="{namespace}",pod=~"{name}.*",container!=""}) / sum(kube_pod_container_resource_limits{namespace="{namespace}",pod=~"{name}.*",resource="memory"})"#.to_string(),
    );
    queries.insert(
        "restart_count".to_string(),
        r#"sum(increase(kube_pod_container_status_restarts_total{namespace="{namespace}",pod=~"{name}.*"}[15m]))"#.to_string(),
    );
    queries.insert(
        "alert".to_string(),
        r#"max(ALERTS{alertname="{alert}",alertstate="firing",namespace="{namespace}"}) or vector(0)"#.to_string(),
    );
    queries
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            default_interval_seconds: default_evaluation_interval(),
            error_requeue_seconds: default_error_requeue(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            api_timeout_seconds: default_api_timeout(),
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            action_record_hours: default_action_record_hours(),
            decision_record_minutes: default_decision_record_minutes(),
            sweep_interval_seconds: default_sweep_interval(),
        }
    }
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            failure_backoff_cap: default_failure_backoff_cap(),
        }
    }
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            model: default_analyzer_model(),
            timeout_ms: default_analyzer_timeout_ms(),
            min_confidence: default_min_confidence(),
        }
    }
}

impl Default for PrometheusConfig {
    fn default() -> Self {
        Self {
            url: default_prometheus_url(),
            timeout_secs: default_prometheus_timeout(),
            queries: default_queries(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
        }
    }
}

impl RetentionConfig {
    #[must_use]
    pub fn action_retention(&self) -> chrono::Duration {
        chrono::Duration::hours(clamp_i64(self.action_record_hours))
    }

    #[must_use]
    pub fn decision_retention(&self) -> chrono::Duration {
        chrono::Duration::minutes(clamp_i64(self.decision_record_minutes))
    }

    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_seconds.max(1))
    }
}

impl EvaluationConfig {
    #[must_use]
    pub fn interval_for(&self, policy_interval: Option<u64>) -> Duration {
        Duration::from_secs(
            policy_interval
                .filter(|secs| *secs > 0)
                .unwrap_or(self.default_interval_seconds)
                .max(1),
        )
    }

    #[must_use]
    pub fn error_requeue(&self) -> Duration {
        Duration::from_secs(self.error_requeue_seconds.max(1))
    }
}

// Keeps chrono's constructors clear of their overflow panic.
fn clamp_i64(value: u64) -> i64 {
    i64::try_from(value.min(1_000_000)).unwrap_or(1_000_000)
}

impl ControllerConfig {
    /// Validate that configuration values are usable
    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if self.retry.max_attempts == 0 {
            return Err(anyhow::anyhow!("retry.maxAttempts must be at least 1"));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(anyhow::anyhow!(
                "retry.baseDelayMs ({}) must not exceed retry.maxDelayMs ({})",
                self.retry.base_delay_ms,
                self.retry.max_delay_ms
            ));
        }
        if self.cluster.api_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("cluster.apiTimeoutSeconds must be positive"));
        }
        if self.retention.sweep_interval_seconds == 0 {
            return Err(anyhow::anyhow!("retention.sweepIntervalSeconds must be positive"));
        }
        if self.safety.failure_backoff_cap > MAX_BACKOFF_EXPONENT {
            return Err(anyhow::anyhow!(
                "safety.failureBackoffCap must be at most {MAX_BACKOFF_EXPONENT}, got {}",
                self.safety.failure_backoff_cap
            ));
        }
        if self.prometheus.url.trim().is_empty() {
            return Err(anyhow::anyhow!("prometheus.url must not be empty"));
        }
        if !(0.0..=1.0).contains(&self.analyzer.min_confidence) {
            return Err(anyhow::anyhow!(
                "analyzer.minConfidence must be within [0, 1], got {}",
                self.analyzer.min_confidence
            ));
        }
        if self.server.bind_address.parse::<std::net::SocketAddr>().is_err() {
            return Err(anyhow::anyhow!(
                "server.bindAddress '{}' is not a socket address",
                self.server.bind_address
            ));
        }
        Ok(())
    }

    /// Apply environment overrides on top of the file contents
    pub fn apply_env_overrides(&mut self) {
        if let Ok(value) = std::env::var("DRY_RUN") {
            match value.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" => self.dry_run = true,
                "0" | "false" | "no" => self.dry_run = false,
                other => warn!(value = %other, "Ignoring unrecognised DRY_RUN value"),
            }
        }
        if let Ok(url) = std::env::var("PROMETHEUS_URL") {
            if !url.is_empty() {
                self.prometheus.url = url;
            }
        }
    }

    /// Load configuration from mounted `ConfigMap` file
    pub fn from_mounted_file(config_path: &str) -> Result<Self, anyhow::Error> {
        let config_str = std::fs::read_to_string(config_path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file {config_path}: {e}"))?;

        Self::from_yaml(&config_str)
    }

    fn from_yaml(yaml: &str) -> Result<Self, anyhow::Error> {
        // An empty document deserializes to unit, not a mapping.
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(yaml).map_err(|e| anyhow::anyhow!("Failed to parse config YAML: {e}"))
    }
}
