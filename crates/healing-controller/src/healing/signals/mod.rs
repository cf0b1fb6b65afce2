//! Inputs to policy evaluation: metric snapshots and the optional analyzer.

pub mod analyzer;
pub mod prometheus;

pub use analyzer::{
    Analysis, AnalysisContext, Analyzer, AnalyzerError, AnalyzerHandle, Consultation,
    HttpAnalyzer, Recommendation, Verdict as AnalyzerVerdict,
};
pub use prometheus::PrometheusMetricsSource;

use crate::crds::{TargetRef, TargetSelector};
use async_trait::async_trait;
use std::collections::BTreeMap;

/// Signal name to latest value for one target
pub type TargetMetrics = BTreeMap<String, f64>;

/// Metrics for every target a selector resolved to.
///
/// A target whose collection failed carries an error instead of values; the
/// evaluator skips it without affecting the others.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricsSnapshot {
    pub targets: BTreeMap<TargetRef, Result<TargetMetrics, String>>,
}

impl MetricsSnapshot {
    pub fn insert(&mut self, target: TargetRef, metrics: TargetMetrics) {
        self.targets.insert(target, Ok(metrics));
    }

    pub fn insert_error(&mut self, target: TargetRef, error: impl Into<String>) {
        self.targets.insert(target, Err(error.into()));
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SignalError {
    #[error("failed to resolve targets: {0}")]
    Targets(#[from] kube::Error),

    #[error("metrics backend request failed: {0}")]
    Backend(String),
}

/// Source of per-target metric values
#[async_trait]
pub trait MetricsSource: Send + Sync {
    /// Resolve `selector` in `namespace` and read `signals` for each target.
    ///
    /// `Err` means the whole fetch failed (no targets could be listed);
    /// per-target failures are reported inside the snapshot.
    async fn fetch_metrics(
        &self,
        namespace: &str,
        selector: &TargetSelector,
        signals: &[String],
    ) -> Result<MetricsSnapshot, SignalError>;
}
