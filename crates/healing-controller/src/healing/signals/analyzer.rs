//! Optional AI analyzer consulted before an action is materialized.
//!
//! The analyzer can only narrow or adjust what the rules already decided: it
//! may confirm a candidate, suppress it, or substitute a compatible action
//! type. Any failure (timeout, transport error, low confidence, nonsense)
//! collapses to "no opinion" and the rule-based candidate stands.

use super::TargetMetrics;
use crate::crds::{ActionType, PolicyRef, TargetRef};
use crate::healing::metrics::HealingMetrics;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// What the analyzer is asked about
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisContext {
    pub policy: PolicyRef,
    pub trigger: String,
    pub target: TargetRef,
    pub proposed_action: ActionType,
    pub metrics: TargetMetrics,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Confirm,
    Suppress,
    Substitute,
}

/// Raw analyzer answer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Analysis {
    pub recommendation: Verdict,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_type: Option<ActionType>,
    pub confidence: f64,
}

#[derive(Debug, thiserror::Error)]
pub enum AnalyzerError {
    #[error("analyzer request failed: {0}")]
    Request(String),

    #[error("analyzer returned an invalid response: {0}")]
    InvalidResponse(String),
}

#[async_trait]
pub trait Analyzer: Send + Sync {
    fn model(&self) -> &str;
    async fn analyze(&self, context: &AnalysisContext) -> Result<Analysis, AnalyzerError>;
}

/// Usable outcome of a consultation
#[derive(Debug, Clone, PartialEq)]
pub enum Recommendation {
    NoOpinion,
    Confirm { confidence: f64 },
    Suppress { confidence: f64 },
    Substitute { action_type: ActionType, confidence: f64 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Consultation {
    pub recommendation: Recommendation,
    /// Set when the analyzer was configured but could not answer
    pub degraded: bool,
    pub model: Option<String>,
}

impl Consultation {
    fn no_opinion(model: Option<String>, degraded: bool) -> Self {
        Self {
            recommendation: Recommendation::NoOpinion,
            degraded,
            model,
        }
    }
}

/// Bounded, failure-tolerant access to an optional analyzer
#[derive(Clone)]
pub struct AnalyzerHandle {
    analyzer: Option<Arc<dyn Analyzer>>,
    timeout: Duration,
    min_confidence: f64,
    metrics: Arc<HealingMetrics>,
}

impl AnalyzerHandle {
    #[must_use]
    pub fn new(
        analyzer: Option<Arc<dyn Analyzer>>,
        timeout: Duration,
        min_confidence: f64,
        metrics: Arc<HealingMetrics>,
    ) -> Self {
        Self {
            analyzer,
            timeout,
            min_confidence,
            metrics,
        }
    }

    /// Handle that never consults anything
    #[must_use]
    pub fn disabled(metrics: Arc<HealingMetrics>) -> Self {
        Self::new(None, Duration::ZERO, 1.0, metrics)
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.analyzer.is_some()
    }

    pub async fn consult(&self, context: &AnalysisContext) -> Consultation {
        let Some(analyzer) = self.analyzer.as_ref() else {
            return Consultation::no_opinion(None, false);
        };
        let model = analyzer.model().to_string();
        let started = Instant::now();

        let answer = tokio::time::timeout(self.timeout, analyzer.analyze(context)).await;
        let elapsed = started.elapsed();

        let analysis = match answer {
            Err(_) => {
                warn!(model = %model, target = %context.target, timeout_ms = u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX), "Analyzer timed out");
                self.metrics.record_analysis(&model, "timeout", elapsed);
                return Consultation::no_opinion(Some(model), true);
            }
            Ok(Err(e)) => {
                warn!(model = %model, target = %context.target, error = %e, "Analyzer call failed");
                self.metrics.record_analysis(&model, "error", elapsed);
                return Consultation::no_opinion(Some(model), true);
            }
            Ok(Ok(analysis)) => analysis,
        };

        let recommendation = self.interpret(&analysis, context);
        let status = match recommendation {
            Recommendation::NoOpinion => "ignored",
            _ => "success",
        };
        self.metrics.record_analysis(&model, status, elapsed);
        debug!(model = %model, target = %context.target, ?recommendation, "Analyzer consulted");

        Consultation {
            recommendation,
            degraded: false,
            model: Some(model),
        }
    }

    fn interpret(&self, analysis: &Analysis, context: &AnalysisContext) -> Recommendation {
        let confidence = analysis.confidence;
        if !confidence.is_finite() || !(0.0..=1.0).contains(&confidence) || confidence < self.min_confidence {
            return Recommendation::NoOpinion;
        }
        match analysis.recommendation {
            Verdict::Confirm => Recommendation::Confirm { confidence },
            Verdict::Suppress => Recommendation::Suppress { confidence },
            Verdict::Substitute => match analysis.action_type {
                Some(action_type) if action_type.supports(context.target.kind) => {
                    Recommendation::Substitute {
                        action_type,
                        confidence,
                    }
                }
                _ => Recommendation::NoOpinion,
            },
        }
    }
}

#[derive(Debug, Serialize)]
struct AnalyzeRequest<'a> {
    model: &'a str,
    context: &'a AnalysisContext,
}

/// Analyzer reached over HTTP: POSTs the context, expects an [`Analysis`]
pub struct HttpAnalyzer {
    client: reqwest::Client,
    endpoint: String,
    model: String,
}

impl HttpAnalyzer {
    pub fn new(endpoint: &str, model: &str, timeout: Duration) -> Result<Self, AnalyzerError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AnalyzerError::Request(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            endpoint: endpoint.to_string(),
            model: model.to_string(),
        })
    }
}

#[async_trait]
impl Analyzer for HttpAnalyzer {
    fn model(&self) -> &str {
        &self.model
    }

    async fn analyze(&self, context: &AnalysisContext) -> Result<Analysis, AnalyzerError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&AnalyzeRequest {
                model: &self.model,
                context,
            })
            .send()
            .await
            .map_err(|e| AnalyzerError::Request(e.to_string()))?;

        if !response.status().is_success() {
            return Err(AnalyzerError::Request(format!(
                "status {}",
                response.status()
            )));
        }

        response
            .json::<Analysis>()
            .await
            .map_err(|e| AnalyzerError::InvalidResponse(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crds::TargetKind;

    struct Fixed(Analysis);

    #[async_trait]
    impl Analyzer for Fixed {
        fn model(&self) -> &str {
            "fixed"
        }

        async fn analyze(&self, _context: &AnalysisContext) -> Result<Analysis, AnalyzerError> {
            Ok(self.0.clone())
        }
    }

    struct Failing;

    #[async_trait]
    impl Analyzer for Failing {
        fn model(&self) -> &str {
            "failing"
        }

        async fn analyze(&self, _context: &AnalysisContext) -> Result<Analysis, AnalyzerError> {
            Err(AnalyzerError::Request("connection refused".to_string()))
        }
    }

    fn context(kind: TargetKind) -> AnalysisContext {
        AnalysisContext {
            policy: PolicyRef {
                namespace: "apps".to_string(),
                name: "cpu".to_string(),
            },
            trigger: "cpu-high".to_string(),
            target: TargetRef::new(kind, Some("apps"), "web"),
            proposed_action: ActionType::RestartWorkload,
            metrics: TargetMetrics::new(),
        }
    }

    fn handle(analyzer: impl Analyzer + 'static) -> AnalyzerHandle {
        AnalyzerHandle::new(
            Some(Arc::new(analyzer)),
            Duration::from_secs(1),
            0.7,
            Arc::new(HealingMetrics::new()),
        )
    }

    #[tokio::test]
    async fn substitute_requires_compatible_type() {
        let h = handle(Fixed(Analysis {
            recommendation: Verdict::Substitute,
            action_type: Some(ActionType::Cordon),
            confidence: 0.9,
        }));
        let consultation = h.consult(&context(TargetKind::Deployment)).await;
        assert_eq!(consultation.recommendation, Recommendation::NoOpinion);
        assert!(!consultation.degraded);

        let h = handle(Fixed(Analysis {
            recommendation: Verdict::Substitute,
            action_type: Some(ActionType::Scale),
            confidence: 0.9,
        }));
        let consultation = h.consult(&context(TargetKind::Deployment)).await;
        assert_eq!(
            consultation.recommendation,
            Recommendation::Substitute {
                action_type: ActionType::Scale,
                confidence: 0.9
            }
        );
    }

    #[tokio::test]
    async fn low_confidence_is_no_opinion() {
        let h = handle(Fixed(Analysis {
            recommendation: Verdict::Suppress,
            action_type: None,
            confidence: 0.4,
        }));
        let consultation = h.consult(&context(TargetKind::Deployment)).await;
        assert_eq!(consultation.recommendation, Recommendation::NoOpinion);
    }

    #[tokio::test]
    async fn failure_degrades_without_opinion() {
        let h = handle(Failing);
        let consultation = h.consult(&context(TargetKind::Deployment)).await;
        assert_eq!(consultation.recommendation, Recommendation::NoOpinion);
        assert!(consultation.degraded);
        assert_eq!(h.metrics.analysis_count("failing", "error"), 1);
    }

    #[tokio::test]
    async fn disabled_handle_never_degrades() {
        let h = AnalyzerHandle::disabled(Arc::new(HealingMetrics::new()));
        let consultation = h.consult(&context(TargetKind::Pod)).await;
        assert_eq!(consultation, Consultation::no_opinion(None, false));
    }

    #[test]
    fn analysis_wire_format() {
        let analysis: Analysis = serde_json::from_str(
            r#"{"recommendation":"substitute","actionType":"Scale","confidence":0.85}"#,
        )
        .unwrap();
        assert_eq!(analysis.action_type, Some(ActionType::Scale));
    }
}
