use crate::crds::{HealingAction, HealingPolicy, PolicyRef, SafetySpec};
use chrono::Utc;
use futures::StreamExt;
use k8s_openapi::NamespaceResourceScope;
use kube::api::ListParams;
use kube::runtime::controller::Controller;
use kube::runtime::watcher::Config;
use kube::{Api, Client, Resource, ResourceExt};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn, Instrument};

pub mod action;
pub mod cleanup;
pub mod config;
pub mod metrics;
pub mod policy;
pub mod remediation;
pub mod safety;
pub mod signals;
pub mod types;

pub use config::ControllerConfig;
pub use types::{Context, Error, Result};

use metrics::HealingMetrics;
use remediation::{ActionRecorder, KubeClusterOps, RemediationEngine, RetryPolicy};
use safety::recovery::{self, RecoveryReport};
use safety::{ActionStore, SafetyController};
use signals::{AnalyzerHandle, HttpAnalyzer, MetricsSource, PrometheusMetricsSource};

/// Wire every component from `config`
pub fn build_context(
    client: Client,
    config: ControllerConfig,
    shutdown: CancellationToken,
) -> Result<Arc<Context>> {
    let config = Arc::new(config);
    let metrics = Arc::new(HealingMetrics::new());

    let store = Arc::new(ActionStore::new(config.safety.failure_backoff_cap));
    let safety = Arc::new(SafetyController::new(store, config.dry_run, Arc::clone(&metrics)));
    let recorder = Arc::new(ActionRecorder::in_memory(
        config.retention.action_retention(),
        config.retention.decision_retention(),
    ));

    let cluster = Arc::new(KubeClusterOps::new(
        client.clone(),
        Duration::from_secs(config.cluster.api_timeout_seconds),
    ));
    let engine = Arc::new(RemediationEngine::new(
        cluster,
        Arc::clone(&recorder),
        Arc::clone(&metrics),
        RetryPolicy::from(&config.retry),
    ));

    let metrics_source: Arc<dyn MetricsSource> =
        Arc::new(PrometheusMetricsSource::new(client.clone(), &config.prometheus)?);

    let analyzer = match config.analyzer.endpoint.as_deref() {
        Some(endpoint) => {
            let timeout = Duration::from_millis(config.analyzer.timeout_ms);
            let http = HttpAnalyzer::new(endpoint, &config.analyzer.model, timeout)
                .map_err(|e| Error::ConfigError(e.to_string()))?;
            info!(endpoint = %endpoint, model = %config.analyzer.model, "AI analyzer enabled");
            AnalyzerHandle::new(
                Some(Arc::new(http)),
                timeout,
                config.analyzer.min_confidence,
                Arc::clone(&metrics),
            )
        }
        None => {
            debug!("No analyzer endpoint configured, rule-based evaluation only");
            AnalyzerHandle::disabled(Arc::clone(&metrics))
        }
    };

    if config.dry_run {
        warn!("Process-wide dry run enabled, no action will mutate the cluster");
    }

    Ok(Arc::new(Context {
        client,
        config,
        safety,
        engine,
        recorder,
        metrics,
        metrics_source,
        analyzer,
        shutdown,
    }))
}

fn scoped_api<K>(client: Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<Scope = NamespaceResourceScope>,
    <K as Resource>::DynamicType: Default,
{
    match namespace {
        Some(namespace) => Api::namespaced(client, namespace),
        None => Api::all(client),
    }
}

/// Rebuild safety state from the actions and policies already in the cluster
#[instrument(skip(ctx))]
pub async fn recover_state(ctx: &Context) -> Result<RecoveryReport> {
    let namespace = ctx.config.watch_namespace.as_deref();
    let actions: Api<HealingAction> = scoped_api(ctx.client.clone(), namespace);
    let policies: Api<HealingPolicy> = scoped_api(ctx.client.clone(), namespace);

    let actions = actions.list(&ListParams::default()).await?.items;
    let policies: BTreeMap<PolicyRef, SafetySpec> = policies
        .list(&ListParams::default())
        .await?
        .items
        .into_iter()
        .filter_map(|policy| {
            let namespace = policy.namespace()?;
            let name = policy.name_any();
            Some((PolicyRef { namespace, name }, policy.spec.safety))
        })
        .collect();

    info!(
        actions = actions.len(),
        policies = policies.len(),
        "Recovering safety state"
    );
    Ok(recovery::rebuild(&ctx.safety, &actions, &policies, Utc::now()))
}

/// Run both reconcile loops and the cleanup loop until shutdown
#[instrument(skip(ctx), fields(namespace = ctx.config.watch_namespace.as_deref().unwrap_or("*")))]
pub async fn run_healing_controller(ctx: Arc<Context>) -> Result<()> {
    info!("Starting HealingPolicy and HealingAction controllers");

    let policy_handle = tokio::spawn(run_policy_controller(Arc::clone(&ctx)));
    let action_handle = tokio::spawn(run_action_controller(Arc::clone(&ctx)));
    let cleanup_handle = tokio::spawn(cleanup::run_cleanup_loop(
        Arc::clone(&ctx.safety),
        Arc::clone(&ctx.recorder),
        ctx.config.retention.sweep_interval(),
        ctx.shutdown.clone(),
    ));

    if let Err(e) = tokio::try_join!(policy_handle, action_handle, cleanup_handle) {
        error!("Controller task join error: {:?}", e);
    }

    info!("Healing controller shutting down");
    Ok(())
}

async fn run_policy_controller(ctx: Arc<Context>) {
    let namespace = ctx.config.watch_namespace.clone();
    let policies: Api<HealingPolicy> = scoped_api(ctx.client.clone(), namespace.as_deref());
    let actions: Api<HealingAction> = scoped_api(ctx.client.clone(), namespace.as_deref());
    let watcher_config = Config::default().any_semantic();

    Controller::new(policies, watcher_config.clone())
        .owns(actions, watcher_config)
        .graceful_shutdown_on(ctx.shutdown.clone().cancelled_owned())
        .run(policy::reconcile_policy, policy::error_policy, Arc::clone(&ctx))
        .for_each(|result| {
            let span = tracing::info_span!("policy_reconciliation_result");
            async move {
                match result {
                    Ok(policy) => debug!(resource = ?policy, "HealingPolicy reconciled"),
                    Err(e) => warn!(error = ?e, "HealingPolicy reconciliation error"),
                }
            }
            .instrument(span)
        })
        .await;

    info!("HealingPolicy controller stopped");
}

async fn run_action_controller(ctx: Arc<Context>) {
    let namespace = ctx.config.watch_namespace.clone();
    let actions: Api<HealingAction> = scoped_api(ctx.client.clone(), namespace.as_deref());

    Controller::new(actions, Config::default().any_semantic())
        .graceful_shutdown_on(ctx.shutdown.clone().cancelled_owned())
        .run(action::reconcile_action, action::error_action, Arc::clone(&ctx))
        .for_each(|result| {
            let span = tracing::info_span!("action_reconciliation_result");
            async move {
                match result {
                    Ok(action) => debug!(resource = ?action, "HealingAction reconciled"),
                    Err(e) => warn!(error = ?e, "HealingAction reconciliation error"),
                }
            }
            .instrument(span)
        })
        .await;

    info!("HealingAction controller stopped");
}
