/*
 * 5D Labs Agent Platform - Self-Healing Controller Service
 * Copyright (C) 2025 5D Labs
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published
 * by the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 */

//! Healing Controller Service
//!
//! - Watches `HealingPolicy` resources and materializes `HealingAction`s
//! - Admits actions through the safety controller and executes them
//! - Serves health, readiness and metrics endpoints

use axum::{extract::State, http::StatusCode, response::Json, routing::get, Router};
use healing_controller::healing::{
    build_context, recover_state, run_healing_controller, Context, ControllerConfig,
};
use serde_json::{json, Value};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::{
    timeout::TimeoutLayer,
    trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer},
};
use tracing::{error, info, warn, Level};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[derive(Clone)]
struct AppState {
    ctx: Arc<Context>,
    /// Set once safety state has been recovered
    ready: Arc<AtomicBool>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,healing_controller=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!(
        "Starting 5D Labs Healing Controller v{}",
        env!("CARGO_PKG_VERSION")
    );

    let mut config = load_controller_config();
    config.apply_env_overrides();
    config.validate()?;
    let bind_address = config.server.bind_address.clone();

    let client = kube::Client::try_default().await?;
    info!("Connected to Kubernetes cluster");

    let shutdown = CancellationToken::new();
    let ctx = build_context(client, config, shutdown.clone())?;
    let ready = Arc::new(AtomicBool::new(false));

    let controller_handle = tokio::spawn({
        let ctx = Arc::clone(&ctx);
        let ready = Arc::clone(&ready);
        async move {
            if !recover_until_done(&ctx).await {
                return;
            }
            ready.store(true, Ordering::SeqCst);
            if let Err(e) = run_healing_controller(ctx).await {
                error!("Controller error: {}", e);
            }
        }
    });

    let state = AppState { ctx, ready };
    let app = Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/metrics", get(metrics))
        .layer(
            ServiceBuilder::new()
                .layer(
                    TraceLayer::new_for_http()
                        .make_span_with(DefaultMakeSpan::new().level(Level::DEBUG))
                        .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                        .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
                )
                .layer(TimeoutLayer::new(Duration::from_secs(10))),
        )
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&bind_address).await?;
    info!("Healing controller HTTP server listening on {}", bind_address);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;

    // Loops observe the token; give in-flight executions time to settle.
    shutdown.cancel();
    if tokio::time::timeout(SHUTDOWN_GRACE, controller_handle)
        .await
        .is_err()
    {
        warn!("Controllers did not stop within {:?}", SHUTDOWN_GRACE);
    }
    info!("Healing controller stopped");

    Ok(())
}

/// Retry recovery until it succeeds. Returns false if shutdown came first.
async fn recover_until_done(ctx: &Context) -> bool {
    let retry_after = ctx.config.evaluation.error_requeue();
    loop {
        match recover_state(ctx).await {
            Ok(report) => {
                info!(
                    adopted = report.adopted,
                    restored = report.restored,
                    "Safety state recovered"
                );
                return true;
            }
            Err(e) => {
                warn!(error = %e, "Safety state recovery failed, retrying");
                tokio::select! {
                    () = tokio::time::sleep(retry_after) => {}
                    () = ctx.shutdown.cancelled() => return false,
                }
            }
        }
    }
}

async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": "healing-controller",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn readiness_check(State(state): State<AppState>) -> Result<Json<Value>, StatusCode> {
    if !state.ready.load(Ordering::SeqCst) || state.ctx.shutdown.is_cancelled() {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }
    Ok(Json(json!({
        "status": "ready",
        "service": "healing-controller",
        "dryRun": state.ctx.config.dry_run,
        "analyzer": state.ctx.analyzer.is_enabled()
    })))
}

async fn metrics(State(state): State<AppState>) -> Json<Value> {
    let ctx = &state.ctx;
    Json(json!({
        "service": "healing-controller",
        "version": env!("CARGO_PKG_VERSION"),
        "metrics": ctx.metrics.report(),
        "inFlightActions": ctx.safety.store().in_flight_total(),
        "safetyEntries": ctx.safety.store().len(),
        "actionRecords": ctx.recorder.action_count(),
        "decisionRecords": ctx.recorder.decision_count()
    }))
}

fn load_controller_config() -> ControllerConfig {
    let override_path = std::env::var("CONTROLLER_CONFIG_PATH").ok();
    let config_path = override_path
        .as_deref()
        .filter(|path| Path::new(path).exists())
        .unwrap_or("/config/config.yaml");

    match ControllerConfig::from_mounted_file(config_path) {
        Ok(cfg) => {
            info!("Loaded controller configuration from {}", config_path);
            cfg
        }
        Err(err) => {
            warn!(
                "Failed to load configuration from {}: {}. Using defaults.",
                config_path, err
            );
            ControllerConfig::default()
        }
    }
}

async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received Ctrl+C, shutting down gracefully");
        },
        () = terminate => {
            info!("Received SIGTERM, shutting down gracefully");
        },
        () = shutdown.cancelled() => {},
    }
    shutdown.cancel();
}
