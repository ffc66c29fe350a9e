//! HTTP surface: alert webhook, pipeline deployment notices and health checks.

use axum::{
    body::Bytes,
    extract::State,
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::Json,
    routing::{get, post},
    Router,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::alerts::{AlertIntake, AlertPayload};
use crate::config::Settings;
use crate::error::{Error, Result};
use crate::model::{NewRollout, RolloutKey, RolloutMetadata, RolloutStatus};
use crate::store::Store;

/// Header carrying the alert webhook shared secret.
pub const ALERT_TOKEN_HEADER: &str = "x-alert-token";

/// Origin recorded for rollouts announced by a pipeline.
pub const PIPELINE_ORIGIN: &str = "pipeline";

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub store: Arc<dyn Store>,
    pub intake: Arc<AlertIntake>,
}

impl AppState {
    pub fn new(settings: Arc<Settings>, store: Arc<dyn Store>) -> Self {
        let intake = Arc::new(AlertIntake::new(store.clone(), settings.clone()));
        Self {
            settings,
            store,
            intake,
        }
    }
}

/// Build the HTTP router.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/webhook/alert", post(alert_webhook))
        .route("/deployments", post(deployment_notice))
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until `cancel` fires, then drain in-flight requests.
pub async fn run_server(state: AppState, cancel: CancellationToken) -> Result<()> {
    let addr = state.settings.server.listen_addr.clone();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| Error::ConfigError(format!("cannot bind {addr}: {e}")))?;
    info!(addr = %addr, "HTTP server listening");

    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .map_err(|e| Error::ConfigError(format!("HTTP server failed: {e}")))?;
    info!("HTTP server stopped");
    Ok(())
}

/// Shared secret presented by the caller, from `X-Alert-Token` or a bearer token.
fn presented_token(headers: &HeaderMap) -> Option<&str> {
    if let Some(token) = headers
        .get(ALERT_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
    {
        return Some(token.trim());
    }
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
}

fn authorized(expected: Option<&str>, headers: &HeaderMap) -> bool {
    let Some(expected) = expected.filter(|s| !s.is_empty()) else {
        return true;
    };
    presented_token(headers)
        .is_some_and(|token| token.as_bytes().ct_eq(expected.as_bytes()).into())
}

/// Alertmanager-style webhook.
async fn alert_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, Json<Value>) {
    if !authorized(
        state.settings.server.alert_webhook_secret.as_deref(),
        &headers,
    ) {
        warn!("Rejected alert webhook with bad token");
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "status": "error", "error": "unauthorized" })),
        );
    }

    let body: Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(e) => {
            debug!(error = %e, "Alert webhook body is not JSON");
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "status": "error", "error": "invalid JSON" })),
            );
        }
    };

    let Some(payload) = AlertPayload::from_value(&body) else {
        debug!("Alert webhook without alerts, ignoring");
        return (StatusCode::ACCEPTED, Json(json!({ "status": "ignored" })));
    };

    match state.intake.ingest(&payload, Utc::now()).await {
        Ok(summary) => (
            StatusCode::ACCEPTED,
            Json(json!({
                "status": "accepted",
                "count": summary.count,
                "triggered": summary.triggered,
            })),
        ),
        Err(e) => {
            error!(error = %e, "Failed to record alerts");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "status": "error", "error": "failed to record alerts" })),
            )
        }
    }
}

/// Pipeline links announced by CI.
#[derive(Debug, Default, Deserialize)]
struct GitInfo {
    project: Option<String>,
    commit: Option<String>,
    pipeline_url: Option<String>,
    mr_url: Option<String>,
}

/// Deployment notice sent by a pipeline after applying a manifest.
#[derive(Debug, Deserialize)]
struct DeploymentNotice {
    #[serde(default)]
    cluster: Option<String>,
    namespace: String,
    deployment: String,
    #[serde(default = "default_generation")]
    generation: i64,
    #[serde(default)]
    team: Option<String>,
    #[serde(default)]
    notify_target: Option<String>,
    #[serde(default)]
    git: GitInfo,
}

const fn default_generation() -> i64 {
    1
}

async fn deployment_notice(
    State(state): State<AppState>,
    Json(notice): Json<DeploymentNotice>,
) -> (StatusCode, Json<Value>) {
    if notice.namespace.trim().is_empty() || notice.deployment.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "status": "error", "error": "namespace and deployment are required" })),
        );
    }

    match record_deployment(&state, notice).await {
        Ok(rollout_id) => (
            StatusCode::OK,
            Json(json!({ "status": "ok", "rollout_id": rollout_id })),
        ),
        Err(e) => {
            error!(error = %e, "Failed to record deployment notice");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "status": "error", "error": e.to_string() })),
            )
        }
    }
}

/// Attach pipeline metadata to the rollout, creating it when the watcher has
/// not seen it yet.
async fn record_deployment(state: &AppState, notice: DeploymentNotice) -> Result<i64> {
    let key = RolloutKey {
        cluster: notice
            .cluster
            .filter(|c| !c.is_empty())
            .unwrap_or_else(|| state.settings.cluster_name.clone()),
        namespace: notice.namespace,
        deployment: notice.deployment,
        generation: notice.generation,
    };
    let metadata = RolloutMetadata {
        team: notice.team,
        notify_target: notice.notify_target,
        git_project: notice.git.project,
        git_commit: notice.git.commit,
        pipeline_url: notice.git.pipeline_url,
        mr_url: notice.git.mr_url,
        ..RolloutMetadata::default()
    };

    if let Some(existing) = state.store.find_rollout(&key).await? {
        state
            .store
            .update_rollout_metadata(existing.id, &metadata)
            .await?;
        info!(rollout = %existing.reference(), "Updated rollout from pipeline");
        return Ok(existing.id);
    }

    let (rollout, created) = state
        .store
        .create_rollout_if_absent(NewRollout {
            key,
            status: RolloutStatus::Pending,
            origin: PIPELINE_ORIGIN.to_string(),
            metadata: metadata.clone(),
            started_at: Utc::now(),
        })
        .await?;
    if !created {
        state
            .store
            .update_rollout_metadata(rollout.id, &metadata)
            .await?;
    }
    info!(rollout = %rollout.reference(), created, "Recorded rollout from pipeline");
    Ok(rollout.id)
}

async fn health_check() -> Json<Value> {
    Json(json!({ "status": "healthy" }))
}

/// Ready once the store answers.
async fn readiness_check(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    match state.store.get_alert_state("").await {
        Ok(_) => (StatusCode::OK, Json(json!({ "status": "ready" }))),
        Err(e) => {
            warn!(error = %e, "Store not ready");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "status": "unavailable" })),
            )
        }
    }
}
