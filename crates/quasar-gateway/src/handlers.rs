use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Extension, Json,
};
use bytes::Bytes;
use quasar_common::auth::{require_role, AuthContext, Role};
use quasar_common::{now_ms, Endpoint, HealthSnapshot, HealthStatus, LifecycleState, ModelConfig, ModelRuntimeState, RequestId};
use quasar_router::CircuitView;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::GatewayError;
use crate::state::AppState;

pub async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

fn respond<T: Serialize>(result: Result<T, GatewayError>, ok: StatusCode, rid: &RequestId) -> Response {
    match result {
        Ok(body) => (ok, Json(body)).into_response(),
        Err(e) => e.with(rid).into_response(),
    }
}

fn registry_error(e: anyhow::Error) -> GatewayError {
    GatewayError::Internal(format!("model registry: {e:#}"))
}

// ── Upstreams ───────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct UpstreamView {
    #[serde(flatten)]
    endpoint: Endpoint,
    /// Status after applying the TTL; `unknown` when never probed or stale.
    effective_status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    health: Option<HealthSnapshot>,
    circuit: CircuitView,
    in_flight: u64,
}

#[derive(Debug, Serialize)]
struct ModelView {
    #[serde(flatten)]
    config: ModelConfig,
    runtime: ModelRuntimeState,
}

async fn model_views(st: &AppState) -> Result<Vec<ModelView>, GatewayError> {
    let configs = st.registry.list().await.map_err(registry_error)?;
    Ok(configs
        .into_iter()
        .map(|config| ModelView {
            runtime: st.orchestrator.state(&config.id),
            config,
        })
        .collect())
}

async fn upstreams_report(st: &AppState) -> Result<serde_json::Value, GatewayError> {
    let now = now_ms();
    let health = st.router.health();
    let endpoints: Vec<UpstreamView> = st
        .router
        .pools()
        .all()
        .iter()
        .map(|ep| UpstreamView {
            endpoint: (**ep).clone(),
            effective_status: health.effective_status(&ep.id, now).unwrap_or(HealthStatus::Unknown),
            health: health.get(&ep.id),
            circuit: st.router.breakers().view(&ep.id),
            in_flight: st.router.in_flight(&ep.id),
        })
        .collect();

    Ok(json!({
        "strategy": st.router.strategy_name(),
        "health_ttl_ms": health.ttl_ms(),
        "health_cycles": health.cycles(),
        "endpoints": endpoints,
        "models": model_views(st).await?,
    }))
}

pub async fn list_upstreams(
    State(st): State<AppState>,
    Extension(rid): Extension<RequestId>,
    Extension(auth): Extension<AuthContext>,
) -> Response {
    if let Some(denied) = require_role(&auth, Role::Viewer, Some(&rid.0)) {
        return denied;
    }
    respond(upstreams_report(&st).await, StatusCode::OK, &rid)
}

/// Runs one health check cycle now instead of waiting for the next tick.
pub async fn refresh_health(
    State(st): State<AppState>,
    Extension(rid): Extension<RequestId>,
    Extension(auth): Extension<AuthContext>,
) -> Response {
    if let Some(denied) = require_role(&auth, Role::Operator, Some(&rid.0)) {
        return denied;
    }
    let probed = st.prober.run_cycle().await;
    tracing::info!(probed, principal = %auth.principal, "manual health refresh");
    let result = upstreams_report(&st).await.map(|mut report| {
        report["probed"] = json!(probed);
        report
    });
    respond(result, StatusCode::OK, &rid)
}

// ── Models ──────────────────────────────────────────────────────────

pub async fn list_models(
    State(st): State<AppState>,
    Extension(rid): Extension<RequestId>,
    Extension(auth): Extension<AuthContext>,
) -> Response {
    if let Some(denied) = require_role(&auth, Role::Viewer, Some(&rid.0)) {
        return denied;
    }
    respond(model_views(&st).await, StatusCode::OK, &rid)
}

/// OpenAI-style model list: served names of running managed models.
pub async fn v1_models(State(st): State<AppState>, Extension(rid): Extension<RequestId>) -> Response {
    let result = st.registry.list().await.map_err(registry_error).map(|configs| {
        let data: Vec<serde_json::Value> = configs
            .iter()
            .filter(|c| st.orchestrator.state(&c.id).state == LifecycleState::Running)
            .map(|c| {
                json!({
                    "id": c.served_name,
                    "object": "model",
                    "owned_by": "quasar",
                    "pool": c.pool,
                })
            })
            .collect();
        json!({ "object": "list", "data": data })
    });
    respond(result, StatusCode::OK, &rid)
}

pub async fn put_model(
    State(st): State<AppState>,
    Extension(rid): Extension<RequestId>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<String>,
    body: Bytes,
) -> Response {
    if let Some(denied) = require_role(&auth, Role::Admin, Some(&rid.0)) {
        return denied;
    }
    let result: Result<ModelConfig, GatewayError> = async {
        let config: ModelConfig =
            serde_json::from_slice(&body).map_err(|e| GatewayError::BadRequest(format!("invalid model config: {e}")))?;
        if config.id != id {
            return Err(GatewayError::BadRequest(format!(
                "config id '{}' does not match path id '{id}'",
                config.id
            )));
        }
        if config.served_name.is_empty() || config.model_path.is_empty() {
            return Err(GatewayError::BadRequest("served_name and model_path must be set".into()));
        }
        let previous = st.registry.put(config.clone()).await.map_err(registry_error)?;
        tracing::info!(model_id = %id, replaced = previous.is_some(), principal = %auth.principal, "model config stored");
        Ok(config)
    }
    .await;
    respond(result, StatusCode::OK, &rid)
}

pub async fn delete_model(
    State(st): State<AppState>,
    Extension(rid): Extension<RequestId>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<String>,
) -> Response {
    if let Some(denied) = require_role(&auth, Role::Admin, Some(&rid.0)) {
        return denied;
    }
    let result: Result<serde_json::Value, GatewayError> = async {
        st.orchestrator.unregister(&id).await?;
        tracing::info!(model_id = %id, principal = %auth.principal, "model config deleted");
        Ok(json!({ "deleted": id }))
    }
    .await;
    respond(result, StatusCode::OK, &rid)
}

// ── Lifecycle ───────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct StartQuery {
    /// Block until the engine is running or failed.
    #[serde(default)]
    pub wait: bool,
}

fn accepted_or_ok(wait: bool) -> StatusCode {
    if wait {
        StatusCode::OK
    } else {
        StatusCode::ACCEPTED
    }
}

pub async fn start_model(
    State(st): State<AppState>,
    Extension(rid): Extension<RequestId>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<String>,
    Query(q): Query<StartQuery>,
) -> Response {
    if let Some(denied) = require_role(&auth, Role::Operator, Some(&rid.0)) {
        return denied;
    }
    tracing::info!(model_id = %id, wait = q.wait, principal = %auth.principal, "start requested");
    let result = st.orchestrator.start(&id, q.wait).await.map_err(GatewayError::from);
    respond(result, accepted_or_ok(q.wait), &rid)
}

pub async fn stop_model(
    State(st): State<AppState>,
    Extension(rid): Extension<RequestId>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<String>,
) -> Response {
    if let Some(denied) = require_role(&auth, Role::Operator, Some(&rid.0)) {
        return denied;
    }
    tracing::info!(model_id = %id, principal = %auth.principal, "stop requested");
    let result = st.orchestrator.stop(&id).await.map_err(GatewayError::from);
    respond(result, StatusCode::OK, &rid)
}

pub async fn apply_model(
    State(st): State<AppState>,
    Extension(rid): Extension<RequestId>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<String>,
    Query(q): Query<StartQuery>,
) -> Response {
    if let Some(denied) = require_role(&auth, Role::Operator, Some(&rid.0)) {
        return denied;
    }
    tracing::info!(model_id = %id, wait = q.wait, principal = %auth.principal, "apply requested");
    let result = st.orchestrator.apply(&id, q.wait).await.map_err(GatewayError::from);
    respond(result, accepted_or_ok(q.wait), &rid)
}

pub async fn dry_run_model(
    State(st): State<AppState>,
    Extension(rid): Extension<RequestId>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<String>,
) -> Response {
    if let Some(denied) = require_role(&auth, Role::Viewer, Some(&rid.0)) {
        return denied;
    }
    let result = st.orchestrator.dry_run(&id).await.map_err(GatewayError::from);
    respond(result, StatusCode::OK, &rid)
}

pub async fn model_readiness(
    State(st): State<AppState>,
    Extension(rid): Extension<RequestId>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<String>,
) -> Response {
    if let Some(denied) = require_role(&auth, Role::Viewer, Some(&rid.0)) {
        return denied;
    }
    let result = st.orchestrator.readiness(&id).await.map_err(GatewayError::from);
    respond(result, StatusCode::OK, &rid)
}

#[derive(Debug, Default, Deserialize)]
pub struct LogsQuery {
    #[serde(default)]
    pub diagnose: bool,
    pub tail: Option<usize>,
}

pub async fn model_logs(
    State(st): State<AppState>,
    Extension(rid): Extension<RequestId>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<String>,
    Query(q): Query<LogsQuery>,
) -> Response {
    if let Some(denied) = require_role(&auth, Role::Viewer, Some(&rid.0)) {
        return denied;
    }
    let tail = q.tail.unwrap_or(st.orchestrator.settings().log_tail_lines);
    let result = st.orchestrator.logs(&id, tail, q.diagnose).await.map_err(GatewayError::from);
    respond(result, StatusCode::OK, &rid)
}
