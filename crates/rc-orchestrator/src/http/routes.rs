//! Request handlers

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::response::sse::Sse;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use rc_core::{InstanceName, Redactor};

use crate::deploy::{DeployMode, DeployRequest, DeployTarget, EventSink};
use crate::service::ServiceAction;
use crate::state::AppState;

use super::error::ApiError;
use super::sse::event_stream;

type AppResult<T> = Result<T, ApiError>;

fn instance(name: &str) -> AppResult<InstanceName> {
    Ok(InstanceName::new(name)?)
}

/// `POST /api/deploy`
///
/// Validates the request, then streams the deployment as server-sent events.
/// The deployment runs in its own task and finishes (or rolls back) even if
/// the client goes away.
pub async fn deploy(
    State(state): State<Arc<AppState>>,
    Json(request): Json<DeployRequest>,
) -> AppResult<Response> {
    let target = DeployTarget::resolve(request, &state.config.deploy)?;

    if state.config.deploy.validate_credential
        && !state.cloud.validate_credential(target.token()).await
    {
        return Err(ApiError::Unauthorized(
            "Hetzner API token was rejected".to_string(),
        ));
    }

    let (sink, rx) = EventSink::channel(Redactor::new(target.token()));
    let sink = state.orchestrator.transcript_sink(sink, &target);

    tracing::info!(
        "Deployment of {} requested ({:?} mode)",
        target.server_name,
        target.mode
    );
    let task_state = Arc::clone(&state);
    tokio::spawn(async move {
        let outcome = match target.mode {
            DeployMode::Direct => task_state.orchestrator.execute(target, &sink).await,
            DeployMode::Script => task_state.script.execute(&target, &sink).await,
        };
        if let Err(failure) = outcome {
            tracing::debug!("Deployment ended with error: {}", failure.message);
        }
    });

    let headers = [("x-accel-buffering", "no")];
    Ok((headers, Sse::new(event_stream(rx))).into_response())
}

/// `POST /api/instances/:name/setup`
pub async fn start_setup(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> AppResult<Json<Value>> {
    let name = instance(&name)?;
    let info = state.onboarding.start(&name).await?;
    Ok(Json(json!(info)))
}

/// `DELETE /api/instances/:name/setup`
pub async fn stop_setup(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> AppResult<Json<Value>> {
    let name = instance(&name)?;
    state.onboarding.stop(&name);
    Ok(Json(json!({ "tunnelActive": false })))
}

/// `POST /api/instances/:name/setup/complete`
pub async fn complete_setup(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> AppResult<Json<Value>> {
    let name = instance(&name)?;
    let completed = state.onboarding.complete(&name).await?;
    Ok(Json(json!({ "onboardingCompleted": completed })))
}

/// `GET /api/instances/:name/tunnel`
pub async fn tunnel_status(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> AppResult<Json<Value>> {
    let name = instance(&name)?;
    Ok(Json(json!(state.onboarding.status(&name))))
}

/// `GET /api/tunnels`
pub async fn list_tunnels(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "keys": state.tunnels.get_active_keys(),
        "tunnels": state.tunnels.list(),
    }))
}

/// `GET /api/instances/:name/service`
pub async fn service_status(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> AppResult<Json<Value>> {
    let name = instance(&name)?;
    let status = state.service.status(&name).await?;
    Ok(Json(json!({
        "status": status.status,
        "enabled": status.enabled,
        "instanceName": name,
    })))
}

#[derive(Debug, Deserialize)]
pub struct ServiceRequest {
    #[serde(default)]
    action: String,
}

/// `POST /api/instances/:name/service`
pub async fn service_action(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(request): Json<ServiceRequest>,
) -> AppResult<Json<Value>> {
    let name = instance(&name)?;
    let action = ServiceAction::parse(&request.action).ok_or_else(|| {
        ApiError::BadRequest(r#"Invalid action. Must be "start" or "stop"."#.to_string())
    })?;

    let status = state.service.apply(&name, action).await?;
    Ok(Json(json!({
        "success": true,
        "status": status.status,
        "enabled": status.enabled,
        "instanceName": name,
    })))
}

