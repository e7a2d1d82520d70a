//! Callback-authenticated operational endpoints.

use axum::{
    Json,
    extract::{Path, State},
};
use serde::Serialize;
use serde_json::Value;

use muster_common::api::{
    AddonRequest, CallbackRequest, ResultResponse, ServiceRequest, ServiceStatus, UpgradeRequest,
};
use muster_common::constants::{UPGRADE_SCRIPTS, files as layout};
use muster_common::{ClusterError, VoterSetEntry};

use super::error::{ApiResult, JsonBody};
use super::{path_component, require_callback};
use crate::network::local_hostname;
use crate::services::ServiceAction;
use crate::state::AppState;

#[derive(Serialize)]
pub struct VersionResponse {
    version: &'static str,
    mode: String,
}

pub async fn version(
    State(state): State<AppState>,
    JsonBody(request): JsonBody<CallbackRequest>,
) -> ApiResult<VersionResponse> {
    require_callback(&state, &request.callback)?;
    Ok(Json(VersionResponse {
        version: env!("CARGO_PKG_VERSION"),
        mode: state.mode().to_string(),
    }))
}

#[derive(Serialize)]
pub struct StatusResponse {
    mode: String,
    hostname: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    members: Option<Vec<VoterSetEntry>>,
}

pub async fn status(
    State(state): State<AppState>,
    JsonBody(request): JsonBody<CallbackRequest>,
) -> ApiResult<StatusResponse> {
    require_callback(&state, &request.callback)?;
    let mode = state.mode();
    let members = if mode.is_consensus() {
        match state.membership.list_members().await {
            Ok(members) => Some(members),
            Err(e) => {
                tracing::warn!(error = %e, "Member list unavailable for status");
                None
            }
        }
    } else {
        None
    };
    Ok(Json(StatusResponse {
        mode: mode.to_string(),
        hostname: local_hostname()?,
        members,
    }))
}

pub async fn services(
    State(state): State<AppState>,
    JsonBody(request): JsonBody<CallbackRequest>,
) -> ApiResult<Vec<ServiceStatus>> {
    require_callback(&state, &request.callback)?;
    Ok(Json(state.services.list().await?))
}

pub async fn overview(
    State(state): State<AppState>,
    JsonBody(request): JsonBody<CallbackRequest>,
) -> ApiResult<Value> {
    require_callback(&state, &request.callback)?;
    Ok(Json(state.kube.overview().await?))
}

/// Admin kubeconfig, converted from YAML
pub async fn config(
    State(state): State<AppState>,
    JsonBody(request): JsonBody<CallbackRequest>,
) -> ApiResult<Value> {
    require_callback(&state, &request.callback)?;
    let yaml = state.read_data(layout::CLIENT_CONFIG)?;
    let parsed: serde_yaml::Value = serde_yaml::from_str(&yaml)
        .map_err(|e| ClusterError::LocalState(format!("invalid client config: {e}")))?;
    let json = serde_json::to_value(parsed)
        .map_err(|e| ClusterError::LocalState(format!("client config is not JSON compatible: {e}")))?;
    Ok(Json(json))
}

#[derive(Serialize)]
pub struct LogsResponse {
    logs: String,
}

#[derive(Serialize)]
#[serde(untagged)]
pub enum ServiceOutcome {
    Done(ResultResponse),
    Logs(LogsResponse),
}

pub async fn service(
    State(state): State<AppState>,
    Path(action): Path<String>,
    JsonBody(request): JsonBody<ServiceRequest>,
) -> ApiResult<ServiceOutcome> {
    require_callback(&state, &request.callback)?;
    let service = required("service", &request.service)?;

    if action == "logs" {
        let logs = state.services.logs(service).await?;
        return Ok(Json(ServiceOutcome::Logs(LogsResponse { logs })));
    }
    let action: ServiceAction = action.parse()?;
    state.services.apply(action, service).await?;
    Ok(Json(ServiceOutcome::Done(ResultResponse::ok())))
}

pub async fn addon(
    State(state): State<AppState>,
    Path(action): Path<String>,
    JsonBody(request): JsonBody<AddonRequest>,
) -> ApiResult<ResultResponse> {
    require_callback(&state, &request.callback)?;
    let addon = required("addon", &request.addon)?;
    let enable = match action.as_str() {
        "enable" => true,
        "disable" => false,
        other => {
            return Err(ClusterError::NotFound(format!("unknown addon action {other:?}")).into());
        }
    };
    state.services.set_addon(addon, enable).await?;
    Ok(Json(ResultResponse::ok()))
}

/// Run one phase of a cluster-wide upgrade script on this node
pub async fn upgrade(
    State(state): State<AppState>,
    JsonBody(request): JsonBody<UpgradeRequest>,
) -> ApiResult<ResultResponse> {
    require_callback(&state, &request.callback)?;
    let phase = match request.phase.as_str() {
        phase @ ("prepare" | "commit" | "rollback") => phase,
        other => {
            return Err(ClusterError::InvalidInput(format!("unknown upgrade phase {other:?}")).into());
        }
    };
    let name = path_component("upgrade", &request.upgrade)?;

    let script = state
        .paths
        .snap(&format!("{UPGRADE_SCRIPTS}/{name}/{phase}-node.sh"));
    if !script.is_file() {
        return Err(
            ClusterError::NotFound(format!("could not find script {}", script.display())).into(),
        );
    }
    let script = script.display().to_string();
    state.runner.output(&[script.as_str()]).await?;
    tracing::info!(upgrade = name, phase, "Upgrade phase complete");
    Ok(Json(ResultResponse::ok()))
}

fn required<'a>(field: &str, value: &'a str) -> Result<&'a str, ClusterError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(ClusterError::InvalidInput(format!("{field} must be specified")));
    }
    Ok(value)
}
