//! Configuration deltas pushed by peers.

use axum::{Json, extract::State};

use muster_common::ClusterError;
use muster_common::api::{ConfigureRequest, ResultResponse};

use super::error::{ApiResult, JsonBody};
use crate::state::AppState;

pub async fn configure(
    State(state): State<AppState>,
    JsonBody(request): JsonBody<ConfigureRequest>,
) -> ApiResult<ResultResponse> {
    super::require_callback(&state, &request.callback)?;
    apply(&state, &request).await?;
    Ok(Json(ResultResponse::ok()))
}

/// Apply argument changes and addon toggles in request order
pub async fn apply(state: &AppState, request: &ConfigureRequest) -> Result<(), ClusterError> {
    // Names become args/<service>; reject them all before touching anything
    for service in &request.service {
        super::path_component("service", &service.name)?;
    }
    for service in &request.service {
        let updates: Vec<(String, String)> = service
            .arguments_update
            .iter()
            .flat_map(|map| map.iter().map(|(k, v)| (k.clone(), v.clone())))
            .collect();
        if !updates.is_empty() || !service.arguments_remove.is_empty() {
            state
                .args
                .update(&service.name, &updates, &service.arguments_remove)?;
        }
        if service.restart {
            state.services.restart(&service.name).await?;
        }
        tracing::info!(
            service = %service.name,
            updated = updates.len(),
            removed = service.arguments_remove.len(),
            restarted = service.restart,
            "Service configured"
        );
    }

    for addon in &request.addon {
        if addon.enable {
            state.services.set_addon(&addon.name, true).await?;
        } else if addon.disable {
            state.services.set_addon(&addon.name, false).await?;
        }
    }
    Ok(())
}
