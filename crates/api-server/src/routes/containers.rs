//! Sandbox container listing.

use axum::extract::State;
use axum::Json;

use agent_runner::ContainerInfo;

use crate::error::ApiError;
use crate::state::AppState;

/// GET /api/containers: orchestrator containers visible to the runtime.
pub async fn list_containers(
    State(state): State<AppState>,
) -> Result<Json<Vec<ContainerInfo>>, ApiError> {
    let containers = state.runner.list_containers().await?;
    Ok(Json(containers))
}
