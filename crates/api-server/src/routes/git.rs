//! Workspace git status endpoint.

use axum::extract::State;
use axum::Json;

use git_ops::WorkspaceStatus;

use crate::state::AppState;

/// GET /api/git/status
pub async fn git_status(State(state): State<AppState>) -> Json<Vec<WorkspaceStatus>> {
    let mut statuses = Vec::with_capacity(state.workspaces.len());
    for workspace in state.workspaces.iter() {
        statuses.push(git_ops::workspace_status(workspace).await);
    }
    Json(statuses)
}
