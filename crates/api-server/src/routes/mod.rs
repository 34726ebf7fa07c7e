//! HTTP route composition.

pub mod containers;
pub mod git;
pub mod streams;
pub mod tasks;


use axum::routing::{get, patch, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/tasks", get(tasks::list_tasks).post(tasks::create_task))
        .route("/api/tasks/stream", get(streams::stream_tasks))
        .route(
            "/api/tasks/generate-titles",
            post(tasks::generate_missing_titles),
        )
        .route(
            "/api/tasks/{id}",
            patch(tasks::update_task).delete(tasks::delete_task),
        )
        .route("/api/tasks/{id}/events", get(tasks::get_events))
        .route("/api/tasks/{id}/outputs/{filename}", get(tasks::serve_output))
        .route("/api/tasks/{id}/feedback", post(tasks::submit_feedback))
        .route("/api/tasks/{id}/done", post(tasks::complete_task))
        .route("/api/tasks/{id}/cancel", post(tasks::cancel_task))
        .route("/api/tasks/{id}/resume", post(tasks::resume_task))
        .route("/api/tasks/{id}/archive", post(tasks::archive_task))
        .route("/api/tasks/{id}/unarchive", post(tasks::unarchive_task))
        .route("/api/tasks/{id}/sync", post(tasks::sync_task))
        .route("/api/tasks/{id}/logs", get(streams::stream_logs))
        .route("/api/git/status", get(git::git_status))
        .route("/api/git/stream", get(streams::stream_git))
        .route("/api/containers", get(containers::list_containers))
        .with_state(state)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}
