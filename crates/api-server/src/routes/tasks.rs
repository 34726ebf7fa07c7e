//! Task API endpoints: CRUD, state-machine actions, events, artifacts.

use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use uuid::Uuid;

use foreman_core::{EventKind, Task, TaskEvent, TaskStatus};

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    include_archived: bool,
}

/// GET /api/tasks
pub async fn list_tasks(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Json<Vec<Task>> {
    Json(state.store.list_tasks(query.include_archived).await)
}

#[derive(Debug, Deserialize)]
pub struct CreateTaskRequest {
    pub prompt: String,
    #[serde(default)]
    pub timeout: i64,
}

/// POST /api/tasks
pub async fn create_task(
    State(state): State<AppState>,
    Json(req): Json<CreateTaskRequest>,
) -> Result<(StatusCode, Json<Task>), ApiError> {
    let task = state.store.create_task(&req.prompt, req.timeout).await?;

    let _ = state
        .store
        .insert_event(
            task.id,
            EventKind::StateChange,
            serde_json::json!({"to": "backlog"}),
        )
        .await;

    state.runner.spawn_generate_title(task.id, task.prompt.clone());

    Ok((StatusCode::CREATED, Json(task)))
}

#[derive(Debug, Deserialize)]
pub struct UpdateTaskRequest {
    #[serde(default)]
    pub status: Option<TaskStatus>,
    #[serde(default)]
    pub position: Option<i64>,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub timeout: Option<i64>,
    #[serde(default)]
    pub fresh_start: Option<bool>,
}

/// PATCH /api/tasks/{id}
///
/// Carries every operator-side mutation: backlog edits, board position,
/// retry back to backlog, and the backlog → in_progress handoff that starts
/// the runner.
pub async fn update_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateTaskRequest>,
) -> Result<Json<Task>, ApiError> {
    let task = state.store.get_task(id).await?;

    // Prompt, timeout, and fresh-start are editable while the card sits in
    // backlog.
    if task.status == TaskStatus::Backlog
        && (req.prompt.is_some() || req.timeout.is_some() || req.fresh_start.is_some())
    {
        state
            .store
            .update_task_backlog(id, req.prompt.as_deref(), req.timeout, req.fresh_start)
            .await?;
    }

    if let Some(position) = req.position {
        state.store.update_task_position(id, position).await?;
    }

    if let Some(new_status) = req.status {
        let old_status = task.status;

        if new_status == TaskStatus::Backlog && old_status.is_retryable() {
            // Retry: drop the previous attempt's worktrees and reset.
            if !task.worktree_paths.is_empty() {
                state
                    .runner
                    .cleanup_worktrees(id, &task.worktree_paths, &task.branch_name)
                    .await;
            }
            let new_prompt = req.prompt.as_deref().unwrap_or(&task.prompt);
            // Sessions resume by default; clients opt out with fresh_start.
            let fresh_start = req.fresh_start.unwrap_or(false);
            state
                .store
                .reset_task_for_retry(id, new_prompt, fresh_start)
                .await?;
            let _ = state
                .store
                .insert_event(
                    id,
                    EventKind::StateChange,
                    serde_json::json!({"from": old_status.as_str(), "to": "backlog"}),
                )
                .await;
        } else if new_status != old_status {
            state.store.update_task_status(id, new_status).await?;
            let _ = state
                .store
                .insert_event(
                    id,
                    EventKind::StateChange,
                    serde_json::json!({"from": old_status.as_str(), "to": new_status.as_str()}),
                )
                .await;

            if new_status == TaskStatus::InProgress && old_status == TaskStatus::Backlog {
                let session_id = if task.fresh_start {
                    String::new()
                } else {
                    task.session_id.clone().unwrap_or_default()
                };
                state
                    .runner
                    .spawn_run(id, task.prompt.clone(), session_id, false);
            }
        }
    }

    Ok(Json(state.store.get_task(id).await?))
}

/// DELETE /api/tasks/{id}
pub async fn delete_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    if let Ok(task) = state.store.get_task(id).await {
        if !task.worktree_paths.is_empty() {
            state
                .runner
                .cleanup_worktrees(id, &task.worktree_paths, &task.branch_name)
                .await;
        }
    }
    state.store.delete_task(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /api/tasks/{id}/events
pub async fn get_events(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Json<Vec<TaskEvent>> {
    Json(state.store.get_events(id).await)
}

/// GET /api/tasks/{id}/outputs/{filename}
pub async fn serve_output(
    State(state): State<AppState>,
    Path((id, filename)): Path<(Uuid, String)>,
) -> Result<Response, ApiError> {
    // Reject traversal before touching the filesystem.
    if filename.contains('/') || filename.contains("..") {
        return Err(ApiError::BadRequest("invalid filename".to_string()));
    }

    let path = state.store.outputs_dir(id).join(&filename);
    let content = tokio::fs::read(&path)
        .await
        .map_err(|_| ApiError::NotFound("not found".to_string()))?;

    let content_type = if filename.ends_with(".json") {
        "application/json"
    } else {
        "text/plain; charset=utf-8"
    };
    Ok(([(header::CONTENT_TYPE, content_type)], content).into_response())
}

#[derive(Debug, Deserialize)]
pub struct FeedbackRequest {
    pub message: String,
}

/// POST /api/tasks/{id}/feedback
///
/// The feedback text becomes the effective prompt for the resumed turn; the
/// stored prompt is untouched.
pub async fn submit_feedback(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<FeedbackRequest>,
) -> Result<StatusCode, ApiError> {
    let task = state.store.get_task(id).await?;
    if task.status != TaskStatus::Waiting {
        return Err(ApiError::BadRequest(format!(
            "task is {}, feedback requires waiting",
            task.status
        )));
    }
    if req.message.trim().is_empty() {
        return Err(ApiError::BadRequest("message is required".to_string()));
    }

    let _ = state
        .store
        .insert_event(
            id,
            EventKind::Feedback,
            serde_json::json!({"message": req.message}),
        )
        .await;

    state
        .store
        .update_task_status(id, TaskStatus::InProgress)
        .await?;
    let _ = state
        .store
        .insert_event(
            id,
            EventKind::StateChange,
            serde_json::json!({"from": "waiting", "to": "in_progress"}),
        )
        .await;

    let session_id = task.session_id.unwrap_or_default();
    state.runner.spawn_run(id, req.message, session_id, true);

    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/tasks/{id}/done: operator marks a waiting task complete and
/// the commit pipeline takes over.
pub async fn complete_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    let task = state.store.get_task(id).await?;
    if task.status != TaskStatus::Waiting {
        return Err(ApiError::BadRequest(format!(
            "task is {}, completion requires waiting",
            task.status
        )));
    }

    state.store.update_task_status(id, TaskStatus::Done).await?;
    let _ = state
        .store
        .insert_event(
            id,
            EventKind::StateChange,
            serde_json::json!({"from": "waiting", "to": "done"}),
        )
        .await;

    state
        .runner
        .spawn_commit(id, task.session_id.unwrap_or_default());

    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/tasks/{id}/cancel
pub async fn cancel_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    let task = state.store.get_task(id).await?;
    if !matches!(task.status, TaskStatus::InProgress | TaskStatus::Waiting) {
        return Err(ApiError::BadRequest(format!(
            "task is {}, cancel requires a running task",
            task.status
        )));
    }

    // The status flips first so the runner's cancellation guard sees the
    // terminal state before the container dies.
    state
        .store
        .update_task_status(id, TaskStatus::Cancelled)
        .await?;
    let _ = state
        .store
        .insert_event(
            id,
            EventKind::StateChange,
            serde_json::json!({"from": task.status.as_str(), "to": "cancelled"}),
        )
        .await;

    state.runner.cancel_task(&task).await;

    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/tasks/{id}/resume
pub async fn resume_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    let task = state.store.get_task(id).await?;
    let old_status = task.status;

    state.store.resume_task(id, None).await?;
    let _ = state
        .store
        .insert_event(
            id,
            EventKind::StateChange,
            serde_json::json!({"from": old_status.as_str(), "to": "in_progress"}),
        )
        .await;

    let session_id = if task.fresh_start {
        String::new()
    } else {
        task.session_id.clone().unwrap_or_default()
    };
    let resumed = !session_id.is_empty();
    state
        .runner
        .spawn_run(id, task.prompt.clone(), session_id, resumed);

    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/tasks/{id}/archive
pub async fn archive_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    state.store.set_task_archived(id, true).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/tasks/{id}/unarchive
pub async fn unarchive_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    state.store.set_task_archived(id, false).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/tasks/{id}/sync: re-run the commit pipeline for a task whose
/// worktrees still exist.
pub async fn sync_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    let task = state.store.get_task(id).await?;
    if task.worktree_paths.is_empty() {
        return Err(ApiError::BadRequest(
            "task has no worktrees to sync".to_string(),
        ));
    }

    state
        .runner
        .spawn_commit(id, task.session_id.unwrap_or_default());
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct GenerateTitlesQuery {
    #[serde(default = "default_title_limit")]
    limit: usize,
}

fn default_title_limit() -> usize {
    10
}

/// POST /api/tasks/generate-titles?limit=N
pub async fn generate_missing_titles(
    State(state): State<AppState>,
    Query(query): Query<GenerateTitlesQuery>,
) -> Json<serde_json::Value> {
    let untitled: Vec<Task> = state
        .store
        .list_tasks(true)
        .await
        .into_iter()
        .filter(|t| t.title.is_empty())
        .collect();

    let total = untitled.len();
    let queued: Vec<&Task> = if query.limit > 0 {
        untitled.iter().take(query.limit).collect()
    } else {
        untitled.iter().collect()
    };

    let mut task_ids = Vec::with_capacity(queued.len());
    for task in &queued {
        task_ids.push(task.id.to_string());
        state
            .runner
            .spawn_generate_title(task.id, task.prompt.clone());
    }

    Json(serde_json::json!({
        "queued": task_ids.len(),
        "total_without_title": total,
        "task_ids": task_ids,
    }))
}
