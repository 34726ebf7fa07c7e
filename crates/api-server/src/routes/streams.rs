//! Live views: SSE snapshots and the plain-text log tail.

use std::collections::BTreeSet;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::extract::{Path, State};
use axum::http::header;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::Response;
use futures::stream::Stream;
use tracing::debug;
use uuid::Uuid;

use foreman_core::{Store, TaskStatus};

use crate::error::ApiError;
use crate::state::AppState;

const SSE_KEEP_ALIVE: Duration = Duration::from_secs(15);
const GIT_POLL_INTERVAL: Duration = Duration::from_secs(5);
const LOG_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Unsubscribes when the SSE stream is dropped (client disconnect included).
struct SubscriptionGuard {
    store: Arc<Store>,
    id: u64,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.store.unsubscribe(self.id);
    }
}

/// GET /api/tasks/stream
///
/// Emits the full task list immediately, then again after every store
/// signal. Signals are coalesced, so a slow client always converges on the
/// latest snapshot.
pub async fn stream_tasks(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let (id, mut rx) = state.store.subscribe();
    let store = state.store.clone();

    let stream = async_stream::stream! {
        let _guard = SubscriptionGuard { store: store.clone(), id };
        loop {
            let tasks = store.list_tasks(true).await;
            if let Ok(json) = serde_json::to_string(&tasks) {
                yield Ok(Event::default().event("tasks").data(json));
            }
            if rx.recv().await.is_none() {
                break;
            }
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::new().interval(SSE_KEEP_ALIVE).text("ping"))
}

/// GET /api/git/stream: workspace status snapshots on a fixed poll.
pub async fn stream_git(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let workspaces = state.workspaces.clone();

    let stream = async_stream::stream! {
        loop {
            let mut statuses = Vec::with_capacity(workspaces.len());
            for workspace in workspaces.iter() {
                statuses.push(git_ops::workspace_status(workspace).await);
            }
            if let Ok(json) = serde_json::to_string(&statuses) {
                yield Ok(Event::default().event("git").data(json));
            }
            tokio::time::sleep(GIT_POLL_INTERVAL).await;
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::new().interval(SSE_KEEP_ALIVE).text("ping"))
}

/// GET /api/tasks/{id}/logs
///
/// Streams every turn artifact in order (stdout then stderr per turn) and
/// keeps tailing for new turns while the task is running. The stream ends
/// once the task leaves `in_progress`/`committing`; a client disconnect
/// simply drops it.
pub async fn stream_logs(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Response, ApiError> {
    state.store.get_task(id).await?;
    let store = state.store.clone();

    let stream = async_stream::stream! {
        let outputs_dir = store.outputs_dir(id);
        let mut emitted: BTreeSet<String> = BTreeSet::new();

        loop {
            let mut names: Vec<String> = Vec::new();
            if let Ok(mut entries) = tokio::fs::read_dir(&outputs_dir).await {
                while let Ok(Some(entry)) = entries.next_entry().await {
                    let name = entry.file_name().to_string_lossy().into_owned();
                    if name.starts_with("turn-") && !emitted.contains(&name) {
                        names.push(name);
                    }
                }
            }
            // Lexical order interleaves turn-NNNN.json with its stderr twin.
            names.sort();

            for name in names {
                match tokio::fs::read(outputs_dir.join(&name)).await {
                    Ok(content) => {
                        emitted.insert(name.clone());
                        yield Ok::<Bytes, Infallible>(Bytes::from(format!("===== {name} =====\n")));
                        yield Ok(Bytes::from(content));
                        yield Ok(Bytes::from("\n"));
                    }
                    Err(err) => debug!(task = %id, file = %name, error = %err, "log tail read"),
                }
            }

            let running = matches!(
                store.get_task(id).await,
                Ok(task) if matches!(task.status, TaskStatus::InProgress | TaskStatus::Committing)
            );
            if !running {
                break;
            }
            tokio::time::sleep(LOG_POLL_INTERVAL).await;
        }
    };

    let response = Response::builder()
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(Body::from_stream(stream))
        .map_err(|err| ApiError::Internal(err.to_string()))?;
    Ok(response)
}
