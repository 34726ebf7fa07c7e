//! Per-task execution: worktree preparation and the multi-turn loop.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use foreman_core::{EventKind, Store, Task, TaskStatus, TaskUsage};

use crate::container::{container_name, force_remove_container, ContainerRun};
use crate::error::RunnerError;
use crate::snapshot::snapshot_workspace;
use crate::{container, snapshot};

/// Runner configuration resolved at startup.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Container runtime binary (docker/podman compatible CLI).
    pub command: String,
    /// Sandbox image run for every agent turn.
    pub sandbox_image: String,
    /// Env file passed into each container (agent token).
    pub env_file: Option<PathBuf>,
    /// Absolute workspace directories exposed to the agent.
    pub workspaces: Vec<PathBuf>,
    /// Root directory for per-task worktrees.
    pub worktrees_dir: PathBuf,
}

/// Drives agent containers against per-task worktrees and writes every
/// observable effect back into the store.
pub struct Runner {
    pub(crate) store: Arc<Store>,
    pub(crate) config: RunnerConfig,
    /// Per-repo locks serializing the rebase-to-merge window.
    pub(crate) repo_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    /// Cancellation tokens for tasks currently running a container.
    cancellations: StdMutex<HashMap<Uuid, CancellationToken>>,
}

impl Runner {
    pub fn new(store: Arc<Store>, config: RunnerConfig) -> Arc<Self> {
        Arc::new(Self {
            store,
            config,
            repo_locks: Mutex::new(HashMap::new()),
            cancellations: StdMutex::new(HashMap::new()),
        })
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn workspaces(&self) -> &[PathBuf] {
        &self.config.workspaces
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Start a task run in the background.
    ///
    /// A panicking run must never take the server down or leave the task
    /// stuck in `in_progress`, so the join result is inspected and a panic is
    /// converted into a `failed` transition.
    pub fn spawn_run(
        self: &Arc<Self>,
        task_id: Uuid,
        prompt: String,
        session_id: String,
        resumed_from_waiting: bool,
    ) {
        let runner = Arc::clone(self);
        tokio::spawn(async move {
            let inner = tokio::spawn({
                let runner = Arc::clone(&runner);
                async move {
                    runner
                        .run(task_id, prompt, session_id, resumed_from_waiting)
                        .await;
                }
            });
            if let Err(join_err) = inner.await {
                if join_err.is_panic() {
                    error!(task = %task_id, "task run panicked");
                    runner
                        .fail_task(task_id, TaskStatus::InProgress, "internal error during task run")
                        .await;
                }
            }
        });
    }

    /// Execute the multi-turn loop for a task already moved to `in_progress`.
    pub async fn run(
        self: &Arc<Self>,
        task_id: Uuid,
        prompt: String,
        session_id: String,
        resumed_from_waiting: bool,
    ) {
        let token = CancellationToken::new();
        self.cancellations
            .lock()
            .expect("cancellation lock poisoned")
            .insert(task_id, token.clone());

        self.run_inner(task_id, prompt, session_id, resumed_from_waiting, token)
            .await;

        self.cancellations
            .lock()
            .expect("cancellation lock poisoned")
            .remove(&task_id);
    }

    async fn run_inner(
        self: &Arc<Self>,
        task_id: Uuid,
        prompt: String,
        session_id: String,
        resumed_from_waiting: bool,
        token: CancellationToken,
    ) {
        let task = match self.store.get_task(task_id).await {
            Ok(task) => task,
            Err(err) => {
                error!(task = %task_id, error = %err, "get task");
                return;
            }
        };

        // One deadline covers every turn of this invocation.
        let timeout = Duration::from_secs(u64::from(task.timeout) * 60);
        let deadline = Instant::now() + timeout;

        let (worktree_paths, branch_name) = match self.prepare_worktrees(&task).await {
            Ok(prepared) => prepared,
            Err(err) => {
                error!(task = %task_id, error = %err, "worktree preparation failed");
                self.fail_task(task_id, TaskStatus::InProgress, &format!("worktree setup: {err}"))
                    .await;
                return;
            }
        };

        let mut prompt = prompt;
        let mut session_id = session_id;
        let mut turns = task.turns;

        loop {
            turns += 1;
            info!(task = %task_id, turn = turns, session = %session_id, ?timeout, "turn");

            let capture = container::run_container(
                ContainerRun {
                    command: &self.config.command,
                    image: &self.config.sandbox_image,
                    env_file: self.config.env_file.as_deref(),
                    name: container_name(task_id),
                    prompt: &prompt,
                    session_id: &session_id,
                    mounts: &worktree_paths,
                },
                deadline,
                &token,
            )
            .await;

            if let Err(err) = self
                .store
                .save_turn_output(task_id, turns, &capture.stdout, &capture.stderr)
                .await
            {
                error!(task = %task_id, turn = turns, error = %err, "save turn output");
            }

            let output = match capture.result {
                Ok(output) => output,
                Err(RunnerError::Cancelled) => {
                    // The cancel path owns the terminal transition.
                    info!(task = %task_id, "run cancelled");
                    return;
                }
                Err(err) => {
                    if self.task_was_cancelled(task_id).await {
                        return;
                    }
                    error!(task = %task_id, error = %err, "container error");
                    let message = match err {
                        RunnerError::Timeout => {
                            format!("task timed out after {} minutes", task.timeout)
                        }
                        other => other.to_string(),
                    };
                    let _ = self
                        .store
                        .update_task_result(task_id, &message, &session_id, "", turns)
                        .await;
                    self.fail_task(task_id, TaskStatus::InProgress, &message).await;
                    return;
                }
            };

            let _ = self
                .store
                .insert_event(
                    task_id,
                    EventKind::Output,
                    serde_json::json!({
                        "result": output.result,
                        "stop_reason": output.stop_reason(),
                        "session_id": output.session_id,
                    }),
                )
                .await;

            if !output.session_id.is_empty() {
                session_id = output.session_id.clone();
            }
            let _ = self
                .store
                .update_task_result(task_id, &output.result, &session_id, output.stop_reason(), turns)
                .await;
            let _ = self
                .store
                .accumulate_task_usage(
                    task_id,
                    &TaskUsage {
                        input_tokens: output.usage.input_tokens,
                        output_tokens: output.usage.output_tokens,
                        cache_read_input_tokens: output.usage.cache_read_input_tokens,
                        cache_creation_input_tokens: output.usage.cache_creation_input_tokens,
                        cost_usd: output.total_cost_usd,
                    },
                )
                .await;

            // Another actor may have finalized a cancel while the container
            // ran; its terminal state must not be overwritten.
            if self.task_was_cancelled(task_id).await {
                return;
            }

            if output.is_error {
                self.transition(task_id, TaskStatus::InProgress, TaskStatus::Failed)
                    .await;
                return;
            }

            match output.stop_reason() {
                "end_turn" => {
                    self.transition(task_id, TaskStatus::InProgress, TaskStatus::Done)
                        .await;
                    if resumed_from_waiting && !session_id.is_empty() {
                        self.spawn_commit(task_id, session_id.clone());
                    }
                    return;
                }
                "max_tokens" | "pause_turn" => {
                    info!(task = %task_id, stop_reason = output.stop_reason(), "auto-continuing");
                    prompt.clear();
                }
                other => {
                    // The agent may report a null stop reason with
                    // subtype=success when a long run completes normally.
                    if output.subtype == "success" {
                        info!(task = %task_id, stop_reason = other, "treating subtype=success as done");
                        self.transition(task_id, TaskStatus::InProgress, TaskStatus::Done)
                            .await;
                        if resumed_from_waiting && !session_id.is_empty() {
                            self.spawn_commit(task_id, session_id.clone());
                        }
                        return;
                    }

                    // Unknown stop reason: the agent needs human feedback.
                    self.transition(task_id, TaskStatus::InProgress, TaskStatus::Waiting)
                        .await;
                    return;
                }
            }
        }
    }

    /// Create (or reuse) the per-workspace worktrees for a task and persist
    /// the resulting path map.
    async fn prepare_worktrees(
        &self,
        task: &Task,
    ) -> Result<(BTreeMap<String, String>, String), RunnerError> {
        // Feedback-resumed tasks keep their existing worktrees.
        if !task.worktree_paths.is_empty() {
            return Ok((task.worktree_paths.clone(), task.branch_name.clone()));
        }

        let branch_name = format!("task/{}", task.short_id());
        let task_root = self.config.worktrees_dir.join(task.id.to_string());
        if !self.config.workspaces.is_empty() {
            tokio::fs::create_dir_all(&task_root).await?;
        }

        let mut worktree_paths = BTreeMap::new();
        for workspace in &self.config.workspaces {
            let Some(basename) = workspace.file_name() else {
                continue;
            };
            let worktree = task_root.join(basename);

            let created = if git_ops::is_git_repo(workspace).await {
                git_ops::create_worktree(workspace, &worktree, &branch_name)
                    .await
                    .map_err(RunnerError::from)
            } else {
                snapshot_workspace(workspace, &worktree).await
            };

            if let Err(err) = created {
                self.cleanup_worktrees(task.id, &worktree_paths, &branch_name)
                    .await;
                return Err(err);
            }

            worktree_paths.insert(
                workspace.to_string_lossy().into_owned(),
                worktree.to_string_lossy().into_owned(),
            );
        }

        if let Err(err) = self
            .store
            .update_task_worktrees(task.id, worktree_paths.clone(), &branch_name)
            .await
        {
            self.cleanup_worktrees(task.id, &worktree_paths, &branch_name)
                .await;
            return Err(err.into());
        }

        Ok((worktree_paths, branch_name))
    }

    /// Remove every worktree of a task plus its branch and the per-task
    /// parent directory. Safe to call repeatedly.
    pub async fn cleanup_worktrees(
        &self,
        task_id: Uuid,
        worktree_paths: &BTreeMap<String, String>,
        branch_name: &str,
    ) {
        for (repo, worktree) in worktree_paths {
            let repo_path = Path::new(repo);
            let worktree_path = Path::new(worktree);
            if git_ops::is_git_repo(repo_path).await {
                if let Err(err) =
                    git_ops::remove_worktree(repo_path, worktree_path, branch_name).await
                {
                    warn!(task = %task_id, repo, error = %err, "remove worktree");
                }
            } else {
                match tokio::fs::remove_dir_all(worktree_path).await {
                    Ok(()) => {}
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                    Err(err) => warn!(task = %task_id, repo, error = %err, "remove snapshot dir"),
                }
            }
        }

        let task_root = self.config.worktrees_dir.join(task_id.to_string());
        match tokio::fs::remove_dir_all(&task_root).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => warn!(task = %task_id, error = %err, "remove task worktree root"),
        }
    }

    /// Operator cancel: fire the run's cancellation token, remove the
    /// container by its deterministic name, and clean up worktrees. The
    /// caller transitions the task status.
    pub async fn cancel_task(&self, task: &Task) {
        let token = self
            .cancellations
            .lock()
            .expect("cancellation lock poisoned")
            .remove(&task.id);
        if let Some(token) = token {
            token.cancel();
        }

        force_remove_container(&self.config.command, &container_name(task.id)).await;

        if !task.worktree_paths.is_empty() {
            self.cleanup_worktrees(task.id, &task.worktree_paths, &task.branch_name)
                .await;
        }
    }

    /// Extract a snapshot worktree back into its non-git workspace.
    pub(crate) async fn extract_snapshot(
        &self,
        worktree: &Path,
        workspace: &Path,
    ) -> Result<(), RunnerError> {
        snapshot::extract_snapshot_to_workspace(worktree, workspace).await
    }

    async fn task_was_cancelled(&self, task_id: Uuid) -> bool {
        match self.store.get_task(task_id).await {
            Ok(task) => task.status == TaskStatus::Cancelled,
            // A deleted task has nothing left to transition.
            Err(_) => true,
        }
    }

    /// Transition with a matching `state_change` event.
    pub(crate) async fn transition(&self, task_id: Uuid, from: TaskStatus, to: TaskStatus) {
        if let Err(err) = self.store.update_task_status(task_id, to).await {
            error!(task = %task_id, error = %err, "update status");
            return;
        }
        let _ = self
            .store
            .insert_event(
                task_id,
                EventKind::StateChange,
                serde_json::json!({"from": from.as_str(), "to": to.as_str()}),
            )
            .await;
    }

    /// Mark a task failed with an `error` event followed by the state change.
    pub(crate) async fn fail_task(&self, task_id: Uuid, from: TaskStatus, message: &str) {
        if let Err(err) = self
            .store
            .update_task_status(task_id, TaskStatus::Failed)
            .await
        {
            error!(task = %task_id, error = %err, "update status to failed");
            return;
        }
        let _ = self
            .store
            .insert_event(
                task_id,
                EventKind::Error,
                serde_json::json!({"error": message}),
            )
            .await;
        let _ = self
            .store
            .insert_event(
                task_id,
                EventKind::StateChange,
                serde_json::json!({"from": from.as_str(), "to": "failed"}),
            )
            .await;
    }

    /// Lazily-created per-repo lock guarding the rebase-to-merge window.
    pub(crate) async fn repo_lock(&self, repo: &str) -> Arc<Mutex<()>> {
        let mut locks = self.repo_locks.lock().await;
        locks
            .entry(repo.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}
