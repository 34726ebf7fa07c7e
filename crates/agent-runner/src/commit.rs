//! The four-phase commit pipeline: stage → rebase/merge → record → cleanup.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use foreman_core::{EventKind, Task, TaskStatus};
use git_ops::GitError;

use crate::container::{container_name, run_container, ContainerRun, CONTAINER_PREFIX};
use crate::error::RunnerError;
use crate::output::truncate;
use crate::runner::Runner;

/// How many rebase attempts (with conflict resolution between them) are made
/// per repository before the pipeline gives up.
const MAX_REBASE_RETRIES: u32 = 3;

/// Budget for the auxiliary commit-message container.
const COMMIT_MESSAGE_TIMEOUT: Duration = Duration::from_secs(90);

/// Fixed commit message used when agent synthesis fails or returns nothing.
fn fallback_commit_message(prompt: &str) -> String {
    let first_line = prompt.lines().next().unwrap_or("");
    format!("{CONTAINER_PREFIX}: {}", truncate(first_line, 72))
}

struct PendingCommit {
    repo: String,
    worktree: String,
    diff_stat: String,
    recent_log: String,
}

impl Runner {
    /// Run the commit pipeline in the background under a fresh timeout.
    pub fn spawn_commit(self: &Arc<Self>, task_id: Uuid, session_id: String) {
        let runner = Arc::clone(self);
        tokio::spawn(async move {
            runner.commit(task_id, session_id).await;
        });
    }

    /// Stage, rebase, fast-forward-merge, and clean up every worktree of a
    /// completed task.
    ///
    /// The task is parked in `committing` for the duration and always returns
    /// to `done`; a pipeline failure records an `error` event but never
    /// demotes the completed task.
    pub async fn commit(self: &Arc<Self>, task_id: Uuid, session_id: String) {
        let task = match self.store.get_task(task_id).await {
            Ok(task) => task,
            Err(err) => {
                error!(task = %task_id, error = %err, "commit: get task");
                return;
            }
        };

        if task.worktree_paths.is_empty() {
            info!(task = %task_id, "commit: no worktrees, nothing to do");
            return;
        }

        let timeout = Duration::from_secs(u64::from(task.timeout) * 60);
        let deadline = Instant::now() + timeout;
        let worktrees = task.worktree_paths.clone();
        let branch_name = task.branch_name.clone();

        info!(task = %task_id, session = %session_id, "commit pipeline starting");
        self.transition(task_id, task.status, TaskStatus::Committing)
            .await;

        // Phase 1: stage and commit pending changes host-side.
        self.progress(task_id, "Phase 1/4: Staging and committing changes...")
            .await;
        self.host_stage_and_commit(task_id, &worktrees, &task.prompt)
            .await;

        // Phase 2: rebase each worktree onto its default branch and merge.
        self.progress(task_id, "Phase 2/4: Rebasing and merging into default branch...")
            .await;
        let (commit_hashes, base_hashes) = match self
            .rebase_and_merge(task_id, &worktrees, &branch_name, &session_id, deadline)
            .await
        {
            Ok(hashes) => hashes,
            Err(err) => {
                error!(task = %task_id, error = %err, "rebase/merge failed");
                let _ = self
                    .store
                    .insert_event(
                        task_id,
                        EventKind::Error,
                        serde_json::json!({"error": format!("rebase/merge failed: {err}")}),
                    )
                    .await;
                self.transition(task_id, TaskStatus::Committing, TaskStatus::Done)
                    .await;
                return;
            }
        };

        // Phase 3: record hashes and the human-readable summary.
        self.progress(task_id, "Phase 3/4: Updating PROGRESS.md...").await;
        if !commit_hashes.is_empty() {
            if let Err(err) = self
                .store
                .update_task_commit_hashes(task_id, commit_hashes.clone())
                .await
            {
                warn!(task = %task_id, error = %err, "save commit hashes");
            }
        }
        if !base_hashes.is_empty() {
            if let Err(err) = self
                .store
                .update_task_base_commit_hashes(task_id, base_hashes)
                .await
            {
                warn!(task = %task_id, error = %err, "save base commit hashes");
            }
        }
        if let Ok(task) = self.store.get_task(task_id).await {
            if let Err(err) = write_progress_md(&task, &commit_hashes).await {
                warn!(task = %task_id, error = %err, "write PROGRESS.md");
            }
        }

        // Phase 4: the branch is merged; drop the worktrees.
        self.progress(task_id, "Phase 4/4: Cleaning up worktrees...").await;
        self.cleanup_worktrees(task_id, &worktrees, &branch_name)
            .await;

        self.progress(task_id, "Commit pipeline completed.").await;
        self.transition(task_id, TaskStatus::Committing, TaskStatus::Done)
            .await;
        info!(task = %task_id, "commit pipeline completed");
    }

    /// Stage every worktree, synthesize one commit message across all pending
    /// changes, and commit each dirty worktree with it.
    async fn host_stage_and_commit(
        &self,
        task_id: Uuid,
        worktrees: &BTreeMap<String, String>,
        prompt: &str,
    ) -> bool {
        let mut pending: Vec<PendingCommit> = Vec::new();

        for (repo, worktree) in worktrees {
            let worktree_path = Path::new(worktree);
            if let Err(err) = git_ops::git_checked(worktree_path, &["add", "-A"]).await {
                warn!(task = %task_id, repo, error = %err, "stage: git add -A");
                continue;
            }

            let status = match git_ops::git(worktree_path, &["status", "--porcelain"]).await {
                Ok(out) => out.stdout,
                Err(err) => {
                    warn!(task = %task_id, repo, error = %err, "stage: git status");
                    continue;
                }
            };
            if status.trim().is_empty() {
                info!(task = %task_id, repo, "stage: nothing to commit");
                continue;
            }

            let diff_stat = git_ops::git(worktree_path, &["diff", "--cached", "--stat"])
                .await
                .map(|o| o.stdout.trim().to_string())
                .unwrap_or_default();
            let recent_log = git_ops::git(worktree_path, &["log", "--oneline", "-3"])
                .await
                .map(|o| o.stdout.trim().to_string())
                .unwrap_or_default();

            pending.push(PendingCommit {
                repo: repo.clone(),
                worktree: worktree.clone(),
                diff_stat,
                recent_log,
            });
        }

        if pending.is_empty() {
            return false;
        }

        let mut all_stats = String::new();
        let mut all_logs = String::new();
        for p in &pending {
            if pending.len() > 1 {
                all_stats.push_str(&format!("Repository: {}\n", p.repo));
                all_logs.push_str(&format!("Repository: {}\n", p.repo));
            }
            all_stats.push_str(&p.diff_stat);
            all_stats.push('\n');
            if !p.recent_log.is_empty() {
                all_logs.push_str(&p.recent_log);
                all_logs.push('\n');
            }
        }

        let message = self
            .generate_commit_message(task_id, prompt, &all_stats, &all_logs)
            .await;

        let mut committed = false;
        for p in &pending {
            match git_ops::git_checked(Path::new(&p.worktree), &["commit", "-m", &message]).await {
                Ok(_) => {
                    committed = true;
                    info!(task = %task_id, repo = %p.repo, "stage: committed changes");
                }
                Err(err) => {
                    warn!(task = %task_id, repo = %p.repo, error = %err, "stage: git commit");
                }
            }
        }
        committed
    }

    /// Ask a short-lived agent container for a commit message matching the
    /// project's style. Any failure degrades to the fixed fallback.
    async fn generate_commit_message(
        &self,
        task_id: Uuid,
        prompt: &str,
        diff_stat: &str,
        recent_log: &str,
    ) -> String {
        let fallback = fallback_commit_message(prompt);

        let mut commit_prompt = format!(
            "Write a git commit message for the following task and file changes.\n\
             Rules:\n\
             - Subject line: imperative mood, max 72 characters, no trailing period\n\
             - Optionally add a blank line followed by a short body (2-4 lines) explaining what changed and why\n\
             - Output ONLY the raw commit message text, no markdown, no code fences, no explanation\n\
             - Match the style and tone of the recent commit history shown below\n\n\
             Task:\n{prompt}\n\nChanged files:\n{diff_stat}"
        );
        if !recent_log.is_empty() {
            commit_prompt.push_str(&format!("\nRecent commits (for style reference):\n{recent_log}"));
        }

        let short = task_id.to_string()[..8].to_string();
        let capture = run_container(
            ContainerRun {
                command: &self.config.command,
                image: &self.config.sandbox_image,
                env_file: self.config.env_file.as_deref(),
                name: format!("{CONTAINER_PREFIX}-commit-{short}"),
                prompt: &commit_prompt,
                session_id: "",
                mounts: &BTreeMap::new(),
            },
            Instant::now() + COMMIT_MESSAGE_TIMEOUT,
            &CancellationToken::new(),
        )
        .await;

        let output = match capture.result {
            Ok(output) => output,
            Err(err) => {
                warn!(task = %task_id, error = %err, "commit message generation failed");
                return fallback;
            }
        };

        let message = output.result.trim().trim_matches('`').trim().to_string();
        if message.is_empty() {
            warn!(task = %task_id, "commit message generation: blank result");
            return fallback;
        }
        message
    }

    /// Rebase every worktree onto its repo's default branch (resolving
    /// conflicts with the agent) and fast-forward merge the task branch.
    ///
    /// Returns (post-merge hashes, pre-merge base hashes) keyed by repo.
    async fn rebase_and_merge(
        self: &Arc<Self>,
        task_id: Uuid,
        worktrees: &BTreeMap<String, String>,
        branch_name: &str,
        session_id: &str,
        deadline: Instant,
    ) -> Result<(BTreeMap<String, String>, BTreeMap<String, String>), RunnerError> {
        let mut commit_hashes = BTreeMap::new();
        let mut base_hashes = BTreeMap::new();

        for (repo, worktree) in worktrees {
            info!(task = %task_id, repo, "rebase+merge");
            let repo_path = Path::new(repo);
            let worktree_path = Path::new(worktree);

            if !git_ops::is_git_repo(repo_path).await {
                // Non-git workspace: copy the snapshot's files back instead.
                let name = basename(repo);
                self.progress(task_id, &format!("Extracting changes from sandbox to {name}..."))
                    .await;
                self.extract_snapshot(worktree_path, repo_path)
                    .await
                    .map_err(|err| {
                        RunnerError::Pipeline(format!("extract snapshot for {repo}: {err}"))
                    })?;
                if let Ok(hash) = git_ops::commit_hash(worktree_path).await {
                    commit_hashes.insert(repo.clone(), hash);
                }
                self.progress(task_id, &format!("Changes extracted to {name}."))
                    .await;
                continue;
            }

            let def_branch = git_ops::default_branch(repo_path).await.map_err(|err| {
                RunnerError::Pipeline(format!("default branch for {repo}: {err}"))
            })?;

            let ahead = match git_ops::has_commits_ahead_of(worktree_path, &def_branch).await {
                Ok(ahead) => ahead,
                Err(err) => {
                    warn!(task = %task_id, repo, error = %err, "rev-list check");
                    false
                }
            };
            if !ahead {
                info!(task = %task_id, repo, "no commits to merge, skipping");
                self.progress(task_id, &format!("Skipping {repo} — no new commits to merge."))
                    .await;
                continue;
            }

            // Concurrent tasks must not interleave between rebase and merge
            // on the same host repo.
            let lock = self.repo_lock(repo).await;
            let _guard = lock.lock().await;

            let mut attempt = 1;
            loop {
                self.progress(
                    task_id,
                    &format!(
                        "Rebasing {repo} onto {def_branch} (attempt {attempt}/{MAX_REBASE_RETRIES})..."
                    ),
                )
                .await;

                match git_ops::rebase_onto_default(repo_path, worktree_path).await {
                    Ok(()) => break,
                    Err(err) if attempt == MAX_REBASE_RETRIES => {
                        return Err(RunnerError::Pipeline(format!(
                            "rebase failed after {MAX_REBASE_RETRIES} attempts in {repo}: {err}"
                        )));
                    }
                    Err(GitError::Conflict(_)) => {
                        warn!(task = %task_id, repo, attempt, "rebase conflict, invoking resolver");
                        self.progress(
                            task_id,
                            &format!("Conflict in {repo} — running resolver (attempt {attempt})..."),
                        )
                        .await;
                        self.resolve_conflicts(task_id, repo, worktree, session_id, deadline)
                            .await?;
                        attempt += 1;
                    }
                    Err(err) => {
                        return Err(RunnerError::Pipeline(format!("rebase {repo}: {err}")));
                    }
                }
            }

            // Captured before the merge so the full task diff can be
            // reconstructed after worktrees are gone.
            if let Ok(base) = git_ops::commit_hash(repo_path).await {
                base_hashes.insert(repo.clone(), base);
            }

            self.progress(
                task_id,
                &format!("Fast-forward merging {branch_name} into {def_branch}..."),
            )
            .await;
            git_ops::ff_merge(repo_path, branch_name)
                .await
                .map_err(|err| RunnerError::Pipeline(format!("ff-merge {repo}: {err}")))?;

            match git_ops::commit_hash(repo_path).await {
                Ok(hash) => {
                    self.progress(task_id, &format!("Merged {repo} — commit {}", &hash[..8]))
                        .await;
                    commit_hashes.insert(repo.clone(), hash);
                }
                Err(err) => warn!(task = %task_id, repo, error = %err, "get commit hash"),
            }
        }

        Ok((commit_hashes, base_hashes))
    }

    /// Run an agent session against the one conflicted worktree to resolve a
    /// mid-rebase conflict and continue the rebase.
    async fn resolve_conflicts(
        &self,
        task_id: Uuid,
        repo: &str,
        worktree: &str,
        session_id: &str,
        deadline: Instant,
    ) -> Result<(), RunnerError> {
        let name = basename(worktree);
        let container_path = format!("/workspace/{name}");

        let prompt = format!(
            "There are git rebase conflicts in {container_path} that need to be resolved. \
             Run `git status` to see which files are conflicted. \
             For each conflicted file: read the file, understand both sides of the conflict, \
             resolve it by keeping the correct implementation while incorporating upstream changes, \
             then run `git add <file>` to mark it resolved. \
             Once ALL conflicts are resolved, run `git rebase --continue`. \
             Do NOT run `git commit` manually — only resolve conflicts and continue the rebase. \
             Report what conflicts you found and how you resolved each one."
        );

        // Only the conflicted worktree is mounted for this targeted fix.
        let mut mounts = BTreeMap::new();
        mounts.insert(repo.to_string(), worktree.to_string());

        let capture = run_container(
            ContainerRun {
                command: &self.config.command,
                image: &self.config.sandbox_image,
                env_file: self.config.env_file.as_deref(),
                name: container_name(task_id),
                prompt: &prompt,
                session_id,
                mounts: &mounts,
            },
            deadline,
            &CancellationToken::new(),
        )
        .await;

        let turn = match self.store.get_task(task_id).await {
            Ok(task) => task.turns + 1,
            Err(_) => 1,
        };
        let _ = self
            .store
            .save_turn_output(task_id, turn, &capture.stdout, &capture.stderr)
            .await;

        let output = capture
            .result
            .map_err(|err| RunnerError::Pipeline(format!("conflict resolver container: {err}")))?;
        if output.is_error {
            return Err(RunnerError::Pipeline(format!(
                "conflict resolver reported error: {}",
                truncate(&output.result, 300)
            )));
        }

        self.progress(
            task_id,
            &format!("Conflict resolver: {}", truncate(&output.result, 500)),
        )
        .await;
        Ok(())
    }

    /// Insert a progress `output` event on the task timeline.
    pub(crate) async fn progress(&self, task_id: Uuid, message: &str) {
        let _ = self
            .store
            .insert_event(
                task_id,
                EventKind::Output,
                serde_json::json!({"result": message}),
            )
            .await;
    }
}

/// Append a human-readable record of the merged task to each host repo's
/// `PROGRESS.md`.
async fn write_progress_md(task: &Task, commit_hashes: &BTreeMap<String, String>) -> std::io::Result<()> {
    for (repo, hash) in commit_hashes {
        let path = Path::new(repo).join("PROGRESS.md");
        let mut entry = format!(
            "\n## {} — task {}\n\n",
            task.updated_at.format("%Y-%m-%d %H:%M:%S UTC"),
            task.short_id()
        );
        if !task.title.is_empty() {
            entry.push_str(&format!("**{}**\n\n", task.title));
        }
        entry.push_str(&format!("Prompt: {}\n\nMerged commit: {hash}\n", task.prompt));

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(entry.as_bytes()).await?;
        file.flush().await?;
    }
    Ok(())
}

fn basename(path: &str) -> String {
    Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallback_message_uses_first_line_truncated() {
        assert_eq!(
            fallback_commit_message("fix the login bug\nwith details"),
            "foreman: fix the login bug"
        );

        let long = "a".repeat(100);
        let message = fallback_commit_message(&long);
        assert!(message.starts_with("foreman: "));
        assert!(message.ends_with("..."));
        assert_eq!(message.len(), "foreman: ".len() + 72 + 3);
    }

    #[test]
    fn basename_of_paths() {
        assert_eq!(basename("/a/b/c"), "c");
        assert_eq!(basename("/a/b/"), "b");
    }

    #[tokio::test]
    async fn progress_md_appends_per_repo() {
        let repo = tempfile::TempDir::new().unwrap();
        let mut task = Task::new("add a feature", 5, 0);
        task.title = "Feature work".to_string();

        let mut hashes = BTreeMap::new();
        hashes.insert(
            repo.path().to_string_lossy().into_owned(),
            "abc123def4567890".to_string(),
        );

        write_progress_md(&task, &hashes).await.unwrap();
        write_progress_md(&task, &hashes).await.unwrap();

        let content = std::fs::read_to_string(repo.path().join("PROGRESS.md")).unwrap();
        assert_eq!(content.matches("Merged commit: abc123def4567890").count(), 2);
        assert!(content.contains("add a feature"));
        assert!(content.contains("Feature work"));
    }
}
