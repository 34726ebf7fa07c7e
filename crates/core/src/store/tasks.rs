//! Task CRUD and targeted mutators.

use std::collections::BTreeMap;

use chrono::Utc;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::task::{clamp_timeout, Task, TaskStatus, TaskUsage};

use super::Store;

impl Store {
    /// Create a task in backlog with a clamped timeout, positioned after the
    /// current backlog tail.
    pub async fn create_task(&self, prompt: &str, timeout_minutes: i64) -> Result<Task> {
        if prompt.trim().is_empty() {
            return Err(Error::InvalidInput("prompt is required".to_string()));
        }

        let mut inner = self.inner.lock().await;
        let max_position = inner
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Backlog)
            .map(|t| t.position)
            .max()
            .unwrap_or(-1);

        let task = Task::new(prompt, timeout_minutes, max_position + 1);

        tokio::fs::create_dir_all(self.traces_dir(task.id)).await?;
        tokio::fs::create_dir_all(self.outputs_dir(task.id)).await?;
        self.persist_task(&task).await?;

        inner.tasks.insert(task.id, task.clone());
        inner.events.insert(task.id, Vec::new());
        drop(inner);

        self.notify();
        Ok(task)
    }

    /// Fetch a copy of a task.
    pub async fn get_task(&self, id: Uuid) -> Result<Task> {
        let inner = self.inner.lock().await;
        inner
            .tasks
            .get(&id)
            .cloned()
            .ok_or(Error::TaskNotFound(id))
    }

    /// List tasks sorted by (position, created_at), optionally including
    /// archived ones.
    pub async fn list_tasks(&self, include_archived: bool) -> Vec<Task> {
        let inner = self.inner.lock().await;
        let mut tasks: Vec<Task> = inner
            .tasks
            .values()
            .filter(|t| include_archived || !t.archived)
            .cloned()
            .collect();
        tasks.sort_by(|a, b| {
            a.position
                .cmp(&b.position)
                .then(a.created_at.cmp(&b.created_at))
        });
        tasks
    }

    /// Delete a task: in-memory entry and the whole on-disk task directory.
    pub async fn delete_task(&self, id: Uuid) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.tasks.remove(&id).is_none() {
            return Err(Error::TaskNotFound(id));
        }
        inner.events.remove(&id);

        match tokio::fs::remove_dir_all(self.task_dir(id)).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        drop(inner);

        self.notify();
        Ok(())
    }

    pub async fn update_task_status(&self, id: Uuid, status: TaskStatus) -> Result<()> {
        self.mutate_task(id, |task| task.status = status).await
    }

    pub async fn update_task_position(&self, id: Uuid, position: i64) -> Result<()> {
        self.mutate_task(id, |task| task.position = position).await
    }

    pub async fn update_task_title(&self, id: Uuid, title: &str) -> Result<()> {
        self.mutate_task(id, |task| task.title = title.to_string())
            .await
    }

    /// Record the latest turn's result, session, stop reason, and turn count.
    /// Empty session/stop-reason strings clear the corresponding field.
    pub async fn update_task_result(
        &self,
        id: Uuid,
        result: &str,
        session_id: &str,
        stop_reason: &str,
        turns: u32,
    ) -> Result<()> {
        self.mutate_task(id, |task| {
            task.result = Some(result.to_string());
            task.session_id = if session_id.is_empty() {
                None
            } else {
                Some(session_id.to_string())
            };
            task.stop_reason = if stop_reason.is_empty() {
                None
            } else {
                Some(stop_reason.to_string())
            };
            task.turns = turns;
        })
        .await
    }

    /// Record the per-task worktree map and branch name.
    pub async fn update_task_worktrees(
        &self,
        id: Uuid,
        worktree_paths: BTreeMap<String, String>,
        branch_name: &str,
    ) -> Result<()> {
        self.mutate_task(id, |task| {
            task.worktree_paths = worktree_paths;
            task.branch_name = branch_name.to_string();
        })
        .await
    }

    pub async fn update_task_commit_hashes(
        &self,
        id: Uuid,
        hashes: BTreeMap<String, String>,
    ) -> Result<()> {
        self.mutate_task(id, |task| task.commit_hashes = hashes)
            .await
    }

    pub async fn update_task_base_commit_hashes(
        &self,
        id: Uuid,
        hashes: BTreeMap<String, String>,
    ) -> Result<()> {
        self.mutate_task(id, |task| task.base_commit_hashes = hashes)
            .await
    }

    /// Edit prompt, timeout, or fresh-start flag while a task sits in backlog.
    /// Absent fields are left untouched.
    pub async fn update_task_backlog(
        &self,
        id: Uuid,
        prompt: Option<&str>,
        timeout_minutes: Option<i64>,
        fresh_start: Option<bool>,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let task = inner.tasks.get(&id).ok_or(Error::TaskNotFound(id))?;
        if task.status != TaskStatus::Backlog {
            return Err(Error::StateViolation(format!(
                "task is {}, backlog edits require backlog status",
                task.status
            )));
        }

        let mut updated = task.clone();
        if let Some(prompt) = prompt {
            updated.prompt = prompt.to_string();
        }
        if let Some(timeout) = timeout_minutes {
            updated.timeout = clamp_timeout(timeout);
        }
        if let Some(fresh_start) = fresh_start {
            updated.fresh_start = fresh_start;
        }
        updated.updated_at = Utc::now();

        self.persist_task(&updated).await?;
        inner.tasks.insert(id, updated);
        drop(inner);

        self.notify();
        Ok(())
    }

    /// Add one turn's usage counters to the task totals.
    pub async fn accumulate_task_usage(&self, id: Uuid, delta: &TaskUsage) -> Result<()> {
        self.mutate_task(id, |task| task.usage.accumulate(delta))
            .await
    }

    /// Send a task back to backlog for another attempt.
    ///
    /// The previous prompt joins the history only when the new prompt
    /// differs; result, stop reason, turn counter, and all worktree bookkeeping
    /// are cleared.
    pub async fn reset_task_for_retry(
        &self,
        id: Uuid,
        new_prompt: &str,
        fresh_start: bool,
    ) -> Result<()> {
        self.mutate_task(id, |task| {
            if task.prompt != new_prompt {
                let old = std::mem::replace(&mut task.prompt, new_prompt.to_string());
                task.prompt_history.push(old);
            }
            task.fresh_start = fresh_start;
            task.status = TaskStatus::Backlog;
            task.result = None;
            task.stop_reason = None;
            task.turns = 0;
            task.worktree_paths.clear();
            task.branch_name.clear();
            task.commit_hashes.clear();
            task.base_commit_hashes.clear();
        })
        .await
    }

    pub async fn set_task_archived(&self, id: Uuid, archived: bool) -> Result<()> {
        self.mutate_task(id, |task| task.archived = archived).await
    }

    /// Re-enter `in_progress`, optionally overriding the timeout.
    pub async fn resume_task(&self, id: Uuid, timeout_minutes: Option<i64>) -> Result<()> {
        self.mutate_task(id, |task| {
            task.status = TaskStatus::InProgress;
            if let Some(timeout) = timeout_minutes {
                task.timeout = clamp_timeout(timeout);
            }
        })
        .await
    }

    /// Apply `mutate` to a task under the store lock.
    ///
    /// The mutated copy is persisted before it replaces the in-memory entry,
    /// so a failed write leaves memory and disk agreeing on the old state.
    async fn mutate_task<F>(&self, id: Uuid, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut Task),
    {
        let mut inner = self.inner.lock().await;
        let task = inner.tasks.get(&id).ok_or(Error::TaskNotFound(id))?;
        let mut updated = task.clone();
        mutate(&mut updated);
        updated.updated_at = Utc::now();

        self.persist_task(&updated).await?;
        inner.tasks.insert(id, updated);
        drop(inner);

        self.notify();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::new_test_store;
    use super::*;

    #[tokio::test]
    async fn create_task_basic() {
        let (store, _dir) = new_test_store().await;
        let task = store.create_task("my prompt", 10).await.unwrap();
        assert!(!task.id.is_nil());
        assert_eq!(task.prompt, "my prompt");
        assert_eq!(task.status, TaskStatus::Backlog);
        assert_eq!(task.timeout, 10);
        assert_eq!(task.turns, 0);
    }

    #[tokio::test]
    async fn create_task_rejects_blank_prompt() {
        let (store, _dir) = new_test_store().await;
        assert!(matches!(
            store.create_task("   \n", 5).await,
            Err(Error::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn create_task_position_increments() {
        let (store, _dir) = new_test_store().await;
        let t1 = store.create_task("first", 5).await.unwrap();
        let t2 = store.create_task("second", 5).await.unwrap();
        let t3 = store.create_task("third", 5).await.unwrap();
        assert_eq!(t2.position, t1.position + 1);
        assert_eq!(t3.position, t2.position + 1);
    }

    #[tokio::test]
    async fn create_task_clamps_timeout() {
        let (store, _dir) = new_test_store().await;
        assert_eq!(store.create_task("p", 0).await.unwrap().timeout, 5);
        assert_eq!(store.create_task("p", 9999).await.unwrap().timeout, 1440);
    }

    #[tokio::test]
    async fn create_task_position_only_counts_backlog() {
        let (store, _dir) = new_test_store().await;
        let t1 = store.create_task("a", 5).await.unwrap();
        store
            .update_task_status(t1.id, TaskStatus::Done)
            .await
            .unwrap();
        // No backlog tasks remain, so the max position is -1 and b gets 0.
        let t2 = store.create_task("b", 5).await.unwrap();
        assert_eq!(t2.position, 0);
    }

    #[tokio::test]
    async fn get_task_not_found() {
        let (store, _dir) = new_test_store().await;
        assert!(matches!(
            store.get_task(Uuid::new_v4()).await,
            Err(Error::TaskNotFound(_))
        ));
    }

    #[tokio::test]
    async fn list_tasks_sorted_by_position() {
        let (store, _dir) = new_test_store().await;
        store.create_task("a", 5).await.unwrap();
        store.create_task("b", 5).await.unwrap();
        store.create_task("c", 5).await.unwrap();

        let tasks = store.list_tasks(false).await;
        assert_eq!(tasks.len(), 3);
        for pair in tasks.windows(2) {
            assert!(pair[0].position <= pair[1].position);
        }
    }

    #[tokio::test]
    async fn list_tasks_same_position_sorted_by_created_at() {
        let (store, _dir) = new_test_store().await;
        let t1 = store.create_task("first", 5).await.unwrap();
        let t2 = store.create_task("second", 5).await.unwrap();

        store.update_task_position(t1.id, 10).await.unwrap();
        store.update_task_position(t2.id, 10).await.unwrap();

        let tasks = store.list_tasks(false).await;
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].id, t1.id, "earlier created_at sorts first");
    }

    #[tokio::test]
    async fn list_tasks_archived_filter() {
        let (store, _dir) = new_test_store().await;
        let task = store.create_task("archive me", 5).await.unwrap();
        store.set_task_archived(task.id, true).await.unwrap();

        assert!(store.list_tasks(false).await.is_empty());
        assert_eq!(store.list_tasks(true).await.len(), 1);
    }

    #[tokio::test]
    async fn delete_task_removes_memory_and_disk() {
        let (store, _dir) = new_test_store().await;
        let task = store.create_task("delete me", 5).await.unwrap();
        let dir = store.task_dir(task.id);
        assert!(dir.exists());

        store.delete_task(task.id).await.unwrap();
        assert!(store.get_task(task.id).await.is_err());
        assert!(!dir.exists());
    }

    #[tokio::test]
    async fn delete_task_not_found() {
        let (store, _dir) = new_test_store().await;
        assert!(store.delete_task(Uuid::new_v4()).await.is_err());
    }

    #[tokio::test]
    async fn delete_task_drops_events() {
        let (store, _dir) = new_test_store().await;
        let task = store.create_task("p", 5).await.unwrap();
        store
            .insert_event(task.id, crate::EventKind::StateChange, serde_json::json!("x"))
            .await
            .unwrap();
        store.delete_task(task.id).await.unwrap();
        assert!(store.get_events(task.id).await.is_empty());
    }

    #[tokio::test]
    async fn update_status() {
        let (store, _dir) = new_test_store().await;
        let task = store.create_task("p", 5).await.unwrap();
        store
            .update_task_status(task.id, TaskStatus::InProgress)
            .await
            .unwrap();
        assert_eq!(
            store.get_task(task.id).await.unwrap().status,
            TaskStatus::InProgress
        );
    }

    #[tokio::test]
    async fn update_title() {
        let (store, _dir) = new_test_store().await;
        let task = store.create_task("p", 5).await.unwrap();
        store.update_task_title(task.id, "New Title").await.unwrap();
        assert_eq!(store.get_task(task.id).await.unwrap().title, "New Title");
    }

    #[tokio::test]
    async fn update_result() {
        let (store, _dir) = new_test_store().await;
        let task = store.create_task("p", 5).await.unwrap();

        store
            .update_task_result(task.id, "the output", "sess-xyz", "end_turn", 3)
            .await
            .unwrap();

        let got = store.get_task(task.id).await.unwrap();
        assert_eq!(got.result.as_deref(), Some("the output"));
        assert_eq!(got.session_id.as_deref(), Some("sess-xyz"));
        assert_eq!(got.stop_reason.as_deref(), Some("end_turn"));
        assert_eq!(got.turns, 3);
    }

    #[tokio::test]
    async fn update_result_empty_strings_clear_fields() {
        let (store, _dir) = new_test_store().await;
        let task = store.create_task("p", 5).await.unwrap();
        store
            .update_task_result(task.id, "out", "", "", 1)
            .await
            .unwrap();
        let got = store.get_task(task.id).await.unwrap();
        assert!(got.session_id.is_none());
        assert!(got.stop_reason.is_none());
    }

    #[tokio::test]
    async fn accumulate_usage_twice() {
        let (store, _dir) = new_test_store().await;
        let task = store.create_task("p", 5).await.unwrap();
        let delta = TaskUsage {
            input_tokens: 100,
            output_tokens: 50,
            cache_read_input_tokens: 10,
            cache_creation_input_tokens: 5,
            cost_usd: 0.01,
        };
        store.accumulate_task_usage(task.id, &delta).await.unwrap();
        store.accumulate_task_usage(task.id, &delta).await.unwrap();

        let got = store.get_task(task.id).await.unwrap();
        assert_eq!(got.usage.input_tokens, 200);
        assert_eq!(got.usage.output_tokens, 100);
        assert_eq!(got.usage.cache_read_input_tokens, 20);
        assert_eq!(got.usage.cache_creation_input_tokens, 10);
        assert!((got.usage.cost_usd - 0.02).abs() < 1e-9);
    }

    #[tokio::test]
    async fn update_backlog_fields() {
        let (store, _dir) = new_test_store().await;
        let task = store.create_task("original", 5).await.unwrap();

        store
            .update_task_backlog(task.id, Some("updated prompt"), Some(9999), Some(true))
            .await
            .unwrap();

        let got = store.get_task(task.id).await.unwrap();
        assert_eq!(got.prompt, "updated prompt");
        assert_eq!(got.timeout, 1440, "timeout is clamped");
        assert!(got.fresh_start);
    }

    #[tokio::test]
    async fn update_backlog_absent_fields_are_noops() {
        let (store, _dir) = new_test_store().await;
        let task = store.create_task("original", 5).await.unwrap();
        store
            .update_task_backlog(task.id, None, None, None)
            .await
            .unwrap();
        let got = store.get_task(task.id).await.unwrap();
        assert_eq!(got.prompt, "original");
        assert_eq!(got.timeout, 5);
    }

    #[tokio::test]
    async fn update_backlog_requires_backlog_status() {
        let (store, _dir) = new_test_store().await;
        let task = store.create_task("p", 5).await.unwrap();
        store
            .update_task_status(task.id, TaskStatus::Done)
            .await
            .unwrap();
        assert!(matches!(
            store.update_task_backlog(task.id, Some("x"), None, None).await,
            Err(Error::StateViolation(_))
        ));
    }

    #[tokio::test]
    async fn reset_for_retry_clears_run_state() {
        let (store, _dir) = new_test_store().await;
        let task = store.create_task("original prompt", 5).await.unwrap();
        store
            .update_task_status(task.id, TaskStatus::Done)
            .await
            .unwrap();
        store
            .update_task_result(task.id, "some result", "sess", "end_turn", 2)
            .await
            .unwrap();
        let mut paths = BTreeMap::new();
        paths.insert("/repo/a".to_string(), "/wt/a".to_string());
        store
            .update_task_worktrees(task.id, paths, "task/abc123")
            .await
            .unwrap();

        store
            .reset_task_for_retry(task.id, "new prompt", true)
            .await
            .unwrap();

        let got = store.get_task(task.id).await.unwrap();
        assert_eq!(got.status, TaskStatus::Backlog);
        assert_eq!(got.prompt, "new prompt");
        assert!(got.fresh_start);
        assert!(got.result.is_none());
        assert!(got.stop_reason.is_none());
        assert_eq!(got.turns, 0);
        assert!(got.worktree_paths.is_empty());
        assert!(got.branch_name.is_empty());
        assert!(got.commit_hashes.is_empty());
        assert!(got.base_commit_hashes.is_empty());
        assert_eq!(got.prompt_history, vec!["original prompt".to_string()]);
    }

    #[tokio::test]
    async fn reset_for_retry_accumulates_history() {
        let (store, _dir) = new_test_store().await;
        let task = store.create_task("prompt1", 5).await.unwrap();
        store
            .reset_task_for_retry(task.id, "prompt2", false)
            .await
            .unwrap();
        store
            .reset_task_for_retry(task.id, "prompt3", false)
            .await
            .unwrap();

        let got = store.get_task(task.id).await.unwrap();
        assert_eq!(
            got.prompt_history,
            vec!["prompt1".to_string(), "prompt2".to_string()]
        );
        assert_eq!(got.prompt, "prompt3");
    }

    #[tokio::test]
    async fn reset_for_retry_same_prompt_skips_history() {
        let (store, _dir) = new_test_store().await;
        let task = store.create_task("same", 5).await.unwrap();
        store
            .reset_task_for_retry(task.id, "same", false)
            .await
            .unwrap();
        let got = store.get_task(task.id).await.unwrap();
        assert!(got.prompt_history.is_empty());
    }

    #[tokio::test]
    async fn archive_and_unarchive() {
        let (store, _dir) = new_test_store().await;
        let task = store.create_task("p", 5).await.unwrap();

        store.set_task_archived(task.id, true).await.unwrap();
        assert!(store.get_task(task.id).await.unwrap().archived);

        store.set_task_archived(task.id, false).await.unwrap();
        assert!(!store.get_task(task.id).await.unwrap().archived);
    }

    #[tokio::test]
    async fn resume_sets_in_progress() {
        let (store, _dir) = new_test_store().await;
        let task = store.create_task("p", 5).await.unwrap();
        store
            .update_task_status(task.id, TaskStatus::Failed)
            .await
            .unwrap();

        store.resume_task(task.id, None).await.unwrap();
        assert_eq!(
            store.get_task(task.id).await.unwrap().status,
            TaskStatus::InProgress
        );
    }

    #[tokio::test]
    async fn resume_with_timeout_override() {
        let (store, _dir) = new_test_store().await;
        let task = store.create_task("p", 5).await.unwrap();
        store.resume_task(task.id, Some(60)).await.unwrap();
        assert_eq!(store.get_task(task.id).await.unwrap().timeout, 60);

        store.resume_task(task.id, Some(9999)).await.unwrap();
        assert_eq!(store.get_task(task.id).await.unwrap().timeout, 1440);
    }

    #[tokio::test]
    async fn worktrees_and_hashes_round_trip() {
        let (store, _dir) = new_test_store().await;
        let task = store.create_task("p", 5).await.unwrap();

        let mut paths = BTreeMap::new();
        paths.insert("/repo/a".to_string(), "/worktree/a".to_string());
        store
            .update_task_worktrees(task.id, paths, "task/abc123")
            .await
            .unwrap();

        let mut hashes = BTreeMap::new();
        hashes.insert("/repo/a".to_string(), "abc123def456".to_string());
        store
            .update_task_commit_hashes(task.id, hashes.clone())
            .await
            .unwrap();
        let mut base = BTreeMap::new();
        base.insert("/repo/a".to_string(), "base456".to_string());
        store
            .update_task_base_commit_hashes(task.id, base)
            .await
            .unwrap();

        let got = store.get_task(task.id).await.unwrap();
        assert_eq!(got.branch_name, "task/abc123");
        assert_eq!(got.worktree_paths["/repo/a"], "/worktree/a");
        assert_eq!(got.commit_hashes["/repo/a"], "abc123def456");
        assert_eq!(got.base_commit_hashes["/repo/a"], "base456");
    }

    #[tokio::test]
    async fn mutators_fail_for_unknown_task() {
        let (store, _dir) = new_test_store().await;
        let id = Uuid::new_v4();
        assert!(store.update_task_status(id, TaskStatus::Done).await.is_err());
        assert!(store.update_task_title(id, "t").await.is_err());
        assert!(store.update_task_position(id, 0).await.is_err());
        assert!(store.update_task_result(id, "", "", "", 0).await.is_err());
        assert!(store
            .accumulate_task_usage(id, &TaskUsage::default())
            .await
            .is_err());
        assert!(store
            .update_task_backlog(id, None, None, None)
            .await
            .is_err());
        assert!(store.reset_task_for_retry(id, "", false).await.is_err());
        assert!(store.set_task_archived(id, true).await.is_err());
        assert!(store.resume_task(id, None).await.is_err());
        assert!(store
            .update_task_worktrees(id, BTreeMap::new(), "")
            .await
            .is_err());
        assert!(store
            .update_task_commit_hashes(id, BTreeMap::new())
            .await
            .is_err());
        assert!(store
            .update_task_base_commit_hashes(id, BTreeMap::new())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn concurrent_creates_all_land() {
        let (store, dir) = new_test_store().await;
        let store = std::sync::Arc::new(store);
        let mut handles = Vec::new();
        for _ in 0..20 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.create_task("concurrent", 5).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(store.list_tasks(false).await.len(), 20);
        drop(dir);
    }
}
