//! Task and event model definitions

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Default per-task timeout in minutes.
pub const DEFAULT_TIMEOUT_MINUTES: u32 = 5;

/// Upper bound for the per-task timeout in minutes (24 hours).
pub const MAX_TIMEOUT_MINUTES: u32 = 1440;

/// Clamp a requested timeout into `[1, 1440]` minutes.
///
/// Non-positive values fall back to the default instead of being rejected, so
/// a client that omits the field gets a sane run length.
pub fn clamp_timeout(minutes: i64) -> u32 {
    if minutes <= 0 {
        DEFAULT_TIMEOUT_MINUTES
    } else if minutes > MAX_TIMEOUT_MINUTES as i64 {
        MAX_TIMEOUT_MINUTES
    } else {
        minutes as u32
    }
}

/// Task status on the kanban board.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Backlog,
    InProgress,
    Waiting,
    Done,
    Failed,
    Cancelled,
    Committing,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Backlog => "backlog",
            Self::InProgress => "in_progress",
            Self::Waiting => "waiting",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Committing => "committing",
        }
    }

    /// Whether a retry back to backlog is allowed from this status.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Done | Self::Failed | Self::Cancelled | Self::Waiting
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Token consumption and cost accumulated across all turns of a task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_read_input_tokens: u64,
    #[serde(default)]
    pub cache_creation_input_tokens: u64,
    #[serde(default)]
    pub cost_usd: f64,
}

impl TaskUsage {
    /// Add a single turn's usage to the running totals.
    pub fn accumulate(&mut self, delta: &TaskUsage) {
        self.input_tokens += delta.input_tokens;
        self.output_tokens += delta.output_tokens;
        self.cache_read_input_tokens += delta.cache_read_input_tokens;
        self.cache_creation_input_tokens += delta.cache_creation_input_tokens;
        self.cost_usd += delta.cost_usd;
    }
}

/// A unit of work executed by the agent sandbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub title: String,
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub prompt_history: Vec<String>,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub archived: bool,
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub fresh_start: bool,
    pub result: Option<String>,
    pub stop_reason: Option<String>,
    pub turns: u32,
    pub timeout: u32,
    #[serde(default)]
    pub usage: TaskUsage,
    pub position: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    // Worktree isolation fields, populated when the task enters in_progress.
    /// Host repository path → per-task worktree directory.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub worktree_paths: BTreeMap<String, String>,
    /// Task branch of the form `task/<uuid8>`.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub branch_name: String,
    /// Host repository path → HEAD hash after the fast-forward merge.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub commit_hashes: BTreeMap<String, String>,
    /// Host repository path → default-branch HEAD captured just before merge.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub base_commit_hashes: BTreeMap<String, String>,
}

impl Task {
    /// Create a new backlog task with a clamped timeout.
    pub fn new(prompt: impl Into<String>, timeout_minutes: i64, position: i64) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            title: String::new(),
            prompt: prompt.into(),
            prompt_history: Vec::new(),
            status: TaskStatus::Backlog,
            archived: false,
            session_id: None,
            fresh_start: false,
            result: None,
            stop_reason: None,
            turns: 0,
            timeout: clamp_timeout(timeout_minutes),
            usage: TaskUsage::default(),
            position,
            created_at: now,
            updated_at: now,
            worktree_paths: BTreeMap::new(),
            branch_name: String::new(),
            commit_hashes: BTreeMap::new(),
            base_commit_hashes: BTreeMap::new(),
        }
    }

    /// Short task identifier used in branch names and container labels.
    pub fn short_id(&self) -> String {
        self.id.to_string()[..8].to_string()
    }
}

/// Kind of event stored in a task's audit trail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    StateChange,
    Output,
    Feedback,
    Error,
    System,
}

/// A single entry in a task's append-only audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEvent {
    /// Monotonic per-task sequence number, re-indexed densely on reload.
    pub id: i64,
    pub task_id: Uuid,
    pub event_type: EventKind,
    pub data: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamp_timeout_bounds() {
        let cases = [
            (0, 5),
            (-1, 5),
            (-999, 5),
            (1, 1),
            (5, 5),
            (720, 720),
            (1440, 1440),
            (1441, 1440),
            (9999, 1440),
        ];
        for (input, want) in cases {
            assert_eq!(clamp_timeout(input), want, "clamp_timeout({input})");
        }
    }

    #[test]
    fn new_task_defaults() {
        let task = Task::new("do the thing", 10, 0);
        assert_eq!(task.prompt, "do the thing");
        assert_eq!(task.status, TaskStatus::Backlog);
        assert_eq!(task.timeout, 10);
        assert_eq!(task.turns, 0);
        assert!(task.session_id.is_none());
        assert!(task.worktree_paths.is_empty());
    }

    #[test]
    fn short_id_is_first_eight_chars() {
        let task = Task::new("p", 5, 0);
        assert_eq!(task.short_id(), task.id.to_string()[..8]);
        assert_eq!(task.short_id().len(), 8);
    }

    #[test]
    fn usage_accumulates() {
        let mut usage = TaskUsage::default();
        let delta = TaskUsage {
            input_tokens: 100,
            output_tokens: 50,
            cache_read_input_tokens: 10,
            cache_creation_input_tokens: 5,
            cost_usd: 0.01,
        };
        usage.accumulate(&delta);
        usage.accumulate(&delta);
        assert_eq!(usage.input_tokens, 200);
        assert_eq!(usage.output_tokens, 100);
        assert_eq!(usage.cache_read_input_tokens, 20);
        assert_eq!(usage.cache_creation_input_tokens, 10);
        assert!((usage.cost_usd - 0.02).abs() < 1e-9);
    }

    #[test]
    fn status_serializes_snake_case() {
        let json = serde_json::to_string(&TaskStatus::InProgress).unwrap();
        assert_eq!(json, r#""in_progress""#);
        let status: TaskStatus = serde_json::from_str(r#""waiting""#).unwrap();
        assert_eq!(status, TaskStatus::Waiting);
    }

    #[test]
    fn task_json_round_trip() {
        let mut task = Task::new("round trip", 15, 3);
        task.worktree_paths
            .insert("/repo/a".into(), "/worktrees/x/a".into());
        task.branch_name = "task/abcd1234".into();

        let json = serde_json::to_string(&task).unwrap();
        let back: Task = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, task.id);
        assert_eq!(back.prompt, "round trip");
        assert_eq!(back.branch_name, "task/abcd1234");
        assert_eq!(back.worktree_paths, task.worktree_paths);
    }
}
