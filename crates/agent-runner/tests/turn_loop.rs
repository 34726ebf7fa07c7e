//! End-to-end turn loop tests against a stub container runtime.
//!
//! The runner only ever shells out to the configured runtime binary, so a
//! small shell script standing in for docker/podman lets the whole loop run:
//! worktree preparation, output parsing, store updates, and state dispatch.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use agent_runner::{Runner, RunnerConfig};
use foreman_core::{EventKind, Store, TaskStatus};
use tempfile::TempDir;

/// Write an executable stub runtime. `body` runs for `run` invocations;
/// `rm`/`ps` calls exit silently like a real CLI would.
fn write_stub(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("stub-runtime.sh");
    let script = format!(
        "#!/bin/sh\ncase \"$1\" in\n  rm|ps) exit 0 ;;\nesac\n{body}\n"
    );
    std::fs::write(&path, script).unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path
}

struct Harness {
    store: Arc<Store>,
    runner: Arc<Runner>,
    _data: TempDir,
    _scratch: TempDir,
}

async fn harness(stub_body: &str, workspaces: Vec<PathBuf>) -> Harness {
    let data = TempDir::new().unwrap();
    let scratch = TempDir::new().unwrap();
    let stub = write_stub(scratch.path(), stub_body);
    let worktrees_dir = scratch.path().join("worktrees");
    std::fs::create_dir_all(&worktrees_dir).unwrap();

    let store = Arc::new(Store::open(data.path().join("data")).await.unwrap());
    let runner = Runner::new(
        store.clone(),
        RunnerConfig {
            command: stub.to_string_lossy().into_owned(),
            sandbox_image: "sandbox:latest".to_string(),
            env_file: None,
            workspaces,
            worktrees_dir,
        },
    );
    Harness {
        store,
        runner,
        _data: data,
        _scratch: scratch,
    }
}

const END_TURN_DOC: &str = r#"echo '{"type":"result","result":"ok","session_id":"s1","stop_reason":"end_turn","subtype":"success","is_error":false,"total_cost_usd":0.01,"usage":{"input_tokens":10,"output_tokens":5,"cache_read_input_tokens":0,"cache_creation_input_tokens":0}}'"#;

#[tokio::test]
async fn happy_path_backlog_to_done() {
    let h = harness(END_TURN_DOC, Vec::new()).await;

    let task = h.store.create_task("hi", 5).await.unwrap();
    h.store
        .update_task_status(task.id, TaskStatus::InProgress)
        .await
        .unwrap();

    h.runner
        .run(task.id, "hi".to_string(), String::new(), false)
        .await;

    let got = h.store.get_task(task.id).await.unwrap();
    assert_eq!(got.status, TaskStatus::Done);
    assert_eq!(got.result.as_deref(), Some("ok"));
    assert_eq!(got.session_id.as_deref(), Some("s1"));
    assert_eq!(got.stop_reason.as_deref(), Some("end_turn"));
    assert_eq!(got.turns, 1);
    assert_eq!(got.usage.input_tokens, 10);
    assert_eq!(got.usage.output_tokens, 5);
    assert!((got.usage.cost_usd - 0.01).abs() < 1e-9);

    let events = h.store.get_events(task.id).await;
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].event_type, EventKind::Output);
    assert_eq!(events[0].data["result"], "ok");
    assert_eq!(events[0].data["stop_reason"], "end_turn");
    assert_eq!(events[0].data["session_id"], "s1");
    assert_eq!(events[1].event_type, EventKind::StateChange);
    assert_eq!(events[1].data["from"], "in_progress");
    assert_eq!(events[1].data["to"], "done");

    // Raw turn artifact was persisted.
    assert!(h.store.outputs_dir(task.id).join("turn-0001.json").exists());
}

#[tokio::test]
async fn auto_continue_on_max_tokens() {
    // First run invocation reports max_tokens, the second end_turn. A marker
    // file distinguishes the calls.
    let scratch = TempDir::new().unwrap();
    let marker = scratch.path().join("first-done");
    let body = format!(
        r#"if [ ! -f "{marker}" ]; then
  touch "{marker}"
  echo '{{"type":"result","result":"partial","session_id":"s1","stop_reason":"max_tokens","is_error":false,"total_cost_usd":0.01,"usage":{{"input_tokens":10,"output_tokens":5,"cache_read_input_tokens":0,"cache_creation_input_tokens":0}}}}'
else
  echo '{{"type":"result","result":"ok","session_id":"s1","stop_reason":"end_turn","is_error":false,"total_cost_usd":0.02,"usage":{{"input_tokens":7,"output_tokens":3,"cache_read_input_tokens":0,"cache_creation_input_tokens":0}}}}'
fi"#,
        marker = marker.display()
    );
    let h = harness(&body, Vec::new()).await;

    let task = h.store.create_task("long job", 5).await.unwrap();
    h.store
        .update_task_status(task.id, TaskStatus::InProgress)
        .await
        .unwrap();

    h.runner
        .run(task.id, "long job".to_string(), String::new(), false)
        .await;

    let got = h.store.get_task(task.id).await.unwrap();
    assert_eq!(got.status, TaskStatus::Done);
    assert_eq!(got.turns, 2);
    assert_eq!(got.usage.input_tokens, 17);
    assert_eq!(got.usage.output_tokens, 8);
    assert!((got.usage.cost_usd - 0.03).abs() < 1e-9);

    // No intermediate state change: only the two outputs and the final done.
    let events = h.store.get_events(task.id).await;
    let state_changes: Vec<_> = events
        .iter()
        .filter(|e| e.event_type == EventKind::StateChange)
        .collect();
    assert_eq!(state_changes.len(), 1);
    assert_eq!(state_changes[0].data["to"], "done");
    assert!(h.store.outputs_dir(task.id).join("turn-0002.json").exists());
}

#[tokio::test]
async fn unknown_stop_reason_waits_for_feedback() {
    let body = r#"echo '{"type":"result","result":"need input","session_id":"s2","stop_reason":"tool_use","subtype":"partial","is_error":false,"total_cost_usd":0.0,"usage":{}}'"#;
    let h = harness(body, Vec::new()).await;

    let task = h.store.create_task("ambiguous", 5).await.unwrap();
    h.store
        .update_task_status(task.id, TaskStatus::InProgress)
        .await
        .unwrap();

    h.runner
        .run(task.id, "ambiguous".to_string(), String::new(), false)
        .await;

    let got = h.store.get_task(task.id).await.unwrap();
    assert_eq!(got.status, TaskStatus::Waiting);
    assert_eq!(got.session_id.as_deref(), Some("s2"));

    let events = h.store.get_events(task.id).await;
    let last = events.last().unwrap();
    assert_eq!(last.event_type, EventKind::StateChange);
    assert_eq!(last.data["to"], "waiting");
}

#[tokio::test]
async fn agent_error_fails_task() {
    let body = r#"echo '{"type":"result","result":"something broke","session_id":"s3","stop_reason":"end_turn","is_error":true,"total_cost_usd":0.0,"usage":{}}'"#;
    let h = harness(body, Vec::new()).await;

    let task = h.store.create_task("doomed", 5).await.unwrap();
    h.store
        .update_task_status(task.id, TaskStatus::InProgress)
        .await
        .unwrap();

    h.runner
        .run(task.id, "doomed".to_string(), String::new(), false)
        .await;

    assert_eq!(
        h.store.get_task(task.id).await.unwrap().status,
        TaskStatus::Failed
    );
}

#[tokio::test]
async fn container_failure_records_error_event() {
    let body = r#"echo "boom" >&2; exit 7"#;
    let h = harness(body, Vec::new()).await;

    let task = h.store.create_task("crashy", 5).await.unwrap();
    h.store
        .update_task_status(task.id, TaskStatus::InProgress)
        .await
        .unwrap();

    h.runner
        .run(task.id, "crashy".to_string(), String::new(), false)
        .await;

    let got = h.store.get_task(task.id).await.unwrap();
    assert_eq!(got.status, TaskStatus::Failed);

    let events = h.store.get_events(task.id).await;
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].event_type, EventKind::Error);
    assert!(events[0].data["error"]
        .as_str()
        .unwrap()
        .contains("exited with code 7"));
    assert_eq!(events[1].event_type, EventKind::StateChange);
    assert_eq!(events[1].data["to"], "failed");
}

#[tokio::test]
async fn worktrees_created_for_git_workspace() {
    // A real repo workspace: the run must isolate the task on its own branch.
    let workspace = TempDir::new().unwrap();
    init_repo(workspace.path());

    let h = harness(END_TURN_DOC, vec![workspace.path().to_path_buf()]).await;

    let task = h.store.create_task("isolated", 5).await.unwrap();
    h.store
        .update_task_status(task.id, TaskStatus::InProgress)
        .await
        .unwrap();

    h.runner
        .run(task.id, "isolated".to_string(), String::new(), false)
        .await;

    let got = h.store.get_task(task.id).await.unwrap();
    assert_eq!(got.status, TaskStatus::Done);
    assert_eq!(got.branch_name, format!("task/{}", got.short_id()));
    assert_eq!(got.worktree_paths.len(), 1);

    let worktree = got
        .worktree_paths
        .values()
        .next()
        .map(PathBuf::from)
        .unwrap();
    assert!(worktree.is_dir());
    assert!(worktree.ends_with(workspace.path().file_name().unwrap()));
}

fn init_repo(dir: &Path) {
    let run = |args: &[&str]| {
        let out = std::process::Command::new("git")
            .arg("-C")
            .arg(dir)
            .args(args)
            .output()
            .unwrap();
        assert!(out.status.success(), "git {args:?}: {out:?}");
    };
    run(&["init", "-b", "main"]);
    run(&["config", "user.email", "test@example.com"]);
    run(&["config", "user.name", "Test"]);
    std::fs::write(dir.join("file.txt"), "initial\n").unwrap();
    run(&["add", "."]);
    run(&["commit", "-m", "initial commit"]);
}
