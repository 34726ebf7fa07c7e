//! One-shot sandbox container invocation.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::RunnerError;
use crate::output::{parse_agent_output, truncate, AgentOutput};

/// Name prefix for every container this orchestrator starts.
pub const CONTAINER_PREFIX: &str = "foreman";

/// Deterministic container name for a task, so a stale container from a
/// crashed run can be found and removed by name.
pub fn container_name(task_id: Uuid) -> String {
    format!("{CONTAINER_PREFIX}-{task_id}")
}

/// One container invocation.
pub(crate) struct ContainerRun<'a> {
    /// Container runtime binary (docker/podman compatible CLI).
    pub command: &'a str,
    pub image: &'a str,
    pub env_file: Option<&'a Path>,
    pub name: String,
    pub prompt: &'a str,
    /// Agent session to resume; empty starts a fresh session.
    pub session_id: &'a str,
    /// Host path (keyed by workspace/repo path) → bind source directory.
    /// Each entry is mounted at `/workspace/<basename of key>`.
    pub mounts: &'a BTreeMap<String, String>,
}

/// Raw capture of one container run. Stdout/stderr are retained even when the
/// run fails so the turn artifacts can always be persisted.
pub(crate) struct TurnCapture {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub result: Result<AgentOutput, RunnerError>,
}

impl TurnCapture {
    fn failed(err: RunnerError) -> Self {
        Self {
            stdout: Vec::new(),
            stderr: Vec::new(),
            result: Err(err),
        }
    }
}

/// Build the full argument list for one sandbox invocation.
fn build_args(run: &ContainerRun<'_>) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "run".into(),
        "--rm".into(),
        "--network=host".into(),
        "--name".into(),
        run.name.clone(),
    ];

    if let Some(env_file) = run.env_file {
        args.push("--env-file".into());
        args.push(env_file.to_string_lossy().into_owned());
    }

    args.push("-v".into());
    args.push("foreman-config:/home/agent/.claude".into());

    for (host_path, source) in run.mounts {
        let basename = mount_basename(host_path);
        args.push("-v".into());
        args.push(format!("{source}:/workspace/{basename}"));
    }

    args.push("-w".into());
    args.push("/workspace".into());
    args.push(run.image.to_string());

    args.push("-p".into());
    args.push(run.prompt.to_string());
    args.push("--output-format".into());
    args.push("stream-json".into());
    args.push("--verbose".into());

    if !run.session_id.is_empty() {
        args.push("--resume".into());
        args.push(run.session_id.to_string());
    }

    args
}

/// Last path component of a host path, tolerating trailing slashes.
fn mount_basename(host_path: &str) -> String {
    PathBuf::from(host_path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| host_path.to_string())
}

/// Forcibly remove a container by name, ignoring the outcome.
pub(crate) async fn force_remove_container(command: &str, name: &str) {
    let _ = Command::new(command)
        .args(["rm", "-f", name])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .output()
        .await;
}

/// Run one agent container to completion, bounded by `deadline` and `cancel`.
pub(crate) async fn run_container(
    run: ContainerRun<'_>,
    deadline: Instant,
    cancel: &CancellationToken,
) -> TurnCapture {
    // A stale container with this name survives a previous crash; remove it
    // first so the new invocation cannot collide.
    force_remove_container(run.command, &run.name).await;

    let args = build_args(&run);
    debug!(command = run.command, name = %run.name, "spawning container");

    let child = Command::new(run.command)
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn();

    let child = match child {
        Ok(child) => child,
        Err(err) => return TurnCapture::failed(err.into()),
    };

    let output = tokio::select! {
        waited = tokio::time::timeout_at(deadline, child.wait_with_output()) => match waited {
            Ok(Ok(output)) => output,
            Ok(Err(err)) => return TurnCapture::failed(err.into()),
            Err(_elapsed) => {
                force_remove_container(run.command, &run.name).await;
                return TurnCapture::failed(RunnerError::Timeout);
            }
        },
        _ = cancel.cancelled() => {
            force_remove_container(run.command, &run.name).await;
            return TurnCapture::failed(RunnerError::Cancelled);
        }
    };

    let stdout = output.stdout;
    let stderr = output.stderr;
    let exit_code = output.status.code().unwrap_or(-1);

    let raw = String::from_utf8_lossy(&stdout);
    let raw = raw.trim();

    if raw.is_empty() {
        let err = if output.status.success() {
            RunnerError::EmptyOutput
        } else {
            RunnerError::ContainerExited {
                code: exit_code,
                stderr: truncate(&String::from_utf8_lossy(&stderr), 500),
            }
        };
        return TurnCapture {
            stdout,
            stderr,
            result: Err(err),
        };
    }

    let parsed = match parse_agent_output(raw) {
        Ok(parsed) => parsed,
        Err(parse_err) => {
            let err = if output.status.success() {
                RunnerError::Parse(format!("{parse_err} (raw: {})", truncate(raw, 200)))
            } else {
                RunnerError::ContainerExited {
                    code: exit_code,
                    stderr: truncate(&String::from_utf8_lossy(&stderr), 500),
                }
            };
            return TurnCapture {
                stdout,
                stderr,
                result: Err(err),
            };
        }
    };

    // The agent sometimes exits non-zero while still producing a valid result
    // document; the parsed output is trusted over the exit code.
    if !output.status.success() {
        warn!(name = %run.name, code = exit_code, "container exited non-zero but produced valid output");
    }

    TurnCapture {
        stdout,
        stderr,
        result: Ok(parsed),
    }
}
