//! Background container monitor.
//!
//! A task in `in_progress` must have a live container behind it. The monitor
//! polls the runtime every [`MONITOR_POLL_INTERVAL`] and fails any running
//! task whose container has been gone for longer than [`MONITOR_GRACE`]; the
//! grace period covers the legitimate gap between turns, when no container
//! exists for a few milliseconds.

use std::collections::{HashMap, HashSet};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::process::Command;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use foreman_core::TaskStatus;

use crate::container::{container_name, CONTAINER_PREFIX};
use crate::error::{Result, RunnerError};
use crate::runner::Runner;

pub const MONITOR_POLL_INTERVAL: Duration = Duration::from_secs(5);
pub const MONITOR_GRACE: Duration = Duration::from_secs(30);

/// One sandbox container as reported by the runtime.
#[derive(Debug, Clone, Serialize)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    pub image: String,
    pub status: String,
}

impl Runner {
    /// Start the monitor loop. Runs until the process exits.
    pub fn spawn_container_monitor(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let runner = Arc::clone(self);
        tokio::spawn(async move {
            let mut missing_since: HashMap<Uuid, Instant> = HashMap::new();
            let mut tick = tokio::time::interval(MONITOR_POLL_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tick.tick().await;

                let running = match runner.running_container_names().await {
                    Ok(names) => names,
                    Err(err) => {
                        debug!(error = %err, "monitor: list containers");
                        continue;
                    }
                };

                let in_progress: Vec<Uuid> = runner
                    .store
                    .list_tasks(true)
                    .await
                    .into_iter()
                    .filter(|t| t.status == TaskStatus::InProgress)
                    .map(|t| t.id)
                    .collect();

                let live: HashSet<Uuid> = in_progress.iter().copied().collect();
                missing_since.retain(|id, _| live.contains(id));

                for task_id in in_progress {
                    if running.contains(&container_name(task_id)) {
                        missing_since.remove(&task_id);
                        continue;
                    }
                    let since = missing_since.entry(task_id).or_insert_with(Instant::now);
                    if since.elapsed() < MONITOR_GRACE {
                        continue;
                    }
                    missing_since.remove(&task_id);

                    // Re-check before failing; the runner may have finished
                    // the task while this poll was in flight.
                    match runner.store.get_task(task_id).await {
                        Ok(task) if task.status == TaskStatus::InProgress => {
                            warn!(task = %task_id, "monitor: container disappeared, failing task");
                            runner
                                .fail_task(
                                    task_id,
                                    TaskStatus::InProgress,
                                    "container disappeared while task was in progress",
                                )
                                .await;
                        }
                        _ => {}
                    }
                }
            }
        })
    }

    /// Names of currently running orchestrator containers.
    async fn running_container_names(&self) -> Result<HashSet<String>> {
        let output = Command::new(&self.config.command)
            .args(["ps", "--format", "{{.Names}}"])
            .stdin(Stdio::null())
            .output()
            .await?;
        if !output.status.success() {
            return Err(RunnerError::ContainerExited {
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::trim)
            .filter(|name| name.starts_with(CONTAINER_PREFIX))
            .map(str::to_string)
            .collect())
    }

    /// All orchestrator containers known to the runtime, running or exited.
    pub async fn list_containers(&self) -> Result<Vec<ContainerInfo>> {
        let filter = format!("name={CONTAINER_PREFIX}-");
        let output = Command::new(&self.config.command)
            .args([
                "ps",
                "-a",
                "--filter",
                &filter,
                "--format",
                "{{.ID}}\t{{.Names}}\t{{.Image}}\t{{.Status}}",
            ])
            .stdin(Stdio::null())
            .output()
            .await?;
        if !output.status.success() {
            return Err(RunnerError::ContainerExited {
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let mut containers = Vec::new();
        for line in String::from_utf8_lossy(&output.stdout).lines() {
            let fields: Vec<&str> = line.splitn(4, '\t').collect();
            if fields.len() != 4 {
                continue;
            }
            containers.push(ContainerInfo {
                id: fields[0].to_string(),
                name: fields[1].to_string(),
                image: fields[2].to_string(),
                status: fields[3].to_string(),
            });
        }
        Ok(containers)
    }
}
