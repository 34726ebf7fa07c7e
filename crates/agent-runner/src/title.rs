//! Background task-title generation.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::container::{run_container, ContainerRun, CONTAINER_PREFIX};
use crate::output::truncate;
use crate::runner::Runner;

const TITLE_TIMEOUT: Duration = Duration::from_secs(60);

impl Runner {
    /// Generate a short title for a task in the background. Best-effort: a
    /// failure leaves the task untitled.
    pub fn spawn_generate_title(self: &Arc<Self>, task_id: Uuid, prompt: String) {
        let runner = Arc::clone(self);
        tokio::spawn(async move {
            runner.generate_title(task_id, &prompt).await;
        });
    }

    async fn generate_title(&self, task_id: Uuid, prompt: &str) {
        match self.store.get_task(task_id).await {
            Ok(task) if task.title.is_empty() => {}
            _ => return,
        }

        let title_prompt = format!(
            "Write a concise title (maximum 50 characters) for this coding task. \
             Output ONLY the title text, no quotes, no markdown, no explanation.\n\n\
             Task:\n{prompt}"
        );

        let short = task_id.to_string()[..8].to_string();
        let capture = run_container(
            ContainerRun {
                command: &self.config.command,
                image: &self.config.sandbox_image,
                env_file: self.config.env_file.as_deref(),
                name: format!("{CONTAINER_PREFIX}-title-{short}"),
                prompt: &title_prompt,
                session_id: "",
                mounts: &BTreeMap::new(),
            },
            Instant::now() + TITLE_TIMEOUT,
            &CancellationToken::new(),
        )
        .await;

        let output = match capture.result {
            Ok(output) => output,
            Err(err) => {
                debug!(task = %task_id, error = %err, "title generation failed");
                return;
            }
        };

        let title = output
            .result
            .trim()
            .trim_matches(|c| c == '"' || c == '`' || c == '\'')
            .trim()
            .to_string();
        if title.is_empty() {
            debug!(task = %task_id, "title generation: blank result");
            return;
        }

        let title = truncate(&title, 80);
        if let Err(err) = self.store.update_task_title(task_id, &title).await {
            warn!(task = %task_id, error = %err, "save generated title");
        }
    }
}
