//! Append-only event trail per task.

use chrono::Utc;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::task::{EventKind, TaskEvent};

use super::io::write_atomic;
use super::Store;

impl Store {
    /// Append an event to a task's audit trail.
    ///
    /// The next sequence number is assigned under the store lock, persisted to
    /// `traces/NNNN.json`, and broadcast like any other mutation.
    pub async fn insert_event(
        &self,
        task_id: Uuid,
        event_type: EventKind,
        data: serde_json::Value,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if !inner.tasks.contains_key(&task_id) {
            return Err(Error::TaskNotFound(task_id));
        }

        let events = inner.events.entry(task_id).or_default();
        let id = events.last().map(|e| e.id + 1).unwrap_or(1);
        let event = TaskEvent {
            id,
            task_id,
            event_type,
            data,
            created_at: Utc::now(),
        };

        let traces_dir = self.traces_dir(task_id);
        tokio::fs::create_dir_all(&traces_dir).await?;
        let data = serde_json::to_vec_pretty(&event)?;
        write_atomic(&traces_dir.join(format!("{id:04}.json")), &data).await?;

        events.push(event);
        drop(inner);

        self.notify();
        Ok(())
    }

    /// Events for a task, ordered by sequence number. Unknown tasks yield an
    /// empty list so callers can render a timeline for freshly deleted tasks.
    pub async fn get_events(&self, task_id: Uuid) -> Vec<TaskEvent> {
        let inner = self.inner.lock().await;
        inner.events.get(&task_id).cloned().unwrap_or_default()
    }
}
