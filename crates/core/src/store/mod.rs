//! Durable task store.
//!
//! One JSON document per task at `<root>/<uuid>/task.json`, one JSON document
//! per event at `<root>/<uuid>/traces/NNNN.json`, and raw turn artifacts under
//! `<root>/<uuid>/outputs/`. A single async mutex covers both the in-memory
//! index and the backing writes, so readers never observe a state that is not
//! on disk. Every mutation ends with a coalesced broadcast to subscribers.

mod events;
mod io;
mod subscribe;
mod tasks;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex as StdMutex;

use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

use crate::error::Result;
use crate::task::{Task, TaskEvent};

use subscribe::Subscribers;

const TASK_FILE: &str = "task.json";
const TRACES_DIR: &str = "traces";
const OUTPUTS_DIR: &str = "outputs";

pub(crate) struct Inner {
    pub(crate) tasks: HashMap<Uuid, Task>,
    pub(crate) events: HashMap<Uuid, Vec<TaskEvent>>,
}

/// Single-writer, multi-reader task store backed by per-task JSON documents.
pub struct Store {
    root: PathBuf,
    inner: Mutex<Inner>,
    subscribers: StdMutex<Subscribers>,
}

impl Store {
    /// Open the store rooted at `root`, creating the directory if needed and
    /// loading every task directory whose name parses as a UUID.
    ///
    /// Unreadable or corrupt entries are skipped with a warning; a damaged
    /// task never prevents startup.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;

        let mut tasks = HashMap::new();
        let mut events = HashMap::new();

        let mut entries = tokio::fs::read_dir(&root).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let Some(id) = name.to_str().and_then(|n| Uuid::parse_str(n).ok()) else {
                continue;
            };

            let task_path = entry.path().join(TASK_FILE);
            let task: Task = match tokio::fs::read(&task_path).await {
                Ok(bytes) => match serde_json::from_slice(&bytes) {
                    Ok(task) => task,
                    Err(err) => {
                        warn!(task = %id, error = %err, "skipping corrupt task.json");
                        continue;
                    }
                },
                Err(err) => {
                    warn!(task = %id, error = %err, "skipping task with unreadable task.json");
                    continue;
                }
            };

            let task_events = load_events(&entry.path().join(TRACES_DIR), id).await;
            tasks.insert(id, task);
            events.insert(id, task_events);
        }

        Ok(Self {
            root,
            inner: Mutex::new(Inner { tasks, events }),
            subscribers: StdMutex::new(Subscribers::default()),
        })
    }

    /// Root directory of the store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub(crate) fn task_dir(&self, id: Uuid) -> PathBuf {
        self.root.join(id.to_string())
    }

    pub(crate) fn task_path(&self, id: Uuid) -> PathBuf {
        self.task_dir(id).join(TASK_FILE)
    }

    pub(crate) fn traces_dir(&self, id: Uuid) -> PathBuf {
        self.task_dir(id).join(TRACES_DIR)
    }

    /// Directory holding raw per-turn stdout/stderr artifacts for a task.
    pub fn outputs_dir(&self, id: Uuid) -> PathBuf {
        self.task_dir(id).join(OUTPUTS_DIR)
    }
}

/// Load and densely re-index the event trail for one task.
///
/// Files are filtered to the `.json` suffix and ordered by the integer value
/// of their stem; anything unparseable is skipped with a warning. IDs are
/// reassigned from 1 so the sequence stays dense across restarts.
async fn load_events(traces_dir: &Path, task_id: Uuid) -> Vec<TaskEvent> {
    let mut entries = match tokio::fs::read_dir(traces_dir).await {
        Ok(entries) => entries,
        Err(_) => return Vec::new(),
    };

    let mut files: Vec<(i64, PathBuf)> = Vec::new();
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let Some(seq) = path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.parse::<i64>().ok())
        else {
            continue;
        };
        files.push((seq, path));
    }
    files.sort_by_key(|(seq, _)| *seq);

    let mut events = Vec::with_capacity(files.len());
    for (seq, path) in files {
        let event: TaskEvent = match tokio::fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(event) => event,
                Err(err) => {
                    warn!(task = %task_id, seq, error = %err, "skipping corrupt trace file");
                    continue;
                }
            },
            Err(err) => {
                warn!(task = %task_id, seq, error = %err, "skipping unreadable trace file");
                continue;
            }
        };
        events.push(event);
    }

    for (idx, event) in events.iter_mut().enumerate() {
        event.id = idx as i64 + 1;
    }
    events
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use tempfile::TempDir;

    pub(crate) async fn new_test_store() -> (Store, TempDir) {
        let dir = TempDir::new().expect("temp dir");
        let store = Store::open(dir.path()).await.expect("open store");
        (store, dir)
    }
}
