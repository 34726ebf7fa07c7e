//! Atomic persistence helpers and raw turn artifacts.

use std::path::Path;

use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::error::Result;
use crate::task::Task;

use super::Store;

/// Write `data` to `path` atomically: temp sibling, fsync, rename.
///
/// The temp file is removed best-effort when any step fails, so a crashed
/// write never leaves a half-written document where the loader could find it.
pub(crate) async fn write_atomic(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = std::path::PathBuf::from(tmp);

    let result = async {
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp, path).await
    }
    .await;

    if result.is_err() {
        let _ = tokio::fs::remove_file(&tmp).await;
    }
    result
}

impl Store {
    /// Persist one task document. Caller must hold the store lock.
    pub(crate) async fn persist_task(&self, task: &Task) -> Result<()> {
        let data = serde_json::to_vec_pretty(task)?;
        write_atomic(&self.task_path(task.id), &data).await?;
        Ok(())
    }

    /// Persist the raw stdout/stderr of one turn under the task's outputs
    /// directory. The stderr file is only written when stderr is non-empty.
    pub async fn save_turn_output(
        &self,
        id: Uuid,
        turn: u32,
        stdout: &[u8],
        stderr: &[u8],
    ) -> Result<()> {
        let dir = self.outputs_dir(id);
        tokio::fs::create_dir_all(&dir).await?;

        write_atomic(&dir.join(format!("turn-{turn:04}.json")), stdout).await?;
        if !stderr.is_empty() {
            write_atomic(&dir.join(format!("turn-{turn:04}.stderr.txt")), stderr).await?;
        }
        Ok(())
    }
}
