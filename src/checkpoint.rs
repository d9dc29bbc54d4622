//! Resumable transfer state persisted as JSON next to the local file.

use crate::error::WosError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

pub const CHECKPOINT_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartStatus {
    Pending,
    Done,
    Failed,
}

/// One contiguous byte range of a transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartRecord {
    /// 1-based.
    pub part_number: u32,
    pub offset: u64,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    pub status: PartStatus,
}

impl PartRecord {
    pub fn is_done(&self) -> bool {
        self.status == PartStatus::Done
    }

    pub fn done(mut self, etag: Option<String>) -> Self {
        self.etag = etag;
        self.status = PartStatus::Done;
        self
    }

    pub fn failed(mut self) -> Self {
        self.status = PartStatus::Failed;
        self
    }
}

/// State that can be saved by a [`CheckpointStore`].
pub trait Checkpoint: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    fn version(&self) -> u32;
    fn parts(&self) -> &[PartRecord];
    fn parts_mut(&mut self) -> &mut Vec<PartRecord>;

    fn completed(&self) -> usize {
        self.parts().iter().filter(|p| p.is_done()).count()
    }

    fn pending(&self) -> Vec<PartRecord> {
        self.parts().iter().filter(|p| !p.is_done()).cloned().collect()
    }
}

/// Modification time of a local file, compared exactly on resume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStamp {
    pub secs: u64,
    pub nanos: u32,
}

impl FileStamp {
    pub fn of(metadata: &std::fs::Metadata) -> Result<Self, WosError> {
        let since_epoch = metadata
            .modified()?
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Ok(Self {
            secs: since_epoch.as_secs(),
            nanos: since_epoch.subsec_nanos(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadCheckpoint {
    pub version: u32,
    pub bucket: String,
    pub key: String,
    pub file_path: PathBuf,
    pub file_size: u64,
    pub file_mtime: FileStamp,
    pub part_size: u64,
    pub upload_id: String,
    pub parts: Vec<PartRecord>,
}

impl Checkpoint for UploadCheckpoint {
    fn version(&self) -> u32 {
        self.version
    }

    fn parts(&self) -> &[PartRecord] {
        &self.parts
    }

    fn parts_mut(&mut self) -> &mut Vec<PartRecord> {
        &mut self.parts
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadCheckpoint {
    pub version: u32,
    pub bucket: String,
    pub key: String,
    pub file_path: PathBuf,
    pub temp_path: PathBuf,
    pub part_size: u64,
    pub object_size: u64,
    pub etag: String,
    pub last_modified: String,
    pub parts: Vec<PartRecord>,
}

impl Checkpoint for DownloadCheckpoint {
    fn version(&self) -> u32 {
        self.version
    }

    fn parts(&self) -> &[PartRecord] {
        &self.parts
    }

    fn parts_mut(&mut self) -> &mut Vec<PartRecord> {
        &mut self.parts
    }
}

/// Serializes updates to a checkpoint and mirrors them to disk.
///
/// Every [`record`](Self::record) rewrites the whole file through a sibling
/// `.tmp` file and a rename, so a crash leaves either the old or the new
/// state. A store without a path keeps its state in memory only.
#[derive(Debug)]
pub struct CheckpointStore<C> {
    path: Option<PathBuf>,
    state: Mutex<C>,
}

impl<C: Checkpoint> CheckpointStore<C> {
    /// Reads a checkpoint, returning `None` when it is missing or unusable.
    pub async fn load<F>(path: &Path, validate: F) -> Option<C>
    where
        F: FnOnce(&C) -> Result<(), String>,
    {
        let data = match tokio::fs::read(path).await {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => return None,
            Err(e) => {
                warn!("⚠️ Cannot read checkpoint {}: {}", path.display(), e);
                return None;
            }
        };
        let checkpoint: C = match serde_json::from_slice(&data) {
            Ok(checkpoint) => checkpoint,
            Err(e) => {
                warn!("⚠️ Ignoring corrupt checkpoint {}: {}", path.display(), e);
                return None;
            }
        };
        if checkpoint.version() != CHECKPOINT_VERSION {
            warn!(
                "⚠️ Ignoring checkpoint {} with version {}",
                path.display(),
                checkpoint.version()
            );
            return None;
        }
        if let Err(reason) = validate(&checkpoint) {
            warn!("⚠️ Ignoring stale checkpoint {}: {}", path.display(), reason);
            return None;
        }
        debug!(
            "Loaded checkpoint {} ({}/{} parts done)",
            path.display(),
            checkpoint.completed(),
            checkpoint.parts().len()
        );
        Some(checkpoint)
    }

    /// Starts tracking `checkpoint`, writing it out immediately when a path is given.
    pub async fn create(path: Option<PathBuf>, checkpoint: C) -> Result<Self, WosError> {
        if let Some(path) = &path {
            write_atomically(path, &checkpoint).await?;
        }
        Ok(Self {
            path,
            state: Mutex::new(checkpoint),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Replaces the record with the same part number and persists the result.
    pub async fn record(&self, part: PartRecord) -> Result<(), WosError> {
        let mut state = self.state.lock().await;
        match state
            .parts_mut()
            .iter_mut()
            .find(|p| p.part_number == part.part_number)
        {
            Some(slot) => *slot = part,
            None => {
                return Err(WosError::validation(format!(
                    "part {} is not part of this checkpoint",
                    part.part_number
                )))
            }
        }
        if let Some(path) = &self.path {
            write_atomically(path, &*state).await?;
        }
        Ok(())
    }

    pub async fn snapshot(&self) -> C {
        self.state.lock().await.clone()
    }

    /// Deletes the checkpoint file once the transfer is over.
    pub async fn finalize(&self) {
        let Some(path) = &self.path else {
            return;
        };
        match tokio::fs::remove_file(path).await {
            Ok(()) => debug!("Removed checkpoint {}", path.display()),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!("⚠️ Failed to remove checkpoint {}: {}", path.display(), e),
        }
    }
}

/// `<path><suffix>` without touching the existing extension.
pub(crate) fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

async fn write_atomically<C: Serialize>(path: &Path, checkpoint: &C) -> Result<(), WosError> {
    let data = serde_json::to_vec_pretty(checkpoint)?;
    let temp = with_suffix(path, ".tmp");
    let mut file = tokio::fs::File::create(&temp).await?;
    file.write_all(&data).await?;
    file.sync_data().await?;
    drop(file);
    tokio::fs::rename(&temp, path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::partition;
    use std::sync::Arc;

    fn upload_checkpoint(parts: usize) -> UploadCheckpoint {
        UploadCheckpoint {
            version: CHECKPOINT_VERSION,
            bucket: "bucket".into(),
            key: "key".into(),
            file_path: PathBuf::from("/data/file.bin"),
            file_size: parts as u64 * 10,
            file_mtime: FileStamp { secs: 1, nanos: 2 },
            part_size: 10,
            upload_id: "upload-1".into(),
            parts: partition(parts as u64 * 10, 10).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_concurrent_records_all_land() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("file.bin.uploadfile_record");
        let store = Arc::new(
            CheckpointStore::create(Some(path.clone()), upload_checkpoint(16))
                .await
                .unwrap(),
        );

        let mut tasks = tokio::task::JoinSet::new();
        for part in store.snapshot().await.parts {
            let store = Arc::clone(&store);
            tasks.spawn(async move {
                let etag = format!("\"etag-{}\"", part.part_number);
                store.record(part.done(Some(etag))).await.unwrap();
            });
        }
        while let Some(joined) = tasks.join_next().await {
            joined.unwrap();
        }

        let loaded: UploadCheckpoint = CheckpointStore::load(&path, |_| Ok(())).await.unwrap();
        assert_eq!(loaded.completed(), 16);
        assert!(loaded.pending().is_empty());
        assert_eq!(loaded.parts[4].etag.as_deref(), Some("\"etag-5\""));
        assert!(!with_suffix(&path, ".tmp").exists());
    }

    #[tokio::test]
    async fn test_unusable_checkpoints_are_absent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("record");

        let missing: Option<UploadCheckpoint> = CheckpointStore::load(&path, |_| Ok(())).await;
        assert!(missing.is_none());

        std::fs::write(&path, b"{\"version\": 1, \"bucket\": ").unwrap();
        let corrupt: Option<UploadCheckpoint> = CheckpointStore::load(&path, |_| Ok(())).await;
        assert!(corrupt.is_none());

        let mut old = upload_checkpoint(2);
        old.version = 0;
        std::fs::write(&path, serde_json::to_vec(&old).unwrap()).unwrap();
        let old: Option<UploadCheckpoint> = CheckpointStore::load(&path, |_| Ok(())).await;
        assert!(old.is_none());

        std::fs::write(&path, serde_json::to_vec(&upload_checkpoint(2)).unwrap()).unwrap();
        let stale: Option<UploadCheckpoint> =
            CheckpointStore::load(&path, |c: &UploadCheckpoint| {
                if c.file_size == 999 {
                    Ok(())
                } else {
                    Err("file size changed".to_string())
                }
            })
            .await;
        assert!(stale.is_none());
    }

    #[tokio::test]
    async fn test_finalize_and_memory_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("record");
        let store = CheckpointStore::create(Some(path.clone()), upload_checkpoint(1))
            .await
            .unwrap();
        assert!(path.exists());
        store.finalize().await;
        assert!(!path.exists());
        store.finalize().await;

        let memory = CheckpointStore::create(None, upload_checkpoint(2)).await.unwrap();
        let first = memory.snapshot().await.parts[0].clone();
        memory.record(first.failed()).await.unwrap();
        assert_eq!(memory.snapshot().await.parts[0].status, PartStatus::Failed);
        assert!(memory.path().is_none());

        let stray = PartRecord {
            part_number: 9,
            offset: 0,
            size: 0,
            etag: None,
            status: PartStatus::Done,
        };
        assert!(matches!(memory.record(stray).await, Err(WosError::Validation(_))));
    }
}
