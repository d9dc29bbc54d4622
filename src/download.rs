//! Resumable ranged download of an object into a local file.

use crate::checkpoint::{
    with_suffix, Checkpoint, CheckpointStore, DownloadCheckpoint, PartRecord, CHECKPOINT_VERSION,
};
use crate::client::{validate_object, WosClient};
use crate::config::DOWNLOAD_CHECKPOINT_SUFFIX;
use crate::error::WosError;
use crate::model::{GetObjectInput, ObjectMetadata, ServerSideEncryption};
use crate::partition::{download_part_size, is_tiling, partition};
use crate::pool::WorkerPool;
use indicatif::ProgressBar;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::{error, info, warn};

/// Parameters of [`WosClient::download_file`].
#[derive(Debug, Clone, Default)]
pub struct DownloadFileInput {
    pub bucket: String,
    pub key: String,
    /// Destination. Defaults to the object key relative to the working directory.
    pub download_file: Option<PathBuf>,
    /// Bytes per ranged GET. Zero picks the default.
    pub part_size: u64,
    /// Concurrent ranged GETs. Zero means one.
    pub task_num: usize,
    pub enable_checkpoint: bool,
    /// Defaults to `<download_file>.downloadfile_record`.
    pub checkpoint_file: Option<PathBuf>,
    /// Customer key the object was written with, if any.
    pub sse: ServerSideEncryption,
    pub progress: Option<ProgressBar>,
}

impl DownloadFileInput {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
            ..Default::default()
        }
    }

    pub fn to_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.download_file = Some(path.into());
        self
    }

    fn destination(&self) -> PathBuf {
        self.download_file
            .clone()
            .unwrap_or_else(|| PathBuf::from(&self.key))
    }
}

impl WosClient {
    /// Downloads an object through concurrent ranged GETs into `<file>.tmp`,
    /// then renames it onto the destination.
    ///
    /// With checkpointing enabled, an interrupted download resumes as long as
    /// the object and the temp file are unchanged.
    pub async fn download_file(
        &self,
        input: DownloadFileInput,
    ) -> Result<ObjectMetadata, WosError> {
        validate_object(&input.bucket, &input.key)?;
        let object = self
            .get_object_metadata(&input.bucket, &input.key, &input.sse)
            .await?;
        let destination = input.destination();
        let temp_path = with_suffix(&destination, ".tmp");
        let checkpoint_path = input.enable_checkpoint.then(|| {
            input
                .checkpoint_file
                .clone()
                .unwrap_or_else(|| with_suffix(&destination, DOWNLOAD_CHECKPOINT_SUFFIX))
        });

        let resumed = match &checkpoint_path {
            Some(path) => {
                let temp_len = tokio::fs::metadata(&temp_path).await.ok().map(|m| m.len());
                CheckpointStore::load(path, |c: &DownloadCheckpoint| {
                    check_download(c, &input, &object, &destination, &temp_path, temp_len)
                })
                .await
            }
            None => None,
        };

        let store = match resumed {
            Some(checkpoint) => {
                info!(
                    "🔁 Resuming download of {}/{} ({}/{} parts done)",
                    input.bucket,
                    input.key,
                    checkpoint.completed(),
                    checkpoint.parts.len()
                );
                CheckpointStore::create(checkpoint_path, checkpoint).await?
            }
            None => {
                let part_size = download_part_size(input.part_size, object.content_length);
                prepare_temp_file(&temp_path, object.content_length).await?;
                let checkpoint = DownloadCheckpoint {
                    version: CHECKPOINT_VERSION,
                    bucket: input.bucket.clone(),
                    key: input.key.clone(),
                    file_path: destination.clone(),
                    temp_path: temp_path.clone(),
                    part_size,
                    object_size: object.content_length,
                    etag: object.etag.clone(),
                    last_modified: object.last_modified.clone(),
                    parts: partition(object.content_length, part_size)?,
                };
                info!(
                    "⬇️ Downloading {}/{} ({} bytes) to {} in {} parts",
                    input.bucket,
                    input.key,
                    object.content_length,
                    destination.display(),
                    checkpoint.parts.len()
                );
                CheckpointStore::create(checkpoint_path, checkpoint).await?
            }
        };

        let store = Arc::new(store);
        let checkpoint = store.snapshot().await;
        let total = checkpoint.parts.len();
        if let Some(pb) = &input.progress {
            pb.set_length(total as u64);
            pb.set_position(checkpoint.completed() as u64);
        }

        let pool = WorkerPool::new(input.task_num);
        let client = self.clone();
        let job_store = Arc::clone(&store);
        let job = Arc::new(RangeJob {
            bucket: input.bucket.clone(),
            key: input.key.clone(),
            etag: object.etag.clone(),
            temp_path: temp_path.clone(),
            sse: input.sse.clone(),
            progress: input.progress.clone(),
        });
        let results = pool
            .run(checkpoint.pending(), move |part| {
                let client = client.clone();
                let store = Arc::clone(&job_store);
                let job = Arc::clone(&job);
                async move { job.download(&client, &store, part).await }
            })
            .await?;

        let mut failed_parts = Vec::new();
        let mut first_error = None;
        for (part, result) in results {
            if let Err(e) = result {
                failed_parts.push(part.part_number);
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
        let checkpoint = store.snapshot().await;
        if let Some(source) = first_error {
            failed_parts.sort_unstable();
            if let Some(pb) = &input.progress {
                pb.abandon_with_message("❌ Download failed");
            }
            return Err(WosError::TransferFailed {
                bucket: input.bucket,
                key: input.key,
                upload_id: None,
                failed_parts,
                completed: checkpoint.completed(),
                total,
                source: Box::new(source),
            });
        }
        if checkpoint.completed() != total {
            return Err(WosError::UnexpectedResponse(format!(
                "{} of {} ranges finished without error",
                checkpoint.completed(),
                total
            )));
        }

        tokio::fs::rename(&temp_path, &destination).await?;
        store.finalize().await;
        if let Some(pb) = &input.progress {
            pb.finish_with_message("✅ Download complete");
        }
        info!(
            "✅ Downloaded {}/{} to {}",
            input.bucket,
            input.key,
            destination.display()
        );
        Ok(object)
    }
}

fn check_download(
    c: &DownloadCheckpoint,
    input: &DownloadFileInput,
    object: &ObjectMetadata,
    destination: &Path,
    temp_path: &Path,
    temp_len: Option<u64>,
) -> Result<(), String> {
    if c.bucket != input.bucket || c.key != input.key {
        return Err(format!("checkpoint is for {}/{}", c.bucket, c.key));
    }
    if c.file_path != destination || c.temp_path != temp_path {
        return Err(format!("checkpoint is for file {}", c.file_path.display()));
    }
    if c.object_size != object.content_length
        || c.etag != object.etag
        || c.last_modified != object.last_modified
    {
        return Err("object changed since the checkpoint was written".to_string());
    }
    if temp_len != Some(c.object_size) {
        return Err(format!("temp file {} is missing or resized", temp_path.display()));
    }
    if !is_tiling(&c.parts, c.object_size) {
        return Err("checkpoint parts do not cover the object".to_string());
    }
    Ok(())
}

/// Creates the temp file at its final size so workers can write anywhere in it.
async fn prepare_temp_file(path: &Path, size: u64) -> Result<(), WosError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    let file = tokio::fs::File::create(path).await?;
    file.set_len(size).await?;
    Ok(())
}

struct RangeJob {
    bucket: String,
    key: String,
    etag: String,
    temp_path: PathBuf,
    sse: ServerSideEncryption,
    progress: Option<ProgressBar>,
}

impl RangeJob {
    async fn download(
        &self,
        client: &WosClient,
        store: &CheckpointStore<DownloadCheckpoint>,
        part: PartRecord,
    ) -> Result<u32, WosError> {
        let part_number = part.part_number;
        match self.fetch(client, &part).await {
            Ok(()) => {
                if let Err(e) = store.record(part.done(None)).await {
                    warn!("⚠️ Could not record part {}: {}", part_number, e);
                }
                if let Some(pb) = &self.progress {
                    pb.inc(1);
                }
                Ok(part_number)
            }
            Err(e) => {
                error!(
                    "❌ Range {} of {}/{} failed: {}",
                    part_number, self.bucket, self.key, e
                );
                if let Err(record_error) = store.record(part.failed()).await {
                    warn!("⚠️ Could not record part {}: {}", part_number, record_error);
                }
                Err(e)
            }
        }
    }

    async fn fetch(&self, client: &WosClient, part: &PartRecord) -> Result<(), WosError> {
        let output = client
            .get_object(GetObjectInput {
                bucket: self.bucket.clone(),
                key: self.key.clone(),
                range: Some((part.offset, part.offset + part.size - 1)),
                if_match: (!self.etag.is_empty()).then(|| self.etag.clone()),
                sse: self.sse.clone(),
            })
            .await?;
        if output.body.len() as u64 != part.size {
            return Err(WosError::UnexpectedResponse(format!(
                "range {} returned {} bytes, expected {}",
                part.part_number,
                output.body.len(),
                part.size
            )));
        }

        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .open(&self.temp_path)
            .await?;
        file.seek(SeekFrom::Start(part.offset)).await?;
        file.write_all(&output.body).await?;
        file.sync_data().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::PartStatus;
    use crate::test_support::{test_client, Call, FakeWos};

    fn object_data(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 256) as u8).collect()
    }

    fn count_gets(fake: &FakeWos) -> usize {
        fake.count(|c| matches!(c, Call::Get(_)))
    }

    #[tokio::test]
    async fn test_download_in_ranges() {
        let dir = tempfile::tempdir().unwrap();
        let data = object_data(5000);
        let fake = FakeWos::new();
        fake.put("bucket", "obj", data.clone());
        let client = test_client(fake.clone());
        let dest = dir.path().join("out").join("obj.bin");

        let mut input = DownloadFileInput::new("bucket", "obj").to_file(&dest);
        input.part_size = 1000;
        input.task_num = 3;
        let meta = client.download_file(input).await.unwrap();

        assert_eq!(meta.content_length, 5000);
        assert_eq!(count_gets(&fake), 5);
        assert!(fake
            .calls()
            .contains(&Call::Get(Some("bytes=4000-4999".to_string()))));
        assert_eq!(std::fs::read(&dest).unwrap(), data);
        assert!(!with_suffix(&dest, ".tmp").exists());
    }

    async fn resume_fixture(
        etag_override: Option<&str>,
    ) -> (tempfile::TempDir, Arc<FakeWos>, WosClient, PathBuf, Vec<u8>) {
        let dir = tempfile::tempdir().unwrap();
        let data = object_data(5000);
        let fake = FakeWos::new();
        fake.put("bucket", "obj", data.clone());
        let client = test_client(fake.clone());
        let meta = client
            .get_object_metadata("bucket", "obj", &ServerSideEncryption::None)
            .await
            .unwrap();

        let dest = dir.path().join("obj.bin");
        let temp = with_suffix(&dest, ".tmp");
        let mut partial = vec![0u8; data.len()];
        partial[..3000].copy_from_slice(&data[..3000]);
        std::fs::write(&temp, &partial).unwrap();

        let mut parts = partition(5000, 1000).unwrap();
        for part in parts.iter_mut().take(3) {
            part.status = PartStatus::Done;
        }
        let checkpoint = DownloadCheckpoint {
            version: CHECKPOINT_VERSION,
            bucket: "bucket".into(),
            key: "obj".into(),
            file_path: dest.clone(),
            temp_path: temp,
            part_size: 1000,
            object_size: 5000,
            etag: etag_override.map_or(meta.etag, str::to_string),
            last_modified: meta.last_modified,
            parts,
        };
        std::fs::write(
            with_suffix(&dest, DOWNLOAD_CHECKPOINT_SUFFIX),
            serde_json::to_vec(&checkpoint).unwrap(),
        )
        .unwrap();
        (dir, fake, client, dest, data)
    }

    #[tokio::test]
    async fn test_resume_fetches_only_missing_ranges() {
        let (_dir, fake, client, dest, data) = resume_fixture(None).await;

        let mut input = DownloadFileInput::new("bucket", "obj").to_file(&dest);
        input.part_size = 1000;
        input.task_num = 2;
        input.enable_checkpoint = true;
        client.download_file(input).await.unwrap();

        assert_eq!(count_gets(&fake), 2);
        assert_eq!(std::fs::read(&dest).unwrap(), data);
        assert!(!with_suffix(&dest, DOWNLOAD_CHECKPOINT_SUFFIX).exists());
    }

    #[tokio::test]
    async fn test_stale_checkpoint_downloads_everything() {
        let (_dir, fake, client, dest, data) = resume_fixture(Some("\"stale\"")).await;

        let mut input = DownloadFileInput::new("bucket", "obj").to_file(&dest);
        input.part_size = 1000;
        input.enable_checkpoint = true;
        client.download_file(input).await.unwrap();

        assert_eq!(count_gets(&fake), 5);
        assert_eq!(std::fs::read(&dest).unwrap(), data);
    }

    #[tokio::test]
    async fn test_empty_object_needs_no_ranges() {
        let dir = tempfile::tempdir().unwrap();
        let fake = FakeWos::new();
        fake.put("bucket", "empty", Vec::new());
        let client = test_client(fake.clone());
        let dest = dir.path().join("empty");

        client
            .download_file(DownloadFileInput::new("bucket", "empty").to_file(&dest))
            .await
            .unwrap();

        assert_eq!(count_gets(&fake), 0);
        assert_eq!(std::fs::metadata(&dest).unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_missing_object_fails_on_head() {
        let dir = tempfile::tempdir().unwrap();
        let fake = FakeWos::new();
        let client = test_client(fake.clone());

        let err = client
            .download_file(DownloadFileInput::new("bucket", "nope").to_file(dir.path().join("x")))
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(404));
        assert_eq!(fake.calls(), vec![Call::Head]);
    }
}
