//! Resumable multipart upload of a local file.

use crate::checkpoint::{
    with_suffix, Checkpoint, CheckpointStore, FileStamp, PartRecord, PartStatus, UploadCheckpoint,
    CHECKPOINT_VERSION,
};
use crate::client::{validate_object, WosClient};
use crate::config::{DEFAULT_PART_SIZE, UPLOAD_CHECKPOINT_SUFFIX};
use crate::dispatcher::RequestBody;
use crate::error::WosError;
use crate::model::{
    CompleteMultipartUploadOutput, CompletedPart, InitiateMultipartUploadInput,
    ServerSideEncryption, UploadPartInput,
};
use crate::partition::{is_tiling, partition, upload_part_size};
use crate::pool::WorkerPool;
use indicatif::ProgressBar;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Parameters of [`WosClient::upload_file`].
#[derive(Debug, Clone, Default)]
pub struct UploadFileInput {
    pub bucket: String,
    pub key: String,
    pub upload_file: PathBuf,
    /// Bytes per part. Zero picks the default; values are clamped to the
    /// service limits.
    pub part_size: u64,
    /// Concurrent part uploads. Zero means one.
    pub task_num: usize,
    pub enable_checkpoint: bool,
    /// Defaults to `<upload_file>.uploadfile_record`.
    pub checkpoint_file: Option<PathBuf>,
    pub content_type: Option<String>,
    pub metadata: BTreeMap<String, String>,
    pub sse: ServerSideEncryption,
    /// Advanced once per finished part.
    pub progress: Option<ProgressBar>,
}

impl UploadFileInput {
    pub fn new(
        bucket: impl Into<String>,
        key: impl Into<String>,
        upload_file: impl Into<PathBuf>,
    ) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
            upload_file: upload_file.into(),
            ..Default::default()
        }
    }

    fn checkpoint_path(&self) -> Option<PathBuf> {
        if !self.enable_checkpoint {
            return None;
        }
        Some(
            self.checkpoint_file
                .clone()
                .unwrap_or_else(|| with_suffix(&self.upload_file, UPLOAD_CHECKPOINT_SUFFIX)),
        )
    }
}

struct LocalFile {
    size: u64,
    mtime: FileStamp,
}

impl WosClient {
    /// Uploads a local file as a multipart upload, resuming from a checkpoint
    /// when one matches the file.
    ///
    /// On failure the checkpoint stays on disk and the remote upload is left
    /// in place, so calling this again with the same input picks up where it
    /// stopped.
    pub async fn upload_file(
        &self,
        input: UploadFileInput,
    ) -> Result<CompleteMultipartUploadOutput, WosError> {
        validate_object(&input.bucket, &input.key)?;
        let metadata = tokio::fs::metadata(&input.upload_file).await.map_err(|e| {
            WosError::validation(format!(
                "cannot read upload file {}: {}",
                input.upload_file.display(),
                e
            ))
        })?;
        if !metadata.is_file() {
            return Err(WosError::validation(format!(
                "{} is not a regular file",
                input.upload_file.display()
            )));
        }
        let file = LocalFile {
            size: metadata.len(),
            mtime: FileStamp::of(&metadata)?,
        };

        let checkpoint_path = input.checkpoint_path();
        let store = match &checkpoint_path {
            Some(path) => {
                let mut stale_upload = None;
                let loaded = CheckpointStore::load(path, |c: &UploadCheckpoint| {
                    let verdict = check_upload(c, &input, &file);
                    if verdict.is_err()
                        && c.bucket == input.bucket
                        && c.key == input.key
                        && !c.upload_id.is_empty()
                    {
                        stale_upload = Some(c.upload_id.clone());
                    }
                    verdict
                })
                .await;
                if let Some(upload_id) = stale_upload {
                    self.abort_stale_upload(&input, &upload_id).await;
                }
                match loaded {
                    Some(checkpoint) => {
                        info!(
                            "🔁 Resuming upload {} of {}/{} ({}/{} parts done)",
                            checkpoint.upload_id,
                            input.bucket,
                            input.key,
                            checkpoint.completed(),
                            checkpoint.parts.len()
                        );
                        CheckpointStore::create(checkpoint_path.clone(), checkpoint).await?
                    }
                    None => self.start_upload(&input, &file, checkpoint_path.clone()).await?,
                }
            }
            None => self.start_upload(&input, &file, None).await?,
        };

        let store = Arc::new(store);
        let checkpoint = store.snapshot().await;
        let upload_id = checkpoint.upload_id.clone();
        let total = checkpoint.parts.len();
        if let Some(pb) = &input.progress {
            pb.set_length(total as u64);
            pb.set_position(checkpoint.completed() as u64);
        }

        let pool = WorkerPool::new(input.task_num);
        let client = self.clone();
        let job_store = Arc::clone(&store);
        let job = Arc::new(PartJob {
            bucket: input.bucket.clone(),
            key: input.key.clone(),
            upload_id: upload_id.clone(),
            path: input.upload_file.clone(),
            sse: input.sse.clone(),
            progress: input.progress.clone(),
        });
        let results = pool
            .run(checkpoint.pending(), move |part| {
                let client = client.clone();
                let store = Arc::clone(&job_store);
                let job = Arc::clone(&job);
                async move { job.upload(&client, &store, part).await }
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
                pb.abandon_with_message("❌ Upload failed");
            }
            return Err(WosError::TransferFailed {
                bucket: input.bucket,
                key: input.key,
                upload_id: Some(upload_id),
                failed_parts,
                completed: checkpoint.completed(),
                total,
                source: Box::new(source),
            });
        }

        let parts: Vec<CompletedPart> = checkpoint
            .parts
            .iter()
            .filter(|p| p.is_done())
            .map(|p| CompletedPart {
                part_number: p.part_number,
                etag: p.etag.clone().unwrap_or_default(),
            })
            .collect();
        if parts.len() != total {
            return Err(WosError::UnexpectedResponse(format!(
                "{} of {} parts finished without error",
                parts.len(),
                total
            )));
        }

        match self
            .complete_multipart_upload(&input.bucket, &input.key, &upload_id, parts)
            .await
        {
            Ok(output) => {
                store.finalize().await;
                if let Some(pb) = &input.progress {
                    pb.finish_with_message("✅ Upload complete");
                }
                Ok(output)
            }
            Err(e) => {
                if e.service_error().is_some_and(|s| s.code == "NoSuchUpload") {
                    warn!(
                        "⚠️ Upload {} no longer exists, discarding its checkpoint",
                        upload_id
                    );
                    store.finalize().await;
                }
                Err(e)
            }
        }
    }

    async fn start_upload(
        &self,
        input: &UploadFileInput,
        file: &LocalFile,
        checkpoint_path: Option<PathBuf>,
    ) -> Result<CheckpointStore<UploadCheckpoint>, WosError> {
        let requested = if input.part_size == 0 {
            DEFAULT_PART_SIZE
        } else {
            input.part_size
        };
        let part_size = upload_part_size(requested, file.size);
        let mut parts = partition(file.size, part_size)?;
        if parts.is_empty() {
            parts.push(PartRecord {
                part_number: 1,
                offset: 0,
                size: 0,
                etag: None,
                status: PartStatus::Pending,
            });
        }

        let upload = self
            .initiate_multipart_upload(InitiateMultipartUploadInput {
                bucket: input.bucket.clone(),
                key: input.key.clone(),
                content_type: input.content_type.clone(),
                metadata: input.metadata.clone(),
                sse: input.sse.clone(),
            })
            .await?;
        info!(
            "⬆️ Uploading {} ({} bytes) to {}/{} in {} parts of {} bytes",
            input.upload_file.display(),
            file.size,
            input.bucket,
            input.key,
            parts.len(),
            part_size
        );

        let checkpoint = UploadCheckpoint {
            version: CHECKPOINT_VERSION,
            bucket: input.bucket.clone(),
            key: input.key.clone(),
            file_path: input.upload_file.clone(),
            file_size: file.size,
            file_mtime: file.mtime,
            part_size,
            upload_id: upload.upload_id,
            parts,
        };
        CheckpointStore::create(checkpoint_path, checkpoint).await
    }

    async fn abort_stale_upload(&self, input: &UploadFileInput, upload_id: &str) {
        if let Err(e) = self
            .abort_multipart_upload(&input.bucket, &input.key, upload_id)
            .await
        {
            warn!("⚠️ Could not abort stale upload {}: {}", upload_id, e);
        }
    }
}

fn check_upload(
    c: &UploadCheckpoint,
    input: &UploadFileInput,
    file: &LocalFile,
) -> Result<(), String> {
    if c.bucket != input.bucket || c.key != input.key {
        return Err(format!("checkpoint is for {}/{}", c.bucket, c.key));
    }
    if c.file_path != input.upload_file {
        return Err(format!("checkpoint is for file {}", c.file_path.display()));
    }
    if c.file_size != file.size || c.file_mtime != file.mtime {
        return Err("file changed since the checkpoint was written".to_string());
    }
    if c.upload_id.is_empty() {
        return Err("checkpoint has no upload id".to_string());
    }
    if !is_tiling(&c.parts, c.file_size) {
        return Err("checkpoint parts do not cover the file".to_string());
    }
    Ok(())
}

struct PartJob {
    bucket: String,
    key: String,
    upload_id: String,
    path: PathBuf,
    sse: ServerSideEncryption,
    progress: Option<ProgressBar>,
}

impl PartJob {
    async fn upload(
        &self,
        client: &WosClient,
        store: &CheckpointStore<UploadCheckpoint>,
        part: PartRecord,
    ) -> Result<u32, WosError> {
        let part_number = part.part_number;
        let result = client
            .upload_part(UploadPartInput {
                bucket: self.bucket.clone(),
                key: self.key.clone(),
                upload_id: self.upload_id.clone(),
                part_number,
                body: RequestBody::File {
                    path: self.path.clone(),
                    offset: part.offset,
                    len: part.size,
                },
                sse: self.sse.clone(),
            })
            .await;

        match result {
            Ok(output) => {
                if let Err(e) = store.record(part.done(Some(output.etag))).await {
                    warn!("⚠️ Could not record part {}: {}", part_number, e);
                }
                if let Some(pb) = &self.progress {
                    pb.inc(1);
                }
                Ok(part_number)
            }
            Err(e) => {
                error!(
                    "❌ Part {} of {}/{} failed: {}",
                    part_number, self.bucket, self.key, e
                );
                if let Err(record_error) = store.record(part.failed()).await {
                    warn!("⚠️ Could not record part {}: {}", part_number, record_error);
                }
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MIN_PART_SIZE;
    use crate::test_support::{test_client, Call, FakeWos};
    use bytes::Bytes;
    use std::path::Path;

    fn write_file(dir: &Path, name: &str, len: usize) -> (PathBuf, Vec<u8>) {
        let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        let path = dir.join(name);
        std::fs::write(&path, &data).unwrap();
        (path, data)
    }

    #[tokio::test]
    async fn test_upload_twelve_megabytes_in_three_parts() {
        let dir = tempfile::tempdir().unwrap();
        let (path, data) = write_file(dir.path(), "big.bin", 12 * 1024 * 1024);
        let fake = FakeWos::new();
        let client = test_client(fake.clone());

        let mut input = UploadFileInput::new("bucket", "big.bin", &path);
        input.part_size = 5 * 1024 * 1024;
        input.task_num = 3;
        let output = client.upload_file(input).await.unwrap();

        assert_eq!(output.key, "big.bin");
        assert_eq!(fake.count(|c| *c == Call::Initiate), 1);
        assert_eq!(fake.uploaded_parts(), vec![1, 2, 3]);
        assert_eq!(fake.count(|c| matches!(c, Call::Complete(_))), 1);
        assert!(fake.calls().contains(&Call::Complete(vec![1, 2, 3])));
        assert_eq!(fake.object("bucket", "big.bin").unwrap(), Bytes::from(data));
    }

    #[tokio::test]
    async fn test_resume_skips_done_parts() {
        let dir = tempfile::tempdir().unwrap();
        let part_size = MIN_PART_SIZE;
        let (path, data) = write_file(dir.path(), "resume.bin", 5 * part_size as usize);
        let fake = FakeWos::new();

        let chunks: Vec<(u32, Bytes)> = (0..3u32)
            .map(|i| {
                let start = i as usize * part_size as usize;
                (i + 1, Bytes::copy_from_slice(&data[start..start + part_size as usize]))
            })
            .collect();
        let etags = fake.seed_upload("upload-77", &chunks);

        let metadata = std::fs::metadata(&path).unwrap();
        let mut parts = partition(data.len() as u64, part_size).unwrap();
        for (part, etag) in parts.iter_mut().zip(etags) {
            part.etag = Some(etag);
            part.status = PartStatus::Done;
        }
        let checkpoint = UploadCheckpoint {
            version: CHECKPOINT_VERSION,
            bucket: "bucket".into(),
            key: "resume.bin".into(),
            file_path: path.clone(),
            file_size: data.len() as u64,
            file_mtime: FileStamp::of(&metadata).unwrap(),
            part_size,
            upload_id: "upload-77".into(),
            parts,
        };
        let record = with_suffix(&path, UPLOAD_CHECKPOINT_SUFFIX);
        std::fs::write(&record, serde_json::to_vec(&checkpoint).unwrap()).unwrap();

        let client = test_client(fake.clone());
        let mut input = UploadFileInput::new("bucket", "resume.bin", &path);
        input.part_size = part_size;
        input.task_num = 2;
        input.enable_checkpoint = true;
        client.upload_file(input).await.unwrap();

        assert_eq!(fake.count(|c| *c == Call::Initiate), 0);
        assert_eq!(fake.uploaded_parts(), vec![4, 5]);
        assert!(fake.calls().contains(&Call::Complete(vec![1, 2, 3, 4, 5])));
        assert_eq!(fake.object("bucket", "resume.bin").unwrap(), Bytes::from(data));
        assert!(!record.exists());
    }

    #[tokio::test]
    async fn test_failed_part_keeps_checkpoint_for_resume() {
        let dir = tempfile::tempdir().unwrap();
        let (path, data) = write_file(dir.path(), "flaky.bin", 3 * MIN_PART_SIZE as usize);
        let fake = FakeWos::new();
        fake.fail_part(2);
        let client = test_client(fake.clone());

        let mut input = UploadFileInput::new("bucket", "flaky.bin", &path);
        input.part_size = MIN_PART_SIZE;
        input.task_num = 1;
        input.enable_checkpoint = true;

        let err = client.upload_file(input.clone()).await.unwrap_err();
        match &err {
            WosError::TransferFailed {
                upload_id,
                failed_parts,
                completed,
                total,
                ..
            } => {
                assert_eq!(upload_id.as_deref(), Some("upload-1"));
                assert_eq!(failed_parts, &vec![2]);
                assert_eq!(*completed, 1);
                assert_eq!(*total, 3);
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert_eq!(err.status(), Some(500));
        assert_eq!(fake.pending_uploads(), 1);

        let record = with_suffix(&path, UPLOAD_CHECKPOINT_SUFFIX);
        let saved: UploadCheckpoint =
            serde_json::from_slice(&std::fs::read(&record).unwrap()).unwrap();
        assert_eq!(saved.parts[0].status, PartStatus::Done);
        assert_eq!(saved.parts[1].status, PartStatus::Failed);
        assert_eq!(saved.parts[2].status, PartStatus::Pending);

        fake.clear_failures();
        client.upload_file(input).await.unwrap();
        assert_eq!(fake.count(|c| *c == Call::Initiate), 1);
        assert_eq!(fake.count(|c| *c == Call::UploadPart(1)), 1);
        assert_eq!(fake.count(|c| *c == Call::UploadPart(3)), 1);
        assert_eq!(fake.object("bucket", "flaky.bin").unwrap(), Bytes::from(data));
        assert!(!record.exists());
    }

    #[tokio::test]
    async fn test_stale_checkpoint_aborts_old_upload() {
        let dir = tempfile::tempdir().unwrap();
        let (path, data) = write_file(dir.path(), "changed.bin", 1000);
        let fake = FakeWos::new();
        fake.seed_upload("upload-old", &[]);

        let checkpoint = UploadCheckpoint {
            version: CHECKPOINT_VERSION,
            bucket: "bucket".into(),
            key: "changed.bin".into(),
            file_path: path.clone(),
            file_size: 999,
            file_mtime: FileStamp { secs: 0, nanos: 0 },
            part_size: MIN_PART_SIZE,
            upload_id: "upload-old".into(),
            parts: partition(999, MIN_PART_SIZE).unwrap(),
        };
        let record = dir.path().join("custom.record");
        std::fs::write(&record, serde_json::to_vec(&checkpoint).unwrap()).unwrap();

        let client = test_client(fake.clone());
        let mut input = UploadFileInput::new("bucket", "changed.bin", &path);
        input.enable_checkpoint = true;
        input.checkpoint_file = Some(record.clone());
        client.upload_file(input).await.unwrap();

        let calls = fake.calls();
        assert_eq!(calls[0], Call::Abort);
        assert_eq!(calls[1], Call::Initiate);
        assert_eq!(fake.pending_uploads(), 0);
        assert_eq!(fake.object("bucket", "changed.bin").unwrap(), Bytes::from(data));
    }

    #[tokio::test]
    async fn test_empty_file_uploads_one_empty_part() {
        let dir = tempfile::tempdir().unwrap();
        let (path, _) = write_file(dir.path(), "empty.bin", 0);
        let fake = FakeWos::new();
        let client = test_client(fake.clone());

        client
            .upload_file(UploadFileInput::new("bucket", "empty.bin", &path))
            .await
            .unwrap();

        assert_eq!(fake.uploaded_parts(), vec![1]);
        assert!(fake.calls().contains(&Call::Complete(vec![1])));
        assert_eq!(fake.object("bucket", "empty.bin").unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_missing_file_is_rejected_before_network() {
        let fake = FakeWos::new();
        let client = test_client(fake.clone());
        let err = client
            .upload_file(UploadFileInput::new("bucket", "k", "/no/such/file"))
            .await
            .unwrap_err();
        assert!(matches!(err, WosError::Validation(_)));
        assert!(fake.calls().is_empty());
    }
}
