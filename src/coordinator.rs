//! One-shot concurrent multipart transfers without checkpoints.
//!
//! Parts fan out over a [`WorkerPool`] and the results are gathered before
//! the upload is completed. The first failing part ends the whole transfer:
//! remaining parts are cancelled and the multipart upload is aborted.

use crate::checkpoint::{PartRecord, PartStatus};
use crate::client::{validate_object, WosClient};
use crate::config::DEFAULT_PART_SIZE;
use crate::dispatcher::RequestBody;
use crate::error::WosError;
use crate::model::{
    CompleteMultipartUploadOutput, CompletedPart, CopyPartInput, InitiateMultipartUploadInput,
    ServerSideEncryption, UploadPartInput,
};
use crate::partition::{partition, upload_part_size};
use crate::pool::WorkerPool;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Parameters of [`WosClient::concurrent_upload_parts`].
#[derive(Debug, Clone, Default)]
pub struct ConcurrentUploadInput {
    pub bucket: String,
    pub key: String,
    pub upload_file: PathBuf,
    pub part_size: u64,
    /// Zero runs every part at once.
    pub task_num: usize,
    pub content_type: Option<String>,
    pub metadata: BTreeMap<String, String>,
    pub sse: ServerSideEncryption,
}

/// Parameters of [`WosClient::concurrent_copy_parts`].
#[derive(Debug, Clone, Default)]
pub struct ConcurrentCopyInput {
    pub bucket: String,
    pub key: String,
    pub source_bucket: String,
    pub source_key: String,
    pub part_size: u64,
    /// Zero runs every part at once.
    pub task_num: usize,
    pub sse: ServerSideEncryption,
    pub source_sse: ServerSideEncryption,
}

/// Parts covering `total` bytes, with a single empty part for empty sources.
fn plan(total: u64, requested: u64) -> Result<Vec<PartRecord>, WosError> {
    let requested = if requested == 0 {
        DEFAULT_PART_SIZE
    } else {
        requested
    };
    let parts = partition(total, upload_part_size(requested, total))?;
    if parts.is_empty() {
        return Ok(vec![PartRecord {
            part_number: 1,
            offset: 0,
            size: 0,
            etag: None,
            status: PartStatus::Pending,
        }]);
    }
    Ok(parts)
}

fn pool_size(task_num: usize, parts: usize) -> usize {
    if task_num == 0 {
        parts
    } else {
        task_num
    }
}

impl WosClient {
    /// Uploads a local file as a multipart upload in one go.
    pub async fn concurrent_upload_parts(
        &self,
        input: ConcurrentUploadInput,
    ) -> Result<CompleteMultipartUploadOutput, WosError> {
        validate_object(&input.bucket, &input.key)?;
        let metadata = tokio::fs::metadata(&input.upload_file).await.map_err(|e| {
            WosError::validation(format!(
                "cannot read upload file {}: {}",
                input.upload_file.display(),
                e
            ))
        })?;
        let parts = plan(metadata.len(), input.part_size)?;

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
            "⬆️ Uploading {} to {}/{} in {} parts",
            input.upload_file.display(),
            input.bucket,
            input.key,
            parts.len()
        );

        let pool = WorkerPool::new(pool_size(input.task_num, parts.len()));
        let client = self.clone();
        let template = Arc::new(UploadPartInput {
            bucket: input.bucket.clone(),
            key: input.key.clone(),
            upload_id: upload.upload_id.clone(),
            sse: input.sse.clone(),
            ..Default::default()
        });
        let path = input.upload_file.clone();
        let results = pool
            .run_fail_fast(parts, move |part| {
                let client = client.clone();
                let template = Arc::clone(&template);
                let path = path.clone();
                async move {
                    let output = client
                        .upload_part(UploadPartInput {
                            bucket: template.bucket.clone(),
                            key: template.key.clone(),
                            upload_id: template.upload_id.clone(),
                            part_number: part.part_number,
                            body: RequestBody::File {
                                path,
                                offset: part.offset,
                                len: part.size,
                            },
                            sse: template.sse.clone(),
                        })
                        .await
                        .map_err(|e| {
                            part_failed(&template.bucket, &template.key, part.part_number, e)
                        })?;
                    Ok::<_, WosError>(CompletedPart {
                        part_number: output.part_number,
                        etag: output.etag,
                    })
                }
            })
            .await;

        self.finish_parts(&input.bucket, &input.key, &upload.upload_id, results)
            .await
    }

    /// Builds an object from ranges of an existing object with part copies.
    pub async fn concurrent_copy_parts(
        &self,
        input: ConcurrentCopyInput,
    ) -> Result<CompleteMultipartUploadOutput, WosError> {
        validate_object(&input.bucket, &input.key)?;
        let source = self
            .get_object_metadata(&input.source_bucket, &input.source_key, &input.source_sse)
            .await?;
        let parts = plan(source.content_length, input.part_size)?;

        let upload = self
            .initiate_multipart_upload(InitiateMultipartUploadInput {
                bucket: input.bucket.clone(),
                key: input.key.clone(),
                sse: input.sse.clone(),
                ..Default::default()
            })
            .await?;
        info!(
            "📋 Copying {}/{} to {}/{} in {} parts",
            input.source_bucket,
            input.source_key,
            input.bucket,
            input.key,
            parts.len()
        );

        let pool = WorkerPool::new(pool_size(input.task_num, parts.len()));
        let client = self.clone();
        let template = Arc::new(CopyPartInput {
            bucket: input.bucket.clone(),
            key: input.key.clone(),
            upload_id: upload.upload_id.clone(),
            source_bucket: input.source_bucket.clone(),
            source_key: input.source_key.clone(),
            sse: input.sse.clone(),
            source_sse: input.source_sse.clone(),
            ..Default::default()
        });
        let results = pool
            .run_fail_fast(parts, move |part| {
                let client = client.clone();
                let template = Arc::clone(&template);
                async move {
                    let mut copy = (*template).clone();
                    copy.part_number = part.part_number;
                    copy.source_range =
                        (part.size > 0).then(|| (part.offset, part.offset + part.size - 1));
                    let output = client
                        .copy_part(copy)
                        .await
                        .map_err(|e| {
                            part_failed(&template.bucket, &template.key, part.part_number, e)
                        })?;
                    Ok::<_, WosError>(CompletedPart {
                        part_number: output.part_number,
                        etag: output.etag,
                    })
                }
            })
            .await;

        self.finish_parts(&input.bucket, &input.key, &upload.upload_id, results)
            .await
    }

    async fn finish_parts(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        results: Result<Vec<CompletedPart>, WosError>,
    ) -> Result<CompleteMultipartUploadOutput, WosError> {
        let outcome = match results {
            Ok(parts) => {
                self.complete_multipart_upload(bucket, key, upload_id, parts)
                    .await
            }
            Err(e) => Err(e),
        };
        if let Err(e) = &outcome {
            error!("❌ Multipart transfer to {}/{} failed: {}", bucket, key, e);
            if let Err(abort_error) = self.abort_multipart_upload(bucket, key, upload_id).await {
                warn!(
                    "⚠️ Could not abort upload {}: {}",
                    upload_id, abort_error
                );
            }
        }
        outcome
    }
}

fn part_failed(bucket: &str, key: &str, part_number: u32, source: WosError) -> WosError {
    WosError::PartFailed {
        bucket: bucket.to_string(),
        key: key.to_string(),
        part_number,
        source: Box::new(source),
    }
}
