//! wos-sdk - Client for WOS/S3-compatible object storage
//!
//! This library signs and sends object storage requests and moves large files
//! through concurrent, resumable multipart transfers.
//!
//! # Features
//!
//! - **Request Signing**: V2 (HMAC-SHA1), V4 (HMAC-SHA256) and the WOS V4 variant
//! - **Presigning**: Signed URLs, requests sent through them, and POST policies for browser uploads
//! - **Automatic Retry**: Jittered backoff for transient failures, redirect following and body replay
//! - **Resumable Transfers**: Multipart upload and ranged download with on-disk checkpoints
//! - **Concurrent Parts**: Fixed-size worker pool per transfer
//! - **Hot-Swappable Credentials**: Rotate keys without rebuilding the client
//!
//! # Example
//!
//! ```no_run
//! use wos_sdk::{ClientConfig, Credentials, UploadFileInput, WosClient};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = WosClient::new(
//!     ClientConfig::new("https://wos.example.com"),
//!     Credentials::new("access-key", "secret-key"),
//! )?;
//!
//! let mut input = UploadFileInput::new("bucket", "backups/db.tar", "db.tar");
//! input.task_num = 4;
//! input.enable_checkpoint = true;
//! client.upload_file(input).await?;
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod checkpoint;
pub mod client;
pub mod config;
pub mod coordinator;
pub mod credentials;
pub mod dispatcher;
pub mod download;
pub mod error;
pub mod model;
pub mod partition;
pub mod pool;
pub mod transport;
pub mod upload;

#[cfg(test)]
mod test_support;

pub use auth::{BrowserSignature, BrowserSignatureInput, SignatureScheme, Signer};
pub use checkpoint::{
    CheckpointStore, DownloadCheckpoint, PartRecord, PartStatus, UploadCheckpoint,
};
pub use client::WosClient;
pub use config::ClientConfig;
pub use coordinator::{ConcurrentCopyInput, ConcurrentUploadInput};
pub use credentials::{CredentialProvider, Credentials};
pub use dispatcher::{RequestBody, SignedUrlRequest, WosRequest};
pub use download::DownloadFileInput;
pub use error::{ServiceError, WosError};
pub use model::{
    CompleteMultipartUploadOutput, CompletedPart, CopyPartInput, CopyPartOutput, GetObjectInput,
    GetObjectOutput, InitiateMultipartUploadInput, InitiateMultipartUploadOutput, ObjectMetadata,
    PutObjectInput, PutObjectOutput, ServerSideEncryption, SignedUrl, SignedUrlInput,
    UploadPartInput, UploadPartOutput,
};
pub use transport::{HttpTransport, ReqwestTransport};
pub use upload::UploadFileInput;
