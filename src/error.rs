//! Error types for WOS operations.

use std::fmt;
use std::io;
use thiserror::Error;

/// Structured error decoded from a non-success service response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceError {
    /// HTTP status code.
    pub status: u16,
    /// Status line, e.g. `"404 Not Found"`.
    pub status_line: String,
    /// Service error code, e.g. `"NoSuchKey"`. Empty when the body had none.
    pub code: String,
    /// Human readable message from the error body.
    pub message: String,
    /// Request id from the body or the `x-*-request-id` header.
    pub request_id: String,
    pub resource: String,
    pub host_id: String,
}

impl fmt::Display for ServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "service responded {}", self.status_line)?;
        if !self.code.is_empty() {
            write!(f, ", code: {}", self.code)?;
        }
        if !self.message.is_empty() {
            write!(f, ", message: {}", self.message)?;
        }
        if !self.request_id.is_empty() {
            write!(f, ", request id: {}", self.request_id)?;
        }
        Ok(())
    }
}

/// Errors that can occur during WOS operations.
#[derive(Error, Debug)]
pub enum WosError {
    /// I/O error during file operations.
    #[error(transparent)]
    Io(#[from] io::Error),

    /// HTTP transport error.
    #[error(transparent)]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization error.
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// XML serialization/deserialization error.
    #[error(transparent)]
    Xml(#[from] quick_xml::DeError),

    /// No progress on the connection within the idle timeout.
    #[error("Request timed out: {0}")]
    Timeout(String),

    /// The service answered with an error status.
    #[error("{0}")]
    Service(ServiceError),

    /// Input rejected before any network call.
    #[error("Invalid input: {0}")]
    Validation(String),

    /// A date header could not be parsed while signing.
    #[error("Failed to parse date header: {0}")]
    DateParse(String),

    #[error("Invalid url: {0}")]
    InvalidUrl(String),

    /// The service answered successfully but the response lacked something we need.
    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),

    /// A spawned worker panicked or was cancelled.
    #[error(transparent)]
    Join(#[from] tokio::task::JoinError),

    /// One part of a multipart transfer failed after exhausting its retries.
    #[error("Part {part_number} of {bucket}/{key} failed: {source}")]
    PartFailed {
        bucket: String,
        key: String,
        part_number: u32,
        source: Box<WosError>,
    },

    /// A resumable transfer stopped before every part completed.
    ///
    /// The checkpoint file, when enabled, is left on disk so the transfer can
    /// be resumed. The remote multipart upload is not aborted.
    #[error(
        "Transfer of {bucket}/{key} failed ({completed}/{total} parts done, failed parts {failed_parts:?}): {source}"
    )]
    TransferFailed {
        bucket: String,
        key: String,
        upload_id: Option<String>,
        failed_parts: Vec<u32>,
        completed: usize,
        total: usize,
        source: Box<WosError>,
    },
}

impl WosError {
    pub(crate) fn validation(message: impl Into<String>) -> Self {
        WosError::Validation(message.into())
    }

    /// Returns the structured service error, looking through part and transfer wrappers.
    pub fn service_error(&self) -> Option<&ServiceError> {
        match self {
            WosError::Service(e) => Some(e),
            WosError::PartFailed { source, .. } | WosError::TransferFailed { source, .. } => {
                source.service_error()
            }
            _ => None,
        }
    }

    /// HTTP status of the underlying service error, if any.
    pub fn status(&self) -> Option<u16> {
        self.service_error().map(|e| e.status)
    }

    /// Whether a repeatable request failing with this error may be retried.
    ///
    /// Transport failures, 5xx, 408 and 429 responses are transient. 304 and
    /// every other 4xx are final.
    pub fn is_retryable(&self) -> bool {
        match self {
            WosError::Http(_) | WosError::Io(_) | WosError::Timeout(_) => true,
            WosError::Service(e) => e.status >= 500 || e.status == 408 || e.status == 429,
            _ => false,
        }
    }
}
