//! Request/response models and their XML shapes.

use crate::auth::{insert_header, SignatureScheme};
use crate::dispatcher::RequestBody;
use crate::error::WosError;
use crate::transport::HttpResponse;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use md5::{Digest, Md5};
use reqwest::header::HeaderMap;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Server-side encryption settings attached to a request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ServerSideEncryption {
    #[default]
    None,
    /// SSE-C: the caller supplies the base64 key on every request.
    CustomerKey {
        algorithm: String,
        key: String,
        /// Base64 MD5 of the decoded key. Computed when `None`.
        key_md5: Option<String>,
    },
    /// SSE-KMS: the service manages the key.
    ManagedKey {
        algorithm: String,
        key_id: Option<String>,
    },
}

impl ServerSideEncryption {
    /// SSE-C with `AES256` and a base64 encoded 256-bit key.
    pub fn customer_key(key: impl Into<String>) -> Self {
        ServerSideEncryption::CustomerKey {
            algorithm: "AES256".to_string(),
            key: key.into(),
            key_md5: None,
        }
    }

    /// SSE-KMS with an optional key id.
    pub fn managed_key(key_id: Option<String>) -> Self {
        ServerSideEncryption::ManagedKey {
            algorithm: "aws:kms".to_string(),
            key_id,
        }
    }

    /// Headers for requests that create an object (put, initiate).
    pub(crate) fn apply(
        &self,
        headers: &mut HeaderMap,
        scheme: SignatureScheme,
    ) -> Result<(), WosError> {
        match self {
            ServerSideEncryption::None => Ok(()),
            ServerSideEncryption::CustomerKey { .. } => {
                self.apply_customer_key(headers, scheme, "")
            }
            ServerSideEncryption::ManagedKey { algorithm, key_id } => {
                insert_header(headers, &scheme.header("server-side-encryption"), algorithm)?;
                if let Some(key_id) = key_id {
                    let name = scheme.header(&format!(
                        "server-side-encryption-{}-kms-key-id",
                        scheme.vendor()
                    ));
                    insert_header(headers, &name, key_id)?;
                }
                Ok(())
            }
        }
    }

    /// SSE-C headers only, for requests that read or extend an object
    /// (upload part, get, head). `infix` is `"copy-source-"` for copy sources.
    pub(crate) fn apply_customer_key(
        &self,
        headers: &mut HeaderMap,
        scheme: SignatureScheme,
        infix: &str,
    ) -> Result<(), WosError> {
        let ServerSideEncryption::CustomerKey { algorithm, key, key_md5 } = self else {
            return Ok(());
        };
        let key_md5 = match key_md5 {
            Some(md5) => md5.clone(),
            None => {
                let raw = BASE64.decode(key).map_err(|e| {
                    WosError::validation(format!("SSE-C key is not valid base64: {}", e))
                })?;
                BASE64.encode(Md5::digest(&raw))
            }
        };
        let prefix = format!("{}server-side-encryption-customer-", infix);
        insert_header(headers, &scheme.header(&format!("{}algorithm", prefix)), algorithm)?;
        insert_header(headers, &scheme.header(&format!("{}key", prefix)), key)?;
        insert_header(headers, &scheme.header(&format!("{}key-md5", prefix)), &key_md5)?;
        Ok(())
    }
}

/// `<InitiateMultipartUploadResult>`
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct InitiateMultipartUploadOutput {
    #[serde(default)]
    pub bucket: String,
    #[serde(default)]
    pub key: String,
    pub upload_id: String,
}

/// One `<Part>` of a `<CompleteMultipartUpload>` body.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CompletedPart {
    #[serde(rename = "PartNumber")]
    pub part_number: u32,
    #[serde(rename = "ETag")]
    pub etag: String,
}

#[derive(Debug, Serialize)]
#[serde(rename = "CompleteMultipartUpload")]
pub(crate) struct CompleteMultipartUploadBody<'a> {
    #[serde(rename = "Part")]
    pub parts: &'a [CompletedPart],
}

/// `<CompleteMultipartUploadResult>`
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct CompleteMultipartUploadOutput {
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub bucket: String,
    #[serde(default)]
    pub key: String,
    #[serde(rename = "ETag", default)]
    pub etag: String,
}

/// `<CopyPartResult>`
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct CopyPartOutput {
    #[serde(rename = "LastModified", default)]
    pub last_modified: String,
    #[serde(rename = "ETag")]
    pub etag: String,
    /// Part number the copy was stored under.
    #[serde(skip)]
    pub part_number: u32,
}

/// `<Error>` body returned with failing responses.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct ErrorBody {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub resource: String,
    #[serde(default)]
    pub request_id: String,
    #[serde(default)]
    pub host_id: String,
}

/// Object attributes returned by HEAD.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectMetadata {
    pub content_length: u64,
    /// ETag as returned, quotes included.
    pub etag: String,
    pub last_modified: String,
    pub content_type: String,
    /// User metadata from `x-*-meta-*` headers, keyed without the prefix.
    pub metadata: BTreeMap<String, String>,
}

impl ObjectMetadata {
    /// Fails when the response carries no usable `content-length`.
    pub(crate) fn from_response(
        response: &HttpResponse,
        scheme: SignatureScheme,
    ) -> Result<Self, WosError> {
        let content_length = response
            .header_str("content-length")
            .and_then(|v| v.trim().parse().ok())
            .ok_or_else(|| {
                WosError::UnexpectedResponse(format!(
                    "HEAD returned status {} without a valid content-length",
                    response.status.as_u16()
                ))
            })?;
        let meta_prefix = scheme.header("meta-");
        let metadata = response
            .headers
            .iter()
            .filter_map(|(name, value)| {
                let key = name.as_str().strip_prefix(meta_prefix.as_str())?;
                Some((key.to_string(), value.to_str().ok()?.to_string()))
            })
            .collect();

        Ok(Self {
            content_length,
            etag: response.header_str("etag").unwrap_or_default().to_string(),
            last_modified: response
                .header_str("last-modified")
                .unwrap_or_default()
                .to_string(),
            content_type: response
                .header_str("content-type")
                .unwrap_or_default()
                .to_string(),
            metadata,
        })
    }
}

/// Input of [`WosClient::put_object`](crate::WosClient::put_object).
#[derive(Debug, Default)]
pub struct PutObjectInput {
    pub bucket: String,
    pub key: String,
    pub body: RequestBody,
    pub content_type: Option<String>,
    pub metadata: BTreeMap<String, String>,
    pub sse: ServerSideEncryption,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PutObjectOutput {
    pub etag: String,
    pub request_id: String,
}

/// Input of [`WosClient::get_object`](crate::WosClient::get_object).
#[derive(Debug, Clone, Default)]
pub struct GetObjectInput {
    pub bucket: String,
    pub key: String,
    /// Inclusive byte range `(start, end)`.
    pub range: Option<(u64, u64)>,
    pub if_match: Option<String>,
    pub sse: ServerSideEncryption,
}

#[derive(Debug, Clone, Default)]
pub struct GetObjectOutput {
    pub body: bytes::Bytes,
    pub etag: String,
    pub content_range: Option<String>,
    pub last_modified: String,
}

/// Input of [`WosClient::initiate_multipart_upload`](crate::WosClient::initiate_multipart_upload).
#[derive(Debug, Clone, Default)]
pub struct InitiateMultipartUploadInput {
    pub bucket: String,
    pub key: String,
    pub content_type: Option<String>,
    pub metadata: BTreeMap<String, String>,
    pub sse: ServerSideEncryption,
}

/// Input of [`WosClient::upload_part`](crate::WosClient::upload_part).
#[derive(Debug, Default)]
pub struct UploadPartInput {
    pub bucket: String,
    pub key: String,
    pub upload_id: String,
    pub part_number: u32,
    pub body: RequestBody,
    pub sse: ServerSideEncryption,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadPartOutput {
    pub part_number: u32,
    pub etag: String,
}

/// Input of [`WosClient::copy_part`](crate::WosClient::copy_part).
#[derive(Debug, Clone, Default)]
pub struct CopyPartInput {
    pub bucket: String,
    pub key: String,
    pub upload_id: String,
    pub part_number: u32,
    pub source_bucket: String,
    pub source_key: String,
    /// Inclusive byte range of the source `(start, end)`.
    pub source_range: Option<(u64, u64)>,
    pub sse: ServerSideEncryption,
    pub source_sse: ServerSideEncryption,
}

/// Input of [`WosClient::create_signed_url`](crate::WosClient::create_signed_url).
#[derive(Debug, Clone)]
pub struct SignedUrlInput {
    pub method: Method,
    pub bucket: String,
    pub key: String,
    pub query: BTreeMap<String, String>,
    /// Headers the bearer will send; they become part of the signature.
    pub headers: HeaderMap,
    /// Lifetime in seconds; `0` means the default of 300.
    pub expires: u64,
}

impl Default for SignedUrlInput {
    fn default() -> Self {
        Self {
            method: Method::GET,
            bucket: String::new(),
            key: String::new(),
            query: BTreeMap::new(),
            headers: HeaderMap::new(),
            expires: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SignedUrl {
    pub url: String,
    /// Headers that must accompany a request to `url`.
    pub headers: HeaderMap,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_complete_body_xml() {
        let parts = vec![
            CompletedPart {
                part_number: 1,
                etag: "\"a\"".into(),
            },
            CompletedPart {
                part_number: 2,
                etag: "\"b\"".into(),
            },
        ];
        let xml = quick_xml::se::to_string(&CompleteMultipartUploadBody { parts: &parts }).unwrap();
        assert!(xml.starts_with("<CompleteMultipartUpload>"));
        assert!(xml.contains("<Part><PartNumber>1</PartNumber>"));
        let first = xml.find("<PartNumber>1<").unwrap();
        let second = xml.find("<PartNumber>2<").unwrap();
        assert!(first < second);
    }

    #[test]
    fn test_parse_initiate_result() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
<InitiateMultipartUploadResult xmlns="http://s3.amazonaws.com/doc/2006-03-01/">
  <Bucket>photos</Bucket>
  <Key>2024/cat.jpg</Key>
  <UploadId>VXBsb2FkIElE</UploadId>
</InitiateMultipartUploadResult>"#;
        let output: InitiateMultipartUploadOutput = quick_xml::de::from_str(xml).unwrap();
        assert_eq!(output.bucket, "photos");
        assert_eq!(output.key, "2024/cat.jpg");
        assert_eq!(output.upload_id, "VXBsb2FkIElE");
    }

    #[test]
    fn test_customer_key_headers() {
        let key = BASE64.encode([7u8; 32]);
        let expected_md5 = BASE64.encode(Md5::digest([7u8; 32]));
        let mut headers = HeaderMap::new();
        ServerSideEncryption::customer_key(key.clone())
            .apply(&mut headers, SignatureScheme::Wos)
            .unwrap();

        assert_eq!(headers["x-wos-server-side-encryption-customer-algorithm"], "AES256");
        assert_eq!(headers["x-wos-server-side-encryption-customer-key"], key.as_str());
        assert_eq!(
            headers["x-wos-server-side-encryption-customer-key-md5"],
            expected_md5.as_str()
        );
    }

    #[test]
    fn test_managed_key_is_not_sent_on_parts() {
        let sse = ServerSideEncryption::managed_key(Some("key-1".into()));
        let mut headers = HeaderMap::new();
        sse.apply_customer_key(&mut headers, SignatureScheme::V4, "").unwrap();
        assert!(headers.is_empty());

        sse.apply(&mut headers, SignatureScheme::V4).unwrap();
        assert_eq!(headers["x-amz-server-side-encryption"], "aws:kms");
        assert_eq!(headers["x-amz-server-side-encryption-aws-kms-key-id"], "key-1");
    }

    #[test]
    fn test_invalid_customer_key() {
        let mut headers = HeaderMap::new();
        let result = ServerSideEncryption::customer_key("not base64!")
            .apply(&mut headers, SignatureScheme::V4);
        assert!(matches!(result, Err(WosError::Validation(_))));
    }
}
