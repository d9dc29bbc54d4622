//! Object and multipart operations on top of the dispatcher.

use crate::auth::{BrowserSignature, BrowserSignatureInput, SignatureScheme};
use crate::config::{ClientConfig, DEFAULT_SIGNED_URL_EXPIRES, MAX_PART_COUNT};
use crate::credentials::{CredentialProvider, Credentials};
use crate::dispatcher::{Dispatcher, RequestBody, SignedUrlRequest, WosRequest};
use crate::error::WosError;
use crate::model::{
    CompleteMultipartUploadBody, CompleteMultipartUploadOutput, CompletedPart, CopyPartInput,
    CopyPartOutput, GetObjectInput, GetObjectOutput, InitiateMultipartUploadInput,
    InitiateMultipartUploadOutput, ObjectMetadata, PutObjectInput, PutObjectOutput,
    ServerSideEncryption, SignedUrl, SignedUrlInput, UploadPartInput, UploadPartOutput,
};
use crate::transport::{HttpResponse, HttpTransport, ReqwestTransport};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use reqwest::Method;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Client for a WOS/S3-compatible endpoint.
///
/// Cloning is cheap; clones share the connection pool and credentials.
///
/// # Example
///
/// ```no_run
/// use wos_sdk::{ClientConfig, Credentials, WosClient};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let client = WosClient::new(
///     ClientConfig::new("https://wos.example.com"),
///     Credentials::new("ak", "sk"),
/// )?;
/// let meta = client.get_object_metadata("bucket", "key", &Default::default()).await?;
/// println!("{} bytes", meta.content_length);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct WosClient {
    dispatcher: Arc<Dispatcher>,
}

impl WosClient {
    /// Creates a client that talks HTTP through `reqwest`.
    pub fn new(config: ClientConfig, credentials: Credentials) -> Result<Self, WosError> {
        let transport = Arc::new(ReqwestTransport::new(&config)?);
        Self::with_transport(
            config,
            Arc::new(CredentialProvider::new(credentials)),
            transport,
        )
    }

    /// Creates a client over a caller-provided transport and credential provider.
    pub fn with_transport(
        config: ClientConfig,
        credentials: Arc<CredentialProvider>,
        transport: Arc<dyn HttpTransport>,
    ) -> Result<Self, WosError> {
        Ok(Self {
            dispatcher: Arc::new(Dispatcher::new(config, credentials, transport)?),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        self.dispatcher.config()
    }

    pub fn credentials(&self) -> &Arc<CredentialProvider> {
        self.dispatcher.credentials()
    }

    /// Replaces the credentials used by every clone of this client.
    /// Requests already signed keep their old signature.
    pub fn refresh(&self, credentials: Credentials) {
        info!("🔑 Refreshing credentials for access key {}", credentials.access_key);
        self.dispatcher.credentials().refresh(credentials);
    }

    fn scheme(&self) -> SignatureScheme {
        self.config().signature
    }

    fn header(&self, suffix: &str) -> String {
        self.scheme().header(suffix)
    }

    pub async fn put_object(&self, input: PutObjectInput) -> Result<PutObjectOutput, WosError> {
        validate_object(&input.bucket, &input.key)?;
        let mut request = WosRequest::new(Method::PUT, &input.bucket, &input.key);
        if let Some(content_type) = &input.content_type {
            request = request.header("content-type", content_type)?;
        }
        request = self.with_metadata(request, &input.metadata)?;
        input.sse.apply(&mut request.headers, self.scheme())?;

        let response = self.dispatcher.send(request.body(input.body)).await?;
        Ok(self.put_output(&response))
    }

    /// Uploads bytes as a single object.
    pub async fn put_bytes(
        &self,
        bucket: &str,
        key: &str,
        data: impl Into<Bytes>,
    ) -> Result<PutObjectOutput, WosError> {
        self.put_object(PutObjectInput {
            bucket: bucket.to_string(),
            key: key.to_string(),
            body: RequestBody::Bytes(data.into()),
            ..Default::default()
        })
        .await
    }

    pub async fn get_object(&self, input: GetObjectInput) -> Result<GetObjectOutput, WosError> {
        validate_object(&input.bucket, &input.key)?;
        let mut request = WosRequest::new(Method::GET, &input.bucket, &input.key);
        if let Some((start, end)) = input.range {
            if start > end {
                return Err(WosError::validation(format!(
                    "invalid range {}-{}",
                    start, end
                )));
            }
            request = request.header("range", &format!("bytes={}-{}", start, end))?;
        }
        if let Some(etag) = &input.if_match {
            request = request.header("if-match", etag)?;
        }
        input
            .sse
            .apply_customer_key(&mut request.headers, self.scheme(), "")?;

        let response = self.dispatcher.send(request).await?;
        Ok(get_output(response))
    }

    /// HEADs an object.
    pub async fn get_object_metadata(
        &self,
        bucket: &str,
        key: &str,
        sse: &ServerSideEncryption,
    ) -> Result<ObjectMetadata, WosError> {
        validate_object(bucket, key)?;
        let mut request = WosRequest::new(Method::HEAD, bucket, key);
        sse.apply_customer_key(&mut request.headers, self.scheme(), "")?;
        let response = self.dispatcher.send(request).await?;
        ObjectMetadata::from_response(&response, self.scheme())
    }

    pub async fn delete_object(&self, bucket: &str, key: &str) -> Result<(), WosError> {
        validate_object(bucket, key)?;
        self.dispatcher
            .send(WosRequest::new(Method::DELETE, bucket, key))
            .await?;
        Ok(())
    }

    pub async fn initiate_multipart_upload(
        &self,
        input: InitiateMultipartUploadInput,
    ) -> Result<InitiateMultipartUploadOutput, WosError> {
        validate_object(&input.bucket, &input.key)?;
        let mut request =
            WosRequest::new(Method::POST, &input.bucket, &input.key).query("uploads", "");
        if let Some(content_type) = &input.content_type {
            request = request.header("content-type", content_type)?;
        }
        request = self.with_metadata(request, &input.metadata)?;
        input.sse.apply(&mut request.headers, self.scheme())?;

        let response = self.dispatcher.send(request).await?;
        let output: InitiateMultipartUploadOutput =
            quick_xml::de::from_reader(response.body.as_ref())?;
        if output.upload_id.is_empty() {
            return Err(WosError::UnexpectedResponse(
                "initiate multipart upload returned no upload id".to_string(),
            ));
        }
        debug!(
            "Initiated multipart upload {} for {}/{}",
            output.upload_id, input.bucket, input.key
        );
        Ok(output)
    }

    pub async fn upload_part(&self, input: UploadPartInput) -> Result<UploadPartOutput, WosError> {
        validate_part(&input.bucket, &input.key, &input.upload_id, input.part_number)?;
        let mut request = WosRequest::new(Method::PUT, &input.bucket, &input.key)
            .query("partNumber", input.part_number.to_string())
            .query("uploadId", &input.upload_id);
        input
            .sse
            .apply_customer_key(&mut request.headers, self.scheme(), "")?;

        let response = self.dispatcher.send(request.body(input.body)).await?;
        let etag = response.header_str("etag").ok_or_else(|| {
            WosError::UnexpectedResponse(format!(
                "upload of part {} returned no ETag",
                input.part_number
            ))
        })?;
        Ok(UploadPartOutput {
            part_number: input.part_number,
            etag: etag.to_string(),
        })
    }

    /// Copies a range of an existing object into a multipart upload part.
    pub async fn copy_part(&self, input: CopyPartInput) -> Result<CopyPartOutput, WosError> {
        validate_part(&input.bucket, &input.key, &input.upload_id, input.part_number)?;
        validate_object(&input.source_bucket, &input.source_key)?;
        let source = format!(
            "/{}/{}",
            input.source_bucket,
            crate::auth::encode_key(&input.source_key)
        );
        let mut request = WosRequest::new(Method::PUT, &input.bucket, &input.key)
            .query("partNumber", input.part_number.to_string())
            .query("uploadId", &input.upload_id)
            .header(&self.header("copy-source"), &source)?;
        if let Some((start, end)) = input.source_range {
            if start > end {
                return Err(WosError::validation(format!(
                    "invalid copy range {}-{}",
                    start, end
                )));
            }
            request = request.header(
                &self.header("copy-source-range"),
                &format!("bytes={}-{}", start, end),
            )?;
        }
        input
            .sse
            .apply_customer_key(&mut request.headers, self.scheme(), "")?;
        input
            .source_sse
            .apply_customer_key(&mut request.headers, self.scheme(), "copy-source-")?;

        let response = self.dispatcher.send(request).await?;
        let mut output: CopyPartOutput = self.parse_success_body(&response)?;
        output.part_number = input.part_number;
        Ok(output)
    }

    /// Completes a multipart upload. `parts` may be in any order; they are
    /// sent sorted by ascending part number.
    pub async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        mut parts: Vec<CompletedPart>,
    ) -> Result<CompleteMultipartUploadOutput, WosError> {
        validate_upload(bucket, key, upload_id)?;
        if parts.is_empty() {
            return Err(WosError::validation("no parts to complete"));
        }
        parts.sort_by_key(|p| p.part_number);

        let body = quick_xml::se::to_string(&CompleteMultipartUploadBody { parts: &parts })?;
        let request = WosRequest::new(Method::POST, bucket, key)
            .query("uploadId", upload_id)
            .header("content-type", "application/xml")?
            .body(RequestBody::Bytes(Bytes::from(body)));

        let response = self.dispatcher.send(request).await?;
        let output = self.parse_success_body(&response)?;
        info!(
            "✅ Completed multipart upload {} of {}/{} with {} parts",
            upload_id,
            bucket,
            key,
            parts.len()
        );
        Ok(output)
    }

    pub async fn abort_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> Result<(), WosError> {
        validate_upload(bucket, key, upload_id)?;
        self.dispatcher
            .send(WosRequest::new(Method::DELETE, bucket, key).query("uploadId", upload_id))
            .await?;
        info!("Aborted multipart upload {} of {}/{}", upload_id, bucket, key);
        Ok(())
    }

    /// Creates a presigned URL valid for `input.expires` seconds (300 by default).
    pub fn create_signed_url(&self, input: &SignedUrlInput) -> Result<SignedUrl, WosError> {
        self.create_signed_url_at(input, Utc::now())
    }

    /// Like [`create_signed_url`](Self::create_signed_url) with an explicit issue time.
    pub fn create_signed_url_at(
        &self,
        input: &SignedUrlInput,
        now: DateTime<Utc>,
    ) -> Result<SignedUrl, WosError> {
        if input.bucket.is_empty() && !input.key.is_empty() {
            return Err(WosError::validation("a key needs a bucket"));
        }
        let expires = if input.expires == 0 {
            DEFAULT_SIGNED_URL_EXPIRES
        } else {
            input.expires
        };
        let (url, headers) = self.dispatcher.presign(
            input.method.clone(),
            &input.bucket,
            &input.key,
            input.query.clone(),
            input.headers.clone(),
            expires,
            now,
        )?;
        Ok(SignedUrl { url, headers })
    }

    /// Sends a request to an already signed URL. The URL and headers go out
    /// as given; only retries and redirects are handled here.
    pub async fn request_with_signed_url(
        &self,
        request: SignedUrlRequest,
    ) -> Result<HttpResponse, WosError> {
        self.dispatcher.send_signed_url(request).await
    }

    /// PUTs `body` through a URL from [`create_signed_url`](Self::create_signed_url).
    pub async fn put_object_with_signed_url(
        &self,
        signed: &SignedUrl,
        body: RequestBody,
    ) -> Result<PutObjectOutput, WosError> {
        let request = SignedUrlRequest::new(Method::PUT, &signed.url, signed.headers.clone());
        let response = self.request_with_signed_url(request.body(body)).await?;
        Ok(self.put_output(&response))
    }

    /// GETs an object through a URL from [`create_signed_url`](Self::create_signed_url).
    pub async fn get_object_with_signed_url(
        &self,
        signed: &SignedUrl,
    ) -> Result<GetObjectOutput, WosError> {
        let request = SignedUrlRequest::new(Method::GET, &signed.url, signed.headers.clone());
        let response = self.request_with_signed_url(request).await?;
        Ok(get_output(response))
    }

    /// Signs a POST policy for uploading straight from a browser form.
    pub fn create_browser_based_signature(
        &self,
        input: &BrowserSignatureInput,
    ) -> Result<BrowserSignature, WosError> {
        self.create_browser_based_signature_at(input, Utc::now())
    }

    pub fn create_browser_based_signature_at(
        &self,
        input: &BrowserSignatureInput,
        now: DateTime<Utc>,
    ) -> Result<BrowserSignature, WosError> {
        self.dispatcher.browser_signature(input, now)
    }

    fn put_output(&self, response: &HttpResponse) -> PutObjectOutput {
        PutObjectOutput {
            etag: response.header_str("etag").unwrap_or_default().to_string(),
            request_id: response
                .header_str(&self.scheme().request_id_header())
                .unwrap_or_default()
                .to_string(),
        }
    }

    fn with_metadata(
        &self,
        mut request: WosRequest,
        metadata: &BTreeMap<String, String>,
    ) -> Result<WosRequest, WosError> {
        for (name, value) in metadata {
            request = request.header(&self.header(&format!("meta-{}", name)), value)?;
        }
        Ok(request)
    }

    /// Some services report failures of long-running calls inside a 200 body.
    fn parse_success_body<T: serde::de::DeserializeOwned>(
        &self,
        response: &HttpResponse,
    ) -> Result<T, WosError> {
        let text = String::from_utf8_lossy(&response.body);
        if text.contains("<Error>") {
            let mut failed = response.clone();
            failed.status = reqwest::StatusCode::INTERNAL_SERVER_ERROR;
            return Err(self.dispatcher.service_error(&failed));
        }
        Ok(quick_xml::de::from_str(&text)?)
    }
}

fn get_output(response: HttpResponse) -> GetObjectOutput {
    GetObjectOutput {
        etag: response.header_str("etag").unwrap_or_default().to_string(),
        content_range: response.header_str("content-range").map(str::to_string),
        last_modified: response
            .header_str("last-modified")
            .unwrap_or_default()
            .to_string(),
        body: response.body,
    }
}

pub(crate) fn validate_object(bucket: &str, key: &str) -> Result<(), WosError> {
    if bucket.is_empty() {
        return Err(WosError::validation("bucket name is empty"));
    }
    if key.is_empty() {
        return Err(WosError::validation("object key is empty"));
    }
    Ok(())
}

fn validate_upload(bucket: &str, key: &str, upload_id: &str) -> Result<(), WosError> {
    validate_object(bucket, key)?;
    if upload_id.is_empty() {
        return Err(WosError::validation("upload id is empty"));
    }
    Ok(())
}

fn validate_part(
    bucket: &str,
    key: &str,
    upload_id: &str,
    part_number: u32,
) -> Result<(), WosError> {
    validate_upload(bucket, key, upload_id)?;
    if part_number == 0 || u64::from(part_number) > MAX_PART_COUNT {
        return Err(WosError::validation(format!(
            "part number {} is outside 1..={}",
            part_number, MAX_PART_COUNT
        )));
    }
    Ok(())
}
