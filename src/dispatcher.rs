//! Signs and executes requests with retry, redirect following and body replay.

use crate::auth::{
    encode_key, insert_header, BrowserSignature, BrowserSignatureInput, RequestParts, Signer,
    REDACTED,
};
use crate::config::ClientConfig;
use crate::credentials::{CredentialProvider, Credentials};
use crate::error::{ServiceError, WosError};
use crate::model::ErrorBody;
use crate::transport::{ByteStream, HttpRequest, HttpResponse, HttpTransport, TransportBody};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, AUTHORIZATION, HOST, LOCATION};
use reqwest::{Method, StatusCode, Url};
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_retry2::strategy::jitter;
use tokio_retry2::{Retry, RetryError};
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};

/// Body of a request, re-opened for every attempt.
#[derive(Default)]
pub enum RequestBody {
    #[default]
    Empty,
    Bytes(Bytes),
    /// `len` bytes of `path` starting at `offset`. Re-opened and seeked on
    /// every attempt.
    File { path: PathBuf, offset: u64, len: u64 },
    /// A one-shot stream. Requests carrying one are never retried.
    Stream(Mutex<Option<(ByteStream, u64)>>),
}

impl RequestBody {
    pub fn stream(stream: ByteStream, content_length: u64) -> Self {
        RequestBody::Stream(Mutex::new(Some((stream, content_length))))
    }

    /// Whether the body can be produced again from the start.
    pub fn is_repeatable(&self) -> bool {
        !matches!(self, RequestBody::Stream(_))
    }

    pub fn content_length(&self) -> u64 {
        match self {
            RequestBody::Empty => 0,
            RequestBody::Bytes(bytes) => bytes.len() as u64,
            RequestBody::File { len, .. } => *len,
            RequestBody::Stream(inner) => inner
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .as_ref()
                .map_or(0, |(_, len)| *len),
        }
    }

    async fn open(&self) -> Result<TransportBody, WosError> {
        match self {
            RequestBody::Empty => Ok(TransportBody::Empty),
            RequestBody::Bytes(bytes) => Ok(TransportBody::Bytes(bytes.clone())),
            RequestBody::File { path, offset, len } => {
                let mut file = tokio::fs::File::open(path).await?;
                file.seek(SeekFrom::Start(*offset)).await?;
                Ok(TransportBody::Stream {
                    stream: Box::pin(ReaderStream::new(file.take(*len))),
                    content_length: *len,
                })
            }
            RequestBody::Stream(inner) => {
                let taken = inner.lock().unwrap_or_else(PoisonError::into_inner).take();
                match taken {
                    Some((stream, content_length)) => Ok(TransportBody::Stream {
                        stream,
                        content_length,
                    }),
                    None => Err(WosError::validation("stream body was already consumed")),
                }
            }
        }
    }
}

impl fmt::Debug for RequestBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestBody::Empty => f.write_str("Empty"),
            RequestBody::Bytes(bytes) => write!(f, "Bytes({} bytes)", bytes.len()),
            RequestBody::File { path, offset, len } => f
                .debug_struct("File")
                .field("path", path)
                .field("offset", offset)
                .field("len", len)
                .finish(),
            RequestBody::Stream(_) => f.write_str("Stream"),
        }
    }
}

impl From<Bytes> for RequestBody {
    fn from(bytes: Bytes) -> Self {
        RequestBody::Bytes(bytes)
    }
}

impl From<Vec<u8>> for RequestBody {
    fn from(bytes: Vec<u8>) -> Self {
        RequestBody::Bytes(Bytes::from(bytes))
    }
}

/// One logical call against the service.
#[derive(Debug)]
pub struct WosRequest {
    pub method: Method,
    /// Empty for service-level requests.
    pub bucket: String,
    pub key: String,
    pub query: BTreeMap<String, String>,
    pub headers: HeaderMap,
    pub body: RequestBody,
}

impl WosRequest {
    pub fn new(method: Method, bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            method,
            bucket: bucket.into(),
            key: key.into(),
            query: BTreeMap::new(),
            headers: HeaderMap::new(),
            body: RequestBody::Empty,
        }
    }

    pub fn query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.insert(name.into(), value.into());
        self
    }

    pub fn header(mut self, name: &str, value: &str) -> Result<Self, WosError> {
        insert_header(&mut self.headers, name, value)?;
        Ok(self)
    }

    pub fn body(mut self, body: RequestBody) -> Self {
        self.body = body;
        self
    }
}

/// A request authenticated by a presigned URL instead of a signature the
/// dispatcher computes.
#[derive(Debug)]
pub struct SignedUrlRequest {
    pub method: Method,
    pub url: String,
    /// Headers that were signed together with the URL, usually
    /// [`SignedUrl::headers`](crate::model::SignedUrl::headers).
    pub headers: HeaderMap,
    pub body: RequestBody,
}

impl SignedUrlRequest {
    pub fn new(method: Method, url: impl Into<String>, headers: HeaderMap) -> Self {
        Self {
            method,
            url: url.into(),
            headers,
            body: RequestBody::Empty,
        }
    }

    pub fn body(mut self, body: RequestBody) -> Self {
        self.body = body;
        self
    }
}

/// Jittered linear backoff: retry `n` waits `(n + 2) * random[0, 1) * unit`.
pub(crate) fn backoff_strategy(unit: Duration, retries: usize) -> impl Iterator<Item = Duration> {
    (2u32..).map(move |n| unit * n).map(jitter).take(retries)
}

/// Turns a request into signed HTTP exchanges.
pub struct Dispatcher {
    config: ClientConfig,
    scheme: String,
    host: String,
    signer: Signer,
    credentials: Arc<CredentialProvider>,
    transport: Arc<dyn HttpTransport>,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("endpoint", &format!("{}://{}", self.scheme, self.host))
            .field("signature", &self.signer.scheme())
            .finish()
    }
}

impl Dispatcher {
    pub fn new(
        config: ClientConfig,
        credentials: Arc<CredentialProvider>,
        transport: Arc<dyn HttpTransport>,
    ) -> Result<Self, WosError> {
        let (scheme, host) = config.endpoint_parts()?;
        let signer = Signer::new(config.signature, config.region.clone());
        Ok(Self {
            config,
            scheme,
            host,
            signer,
            credentials,
            transport,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn credentials(&self) -> &Arc<CredentialProvider> {
        &self.credentials
    }

    /// Host, path and canonical resource for a bucket/key pair.
    pub(crate) fn request_parts(
        &self,
        method: Method,
        bucket: &str,
        key: &str,
        query: BTreeMap<String, String>,
        headers: HeaderMap,
    ) -> RequestParts {
        let encoded_key = encode_key(key);
        let (host, path) = if bucket.is_empty() {
            (self.host.clone(), "/".to_string())
        } else if self.config.path_style {
            let path = if key.is_empty() {
                format!("/{}", bucket)
            } else {
                format!("/{}/{}", bucket, encoded_key)
            };
            (self.host.clone(), path)
        } else {
            (format!("{}.{}", bucket, self.host), format!("/{}", encoded_key))
        };
        let resource = if bucket.is_empty() {
            "/".to_string()
        } else {
            format!("/{}/{}", bucket, encoded_key)
        };

        RequestParts {
            method,
            host,
            path,
            resource,
            query,
            headers,
        }
    }

    /// Executes `request`, retrying and following redirects per configuration.
    ///
    /// Only repeatable requests are retried, and only on errors that
    /// [`WosError::is_retryable`] accepts. Each retry sleeps a jittered
    /// `(n + 2) * unit`.
    pub async fn send(&self, request: WosRequest) -> Result<HttpResponse, WosError> {
        let redirects = AtomicUsize::new(0);
        let label = format!("{} {}/{}", request.method, request.bucket, request.key);
        self.retrying(&label, &request.body, || self.attempt(&request, &redirects))
            .await
    }

    /// Executes a request authenticated by a presigned URL.
    ///
    /// Retries and redirects follow the same rules as [`send`](Self::send),
    /// but nothing is ever signed: the URL and its signed headers are sent as
    /// given, and redirect targets are fetched as-is.
    pub async fn send_signed_url(
        &self,
        request: SignedUrlRequest,
    ) -> Result<HttpResponse, WosError> {
        let logged_url = redact_url(&request.url);
        Url::parse(&request.url)
            .map_err(|e| WosError::InvalidUrl(format!("{}: {}", logged_url, e)))?;
        let redirects = AtomicUsize::new(0);
        let label = format!("{} {}", request.method, logged_url);
        self.retrying(&label, &request.body, || {
            self.attempt_signed_url(&request, &redirects)
        })
        .await
    }

    async fn retrying<F, Fut>(
        &self,
        label: &str,
        body: &RequestBody,
        run: F,
    ) -> Result<HttpResponse, WosError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<HttpResponse, WosError>>,
    {
        let repeatable = body.is_repeatable();
        let retries = if repeatable {
            self.config.max_retry_count
        } else {
            0
        };
        let strategy = backoff_strategy(self.config.retry_backoff_unit, retries);
        let attempts = AtomicUsize::new(0);

        Retry::spawn(strategy, || {
            let attempts = &attempts;
            let outcome = run();
            async move {
                let attempt = attempts.fetch_add(1, Ordering::Relaxed) + 1;
                match outcome.await {
                    Ok(response) => Ok(response),
                    Err(e) if repeatable && e.is_retryable() && attempt <= retries => {
                        warn!("{} failed on attempt {}: {}, retrying", label, attempt, e);
                        RetryError::to_transient(e)
                    }
                    Err(e) => RetryError::to_permanent(e),
                }
            }
        })
        .await
    }

    async fn attempt(
        &self,
        request: &WosRequest,
        redirects: &AtomicUsize,
    ) -> Result<HttpResponse, WosError> {
        let credentials = self.credentials.snapshot();
        let mut parts = self.request_parts(
            request.method.clone(),
            &request.bucket,
            &request.key,
            request.query.clone(),
            request.headers.clone(),
        );
        self.signer.sign(&mut parts, &credentials, Utc::now())?;

        let mut http = HttpRequest {
            method: request.method.clone(),
            url: parts.url(&self.scheme),
            headers: parts.headers,
            body: request.body.open().await?,
        };

        loop {
            debug!("{} {}", http.method, http.url);
            let current_url = http.url.clone();
            let response = self.transport.execute(http).await?;
            if response.status.is_success() {
                return Ok(response);
            }
            let (status, target) =
                self.redirect_target(&response, &current_url, &request.body, redirects)?;
            http = self
                .redirect_request(request, &credentials, status, target)
                .await?;
        }
    }

    async fn attempt_signed_url(
        &self,
        request: &SignedUrlRequest,
        redirects: &AtomicUsize,
    ) -> Result<HttpResponse, WosError> {
        let mut http = HttpRequest {
            method: request.method.clone(),
            url: request.url.clone(),
            headers: request.headers.clone(),
            body: request.body.open().await?,
        };

        loop {
            debug!("{} {}", http.method, redact_url(&http.url));
            let current_url = http.url.clone();
            let response = self.transport.execute(http).await?;
            if response.status.is_success() {
                return Ok(response);
            }
            let (_, target) =
                self.redirect_target(&response, &current_url, &request.body, redirects)?;
            let mut headers = request.headers.clone();
            headers.remove(HOST);
            http = HttpRequest {
                method: request.method.clone(),
                url: target.to_string(),
                headers,
                body: request.body.open().await?,
            };
        }
    }

    /// Resolves where a non-2xx `response` points, or the error that ends
    /// the attempt.
    ///
    /// Only 3xx responses other than 304 that carry a `Location` are followed,
    /// and only while the redirect budget lasts and the body can be sent
    /// again.
    fn redirect_target(
        &self,
        response: &HttpResponse,
        current_url: &str,
        body: &RequestBody,
        redirects: &AtomicUsize,
    ) -> Result<(StatusCode, Url), WosError> {
        let status = response.status;
        let followable = status.is_redirection()
            && status != StatusCode::NOT_MODIFIED
            && body.is_repeatable();
        let location = match response.header_str(LOCATION.as_str()) {
            Some(location) if followable => location,
            _ => return Err(self.service_error(response)),
        };
        if redirects.fetch_add(1, Ordering::Relaxed) >= self.config.max_redirect_count {
            return Err(self.service_error(response));
        }

        let target = Url::parse(current_url)
            .and_then(|base| base.join(location))
            .map_err(|e| WosError::InvalidUrl(format!("{}: {}", location, e)))?;
        debug!(
            "Following {} redirect to {}",
            status.as_u16(),
            redact_url(target.as_str())
        );
        Ok((status, target))
    }

    /// Builds the request for a redirect target.
    ///
    /// A 302 answering a GET is fetched as-is without signing. Anything else is
    /// re-signed against the target host.
    async fn redirect_request(
        &self,
        request: &WosRequest,
        credentials: &Credentials,
        status: StatusCode,
        target: Url,
    ) -> Result<HttpRequest, WosError> {
        if status == StatusCode::FOUND && request.method == Method::GET {
            let mut headers = request.headers.clone();
            headers.remove(AUTHORIZATION);
            return Ok(HttpRequest {
                method: Method::GET,
                url: target.to_string(),
                headers,
                body: TransportBody::Empty,
            });
        }

        let host = match (target.host_str(), target.port()) {
            (Some(host), Some(port)) => format!("{}:{}", host, port),
            (Some(host), None) => host.to_string(),
            (None, _) => return Err(WosError::InvalidUrl(format!("{}: missing host", target))),
        };
        let query: BTreeMap<String, String> = if target.query().is_some() {
            target.query_pairs().into_owned().collect()
        } else {
            request.query.clone()
        };
        let resource = self
            .request_parts(
                Method::GET,
                &request.bucket,
                &request.key,
                BTreeMap::new(),
                HeaderMap::new(),
            )
            .resource;

        let mut parts = RequestParts {
            method: request.method.clone(),
            host,
            path: target.path().to_string(),
            resource,
            query,
            headers: request.headers.clone(),
        };
        self.signer.sign(&mut parts, credentials, Utc::now())?;

        Ok(HttpRequest {
            method: request.method.clone(),
            url: parts.url(target.scheme()),
            headers: parts.headers,
            body: request.body.open().await?,
        })
    }

    /// Decodes the `<Error>` body of a failed response.
    pub(crate) fn service_error(&self, response: &HttpResponse) -> WosError {
        let body: ErrorBody = if response.body.is_empty() {
            ErrorBody::default()
        } else {
            quick_xml::de::from_reader(response.body.as_ref()).unwrap_or_default()
        };
        let request_id = if body.request_id.is_empty() {
            response
                .header_str(&self.config.signature.request_id_header())
                .unwrap_or_default()
                .to_string()
        } else {
            body.request_id
        };

        WosError::Service(ServiceError {
            status: response.status.as_u16(),
            status_line: format!(
                "{} {}",
                response.status.as_u16(),
                response.status.canonical_reason().unwrap_or_default()
            ),
            code: body.code,
            message: body.message,
            request_id,
            resource: body.resource,
            host_id: body.host_id,
        })
    }

    /// Builds a query-signed URL valid for `expires` seconds after `now`.
    pub(crate) fn presign(
        &self,
        method: Method,
        bucket: &str,
        key: &str,
        query: BTreeMap<String, String>,
        headers: HeaderMap,
        expires: u64,
        now: DateTime<Utc>,
    ) -> Result<(String, HeaderMap), WosError> {
        let credentials = self.credentials.snapshot();
        let mut parts = self.request_parts(method, bucket, key, query, headers);
        self.signer.presign(&mut parts, &credentials, now, expires)?;
        Ok((parts.url(&self.scheme), parts.headers))
    }

    pub(crate) fn browser_signature(
        &self,
        input: &BrowserSignatureInput,
        now: DateTime<Utc>,
    ) -> Result<BrowserSignature, WosError> {
        let credentials = self.credentials.snapshot();
        self.signer.browser_signature(input, &credentials, now)
    }
}

/// Masks session tokens carried in the query of a presigned URL.
fn redact_url(url: &str) -> String {
    let Ok(mut parsed) = Url::parse(url) else {
        return url.to_string();
    };
    if !parsed.query_pairs().any(|(name, _)| is_token_param(&name)) {
        return url.to_string();
    }
    let pairs: Vec<(String, String)> = parsed
        .query_pairs()
        .into_owned()
        .map(|(name, value)| {
            if is_token_param(&name) {
                (name, REDACTED.to_string())
            } else {
                (name, value)
            }
        })
        .collect();
    parsed.query_pairs_mut().clear().extend_pairs(pairs);
    parsed.to_string()
}

fn is_token_param(name: &str) -> bool {
    name.to_ascii_lowercase().ends_with("security-token")
}
