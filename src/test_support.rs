//! In-memory transports for unit tests.

use crate::client::WosClient;
use crate::config::ClientConfig;
use crate::credentials::{CredentialProvider, Credentials};
use crate::error::WosError;
use crate::transport::{HttpRequest, HttpResponse, HttpTransport, TransportBody};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use md5::{Digest, Md5};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, StatusCode, Url};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub(crate) fn test_config() -> ClientConfig {
    ClientConfig::new("http://wos.test")
        .with_path_style(true)
        .with_retry_backoff_unit(Duration::from_millis(1))
}

pub(crate) fn test_client(transport: Arc<dyn HttpTransport>) -> WosClient {
    WosClient::with_transport(
        test_config().with_max_retry_count(1),
        Arc::new(CredentialProvider::new(Credentials::new("ak", "sk"))),
        transport,
    )
    .unwrap()
}

async fn read_body(body: TransportBody) -> Result<Bytes, WosError> {
    match body {
        TransportBody::Empty => Ok(Bytes::new()),
        TransportBody::Bytes(bytes) => Ok(bytes),
        TransportBody::Stream { mut stream, .. } => {
            let mut buf = BytesMut::new();
            while let Some(chunk) = stream.next().await {
                buf.extend_from_slice(&chunk?);
            }
            Ok(buf.freeze())
        }
    }
}

fn response(status: u16, headers: &[(&str, &str)], body: impl Into<Bytes>) -> HttpResponse {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        map.append(
            HeaderName::from_bytes(name.as_bytes()).unwrap(),
            HeaderValue::from_str(value).unwrap(),
        );
    }
    HttpResponse {
        status: StatusCode::from_u16(status).unwrap(),
        headers: map,
        body: body.into(),
    }
}

fn error_response(status: u16, code: &str) -> HttpResponse {
    response(
        status,
        &[("x-amz-request-id", "fake-request")],
        format!(
            "<Error><Code>{}</Code><Message>{}</Message><RequestId>fake-request</RequestId></Error>",
            code, code
        ),
    )
}

fn quoted_md5(data: &[u8]) -> String {
    format!("\"{}\"", hex::encode(Md5::digest(data)))
}

#[derive(Debug, Clone)]
pub(crate) struct SeenRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Replays a fixed list of responses in order.
pub(crate) struct ScriptedTransport {
    responses: Mutex<VecDeque<HttpResponse>>,
    seen: Mutex<Vec<SeenRequest>>,
}

impl ScriptedTransport {
    pub(crate) fn new(responses: Vec<HttpResponse>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn status(status: u16) -> HttpResponse {
        response(status, &[], Bytes::new())
    }

    pub(crate) fn response(status: u16, headers: &[(&str, &str)], body: &str) -> HttpResponse {
        response(status, headers, body.to_string())
    }

    pub(crate) fn calls(&self) -> usize {
        self.seen.lock().unwrap().len()
    }

    pub(crate) fn requests(&self) -> Vec<SeenRequest> {
        self.seen.lock().unwrap().clone()
    }

    pub(crate) fn bodies(&self) -> Vec<Bytes> {
        self.requests().into_iter().map(|r| r.body).collect()
    }
}

#[async_trait]
impl HttpTransport for ScriptedTransport {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, WosError> {
        let body = read_body(request.body).await?;
        self.seen.lock().unwrap().push(SeenRequest {
            method: request.method,
            url: request.url,
            headers: request.headers,
            body,
        });
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| WosError::validation("scripted transport ran out of responses"))
    }
}

/// Calls observed by [`FakeWos`], in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Call {
    Initiate,
    UploadPart(u32),
    CopyPart(u32),
    Complete(Vec<u32>),
    Abort,
    Put,
    Head,
    Get(Option<String>),
    Delete,
}

struct StoredObject {
    data: Bytes,
    etag: String,
    last_modified: String,
}

struct PendingUpload {
    parts: BTreeMap<u32, (Bytes, String)>,
}

#[derive(Default)]
struct FakeState {
    objects: HashMap<(String, String), StoredObject>,
    uploads: HashMap<String, PendingUpload>,
    uploads_created: u32,
    versions: u32,
    calls: Vec<Call>,
    failing_parts: HashSet<u32>,
}

#[derive(Deserialize)]
struct CompleteBody {
    #[serde(rename = "Part", default)]
    parts: Vec<CompletePart>,
}

#[derive(Deserialize)]
struct CompletePart {
    #[serde(rename = "PartNumber")]
    part_number: u32,
    #[serde(rename = "ETag")]
    etag: String,
}

/// A small in-memory object store speaking the multipart protocol.
#[derive(Default)]
pub(crate) struct FakeWos {
    state: Mutex<FakeState>,
}

impl FakeWos {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn put(&self, bucket: &str, key: &str, data: impl Into<Bytes>) {
        let data = data.into();
        let mut state = self.state.lock().unwrap();
        state.versions += 1;
        let object = StoredObject {
            etag: quoted_md5(&data),
            last_modified: format!("Wed, 01 Oct 2025 00:00:{:02} GMT", state.versions % 60),
            data,
        };
        state
            .objects
            .insert((bucket.to_string(), key.to_string()), object);
    }

    pub(crate) fn object(&self, bucket: &str, key: &str) -> Option<Bytes> {
        let state = self.state.lock().unwrap();
        state
            .objects
            .get(&(bucket.to_string(), key.to_string()))
            .map(|o| o.data.clone())
    }

    /// Registers an upload id as in progress, with some parts already stored.
    pub(crate) fn seed_upload(&self, upload_id: &str, parts: &[(u32, Bytes)]) -> Vec<String> {
        let mut state = self.state.lock().unwrap();
        let mut etags = Vec::new();
        let parts = parts
            .iter()
            .map(|(n, data)| {
                let etag = quoted_md5(data);
                etags.push(etag.clone());
                (*n, (data.clone(), etag))
            })
            .collect();
        state
            .uploads
            .insert(upload_id.to_string(), PendingUpload { parts });
        etags
    }

    pub(crate) fn fail_part(&self, part_number: u32) {
        self.state.lock().unwrap().failing_parts.insert(part_number);
    }

    pub(crate) fn clear_failures(&self) {
        self.state.lock().unwrap().failing_parts.clear();
    }

    pub(crate) fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    pub(crate) fn count(&self, predicate: impl Fn(&Call) -> bool) -> usize {
        self.calls().iter().filter(|c| predicate(c)).count()
    }

    pub(crate) fn uploaded_parts(&self) -> Vec<u32> {
        let mut parts: Vec<u32> = self
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::UploadPart(n) | Call::CopyPart(n) => Some(n),
                _ => None,
            })
            .collect();
        parts.sort_unstable();
        parts
    }

    pub(crate) fn pending_uploads(&self) -> usize {
        self.state.lock().unwrap().uploads.len()
    }

    fn handle(
        &self,
        method: &Method,
        url: &Url,
        headers: &HeaderMap,
        body: Bytes,
    ) -> HttpResponse {
        let path = url.path().trim_start_matches('/');
        let (bucket, raw_key) = path.split_once('/').unwrap_or((path, ""));
        let key = urlencoding::decode(raw_key).unwrap().into_owned();
        let query: HashMap<String, String> = url.query_pairs().into_owned().collect();
        let object_id = (bucket.to_string(), key.clone());
        let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());

        let mut state = self.state.lock().unwrap();

        if *method == Method::POST && query.contains_key("uploads") {
            state.calls.push(Call::Initiate);
            state.uploads_created += 1;
            let upload_id = format!("upload-{}", state.uploads_created);
            state.uploads.insert(
                upload_id.clone(),
                PendingUpload {
                    parts: BTreeMap::new(),
                },
            );
            return response(
                200,
                &[],
                format!(
                    "<InitiateMultipartUploadResult><Bucket>{}</Bucket><Key>{}</Key><UploadId>{}</UploadId></InitiateMultipartUploadResult>",
                    bucket, key, upload_id
                ),
            );
        }

        if let Some(upload_id) = query.get("uploadId") {
            if *method == Method::PUT {
                let part_number: u32 = query
                    .get("partNumber")
                    .and_then(|n| n.parse().ok())
                    .unwrap_or(0);
                let copy_source = header("x-amz-copy-source").map(str::to_string);
                state.calls.push(match copy_source {
                    Some(_) => Call::CopyPart(part_number),
                    None => Call::UploadPart(part_number),
                });
                if !state.uploads.contains_key(upload_id) {
                    return error_response(404, "NoSuchUpload");
                }
                if state.failing_parts.contains(&part_number) {
                    return error_response(500, "InternalError");
                }

                let data = match copy_source {
                    Some(source) => {
                        let source = urlencoding::decode(source.trim_start_matches('/'))
                            .unwrap()
                            .into_owned();
                        let (src_bucket, src_key) = source.split_once('/').unwrap();
                        let Some(object) = state
                            .objects
                            .get(&(src_bucket.to_string(), src_key.to_string()))
                        else {
                            return error_response(404, "NoSuchKey");
                        };
                        match header("x-amz-copy-source-range").and_then(parse_range) {
                            Some((start, end)) => {
                                object.data.slice(start as usize..end as usize + 1)
                            }
                            None => object.data.clone(),
                        }
                    }
                    None => body,
                };
                let etag = quoted_md5(&data);
                let is_copy = header("x-amz-copy-source").is_some();
                if let Some(upload) = state.uploads.get_mut(upload_id) {
                    upload.parts.insert(part_number, (data, etag.clone()));
                }
                if is_copy {
                    return response(
                        200,
                        &[],
                        format!(
                            "<CopyPartResult><LastModified>2025-10-01T00:00:00.000Z</LastModified><ETag>{}</ETag></CopyPartResult>",
                            etag
                        ),
                    );
                }
                return response(200, &[("etag", etag.as_str())], Bytes::new());
            }

            if *method == Method::POST {
                let parsed: CompleteBody =
                    quick_xml::de::from_str(std::str::from_utf8(&body).unwrap()).unwrap();
                state.calls.push(Call::Complete(
                    parsed.parts.iter().map(|p| p.part_number).collect(),
                ));
                let Some(upload) = state.uploads.get(upload_id) else {
                    return error_response(404, "NoSuchUpload");
                };
                if parsed
                    .parts
                    .windows(2)
                    .any(|w| w[0].part_number >= w[1].part_number)
                {
                    return error_response(400, "InvalidPartOrder");
                }
                let mut data = BytesMut::new();
                for part in &parsed.parts {
                    match upload.parts.get(&part.part_number) {
                        Some((bytes, etag)) if *etag == part.etag => data.extend_from_slice(bytes),
                        _ => return error_response(400, "InvalidPart"),
                    }
                }
                state.uploads.remove(upload_id);
                drop(state);
                self.put(bucket, &key, data.freeze());
                return response(
                    200,
                    &[],
                    format!(
                        "<CompleteMultipartUploadResult><Location>http://wos.test/{}/{}</Location><Bucket>{}</Bucket><Key>{}</Key><ETag>\"multipart\"</ETag></CompleteMultipartUploadResult>",
                        bucket, key, bucket, key
                    ),
                );
            }

            if *method == Method::DELETE {
                state.calls.push(Call::Abort);
                state.uploads.remove(upload_id);
                return response(204, &[], Bytes::new());
            }
        }

        match *method {
            Method::PUT => {
                state.calls.push(Call::Put);
                drop(state);
                let etag = quoted_md5(&body);
                self.put(bucket, &key, body);
                response(200, &[("etag", etag.as_str())], Bytes::new())
            }
            Method::HEAD => {
                state.calls.push(Call::Head);
                match state.objects.get(&object_id) {
                    Some(object) => {
                        let length = object.data.len().to_string();
                        response(
                            200,
                            &[
                                ("content-length", length.as_str()),
                                ("etag", object.etag.as_str()),
                                ("last-modified", object.last_modified.as_str()),
                                ("content-type", "application/octet-stream"),
                            ],
                            Bytes::new(),
                        )
                    }
                    None => response(404, &[("x-amz-request-id", "fake-request")], Bytes::new()),
                }
            }
            Method::GET => {
                let range = header("range").map(str::to_string);
                state.calls.push(Call::Get(range.clone()));
                let Some(object) = state.objects.get(&object_id) else {
                    return error_response(404, "NoSuchKey");
                };
                if let Some(expected) = header("if-match") {
                    if expected != object.etag {
                        return error_response(412, "PreconditionFailed");
                    }
                }
                match range.as_deref().and_then(parse_range) {
                    Some((start, end)) => {
                        let end = end.min(object.data.len() as u64 - 1);
                        let content_range =
                            format!("bytes {}-{}/{}", start, end, object.data.len());
                        response(
                            206,
                            &[
                                ("etag", object.etag.as_str()),
                                ("content-range", content_range.as_str()),
                            ],
                            object.data.slice(start as usize..end as usize + 1),
                        )
                    }
                    None => response(200, &[("etag", object.etag.as_str())], object.data.clone()),
                }
            }
            Method::DELETE => {
                state.calls.push(Call::Delete);
                state.objects.remove(&object_id);
                response(204, &[], Bytes::new())
            }
            _ => error_response(405, "MethodNotAllowed"),
        }
    }
}

fn parse_range(value: &str) -> Option<(u64, u64)> {
    let (start, end) = value.strip_prefix("bytes=")?.split_once('-')?;
    Some((start.parse().ok()?, end.parse().ok()?))
}

#[async_trait]
impl HttpTransport for FakeWos {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, WosError> {
        let body = read_body(request.body).await?;
        let url = Url::parse(&request.url).map_err(|e| WosError::InvalidUrl(e.to_string()))?;
        // Yield so concurrent workers interleave like real network calls.
        tokio::task::yield_now().await;
        Ok(self.handle(&request.method, &url, &request.headers, body))
    }
}
