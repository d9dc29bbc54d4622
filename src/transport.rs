//! The HTTP seam between the dispatcher and the network.
//!
//! [`ReqwestTransport`] is the production implementation. Redirects are never
//! followed here; the dispatcher decides what to do with a 3xx.

use crate::config::ClientConfig;
use crate::error::WosError;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures_util::{Stream, StreamExt};
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_LENGTH};
use reqwest::{Method, StatusCode};
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

/// Request body chunks.
pub type ByteStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send + Sync>>;

/// Body of one outgoing attempt.
pub enum TransportBody {
    Empty,
    Bytes(Bytes),
    /// Streamed body with a known length, sent with an explicit `Content-Length`.
    Stream {
        stream: ByteStream,
        content_length: u64,
    },
}

impl std::fmt::Debug for TransportBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportBody::Empty => f.write_str("Empty"),
            TransportBody::Bytes(b) => write!(f, "Bytes({} bytes)", b.len()),
            TransportBody::Stream { content_length, .. } => {
                write!(f, "Stream({} bytes)", content_length)
            }
        }
    }
}

/// A fully signed request.
#[derive(Debug)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: TransportBody,
}

/// A response whose body has been read completely.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl HttpResponse {
    pub fn header_str(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// Executes one HTTP exchange. Implementations must not follow redirects.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, WosError>;
}

/// [`HttpTransport`] backed by a shared `reqwest::Client` connection pool.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
    idle_timeout: Duration,
}

impl ReqwestTransport {
    pub fn new(config: &ClientConfig) -> Result<Self, WosError> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(config.connect_timeout)
            .user_agent(config.user_agent.clone())
            .build()?;
        Ok(Self {
            client,
            idle_timeout: config.socket_timeout,
        })
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, WosError> {
        let last_progress = Arc::new(Mutex::new(Instant::now()));
        let mut builder = self
            .client
            .request(request.method, &request.url)
            .headers(request.headers);

        builder = match request.body {
            TransportBody::Empty => builder,
            TransportBody::Bytes(bytes) => builder.body(bytes),
            TransportBody::Stream {
                stream,
                content_length,
            } => {
                let progress = Arc::clone(&last_progress);
                let stream = stream.inspect(move |_| touch(&progress));
                builder
                    .header(CONTENT_LENGTH, HeaderValue::from(content_length))
                    .body(reqwest::Body::wrap_stream(stream))
            }
        };

        let response = idle_timeout(
            builder.send(),
            Arc::clone(&last_progress),
            self.idle_timeout,
        )
        .await??;

        let status = response.status();
        let headers = response.headers().clone();
        let mut body = BytesMut::new();
        let mut chunks = response.bytes_stream();
        loop {
            match tokio::time::timeout(self.idle_timeout, chunks.next()).await {
                Ok(Some(chunk)) => body.extend_from_slice(&chunk?),
                Ok(None) => break,
                Err(_) => {
                    return Err(WosError::Timeout(format!(
                        "no data received for {:?} while reading {}",
                        self.idle_timeout, request.url
                    )))
                }
            }
        }

        Ok(HttpResponse {
            status,
            headers,
            body: body.freeze(),
        })
    }
}

fn touch(progress: &Mutex<Instant>) {
    *progress.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
}

/// Awaits `future`, failing once `idle` passes without `last_progress` moving.
async fn idle_timeout<F: Future>(
    future: F,
    last_progress: Arc<Mutex<Instant>>,
    idle: Duration,
) -> Result<F::Output, WosError> {
    tokio::pin!(future);
    loop {
        let deadline = *last_progress.lock().unwrap_or_else(PoisonError::into_inner) + idle;
        tokio::select! {
            output = &mut future => return Ok(output),
            _ = tokio::time::sleep_until(deadline) => {
                let last = *last_progress.lock().unwrap_or_else(PoisonError::into_inner);
                if last + idle <= Instant::now() {
                    return Err(WosError::Timeout(format!("no progress for {:?}", idle)));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout_fires_without_progress() {
        let progress = Arc::new(Mutex::new(Instant::now()));
        let result = idle_timeout(
            tokio::time::sleep(Duration::from_secs(10)),
            progress,
            Duration::from_secs(1),
        )
        .await;
        assert!(matches!(result, Err(WosError::Timeout(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout_slides_with_progress() {
        let progress = Arc::new(Mutex::new(Instant::now()));
        let ticker = Arc::clone(&progress);
        let work = async move {
            for _ in 0..5 {
                tokio::time::sleep(Duration::from_millis(600)).await;
                touch(&ticker);
            }
            42
        };

        let result = idle_timeout(work, progress, Duration::from_secs(1)).await;
        assert_eq!(result.unwrap(), 42);
    }
}
