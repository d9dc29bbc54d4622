//! Client configuration and service limits.

use crate::auth::SignatureScheme;
use crate::error::WosError;
use reqwest::Url;
use std::time::Duration;

pub const DEFAULT_REGION: &str = "us-east-1";

/// Smallest part size accepted for multipart uploads (100 KiB).
pub const MIN_PART_SIZE: u64 = 100 * 1024;
/// Largest part size accepted for multipart uploads (5 GiB).
pub const MAX_PART_SIZE: u64 = 5 * 1024 * 1024 * 1024;
/// Part size used by downloads when none is given (9 MiB).
pub const DEFAULT_PART_SIZE: u64 = 9 * 1024 * 1024;
/// Highest part number the service accepts.
pub const MAX_PART_COUNT: u64 = 10_000;

pub const DEFAULT_MAX_RETRY_COUNT: usize = 3;
pub const DEFAULT_MAX_REDIRECT_COUNT: usize = 3;
/// Presigned URL lifetime when the caller gives none.
pub const DEFAULT_SIGNED_URL_EXPIRES: u64 = 300;

pub const UPLOAD_CHECKPOINT_SUFFIX: &str = ".uploadfile_record";
pub const DOWNLOAD_CHECKPOINT_SUFFIX: &str = ".downloadfile_record";

/// Configuration for a [`WosClient`](crate::WosClient).
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use wos_sdk::{ClientConfig, SignatureScheme};
///
/// let config = ClientConfig::new("https://wos.example.com")
///     .with_region("cn-east-1")
///     .with_signature(SignatureScheme::Wos)
///     .with_max_retry_count(5)
///     .with_socket_timeout(Duration::from_secs(30));
/// assert_eq!(config.region, "cn-east-1");
/// ```
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Service endpoint, e.g. `https://wos.example.com`. `https://` is assumed
    /// when no scheme is given.
    pub endpoint: String,
    pub region: String,
    pub signature: SignatureScheme,
    /// Address buckets as `host/bucket/key` instead of `bucket.host/key`.
    pub path_style: bool,
    /// Retries after the first attempt for repeatable requests.
    pub max_retry_count: usize,
    /// Redirects followed per request, across all attempts.
    pub max_redirect_count: usize,
    /// Base unit of the jittered backoff between retries (default: 1s).
    pub retry_backoff_unit: Duration,
    pub connect_timeout: Duration,
    /// Idle timeout, refreshed on every chunk read or written.
    pub socket_timeout: Duration,
    pub user_agent: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            region: DEFAULT_REGION.to_string(),
            signature: SignatureScheme::default(),
            path_style: false,
            max_retry_count: DEFAULT_MAX_RETRY_COUNT,
            max_redirect_count: DEFAULT_MAX_REDIRECT_COUNT,
            retry_backoff_unit: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(60),
            socket_timeout: Duration::from_secs(60),
            user_agent: format!("wos-sdk-rust/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl ClientConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            ..Default::default()
        }
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = region.into();
        self
    }

    pub fn with_signature(mut self, signature: SignatureScheme) -> Self {
        self.signature = signature;
        self
    }

    pub fn with_path_style(mut self, path_style: bool) -> Self {
        self.path_style = path_style;
        self
    }

    pub fn with_max_retry_count(mut self, count: usize) -> Self {
        self.max_retry_count = count;
        self
    }

    pub fn with_max_redirect_count(mut self, count: usize) -> Self {
        self.max_redirect_count = count;
        self
    }

    pub fn with_retry_backoff_unit(mut self, unit: Duration) -> Self {
        self.retry_backoff_unit = unit;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_socket_timeout(mut self, timeout: Duration) -> Self {
        self.socket_timeout = timeout;
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// Splits the endpoint into `(scheme, host[:port])`.
    pub(crate) fn endpoint_parts(&self) -> Result<(String, String), WosError> {
        let raw = self.endpoint.trim().trim_end_matches('/');
        if raw.is_empty() {
            return Err(WosError::validation("endpoint is not set"));
        }
        let with_scheme = if raw.contains("://") {
            raw.to_string()
        } else {
            format!("https://{}", raw)
        };

        let url = Url::parse(&with_scheme)
            .map_err(|e| WosError::InvalidUrl(format!("{}: {}", self.endpoint, e)))?;
        let host = url
            .host_str()
            .ok_or_else(|| WosError::InvalidUrl(format!("{}: missing host", self.endpoint)))?;
        let host = match url.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        };
        Ok((url.scheme().to_string(), host))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_parts() {
        let config = ClientConfig::new("wos.example.com");
        assert_eq!(
            config.endpoint_parts().unwrap(),
            ("https".to_string(), "wos.example.com".to_string())
        );

        let config = ClientConfig::new("http://127.0.0.1:9000/");
        assert_eq!(
            config.endpoint_parts().unwrap(),
            ("http".to_string(), "127.0.0.1:9000".to_string())
        );

        assert!(matches!(
            ClientConfig::default().endpoint_parts(),
            Err(WosError::Validation(_))
        ));
    }

    #[test]
    fn test_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.region, DEFAULT_REGION);
        assert_eq!(config.signature, SignatureScheme::V4);
        assert_eq!(config.max_retry_count, 3);
        assert!(!config.path_style);
    }
}
