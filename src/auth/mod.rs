//! Request signing for the V2, V4 and WOS signature schemes.
//!
//! The [`Signer`] mutates a [`RequestParts`] in place: it injects the headers
//! (or query parameters, for presigned URLs) a scheme requires and then attaches
//! the signature. It never performs I/O.

mod policy;
mod v2;
mod v4;

pub use policy::{BrowserSignature, BrowserSignatureInput};

use crate::credentials::Credentials;
use crate::error::WosError;
use chrono::{DateTime, NaiveDateTime, Utc};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, HOST};
use reqwest::Method;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use tracing::warn;

/// Payload hash sentinel used instead of hashing streamed bodies.
pub const UNSIGNED_PAYLOAD: &str = "UNSIGNED-PAYLOAD";

pub(crate) const LONG_DATE_FORMAT: &str = "%Y%m%dT%H%M%SZ";
pub(crate) const SHORT_DATE_FORMAT: &str = "%Y%m%d";
pub(crate) const RFC1123_FORMAT: &str = "%a, %d %b %Y %H:%M:%S GMT";

pub(crate) const REDACTED: &str = "******";

/// Signature algorithm selected once per client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum SignatureScheme {
    /// Legacy HMAC-SHA1 signing.
    V2,
    /// AWS style HMAC-SHA256 signing.
    #[default]
    V4,
    /// The vendor variant of V4 with `WOS4`/`x-wos-` names.
    Wos,
}

impl SignatureScheme {
    /// Prefix of custom headers: `x-amz-` or `x-wos-`.
    pub fn header_prefix(self) -> &'static str {
        match self {
            SignatureScheme::V2 | SignatureScheme::V4 => "x-amz-",
            SignatureScheme::Wos => "x-wos-",
        }
    }

    /// Full name of a prefixed header, e.g. `header("date")` is `x-amz-date`.
    pub fn header(self, suffix: &str) -> String {
        format!("{}{}", self.header_prefix(), suffix)
    }

    pub fn date_header(self) -> String {
        self.header("date")
    }

    pub fn content_sha256_header(self) -> String {
        self.header("content-sha256")
    }

    pub fn security_token_header(self) -> String {
        self.header("security-token")
    }

    pub fn request_id_header(self) -> String {
        self.header("request-id")
    }

    pub(crate) fn algorithm(self) -> &'static str {
        match self {
            SignatureScheme::Wos => "WOS4-HMAC-SHA256",
            _ => "AWS4-HMAC-SHA256",
        }
    }

    pub(crate) fn key_prefix(self) -> &'static str {
        match self {
            SignatureScheme::Wos => "WOS4",
            _ => "AWS4",
        }
    }

    pub(crate) fn service(self) -> &'static str {
        match self {
            SignatureScheme::Wos => "wos",
            _ => "s3",
        }
    }

    pub(crate) fn terminator(self) -> &'static str {
        match self {
            SignatureScheme::Wos => "wos4_request",
            _ => "aws4_request",
        }
    }

    /// Prefix of presigned query parameters: `X-Amz-` or `X-Wos-`.
    pub(crate) fn query_prefix(self) -> &'static str {
        match self {
            SignatureScheme::Wos => "X-Wos-",
            _ => "X-Amz-",
        }
    }

    /// Vendor tag used inside some header names, e.g. `...-aws-kms-key-id`.
    pub(crate) fn vendor(self) -> &'static str {
        match self {
            SignatureScheme::Wos => "wos",
            _ => "aws",
        }
    }
}

impl fmt::Display for SignatureScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SignatureScheme::V2 => "v2",
            SignatureScheme::V4 => "v4",
            SignatureScheme::Wos => "wos",
        };
        f.write_str(name)
    }
}

impl FromStr for SignatureScheme {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "v2" => Ok(SignatureScheme::V2),
            "v4" => Ok(SignatureScheme::V4),
            "wos" | "wos4" => Ok(SignatureScheme::Wos),
            other => Err(format!("unknown signature scheme '{}', expected v2, v4 or wos", other)),
        }
    }
}

/// Everything a signature is computed over, built fresh for each attempt.
#[derive(Debug, Clone)]
pub struct RequestParts {
    pub method: Method,
    /// Host the request is sent to, possibly with a port.
    pub host: String,
    /// Percent-encoded path, starting with `/`.
    pub path: String,
    /// V2 canonical resource without sub-resources, e.g. `/bucket/key`.
    pub resource: String,
    /// Raw (unencoded) query parameters. An empty value renders as a bare key.
    pub query: BTreeMap<String, String>,
    pub headers: HeaderMap,
}

impl RequestParts {
    /// Renders the full request URL.
    pub fn url(&self, scheme: &str) -> String {
        let mut url = format!("{}://{}{}", scheme, self.host, self.path);
        if !self.query.is_empty() {
            url.push('?');
            url.push_str(&encode_query(&self.query));
        }
        url
    }

    pub(crate) fn header_str(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub(crate) fn set_header(&mut self, name: &str, value: &str) -> Result<(), WosError> {
        insert_header(&mut self.headers, name, value)
    }
}

/// Computes header- and query-based signatures for one scheme and region.
#[derive(Debug, Clone)]
pub struct Signer {
    scheme: SignatureScheme,
    region: String,
}

impl Signer {
    pub fn new(scheme: SignatureScheme, region: impl Into<String>) -> Self {
        Self {
            scheme,
            region: region.into(),
        }
    }

    pub fn scheme(&self) -> SignatureScheme {
        self.scheme
    }

    /// Signs `parts` by attaching an `Authorization` header.
    ///
    /// Injects `Host`, the scheme's date header (when absent), the payload hash
    /// header and the security token header before signing. Anonymous
    /// credentials leave the request unsigned.
    ///
    /// # Errors
    ///
    /// Returns [`WosError::DateParse`] when the caller supplied a date header
    /// that cannot be parsed.
    pub fn sign(
        &self,
        parts: &mut RequestParts,
        credentials: &Credentials,
        now: DateTime<Utc>,
    ) -> Result<(), WosError> {
        if credentials.is_anonymous() {
            warn!(
                "No credentials configured, sending anonymous {} request to {}",
                parts.method, parts.host
            );
            return Ok(());
        }

        let host = strip_default_port(&parts.host).to_string();
        parts.set_header(HOST.as_str(), &host)?;
        if let Some(token) = credentials.token() {
            let header = self.scheme.security_token_header();
            parts.set_header(&header, token)?;
        }

        match self.scheme {
            SignatureScheme::V2 => v2::sign(parts, credentials, now),
            scheme => v4::sign(scheme, &self.region, parts, credentials, now),
        }
    }

    /// Signs `parts` through query parameters so the resulting URL can be
    /// used without further authentication until `expires_secs` after `now`.
    pub fn presign(
        &self,
        parts: &mut RequestParts,
        credentials: &Credentials,
        now: DateTime<Utc>,
        expires_secs: u64,
    ) -> Result<(), WosError> {
        if credentials.is_anonymous() {
            warn!("No credentials configured, creating an unsigned url for {}", parts.host);
            return Ok(());
        }

        let host = strip_default_port(&parts.host).to_string();
        parts.set_header(HOST.as_str(), &host)?;

        match self.scheme {
            SignatureScheme::V2 => v2::presign(parts, credentials, now, expires_secs),
            scheme => v4::presign(scheme, &self.region, parts, credentials, now, expires_secs),
        }
    }

    /// Builds and signs the POST policy for a browser form upload.
    pub fn browser_signature(
        &self,
        input: &BrowserSignatureInput,
        credentials: &Credentials,
        now: DateTime<Utc>,
    ) -> Result<BrowserSignature, WosError> {
        policy::browser_signature(self.scheme, &self.region, input, credentials, now)
    }
}

/// Drops `:80` and `:443`, which clients never send in `Host`.
pub(crate) fn strip_default_port(host: &str) -> &str {
    host.strip_suffix(":80")
        .or_else(|| host.strip_suffix(":443"))
        .unwrap_or(host)
}

pub(crate) fn insert_header(
    headers: &mut HeaderMap,
    name: &str,
    value: &str,
) -> Result<(), WosError> {
    let name = HeaderName::from_bytes(name.as_bytes())
        .map_err(|e| WosError::validation(format!("invalid header name '{}': {}", name, e)))?;
    let value = HeaderValue::from_str(value)
        .map_err(|e| WosError::validation(format!("invalid value for header '{}': {}", name, e)))?;
    headers.insert(name, value);
    Ok(())
}

/// RFC 3986 query rendering used both on the wire and in canonical requests.
pub(crate) fn encode_query(query: &BTreeMap<String, String>) -> String {
    encoded_pairs(query)
        .into_iter()
        .map(|(k, v)| if v.is_empty() { k } else { format!("{}={}", k, v) })
        .collect::<Vec<_>>()
        .join("&")
}

/// Query pairs percent-encoded and sorted by encoded key, then value.
pub(crate) fn encoded_pairs(query: &BTreeMap<String, String>) -> Vec<(String, String)> {
    let mut pairs: Vec<(String, String)> = query
        .iter()
        .map(|(k, v)| {
            (
                urlencoding::encode(k).into_owned(),
                urlencoding::encode(v).into_owned(),
            )
        })
        .collect();
    pairs.sort();
    pairs
}

/// Percent-encodes an object key segment by segment, keeping `/`.
pub(crate) fn encode_key(key: &str) -> String {
    key.split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

/// Replaces the session token with a placeholder before text is logged.
pub(crate) fn redact(text: &str, credentials: &Credentials) -> String {
    match credentials.token() {
        Some(token) => text.replace(token, REDACTED),
        None => text.to_string(),
    }
}

/// Parses a `Date` header value in RFC 1123 or RFC 2822 form.
pub(crate) fn parse_http_date(value: &str) -> Result<DateTime<Utc>, WosError> {
    if let Ok(date) = DateTime::parse_from_rfc2822(value) {
        return Ok(date.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(value, RFC1123_FORMAT)
        .map(|naive| naive.and_utc())
        .map_err(|e| WosError::DateParse(format!("'{}': {}", value, e)))
}

/// Parses an `x-amz-date` style value (`20130524T000000Z`).
pub(crate) fn parse_long_date(value: &str) -> Result<DateTime<Utc>, WosError> {
    NaiveDateTime::parse_from_str(value, LONG_DATE_FORMAT)
        .map(|naive| naive.and_utc())
        .map_err(|e| WosError::DateParse(format!("'{}': {}", value, e)))
}
