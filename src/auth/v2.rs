//! Legacy HMAC-SHA1 signing (`Authorization: AWS ak:signature`).

use super::{parse_http_date, redact, RequestParts, SignatureScheme, RFC1123_FORMAT};
use crate::credentials::Credentials;
use crate::error::WosError;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha1::Sha1;
use std::collections::BTreeMap;
use tracing::debug;

type HmacSha1 = Hmac<Sha1>;

/// Query parameters that are part of the canonical resource.
const SUB_RESOURCES: &[&str] = &[
    "acl",
    "cors",
    "delete",
    "lifecycle",
    "location",
    "logging",
    "notification",
    "partNumber",
    "policy",
    "requestPayment",
    "response-cache-control",
    "response-content-disposition",
    "response-content-encoding",
    "response-content-language",
    "response-content-type",
    "response-expires",
    "tagging",
    "torrent",
    "uploadId",
    "uploads",
    "versionId",
    "versioning",
    "versions",
    "website",
];

pub(super) fn sign(
    parts: &mut RequestParts,
    credentials: &Credentials,
    now: DateTime<Utc>,
) -> Result<(), WosError> {
    let amz_date = parts
        .header_str(&SignatureScheme::V2.date_header())
        .map(str::to_string);
    let date = parts.header_str("date").map(str::to_string);

    // With x-amz-date present the Date line is left empty.
    let date_line = match (amz_date, date) {
        (Some(amz_date), _) => {
            parse_http_date(&amz_date)?;
            String::new()
        }
        (None, Some(date)) => {
            parse_http_date(&date)?;
            date
        }
        (None, None) => {
            let date = now.format(RFC1123_FORMAT).to_string();
            parts.set_header("date", &date)?;
            date
        }
    };

    let string_to_sign = string_to_sign(parts, &date_line, &BTreeMap::new());
    debug!(
        "V2 string to sign: {:?}",
        redact(&string_to_sign, credentials)
    );

    let signature = signature(&credentials.secret_key, &string_to_sign);
    parts.set_header(
        "authorization",
        &format!("AWS {}:{}", credentials.access_key, signature),
    )
}

pub(super) fn presign(
    parts: &mut RequestParts,
    credentials: &Credentials,
    now: DateTime<Utc>,
    expires_secs: u64,
) -> Result<(), WosError> {
    let expires_at = now.timestamp() + expires_secs as i64;

    let mut extra = BTreeMap::new();
    if let Some(token) = credentials.token() {
        let name = SignatureScheme::V2.security_token_header();
        extra.insert(name.clone(), token.to_string());
        parts.query.insert(name, token.to_string());
    }

    let string_to_sign = string_to_sign(parts, &expires_at.to_string(), &extra);
    debug!(
        "V2 presign string to sign: {:?}",
        redact(&string_to_sign, credentials)
    );
    let signature = signature(&credentials.secret_key, &string_to_sign);

    parts
        .query
        .insert("AWSAccessKeyId".to_string(), credentials.access_key.clone());
    parts
        .query
        .insert("Expires".to_string(), expires_at.to_string());
    parts.query.insert("Signature".to_string(), signature);
    Ok(())
}

/// `METHOD\nContent-MD5\nContent-Type\nDate\n<x-amz-* lines><resource>`
pub(crate) fn string_to_sign(
    parts: &RequestParts,
    date_line: &str,
    extra_headers: &BTreeMap<String, String>,
) -> String {
    let mut out = format!(
        "{}\n{}\n{}\n{}\n",
        parts.method,
        parts.header_str("content-md5").unwrap_or("").trim(),
        parts.header_str("content-type").unwrap_or("").trim(),
        date_line
    );

    let prefix = SignatureScheme::V2.header_prefix();
    let mut amz: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for name in parts.headers.keys() {
        let name = name.as_str();
        if !name.starts_with(prefix) {
            continue;
        }
        let values = parts
            .headers
            .get_all(name)
            .iter()
            .map(|v| String::from_utf8_lossy(v.as_bytes()).trim().to_string())
            .collect();
        amz.insert(name.to_string(), values);
    }
    for (name, value) in extra_headers {
        amz.entry(name.to_lowercase())
            .or_default()
            .push(value.trim().to_string());
    }
    for (name, values) in &amz {
        out.push_str(name);
        out.push(':');
        out.push_str(&values.join(","));
        out.push('\n');
    }

    out.push_str(&canonical_resource(parts));
    out
}

fn canonical_resource(parts: &RequestParts) -> String {
    let sub_resources: Vec<String> = parts
        .query
        .iter()
        .filter(|(k, _)| SUB_RESOURCES.contains(&k.as_str()))
        .map(|(k, v)| {
            if v.is_empty() {
                k.clone()
            } else {
                format!("{}={}", k, v)
            }
        })
        .collect();

    if sub_resources.is_empty() {
        parts.resource.clone()
    } else {
        format!("{}?{}", parts.resource, sub_resources.join("&"))
    }
}

pub(crate) fn signature(secret_key: &str, string_to_sign: &str) -> String {
    let mut mac =
        HmacSha1::new_from_slice(secret_key.as_bytes()).expect("HMAC can take key of any size");
    mac.update(string_to_sign.as_bytes());
    BASE64.encode(mac.finalize().into_bytes())
}
