//! HMAC-SHA256 signing shared by the V4 and WOS schemes.
//!
//! Both schemes use the same canonical request and key derivation; they only
//! differ in algorithm tag, key prefix, service name, scope terminator and the
//! header/query prefixes returned by [`SignatureScheme`].

use super::{
    encoded_pairs, parse_long_date, redact, RequestParts, SignatureScheme, LONG_DATE_FORMAT,
    SHORT_DATE_FORMAT, UNSIGNED_PAYLOAD,
};
use crate::credentials::Credentials;
use crate::error::WosError;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::header::HeaderMap;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use tracing::debug;

type HmacSha256 = Hmac<Sha256>;

pub(super) fn sign(
    scheme: SignatureScheme,
    region: &str,
    parts: &mut RequestParts,
    credentials: &Credentials,
    now: DateTime<Utc>,
) -> Result<(), WosError> {
    let date_header = scheme.date_header();
    let signing_time = match parts.header_str(&date_header).map(str::to_string) {
        Some(value) => parse_long_date(&value)?,
        None => {
            parts.set_header(&date_header, &now.format(LONG_DATE_FORMAT).to_string())?;
            now
        }
    };

    let sha_header = scheme.content_sha256_header();
    let payload_hash = match parts.header_str(&sha_header).map(str::to_string) {
        Some(hash) => hash,
        None => {
            parts.set_header(&sha_header, UNSIGNED_PAYLOAD)?;
            UNSIGNED_PAYLOAD.to_string()
        }
    };

    let (canonical_headers, signed_headers) = canonical_headers(&parts.headers);
    let canonical = canonical_request(parts, &canonical_headers, &signed_headers, &payload_hash);
    let scope = scope(scheme, region, signing_time);
    let string_to_sign = string_to_sign(scheme, signing_time, &scope, &canonical);
    debug!(
        "{} canonical request: {:?}, string to sign: {:?}",
        scheme.algorithm(),
        redact(&canonical, credentials),
        string_to_sign
    );

    let signature = signature(
        scheme,
        &credentials.secret_key,
        signing_time,
        region,
        &string_to_sign,
    );
    parts.set_header(
        "authorization",
        &format!(
            "{} Credential={}/{},SignedHeaders={},Signature={}",
            scheme.algorithm(),
            credentials.access_key,
            scope,
            signed_headers,
            signature
        ),
    )
}

pub(super) fn presign(
    scheme: SignatureScheme,
    region: &str,
    parts: &mut RequestParts,
    credentials: &Credentials,
    now: DateTime<Utc>,
    expires_secs: u64,
) -> Result<(), WosError> {
    let prefix = scheme.query_prefix();
    let scope = scope(scheme, region, now);
    let (canonical_headers, signed_headers) = canonical_headers(&parts.headers);

    let mut params = vec![
        ("Algorithm", scheme.algorithm().to_string()),
        ("Credential", format!("{}/{}", credentials.access_key, scope)),
        ("Date", now.format(LONG_DATE_FORMAT).to_string()),
        ("Expires", expires_secs.to_string()),
        ("SignedHeaders", signed_headers.clone()),
    ];
    if let Some(token) = credentials.token() {
        params.push(("Security-Token", token.to_string()));
    }
    for (name, value) in params {
        parts.query.insert(format!("{}{}", prefix, name), value);
    }

    let canonical = canonical_request(parts, &canonical_headers, &signed_headers, UNSIGNED_PAYLOAD);
    let string_to_sign = string_to_sign(scheme, now, &scope, &canonical);
    debug!(
        "{} presign canonical request: {:?}",
        scheme.algorithm(),
        redact(&canonical, credentials)
    );

    let signature = signature(scheme, &credentials.secret_key, now, region, &string_to_sign);
    parts
        .query
        .insert(format!("{}Signature", prefix), signature);
    Ok(())
}

/// Returns `(canonical header block, signed header list)`.
///
/// Every header except `authorization` is signed. Names are lower-case,
/// values are trimmed with inner whitespace collapsed, repeated values are
/// comma-joined.
fn canonical_headers(headers: &HeaderMap) -> (String, String) {
    let mut canonical: BTreeMap<&str, String> = BTreeMap::new();
    for name in headers.keys() {
        if name.as_str() == "authorization" {
            continue;
        }
        let value = headers
            .get_all(name)
            .iter()
            .map(|v| {
                String::from_utf8_lossy(v.as_bytes())
                    .split_whitespace()
                    .collect::<Vec<_>>()
                    .join(" ")
            })
            .collect::<Vec<_>>()
            .join(",");
        canonical.insert(name.as_str(), value);
    }

    let block = canonical
        .iter()
        .map(|(k, v)| format!("{}:{}\n", k, v))
        .collect::<String>();
    let signed = canonical.keys().copied().collect::<Vec<_>>().join(";");
    (block, signed)
}

fn canonical_request(
    parts: &RequestParts,
    canonical_headers: &str,
    signed_headers: &str,
    payload_hash: &str,
) -> String {
    let query = encoded_pairs(&parts.query)
        .into_iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&");

    format!(
        "{}\n{}\n{}\n{}\n{}\n{}",
        parts.method, parts.path, query, canonical_headers, signed_headers, payload_hash
    )
}

pub(super) fn scope(scheme: SignatureScheme, region: &str, time: DateTime<Utc>) -> String {
    format!(
        "{}/{}/{}/{}",
        time.format(SHORT_DATE_FORMAT),
        region,
        scheme.service(),
        scheme.terminator()
    )
}

fn string_to_sign(
    scheme: SignatureScheme,
    time: DateTime<Utc>,
    scope: &str,
    canonical_request: &str,
) -> String {
    format!(
        "{}\n{}\n{}\n{}",
        scheme.algorithm(),
        time.format(LONG_DATE_FORMAT),
        scope,
        hex::encode(Sha256::digest(canonical_request.as_bytes()))
    )
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

pub(super) fn signature(
    scheme: SignatureScheme,
    secret_key: &str,
    time: DateTime<Utc>,
    region: &str,
    string_to_sign: &str,
) -> String {
    let short_date = time.format(SHORT_DATE_FORMAT).to_string();
    let k_date = hmac_sha256(
        format!("{}{}", scheme.key_prefix(), secret_key).as_bytes(),
        short_date.as_bytes(),
    );
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, scheme.service().as_bytes());
    let k_signing = hmac_sha256(&k_service, scheme.terminator().as_bytes());
    hex::encode(hmac_sha256(&k_signing, string_to_sign.as_bytes()))
}
