//! POST policy signatures for browser form uploads.

use super::{v2, v4, SignatureScheme, LONG_DATE_FORMAT};
use crate::config::DEFAULT_SIGNED_URL_EXPIRES;
use crate::credentials::Credentials;
use crate::error::WosError;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

const EXPIRATION_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// What a browser form is allowed to upload.
#[derive(Debug, Clone, Default)]
pub struct BrowserSignatureInput {
    /// Empty allows any bucket.
    pub bucket: String,
    /// Empty allows any key.
    pub key: String,
    /// Lifetime in seconds; `0` means the default of 300.
    pub expires: u64,
    /// Extra form fields pinned by the policy, e.g. `acl` or `content-type`.
    pub form_params: BTreeMap<String, String>,
}

/// Form fields a browser posts alongside the file.
///
/// `algorithm`, `credential` and `date` are empty for V2 signatures.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BrowserSignature {
    /// The policy document as JSON.
    pub origin_policy: String,
    /// Base64 of `origin_policy`, posted as the `policy` field.
    pub policy: String,
    pub algorithm: String,
    pub credential: String,
    pub date: String,
    pub signature: String,
}

#[derive(Serialize)]
struct PolicyDocument {
    expiration: String,
    conditions: Vec<Value>,
}

pub(super) fn browser_signature(
    scheme: SignatureScheme,
    region: &str,
    input: &BrowserSignatureInput,
    credentials: &Credentials,
    now: DateTime<Utc>,
) -> Result<BrowserSignature, WosError> {
    if credentials.is_anonymous() {
        return Err(WosError::validation(
            "a browser-based signature needs credentials",
        ));
    }
    let expires = if input.expires == 0 {
        DEFAULT_SIGNED_URL_EXPIRES
    } else {
        input.expires
    };
    let expires = i64::try_from(expires)
        .map_err(|_| WosError::validation(format!("expiry of {} seconds is too long", expires)))?;

    let mut fields: BTreeMap<String, String> = input
        .form_params
        .iter()
        .filter_map(|(name, value)| {
            let name = name.trim().to_lowercase();
            (!name.is_empty()).then(|| (name, value.clone()))
        })
        .collect();

    let mut signed = BrowserSignature::default();
    if scheme != SignatureScheme::V2 {
        let prefix = scheme.query_prefix().to_lowercase();
        signed.algorithm = scheme.algorithm().to_string();
        signed.credential = format!(
            "{}/{}",
            credentials.access_key,
            v4::scope(scheme, region, now)
        );
        signed.date = now.format(LONG_DATE_FORMAT).to_string();
        fields.insert(format!("{}algorithm", prefix), signed.algorithm.clone());
        fields.insert(format!("{}credential", prefix), signed.credential.clone());
        fields.insert(format!("{}date", prefix), signed.date.clone());
    }
    if let Some(token) = credentials.token() {
        fields.insert(scheme.security_token_header(), token.to_string());
    }

    let bucket = input.bucket.trim();
    let key = input.key.trim();
    if !bucket.is_empty() {
        fields.insert("bucket".to_string(), bucket.to_string());
    }
    if !key.is_empty() {
        fields.insert("key".to_string(), key.to_string());
    }

    let mut conditions: Vec<Value> = fields
        .into_iter()
        .map(|(name, value)| {
            let mut field = Map::new();
            field.insert(name, Value::String(value));
            Value::Object(field)
        })
        .collect();
    if bucket.is_empty() {
        conditions.push(starts_with("$bucket"));
    }
    if key.is_empty() {
        conditions.push(starts_with("$key"));
    }

    let document = PolicyDocument {
        expiration: (now + Duration::seconds(expires))
            .format(EXPIRATION_FORMAT)
            .to_string(),
        conditions,
    };
    signed.origin_policy = serde_json::to_string(&document)?;
    signed.policy = BASE64.encode(signed.origin_policy.as_bytes());
    signed.signature = match scheme {
        SignatureScheme::V2 => v2::signature(&credentials.secret_key, &signed.policy),
        scheme => v4::signature(scheme, &credentials.secret_key, now, region, &signed.policy),
    };
    Ok(signed)
}

fn starts_with(field: &str) -> Value {
    Value::Array(vec![
        Value::from("starts-with"),
        Value::from(field),
        Value::from(""),
    ])
}
