//! Object URL construction and parsing
//!
//! Two addressing styles are supported:
//!
//! | Style | URL |
//! |-------|-----|
//! | path-style | `{scheme}://{host}/{bucket}/{key}` |
//! | virtual-hosted | `{scheme}://{bucket}.{host}/{key}` |

use super::S3ClientError;
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use reqwest::Url;

/// Like the query set, but `/` stays literal so keys keep their hierarchy.
const KEY_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~')
    .remove(b'/');

/// Components recovered from an object URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct S3Location {
    pub bucket: String,
    pub key: String,
    /// `{scheme}://{host}[:{port}]` without the bucket
    pub endpoint: String,
    pub path_style: bool,
}

/// Percent-encode an object key, keeping `/` separators
pub fn encode_key(key: &str) -> String {
    utf8_percent_encode(key, KEY_ENCODE_SET).to_string()
}

/// Check that `key` names an object and survives URL parsing unchanged
///
/// URL parsers collapse `.` and `..` segments (encoded or not), so such keys
/// are rejected instead of being silently rewritten.
pub fn validate_key(key: &str) -> Result<(), S3ClientError> {
    let key = key.trim_start_matches('/');
    if key.is_empty() {
        return Err(S3ClientError::ConfigError("object key is empty".into()));
    }
    if key.split('/').any(|segment| segment == "." || segment == "..") {
        return Err(S3ClientError::ConfigError(format!(
            "object key contains a dot segment: {}",
            key
        )));
    }
    Ok(())
}

/// Build the URL addressing `key` in `bucket`
///
/// An empty key addresses the bucket itself (used by list and batch delete).
/// Any other key must pass [`validate_key`].
pub fn build_s3_url(
    bucket: &str,
    key: &str,
    endpoint: &str,
    path_style: bool,
) -> Result<Url, S3ClientError> {
    if bucket.is_empty() {
        return Err(S3ClientError::ConfigError("bucket is empty".into()));
    }

    let base = Url::parse(endpoint)
        .map_err(|e| S3ClientError::ConfigError(format!("invalid endpoint {}: {}", endpoint, e)))?;
    let host = base
        .host_str()
        .ok_or_else(|| S3ClientError::ConfigError(format!("endpoint has no host: {}", endpoint)))?;
    let authority = match base.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    };

    let key = key.trim_start_matches('/');
    if !key.is_empty() {
        validate_key(key)?;
    }
    let key = encode_key(key);
    let raw = if path_style {
        format!("{}://{}/{}/{}", base.scheme(), authority, bucket, key)
    } else {
        format!("{}://{}.{}/{}", base.scheme(), bucket, authority, key)
    };

    Url::parse(&raw).map_err(|e| S3ClientError::ConfigError(format!("invalid object URL: {}", e)))
}

/// Parse an object URL, detecting the addressing style from the host
///
/// A host whose second label is an S3 service label (`s3`, `s3-*`,
/// `s3.*`) is treated as virtual-hosted; anything else as path-style.
pub fn parse_s3_url(url: &str) -> Result<S3Location, S3ClientError> {
    let parsed = parse(url)?;
    let host = parsed.host_str().unwrap_or_default();
    let labels: Vec<&str> = host.split('.').collect();
    let virtual_hosted = parsed.domain().is_some()
        && labels.len() > 2
        && !is_service_label(labels[0])
        && is_service_label(labels[1]);

    parse_s3_url_with_style(url, !virtual_hosted)
}

/// Parse an object URL using a known addressing style
pub fn parse_s3_url_with_style(url: &str, path_style: bool) -> Result<S3Location, S3ClientError> {
    let parsed = parse(url)?;
    let host = parsed
        .host_str()
        .ok_or_else(|| S3ClientError::ConfigError(format!("URL has no host: {}", url)))?;
    let port = parsed.port().map(|p| format!(":{}", p)).unwrap_or_default();
    let path = parsed.path().trim_start_matches('/');

    let (bucket, endpoint_host, raw_key) = if path_style {
        let (bucket, key) = path.split_once('/').unwrap_or((path, ""));
        (bucket.to_string(), host.to_string(), key)
    } else {
        let (bucket, rest) = host
            .split_once('.')
            .ok_or_else(|| S3ClientError::ConfigError(format!("no bucket in host: {}", host)))?;
        (bucket.to_string(), rest.to_string(), path)
    };

    if bucket.is_empty() {
        return Err(S3ClientError::ConfigError(format!("no bucket in URL: {}", url)));
    }

    let key = percent_decode_str(raw_key)
        .decode_utf8()
        .map_err(|e| S3ClientError::ConfigError(format!("invalid key encoding: {}", e)))?
        .into_owned();

    Ok(S3Location {
        bucket,
        key,
        endpoint: format!("{}://{}{}", parsed.scheme(), endpoint_host, port),
        path_style,
    })
}

fn parse(url: &str) -> Result<Url, S3ClientError> {
    Url::parse(url).map_err(|e| S3ClientError::ConfigError(format!("invalid URL {}: {}", url, e)))
}

fn is_service_label(label: &str) -> bool {
    label == "s3" || label.starts_with("s3-")
}
