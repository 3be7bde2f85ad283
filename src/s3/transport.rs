//! HTTP transport
//!
//! Executes exactly one request and returns status, headers and body. Retry
//! policy does not live here; only the multipart orchestrator knows which
//! requests are safe to repeat.

use super::{xml, S3ClientError};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Method, Url};
use std::collections::BTreeMap;
use std::time::Duration;

/// Outgoing request, already signed
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: Url,
    pub headers: BTreeMap<String, String>,
    pub body: Bytes,
}

/// Response with lower-cased header names
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: Bytes,
}

impl HttpResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_lowercase()).map(String::as_str)
    }

    /// ETag header, verbatim (quotes included)
    pub fn etag(&self) -> Option<&str> {
        self.header("etag")
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Sends one HTTP request
///
/// Implemented over reqwest for production; tests can substitute their own.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, S3ClientError>;
}

/// Per-request timeouts
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub timeout: Duration,
    pub connect_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(300),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// reqwest-backed transport
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    http_client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(config: &TransportConfig) -> Result<Self, S3ClientError> {
        let http_client = reqwest::Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| S3ClientError::ConfigError(e.to_string()))?;

        Ok(Self { http_client })
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, S3ClientError> {
        let mut builder = self.http_client.request(request.method, request.url);
        for (name, value) in &request.headers {
            // reqwest derives Host from the URL
            if name == "host" {
                continue;
            }
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder
            .body(request.body)
            .send()
            .await
            .map_err(|e| S3ClientError::TransportError(e.to_string()))?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_lowercase(), v.to_string()))
            })
            .collect();
        let body = response
            .bytes()
            .await
            .map_err(|e| S3ClientError::TransportError(e.to_string()))?;

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

/// Turn a non-2xx response into a typed error
///
/// An S3 `<Error>` document becomes a `ProviderError`; anything else
/// becomes an `HttpStatusError` carrying the raw body.
pub fn check_status(response: HttpResponse) -> Result<HttpResponse, S3ClientError> {
    if response.is_success() {
        return Ok(response);
    }

    let body = response.body_text();
    match xml::parse_error(&body, response.status) {
        Some(mut error) => {
            if error.request_id.is_none() {
                error.request_id = response.header("x-amz-request-id").map(str::to_string);
            }
            Err(S3ClientError::ProviderError(error))
        }
        None => Err(S3ClientError::HttpStatusError {
            status: response.status,
            body,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(status: u16, body: &str) -> HttpResponse {
        HttpResponse {
            status,
            headers: BTreeMap::from([("x-amz-request-id".to_string(), "REQ1".to_string())]),
            body: Bytes::from(body.to_string()),
        }
    }

    #[test]
    fn test_success_passes_through() {
        assert!(check_status(response(204, "")).is_ok());
    }

    #[test]
    fn test_error_document_becomes_provider_error() {
        let body = "<Error><Code>AccessDenied</Code><Message>Access Denied</Message></Error>";
        match check_status(response(403, body)) {
            Err(S3ClientError::ProviderError(error)) => {
                assert_eq!(error.code, "AccessDenied");
                assert_eq!(error.status, 403);
                assert_eq!(error.request_id.as_deref(), Some("REQ1"));
            }
            other => panic!("expected provider error, got {:?}", other),
        }
    }

    #[test]
    fn test_plain_body_becomes_status_error() {
        match check_status(response(502, "Bad Gateway")) {
            Err(S3ClientError::HttpStatusError { status, body }) => {
                assert_eq!(status, 502);
                assert_eq!(body, "Bad Gateway");
            }
            other => panic!("expected status error, got {:?}", other),
        }
    }

    #[test]
    fn test_header_lookup_is_case_insensitive() {
        let mut resp = response(200, "");
        resp.headers.insert("etag".into(), "\"abc\"".into());
        assert_eq!(resp.etag(), Some("\"abc\""));
        assert_eq!(resp.header("ETag"), Some("\"abc\""));
    }
}
