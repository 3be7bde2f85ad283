//! PutObject handler
//!
//! Handles simple object uploads (payloads up to one part size).
//!
//! # Example
//!
//! ```no_run
//! use mizuchi_storage::s3::{Credentials, S3Client, StorageCredential};
//! use mizuchi_storage::upload::{PutObjectHandler, UploadHandler, UploadOptions, UploadTarget};
//! use bytes::Bytes;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let credential = StorageCredential::new(Credentials::direct("key", "secret"), "my-bucket", "us-east-1");
//! let handler = PutObjectHandler::with_client(Arc::new(S3Client::new(credential)?));
//!
//! let target = UploadTarget::new("hello.txt", Bytes::from("Hello, World!"));
//! let result = handler.upload("hello.txt", &target, &UploadOptions::default()).await?;
//! println!("Uploaded with ETag: {}", result.etag);
//! # Ok(())
//! # }
//! ```

use super::{UploadError, UploadHandler, UploadOptions, UploadProgress, UploadResult, UploadSource, UploadTarget};
use crate::metrics;
use crate::s3::{
    HttpRequest, Platform, PutObjectOptions, S3Client, Transport, MAX_SINGLE_PUT_SIZE,
};
use async_trait::async_trait;
use reqwest::{Method, Url};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

fn check_single_put_size(size: u64) -> Result<(), UploadError> {
    if size > MAX_SINGLE_PUT_SIZE {
        return Err(UploadError::ObjectTooLarge {
            size,
            maximum: MAX_SINGLE_PUT_SIZE,
        });
    }
    Ok(())
}

/// Simple upload handler
///
/// One signed PUT with the whole body.
pub struct PutObjectHandler {
    client: Arc<S3Client>,
}

impl PutObjectHandler {
    pub fn with_client(client: Arc<S3Client>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl UploadHandler for PutObjectHandler {
    #[tracing::instrument(
        name = "upload.put_object",
        skip(self, target, options),
        fields(
            s3.bucket = %self.client.bucket(),
            s3.key = %key,
            upload.bytes = tracing::field::Empty,
            s3.etag = tracing::field::Empty
        ),
        err
    )]
    async fn upload(
        &self,
        key: &str,
        target: &UploadTarget,
        options: &UploadOptions,
    ) -> Result<UploadResult, UploadError> {
        let bucket = self.client.bucket().to_string();
        let size = target.resolve_size().await?;
        check_single_put_size(size)?;
        tracing::Span::current().record("upload.bytes", size);

        let body = target.source.read_all().await?;
        let put_options = PutObjectOptions {
            content_type: Some(target.content_type()),
            headers: options.headers.clone(),
            signing: target.source.payload_signing(),
        };

        let start_time = Instant::now();
        let upload_result = self.client.put_object_with(key, body, &put_options).await;

        let duration = start_time.elapsed();

        match upload_result {
            Ok(response) => {
                metrics::record_upload(&bucket, "simple", duration.as_secs_f64(), Ok(size));
                options.report(&UploadProgress::new(size, size, None));

                tracing::Span::current().record("s3.etag", response.etag.as_str());
                tracing::info!(
                    etag = %response.etag,
                    bytes_written = size,
                    duration_ms = duration.as_millis(),
                    "PutObject upload completed"
                );

                Ok(UploadResult {
                    platform: self.client.platform(),
                    key: key.to_string(),
                    etag: response.etag,
                    version_id: response.version_id,
                    location: None,
                    bytes_written: size,
                    parts: 0,
                })
            }
            Err(e) => {
                metrics::record_upload(&bucket, "simple", duration.as_secs_f64(), Err(e.kind()));

                tracing::error!(
                    error = %e,
                    duration_ms = duration.as_millis(),
                    "PutObject upload failed"
                );

                Err(e.into())
            }
        }
    }
}

/// Upload through a URL someone else signed
///
/// The body goes out as-is with the given headers; no credentials are
/// needed on this side.
#[derive(Debug, Clone)]
pub struct PresignedUpload {
    pub url: Url,
    /// PUT or POST
    pub method: Method,
    pub headers: BTreeMap<String, String>,
    pub key: String,
}

impl PresignedUpload {
    /// Presigned PUT for `key` on the client's bucket
    pub fn for_client(client: &S3Client, key: &str, expires_in: u64) -> Result<Self, UploadError> {
        let url = client.presign_url(Method::PUT, key, expires_in)?;
        let url = Url::parse(&url)
            .map_err(|e| UploadError::InvalidOptions(format!("invalid presigned URL: {}", e)))?;
        Ok(Self {
            url,
            method: Method::PUT,
            headers: BTreeMap::new(),
            key: key.to_string(),
        })
    }

    #[tracing::instrument(
        name = "upload.presigned",
        skip(self, transport, source),
        fields(upload.key = %self.key, http.method = %self.method),
        err
    )]
    pub async fn upload(
        &self,
        transport: &dyn Transport,
        source: &UploadSource,
        content_type: Option<&str>,
    ) -> Result<UploadResult, UploadError> {
        if self.method != Method::PUT && self.method != Method::POST {
            return Err(UploadError::InvalidOptions(format!(
                "presigned uploads use PUT or POST, not {}",
                self.method
            )));
        }

        let size = source.len().await?;
        check_single_put_size(size)?;
        let body = source.read_all().await?;

        let mut headers = self.headers.clone();
        if !headers.keys().any(|name| name.eq_ignore_ascii_case("content-type")) {
            let content_type = content_type
                .map(str::to_string)
                .unwrap_or_else(|| super::source::guess_content_type(&self.key));
            headers.insert("content-type".to_string(), content_type);
        }

        let response = transport
            .send(HttpRequest {
                method: self.method.clone(),
                url: self.url.clone(),
                headers,
                body,
            })
            .await
            .and_then(crate::s3::transport::check_status)?;

        tracing::info!(bytes_written = size, status = response.status, "Presigned upload completed");

        Ok(UploadResult {
            platform: Platform::default(),
            key: self.key.clone(),
            etag: response.etag().unwrap_or_default().to_string(),
            version_id: response.header("x-amz-version-id").map(str::to_string),
            location: Some(self.url.as_str().split('?').next().unwrap_or_default().to_string()),
            bytes_written: size,
            parts: 0,
        })
    }
}
