//! Upload module
//!
//! Chooses between a single PUT and a multipart upload and drives either to
//! completion.
//!
//! # Example
//!
//! ```no_run
//! use mizuchi_storage::s3::{Credentials, S3Client, StorageCredential};
//! use mizuchi_storage::upload::{UploadOptions, UploadSource, UploadTarget, Uploader};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let credential = StorageCredential::new(Credentials::direct("key", "secret"), "uploads", "us-east-1")
//!     .with_endpoint("http://localhost:9000")
//!     .with_path_style(true);
//! let uploader = Uploader::new(Arc::new(S3Client::new(credential)?));
//!
//! let target = UploadTarget::new("videos/big.mp4", UploadSource::file("/tmp/big.mp4"));
//! let result = uploader.upload(target, &UploadOptions::default()).await?;
//! println!("{} -> {}", result.key, result.etag);
//! # Ok(())
//! # }
//! ```

use crate::config::UploadConfig;
use crate::s3::{ErrorKind, Platform, S3Client, S3ClientError};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub mod multipart;
pub mod put_object;
pub mod retry;
pub mod source;
pub mod strategy;

pub use multipart::{Checkpoint, CheckpointStore, MultipartHandler, PartDescriptor, SessionState};
pub use put_object::{PresignedUpload, PutObjectHandler};
pub use retry::RetryPolicy;
pub use source::UploadSource;
pub use strategy::{UploadStrategy, DEFAULT_PART_SIZE, MAX_PARTS, MIN_PART_SIZE};

/// Upload errors
#[derive(Error, Debug)]
pub enum UploadError {
    #[error("S3 error: {0}")]
    S3Error(#[from] S3ClientError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Invalid upload options: {0}")]
    InvalidOptions(String),

    #[error("Part too small: {part_size} bytes (minimum {minimum})")]
    PartTooSmall { part_size: u64, minimum: u64 },

    #[error("Too many parts: {parts} (maximum {maximum})")]
    TooManyParts { parts: u64, maximum: u64 },

    #[error("Object too large: {size} bytes (maximum {maximum})")]
    ObjectTooLarge { size: u64, maximum: u64 },

    #[error("Integrity error: {0}")]
    IntegrityError(String),

    #[error("Checkpoint does not match this upload: {0}")]
    CheckpointMismatch(String),

    #[error("Multipart upload failed{}: {source}", .part_number.map(|n| format!(" at part {}", n)).unwrap_or_default())]
    MultipartError {
        #[source]
        source: Box<UploadError>,
        part_number: Option<u32>,
        checkpoint: Box<Checkpoint>,
    },

    #[error("Upload cancelled")]
    Cancelled { checkpoint: Option<Box<Checkpoint>> },
}

impl UploadError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            UploadError::S3Error(e) => e.kind(),
            UploadError::IoError(_)
            | UploadError::InvalidOptions(_)
            | UploadError::CheckpointMismatch(_) => ErrorKind::Configuration,
            UploadError::PartTooSmall { .. }
            | UploadError::TooManyParts { .. }
            | UploadError::ObjectTooLarge { .. }
            | UploadError::IntegrityError(_) => ErrorKind::Integrity,
            UploadError::MultipartError { source, .. } => source.kind(),
            UploadError::Cancelled { .. } => ErrorKind::Cancelled,
        }
    }

    /// Last-known multipart state, for resuming instead of restarting
    pub fn checkpoint(&self) -> Option<&Checkpoint> {
        match self {
            UploadError::MultipartError { checkpoint, .. } => Some(checkpoint),
            UploadError::Cancelled { checkpoint } => checkpoint.as_deref(),
            _ => None,
        }
    }
}

/// Upload result
#[derive(Debug, Clone)]
pub struct UploadResult {
    /// Backend that handled the upload
    pub platform: Platform,
    pub key: String,
    pub etag: String,
    pub version_id: Option<String>,
    pub location: Option<String>,
    pub bytes_written: u64,
    /// Part count; 0 for single-request uploads
    pub parts: usize,
}

/// What is being uploaded
#[derive(Debug, Clone)]
pub struct UploadTarget {
    /// Object key, relative to the credential's `dir` prefix
    pub key: String,
    pub source: UploadSource,
    /// Declared size, checked against the source when set
    pub size: Option<u64>,
    /// Guessed from the key when unset
    pub content_type: Option<String>,
}

impl UploadTarget {
    pub fn new(key: impl Into<String>, source: impl Into<UploadSource>) -> Self {
        Self {
            key: key.into(),
            source: source.into(),
            size: None,
            content_type: None,
        }
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    /// Actual payload size, validated against the declared one
    pub async fn resolve_size(&self) -> Result<u64, UploadError> {
        let actual = self.source.len().await?;
        match self.size {
            Some(declared) if declared != actual => Err(UploadError::InvalidOptions(format!(
                "declared size {} does not match source size {}",
                declared, actual
            ))),
            _ => Ok(actual),
        }
    }

    pub fn content_type(&self) -> String {
        self.content_type
            .clone()
            .unwrap_or_else(|| source::guess_content_type(&self.key))
    }
}

/// Progress snapshot handed to the progress callback
#[derive(Debug)]
pub struct UploadProgress<'a> {
    pub percent: f64,
    pub loaded: u64,
    pub total: u64,
    /// Present for multipart uploads
    pub checkpoint: Option<&'a Checkpoint>,
}

impl<'a> UploadProgress<'a> {
    pub fn new(loaded: u64, total: u64, checkpoint: Option<&'a Checkpoint>) -> Self {
        let percent = if total == 0 {
            100.0
        } else {
            loaded as f64 * 100.0 / total as f64
        };
        Self {
            percent,
            loaded,
            total,
            checkpoint,
        }
    }
}

pub type ProgressCallback = Arc<dyn Fn(&UploadProgress<'_>) + Send + Sync>;

/// Per-upload options
#[derive(Clone)]
pub struct UploadOptions {
    /// Explicit part size; `None` picks one from `default_part_size`
    pub part_size: Option<u64>,
    pub default_part_size: u64,
    /// Parts in flight at once
    pub concurrency: usize,
    pub retry: RetryPolicy,
    /// Abort the session when parts fail or the upload is cancelled
    pub abort_on_failure: bool,
    /// Compare each part's ETag with the MD5 of its bytes
    pub verify_part_etag: bool,
    pub checkpoint_store: Option<CheckpointStore>,
    pub cancel: CancellationToken,
    pub progress: Option<ProgressCallback>,
    /// Extra headers for PutObject / CreateMultipartUpload
    pub headers: BTreeMap<String, String>,
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self::from_config(&UploadConfig::default())
    }
}

impl UploadOptions {
    pub fn from_config(config: &UploadConfig) -> Self {
        Self {
            part_size: None,
            default_part_size: config.part_size,
            concurrency: config.concurrency,
            retry: config.retry_policy(),
            abort_on_failure: config.abort_on_failure,
            verify_part_etag: config.verify_part_etag,
            checkpoint_store: None,
            cancel: CancellationToken::new(),
            progress: None,
            headers: BTreeMap::new(),
        }
    }

    pub fn with_part_size(mut self, part_size: u64) -> Self {
        self.part_size = Some(part_size);
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_checkpoint_store(mut self, store: CheckpointStore) -> Self {
        self.checkpoint_store = Some(store);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_progress(
        mut self,
        progress: impl Fn(&UploadProgress<'_>) + Send + Sync + 'static,
    ) -> Self {
        self.progress = Some(Arc::new(progress));
        self
    }

    pub(crate) fn report(&self, progress: &UploadProgress<'_>) {
        if let Some(callback) = &self.progress {
            callback(progress);
        }
    }
}

/// Upload handler trait
#[async_trait::async_trait]
pub trait UploadHandler: Send + Sync {
    /// Upload `target` to the handler's backend under `key`
    ///
    /// `key` is final: no prefix is applied here.
    async fn upload(
        &self,
        key: &str,
        target: &UploadTarget,
        options: &UploadOptions,
    ) -> Result<UploadResult, UploadError>;
}

/// Upload entry point: applies the key prefix, picks the strategy and
/// delegates
pub struct Uploader {
    client: Arc<S3Client>,
    simple: PutObjectHandler,
    multipart: MultipartHandler,
}

impl Uploader {
    pub fn new(client: Arc<S3Client>) -> Self {
        Self {
            simple: PutObjectHandler::with_client(client.clone()),
            multipart: MultipartHandler::new(client.clone()),
            client,
        }
    }

    pub fn client(&self) -> &Arc<S3Client> {
        &self.client
    }

    /// Upload `target`, choosing single PUT or multipart by size
    #[tracing::instrument(
        name = "upload",
        skip(self, target, options),
        fields(
            backend = %self.client.name(),
            upload.key = %target.key,
            upload.strategy = tracing::field::Empty
        ),
        err
    )]
    pub async fn upload(
        &self,
        target: UploadTarget,
        options: &UploadOptions,
    ) -> Result<UploadResult, UploadError> {
        if options.cancel.is_cancelled() {
            return Err(UploadError::Cancelled { checkpoint: None });
        }

        let key = self.client.credential().object_key(&target.key);
        let size = target.resolve_size().await?;
        // Part size limits only bind once the payload is actually split.
        let threshold = options
            .part_size
            .unwrap_or_else(|| options.default_part_size.max(MIN_PART_SIZE));
        let strategy = strategy::select_strategy(size, threshold);
        tracing::Span::current().record("upload.strategy", tracing::field::debug(&strategy));

        match strategy {
            UploadStrategy::Simple => self.simple.upload(&key, &target, options).await,
            UploadStrategy::Multipart => {
                let part_size = strategy::resolve_part_size(
                    size,
                    options.part_size,
                    options.default_part_size,
                )?;
                let options = options.clone().with_part_size(part_size);
                self.multipart.upload(&key, &target, &options).await
            }
        }
    }

    /// Continue an interrupted multipart upload from its checkpoint
    pub async fn resume(
        &self,
        checkpoint: Checkpoint,
        source: &UploadSource,
        options: &UploadOptions,
    ) -> Result<UploadResult, UploadError> {
        self.multipart.resume(checkpoint, source, options).await
    }
}

#[async_trait::async_trait]
impl UploadHandler for Uploader {
    async fn upload(
        &self,
        key: &str,
        target: &UploadTarget,
        options: &UploadOptions,
    ) -> Result<UploadResult, UploadError> {
        let mut target = target.clone();
        target.key = key.to_string();
        Uploader::upload(self, target, options).await
    }
}
