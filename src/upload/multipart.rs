//! Multipart upload handler
//!
//! Drives initiate → upload parts → complete against an [`S3Client`]. The
//! state of a session is a [`Checkpoint`]: it is updated after every part,
//! can be persisted through a [`CheckpointStore`], and comes back inside
//! failed uploads so they can be resumed instead of restarted.

use super::strategy::{check_part_layout, part_count};
use super::{UploadError, UploadHandler, UploadOptions, UploadProgress, UploadResult, UploadSource, UploadTarget};
use crate::metrics;
use crate::s3::{DonePart, S3Client};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use md5::{Digest, Md5};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// One slice of the payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartDescriptor {
    /// 1-based
    pub part_number: u32,
    pub offset: u64,
    pub size: u64,
}

/// Split `size` bytes into `part_size` slices; only the last may be shorter
pub fn divide_parts(size: u64, part_size: u64) -> Vec<PartDescriptor> {
    if part_size == 0 {
        return Vec::new();
    }
    (0..part_count(size, part_size))
        .map(|index| {
            let offset = index * part_size;
            PartDescriptor {
                part_number: index as u32 + 1,
                offset,
                size: part_size.min(size - offset),
            }
        })
        .collect()
}

/// Lifecycle of a multipart session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Uninitiated,
    Active,
    ReadyToComplete,
    Completed,
    Aborted,
}

/// Resumable state of one multipart upload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub upload_id: String,
    pub bucket: String,
    pub key: String,
    /// Total payload size
    pub size: u64,
    pub part_size: u64,
    /// Local file the parts are read from, when there is one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    pub state: SessionState,
    /// Sorted by part number, one entry per part
    #[serde(default)]
    pub parts: Vec<DonePart>,
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(
        upload_id: impl Into<String>,
        bucket: impl Into<String>,
        key: impl Into<String>,
        size: u64,
        part_size: u64,
    ) -> Self {
        Self {
            upload_id: upload_id.into(),
            bucket: bucket.into(),
            key: key.into(),
            size,
            part_size,
            source_path: None,
            content_type: None,
            state: SessionState::Active,
            parts: Vec::new(),
            updated_at: Utc::now(),
        }
    }

    /// Record an uploaded part; a part uploaded again replaces the old ETag
    pub fn record(&mut self, part: DonePart) {
        match self
            .parts
            .binary_search_by_key(&part.part_number, |p| p.part_number)
        {
            Ok(index) => self.parts[index] = part,
            Err(index) => self.parts.insert(index, part),
        }
        self.updated_at = Utc::now();
    }

    pub fn total_parts(&self) -> u64 {
        part_count(self.size, self.part_size)
    }

    /// Parts that still have to be uploaded
    pub fn missing_parts(&self) -> Vec<PartDescriptor> {
        divide_parts(self.size, self.part_size)
            .into_iter()
            .filter(|part| {
                self.parts
                    .binary_search_by_key(&part.part_number, |p| p.part_number)
                    .is_err()
            })
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.total_parts() > 0 && self.missing_parts().is_empty()
    }

    /// Bytes covered by the recorded parts
    pub fn uploaded_bytes(&self) -> u64 {
        self.parts
            .iter()
            .map(|part| {
                let offset = (part.part_number as u64).saturating_sub(1) * self.part_size;
                self.size.saturating_sub(offset).min(self.part_size)
            })
            .sum()
    }

    fn transition(&mut self, state: SessionState) {
        self.state = state;
        self.updated_at = Utc::now();
    }
}

/// JSON file holding a checkpoint between runs
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the stored checkpoint; `None` when there is no file
    pub async fn load(&self) -> Result<Option<Checkpoint>, UploadError> {
        match tokio::fs::read(&self.path).await {
            Ok(data) => serde_json::from_slice(&data).map(Some).map_err(|e| {
                UploadError::CheckpointMismatch(format!(
                    "unreadable checkpoint {}: {}",
                    self.path.display(),
                    e
                ))
            }),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Write the checkpoint through a temporary file and rename
    pub async fn save(&self, checkpoint: &Checkpoint) -> Result<(), UploadError> {
        self.write(&encode(checkpoint)?).await
    }

    async fn write(&self, data: &[u8]) -> Result<(), UploadError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file_name = self.path.file_name().unwrap_or_default().to_os_string();
        file_name.push(".tmp");
        let tmp = self.path.with_file_name(file_name);

        tokio::fs::write(&tmp, data).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    pub async fn remove(&self) -> Result<(), UploadError> {
        match tokio::fs::remove_file(&self.path).await {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}

fn encode(checkpoint: &Checkpoint) -> Result<Vec<u8>, UploadError> {
    serde_json::to_vec_pretty(checkpoint).map_err(|e| UploadError::IoError(io::Error::other(e)))
}

/// Compare a part's ETag with the MD5 of the bytes sent
fn verify_part_etag(part: &DonePart, body: &[u8]) -> Result<(), UploadError> {
    let expected = hex::encode(Md5::digest(body));
    let actual = part.etag.trim_matches('"');
    if actual.eq_ignore_ascii_case(&expected) {
        Ok(())
    } else {
        Err(UploadError::IntegrityError(format!(
            "part {} ETag {} does not match MD5 {}",
            part.part_number, part.etag, expected
        )))
    }
}

/// Multipart upload handler
pub struct MultipartHandler {
    client: Arc<S3Client>,
}

impl MultipartHandler {
    pub fn new(client: Arc<S3Client>) -> Self {
        Self { client }
    }

    /// Initiate a multipart upload
    #[tracing::instrument(
        name = "upload.multipart.create",
        skip(self, options),
        fields(
            s3.bucket = %self.client.bucket(),
            s3.key = %key,
            upload.bytes = size
        ),
        err
    )]
    pub async fn create(
        &self,
        key: &str,
        size: u64,
        part_size: u64,
        content_type: Option<&str>,
        options: &UploadOptions,
    ) -> Result<Checkpoint, UploadError> {
        let initiated = self
            .client
            .create_multipart_upload(key, content_type, &options.headers)
            .await?;

        let mut checkpoint =
            Checkpoint::new(initiated.upload_id, self.client.bucket(), key, size, part_size);
        checkpoint.content_type = content_type.map(str::to_string);

        tracing::info!(
            upload_id = %checkpoint.upload_id,
            parts = checkpoint.total_parts(),
            part_size,
            "Created multipart upload"
        );

        Ok(checkpoint)
    }

    /// Upload one part, retrying transient failures at the same part number
    #[tracing::instrument(
        name = "upload.multipart.upload_part",
        skip(self, source, options),
        fields(
            upload_id = %upload_id,
            part_number = part.part_number,
            upload.bytes = part.size
        ),
        err
    )]
    pub async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part: &PartDescriptor,
        source: &UploadSource,
        options: &UploadOptions,
    ) -> Result<DonePart, UploadError> {
        let body = source.read_range(part.offset, part.size).await?;
        let signing = source.payload_signing();

        let done = options
            .retry
            .run(
                || {
                    self.client
                        .upload_part(key, upload_id, part.part_number, body.clone(), signing)
                },
                |retry, error| {
                    metrics::record_part_retry();
                    tracing::warn!(
                        part_number = part.part_number,
                        retry,
                        error = %error,
                        "Retrying part upload"
                    );
                },
            )
            .await?;

        if options.verify_part_etag {
            verify_part_etag(&done, &body)?;
        }

        tracing::debug!(part_number = done.part_number, etag = %done.etag, "Uploaded part");
        Ok(done)
    }

    /// Upload every part the checkpoint is missing
    ///
    /// At most `options.concurrency` parts are in flight. After a failure or
    /// cancellation no new part starts, but parts already in flight finish
    /// and are recorded. The returned error carries the checkpoint; nothing
    /// is aborted here.
    pub async fn upload_parts(
        &self,
        checkpoint: Checkpoint,
        source: &UploadSource,
        options: &UploadOptions,
    ) -> Result<Checkpoint, UploadError> {
        let missing = checkpoint.missing_parts();
        let key = checkpoint.key.clone();
        let upload_id = checkpoint.upload_id.clone();
        let total = checkpoint.size;
        let concurrency = options.concurrency.max(1);

        tracing::info!(
            upload_id = %upload_id,
            parts = missing.len(),
            done = checkpoint.parts.len(),
            concurrency,
            "Uploading parts"
        );

        let state = Mutex::new(checkpoint);
        let stop = AtomicBool::new(false);
        let mut failure: Option<(u32, UploadError)> = None;

        let mut results = stream::iter(missing)
            .map(|part| {
                let (state, stop, key, upload_id) = (&state, &stop, &key, &upload_id);
                async move {
                    if stop.load(Ordering::SeqCst) || options.cancel.is_cancelled() {
                        return None;
                    }
                    let result = self
                        .upload_part(key, upload_id, &part, source, options)
                        .await;
                    match &result {
                        Ok(done) => state.lock().record(done.clone()),
                        Err(_) => stop.store(true, Ordering::SeqCst),
                    }
                    Some((part.part_number, result))
                }
            })
            .buffer_unordered(concurrency);

        while let Some(outcome) = results.next().await {
            match outcome {
                Some((_, Ok(_))) => {
                    let encoded = {
                        let checkpoint = state.lock();
                        options.report(&UploadProgress::new(
                            checkpoint.uploaded_bytes(),
                            total,
                            Some(&*checkpoint),
                        ));
                        options.checkpoint_store.as_ref().map(|_| encode(&checkpoint))
                    };
                    if let (Some(store), Some(encoded)) = (&options.checkpoint_store, encoded) {
                        let written = match encoded {
                            Ok(data) => store.write(&data).await,
                            Err(e) => Err(e),
                        };
                        if let Err(e) = written {
                            tracing::warn!(path = %store.path().display(), error = %e, "Failed to save checkpoint");
                        }
                    }
                }
                Some((part_number, Err(e))) => {
                    tracing::error!(part_number, error = %e, "Part upload failed");
                    if failure.is_none() {
                        failure = Some((part_number, e));
                    }
                }
                None => {}
            }
        }
        drop(results);

        let checkpoint = state.into_inner();
        if let Some((part_number, source)) = failure {
            return Err(UploadError::MultipartError {
                source: Box::new(source),
                part_number: Some(part_number),
                checkpoint: Box::new(checkpoint),
            });
        }
        if options.cancel.is_cancelled() && !checkpoint.is_complete() {
            return Err(UploadError::Cancelled {
                checkpoint: Some(Box::new(checkpoint)),
            });
        }
        Ok(checkpoint)
    }

    /// Complete a multipart upload
    #[tracing::instrument(
        name = "upload.multipart.complete",
        skip(self, checkpoint),
        fields(
            upload_id = %checkpoint.upload_id,
            parts_count = checkpoint.parts.len()
        ),
        err
    )]
    pub async fn complete(&self, checkpoint: &mut Checkpoint) -> Result<UploadResult, UploadError> {
        let missing = checkpoint.missing_parts();
        if let Some(first) = missing.first() {
            return Err(UploadError::IntegrityError(format!(
                "{} of {} parts not uploaded (first missing: {})",
                missing.len(),
                checkpoint.total_parts(),
                first.part_number
            )));
        }

        let completed = self
            .client
            .complete_multipart_upload(&checkpoint.key, &checkpoint.upload_id, &checkpoint.parts)
            .await?;
        checkpoint.transition(SessionState::Completed);

        tracing::info!(
            upload_id = %checkpoint.upload_id,
            parts = checkpoint.parts.len(),
            etag = %completed.etag,
            "Completed multipart upload"
        );

        Ok(UploadResult {
            platform: self.client.platform(),
            key: checkpoint.key.clone(),
            etag: completed.etag,
            version_id: None,
            location: completed.location,
            bytes_written: checkpoint.size,
            parts: checkpoint.parts.len(),
        })
    }

    /// Abort a multipart upload
    pub async fn abort(&self, checkpoint: &mut Checkpoint) -> Result<(), UploadError> {
        self.client
            .abort_multipart_upload(&checkpoint.key, &checkpoint.upload_id)
            .await?;
        checkpoint.transition(SessionState::Aborted);

        tracing::info!(upload_id = %checkpoint.upload_id, "Aborted multipart upload");
        Ok(())
    }

    /// Full upload: initiate, upload every part, complete
    pub async fn run(
        &self,
        key: &str,
        source: &UploadSource,
        content_type: Option<&str>,
        part_size: u64,
        options: &UploadOptions,
    ) -> Result<UploadResult, UploadError> {
        if options.cancel.is_cancelled() {
            return Err(UploadError::Cancelled { checkpoint: None });
        }

        let size = source.len().await?;
        if size == 0 {
            return Err(UploadError::InvalidOptions(
                "empty payloads are uploaded with a single PUT".into(),
            ));
        }
        check_part_layout(size, part_size)?;

        let mut checkpoint = match self.create(key, size, part_size, content_type, options).await {
            Ok(checkpoint) => checkpoint,
            Err(e) => {
                metrics::record_upload(self.client.bucket(), "multipart", 0.0, Err(e.kind()));
                return Err(e);
            }
        };
        checkpoint.source_path = source.path().map(Path::to_path_buf);
        options.report(&UploadProgress::new(0, size, Some(&checkpoint)));

        self.drive(checkpoint, source, options).await
    }

    /// Continue a session from its checkpoint, uploading only missing parts
    #[tracing::instrument(
        name = "upload.multipart.resume",
        skip_all,
        fields(upload_id = %checkpoint.upload_id, s3.key = %checkpoint.key),
        err
    )]
    pub async fn resume(
        &self,
        checkpoint: Checkpoint,
        source: &UploadSource,
        options: &UploadOptions,
    ) -> Result<UploadResult, UploadError> {
        if checkpoint.bucket != self.client.bucket() {
            return Err(UploadError::CheckpointMismatch(format!(
                "checkpoint is for bucket '{}', client uses '{}'",
                checkpoint.bucket,
                self.client.bucket()
            )));
        }
        if !matches!(
            checkpoint.state,
            SessionState::Active | SessionState::ReadyToComplete
        ) {
            return Err(UploadError::CheckpointMismatch(format!(
                "upload {} is {:?} and cannot be resumed",
                checkpoint.upload_id, checkpoint.state
            )));
        }
        check_part_layout(checkpoint.size, checkpoint.part_size)?;
        let size = source.len().await?;
        if size != checkpoint.size {
            return Err(UploadError::CheckpointMismatch(format!(
                "source is {} bytes, checkpoint expects {}",
                size, checkpoint.size
            )));
        }
        if options.cancel.is_cancelled() {
            return Err(UploadError::Cancelled {
                checkpoint: Some(Box::new(checkpoint)),
            });
        }

        tracing::info!(
            done = checkpoint.parts.len(),
            total = checkpoint.total_parts(),
            "Resuming multipart upload"
        );

        self.drive(checkpoint, source, options).await
    }

    async fn drive(
        &self,
        mut checkpoint: Checkpoint,
        source: &UploadSource,
        options: &UploadOptions,
    ) -> Result<UploadResult, UploadError> {
        let start_time = Instant::now();
        let bucket = checkpoint.bucket.clone();

        checkpoint.transition(SessionState::Active);
        self.save(options, &checkpoint).await;

        let result = match self.upload_parts(checkpoint, source, options).await {
            Ok(mut checkpoint) => {
                checkpoint.transition(SessionState::ReadyToComplete);
                self.save(options, &checkpoint).await;

                match self.complete(&mut checkpoint).await {
                    Ok(result) => {
                        self.discard(options).await;
                        Ok(result)
                    }
                    // Parts stay uploaded; completion can be retried.
                    Err(e) => Err(UploadError::MultipartError {
                        source: Box::new(e),
                        part_number: None,
                        checkpoint: Box::new(checkpoint),
                    }),
                }
            }
            Err(e) => Err(self.settle(e, options).await),
        };

        let duration = start_time.elapsed();
        let seconds = duration.as_secs_f64();

        match &result {
            Ok(uploaded) => {
                metrics::record_multipart_session(&bucket, SessionState::Completed, uploaded.parts);
                metrics::record_upload(&bucket, "multipart", seconds, Ok(uploaded.bytes_written));
            }
            Err(e) => {
                if let Some(checkpoint) = e.checkpoint() {
                    metrics::record_multipart_session(&bucket, checkpoint.state, checkpoint.parts.len());
                }
                metrics::record_upload(&bucket, "multipart", seconds, Err(e.kind()));
                tracing::error!(
                    error = %e,
                    duration_ms = duration.as_millis(),
                    "Multipart upload failed"
                );
            }
        }

        result
    }

    /// Apply the failure policy to a failed or cancelled session
    async fn settle(&self, error: UploadError, options: &UploadOptions) -> UploadError {
        match error {
            UploadError::MultipartError {
                source,
                part_number,
                mut checkpoint,
            } => {
                self.release(&mut checkpoint, options).await;
                UploadError::MultipartError {
                    source,
                    part_number,
                    checkpoint,
                }
            }
            UploadError::Cancelled {
                checkpoint: Some(mut checkpoint),
            } => {
                self.release(&mut checkpoint, options).await;
                UploadError::Cancelled {
                    checkpoint: Some(checkpoint),
                }
            }
            other => other,
        }
    }

    async fn release(&self, checkpoint: &mut Checkpoint, options: &UploadOptions) {
        if !options.abort_on_failure {
            self.save(options, checkpoint).await;
            tracing::info!(
                upload_id = %checkpoint.upload_id,
                done = checkpoint.parts.len(),
                "Multipart upload left open for resume"
            );
            return;
        }

        match self.abort(checkpoint).await {
            Ok(()) => self.discard(options).await,
            Err(e) => {
                tracing::warn!(
                    upload_id = %checkpoint.upload_id,
                    error = %e,
                    "Failed to abort multipart upload"
                );
                self.save(options, checkpoint).await;
            }
        }
    }

    async fn save(&self, options: &UploadOptions, checkpoint: &Checkpoint) {
        if let Some(store) = &options.checkpoint_store {
            if let Err(e) = store.save(checkpoint).await {
                tracing::warn!(path = %store.path().display(), error = %e, "Failed to save checkpoint");
            }
        }
    }

    async fn discard(&self, options: &UploadOptions) {
        if let Some(store) = &options.checkpoint_store {
            if let Err(e) = store.remove().await {
                tracing::warn!(path = %store.path().display(), error = %e, "Failed to remove checkpoint");
            }
        }
    }
}

#[async_trait]
impl UploadHandler for MultipartHandler {
    async fn upload(
        &self,
        key: &str,
        target: &UploadTarget,
        options: &UploadOptions,
    ) -> Result<UploadResult, UploadError> {
        let size = target.resolve_size().await?;
        let part_size = super::strategy::resolve_part_size(
            size,
            options.part_size,
            options.default_part_size,
        )?;
        let content_type = target.content_type();
        self.run(key, &target.source, Some(&content_type), part_size, options)
            .await
    }
}
