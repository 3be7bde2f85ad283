//! Mizuchi Storage Library
//!
//! Upload engine for S3-compatible object storage (AWS S3, MinIO).
//!
//! # Features
//!
//! - **SigV4**: Header and query-string (presigned URL) signing, no AWS SDK
//! - **Strategy Selection**: Single PUT up to one part, multipart above
//! - **Resumable Multipart**: Bounded-concurrency parts, checkpoint after
//!   every part, abort on failure
//! - **Object Operations**: Get, head, list, copy, delete, batch delete
//! - **Multiple Backends**: One client per configured backend, optional
//!   STS AssumeRole
//!
//! # Example
//!
//! ```no_run
//! use mizuchi_storage::{config::Config, s3::S3ClientPool};
//! use mizuchi_storage::upload::{UploadOptions, UploadSource, UploadTarget, Uploader};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.yaml")?;
//!     let pool = S3ClientPool::new(&config).await?;
//!     let client = pool.default_client().ok_or_else(|| anyhow::anyhow!("no backend"))?;
//!
//!     let target = UploadTarget::new("backups/db.tar", UploadSource::file("db.tar"));
//!     let result = Uploader::new(client).upload(target, &UploadOptions::default()).await?;
//!     println!("{} ({} parts)", result.etag, result.parts);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod metrics;
pub mod s3;
pub mod upload;

// Re-export commonly used types
pub use config::Config;
pub use s3::{S3Client, S3ClientError};
pub use upload::{UploadError, UploadResult, Uploader};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
