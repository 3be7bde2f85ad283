//! S3 Client Pool Module
//!
//! One client per configured backend, created up front and shared behind
//! `Arc`s.
//!
//! # Example
//!
//! ```no_run
//! use mizuchi_storage::config::Config;
//! use mizuchi_storage::s3::S3ClientPool;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::load("config.yaml")?;
//! let pool = S3ClientPool::new(&config).await?;
//!
//! if let Some(client) = pool.get_client("minio") {
//!     println!("{} -> {}", client.name(), client.endpoint());
//! }
//! # Ok(())
//! # }
//! ```

use crate::config::{default_session_name, BackendConfig, Config, UploadConfig};
use crate::s3::credentials::{CredentialsError, CredentialsProvider};
use crate::s3::sts::{StsClient, DEFAULT_DURATION_SECONDS};
use crate::s3::{ReqwestTransport, S3Client, S3ClientError};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// S3 Client Pool errors
#[derive(Error, Debug)]
pub enum S3ClientPoolError {
    #[error("Credentials error: {0}")]
    CredentialsError(#[from] CredentialsError),

    #[error("Client creation error: {0}")]
    ClientCreationError(#[from] S3ClientError),

    #[error("AssumeRole failed for backend '{backend}': {source}")]
    AssumeRoleError {
        backend: String,
        #[source]
        source: S3ClientError,
    },
}

struct PoolEntry {
    client: Arc<S3Client>,
    upload: UploadConfig,
}

/// S3 Client Pool
///
/// Maps backend names to clients. Thread-safe: clients are immutable and
/// handed out as `Arc`s.
pub struct S3ClientPool {
    entries: HashMap<String, PoolEntry>,
    default_backend: Option<String>,
}

impl S3ClientPool {
    /// Create a pool with one client per configured backend
    ///
    /// Backends with a `role_arn` assume that role through STS first and
    /// sign with the temporary credentials it returns.
    pub async fn new(config: &Config) -> Result<Self, S3ClientPoolError> {
        let mut entries = HashMap::new();

        for backend in &config.backends {
            let client = Self::build_client(backend).await?;
            tracing::info!(
                backend = %backend.name,
                platform = %backend.adapter,
                bucket = %backend.s3.bucket,
                endpoint = %client.endpoint(),
                "Initialized storage backend"
            );

            entries.insert(
                backend.name.clone(),
                PoolEntry {
                    client: Arc::new(client),
                    upload: backend.upload.clone(),
                },
            );
        }

        let default_backend = config
            .default_backend
            .clone()
            .or_else(|| config.backends.first().map(|b| b.name.clone()));

        Ok(Self {
            entries,
            default_backend,
        })
    }

    async fn build_client(backend: &BackendConfig) -> Result<S3Client, S3ClientPoolError> {
        let mut credential =
            CredentialsProvider::storage_credential(&backend.s3, backend.path_style())?;

        if let Some(role_arn) = backend.s3.role_arn.as_deref().filter(|arn| !arn.is_empty()) {
            let sts_endpoint = backend
                .s3
                .sts_endpoint
                .clone()
                .unwrap_or_else(|| credential.sts_endpoint());
            let assumed = StsClient::new(sts_endpoint, credential.region.clone())?
                .assume_role(
                    &credential.credentials,
                    role_arn,
                    &default_session_name(),
                    DEFAULT_DURATION_SECONDS,
                )
                .await
                .map_err(|source| S3ClientPoolError::AssumeRoleError {
                    backend: backend.name.clone(),
                    source,
                })?;
            credential.credentials = assumed.credentials;
        }

        let transport = ReqwestTransport::new(&backend.upload.transport_config())?;
        Ok(S3Client::with_transport(credential, Arc::new(transport))?
            .with_name(backend.name.clone())
            .with_platform(backend.adapter))
    }

    /// Get a client for a specific backend
    pub fn get_client(&self, name: &str) -> Option<Arc<S3Client>> {
        self.entries.get(name).map(|entry| entry.client.clone())
    }

    /// Client for the default backend
    pub fn default_client(&self) -> Option<Arc<S3Client>> {
        self.default_backend
            .as_deref()
            .and_then(|name| self.get_client(name))
    }

    /// Upload settings of a backend
    pub fn upload_config(&self, name: &str) -> Option<&UploadConfig> {
        self.entries.get(name).map(|entry| &entry.upload)
    }

    /// Get the number of clients in the pool
    pub fn client_count(&self) -> usize {
        self.entries.len()
    }

    /// Backend names, sorted
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}
