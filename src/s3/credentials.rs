//! S3 Credentials Module
//!
//! Credentials come in two shapes, resolved once at the boundary:
//!
//! - `Credentials::Direct` - long-lived access key + secret
//! - `Credentials::Temporary` - STS-issued key + secret + session token
//!
//! `StorageCredential` binds credentials to one storage backend (bucket,
//! region, endpoint, addressing style and optional key prefix).
//!
//! # Example
//!
//! ```
//! use mizuchi_storage::s3::credentials::StorageCredential;
//!
//! let json = r#"{
//!     "temporary_credential": {
//!         "bucket": "uploads",
//!         "region": "us-east-1",
//!         "endpoint": "http://localhost:9000",
//!         "access_key_id": "AKID",
//!         "secret_access_key": "SECRET",
//!         "session_token": "TOKEN",
//!         "dir": "tenant-a/"
//!     }
//! }"#;
//!
//! let credential = StorageCredential::from_json(json).unwrap();
//! assert_eq!(credential.credentials.session_token(), Some("TOKEN"));
//! assert_eq!(credential.object_key("report.pdf"), "tenant-a/report.pdf");
//! ```

use crate::config::S3Config;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Credential loading errors
#[derive(Error, Debug)]
pub enum CredentialsError {
    #[error("Missing credentials: {0}")]
    MissingCredentials(String),

    #[error("Invalid credentials: {0}")]
    InvalidCredentials(String),
}

/// Credentials for SigV4 authentication
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Credentials {
    Direct {
        access_key_id: String,
        secret_access_key: String,
    },
    Temporary {
        access_key_id: String,
        secret_access_key: String,
        session_token: String,
    },
}

impl Credentials {
    /// Long-lived credentials
    pub fn direct(access_key_id: impl Into<String>, secret_access_key: impl Into<String>) -> Self {
        Credentials::Direct {
            access_key_id: access_key_id.into(),
            secret_access_key: secret_access_key.into(),
        }
    }

    /// Temporary credentials (STS)
    pub fn temporary(
        access_key_id: impl Into<String>,
        secret_access_key: impl Into<String>,
        session_token: impl Into<String>,
    ) -> Self {
        Credentials::Temporary {
            access_key_id: access_key_id.into(),
            secret_access_key: secret_access_key.into(),
            session_token: session_token.into(),
        }
    }

    /// Get the access key ID
    pub fn access_key_id(&self) -> &str {
        match self {
            Credentials::Direct { access_key_id, .. }
            | Credentials::Temporary { access_key_id, .. } => access_key_id,
        }
    }

    /// Get the secret access key
    pub fn secret_access_key(&self) -> &str {
        match self {
            Credentials::Direct {
                secret_access_key, ..
            }
            | Credentials::Temporary {
                secret_access_key, ..
            } => secret_access_key,
        }
    }

    /// Get the session token (temporary credentials only)
    pub fn session_token(&self) -> Option<&str> {
        match self {
            Credentials::Direct { .. } => None,
            Credentials::Temporary { session_token, .. } => Some(session_token),
        }
    }
}

// Secrets stay out of logs.
impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key_id", &self.access_key_id())
            .field("secret_access_key", &"***")
            .field("temporary", &self.session_token().is_some())
            .finish()
    }
}

/// Authorization for one storage backend
///
/// Immutable for the lifetime of an upload and shared read-only between
/// concurrent part uploads.
#[derive(Debug, Clone)]
pub struct StorageCredential {
    pub credentials: Credentials,
    pub bucket: String,
    pub region: String,
    /// Endpoint URL; `None` means AWS (`https://s3.{region}.amazonaws.com`)
    pub endpoint: Option<String>,
    /// Path-style (`endpoint/bucket/key`) instead of virtual-hosted addressing
    pub path_style: bool,
    /// Key prefix prepended to relative upload keys
    pub dir: Option<String>,
}

impl StorageCredential {
    pub fn new(
        credentials: Credentials,
        bucket: impl Into<String>,
        region: impl Into<String>,
    ) -> Self {
        Self {
            credentials,
            bucket: bucket.into(),
            region: region.into(),
            endpoint: None,
            path_style: false,
            dir: None,
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn with_path_style(mut self, path_style: bool) -> Self {
        self.path_style = path_style;
        self
    }

    pub fn with_dir(mut self, dir: impl Into<String>) -> Self {
        self.dir = Some(dir.into());
        self
    }

    /// Endpoint URL, defaulting to the regional AWS endpoint
    pub fn endpoint(&self) -> String {
        self.endpoint
            .clone()
            .unwrap_or_else(|| format!("https://s3.{}.amazonaws.com", self.region))
    }

    /// STS endpoint for this backend: the custom endpoint when one is set
    /// (MinIO serves STS on the S3 port), else the regional AWS STS host
    pub fn sts_endpoint(&self) -> String {
        self.endpoint
            .clone()
            .unwrap_or_else(|| format!("https://sts.{}.amazonaws.com", self.region))
    }

    /// Prepend the configured `dir` prefix to a relative key
    ///
    /// The prefix is always applied, even when the key already begins with
    /// the same text.
    pub fn object_key(&self, relative: &str) -> String {
        match self.dir.as_deref().map(|dir| dir.trim_start_matches('/')) {
            Some(dir) if !dir.is_empty() => {
                let relative = relative.trim_start_matches('/');
                if dir.ends_with('/') {
                    format!("{}{}", dir, relative)
                } else {
                    format!("{}/{}", dir, relative)
                }
            }
            _ => relative.to_string(),
        }
    }

    /// Check that every field needed to sign a request is present
    pub fn validate(&self) -> Result<(), CredentialsError> {
        if self.credentials.access_key_id().is_empty() {
            return Err(CredentialsError::MissingCredentials(
                "access key id is empty".into(),
            ));
        }
        if self.credentials.secret_access_key().is_empty() {
            return Err(CredentialsError::MissingCredentials(
                "secret access key is empty".into(),
            ));
        }
        if self.bucket.is_empty() {
            return Err(CredentialsError::InvalidCredentials(
                "bucket is empty".into(),
            ));
        }
        if self.region.is_empty() {
            return Err(CredentialsError::InvalidCredentials(
                "region is empty".into(),
            ));
        }
        if let Some(endpoint) = &self.endpoint {
            if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
                return Err(CredentialsError::InvalidCredentials(format!(
                    "endpoint must start with http:// or https://: {}",
                    endpoint
                )));
            }
        }
        Ok(())
    }

    /// Parse a JSON credential payload (direct or `temporary_credential`-wrapped)
    pub fn from_json(json: &str) -> Result<Self, CredentialsError> {
        let payload: CredentialPayload = serde_json::from_str(json)
            .map_err(|e| CredentialsError::InvalidCredentials(e.to_string()))?;
        let credential = payload.into_storage_credential();
        credential.validate()?;
        Ok(credential)
    }
}

/// Wire shape of a credential payload handed out by an issuing service
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum CredentialPayload {
    Wrapped {
        temporary_credential: CredentialFields,
    },
    Flat(CredentialFields),
}

#[derive(Debug, Clone, Deserialize)]
pub struct CredentialFields {
    pub bucket: String,
    pub region: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(alias = "accessKeyId", alias = "access_key")]
    pub access_key_id: String,
    #[serde(alias = "secretAccessKey", alias = "secret_key")]
    pub secret_access_key: String,
    #[serde(default, alias = "sessionToken")]
    pub session_token: Option<String>,
    #[serde(default, alias = "pathStyle", alias = "use_path_style_endpoint")]
    pub path_style: Option<bool>,
    #[serde(default)]
    pub dir: Option<String>,
}

impl CredentialPayload {
    pub fn into_storage_credential(self) -> StorageCredential {
        let fields = match self {
            CredentialPayload::Wrapped {
                temporary_credential,
            } => temporary_credential,
            CredentialPayload::Flat(fields) => fields,
        };

        let credentials = match fields.session_token.filter(|t| !t.is_empty()) {
            Some(token) => {
                Credentials::temporary(fields.access_key_id, fields.secret_access_key, token)
            }
            None => Credentials::direct(fields.access_key_id, fields.secret_access_key),
        };

        // Custom endpoints (MinIO and friends) default to path-style.
        let path_style = fields.path_style.unwrap_or(fields.endpoint.is_some());

        StorageCredential {
            credentials,
            bucket: fields.bucket,
            region: fields.region,
            endpoint: fields.endpoint,
            path_style,
            dir: fields.dir,
        }
    }
}

/// Factory methods for loading credentials
pub struct CredentialsProvider;

impl CredentialsProvider {
    /// Load credentials from environment variables
    ///
    /// Looks for:
    /// - `AWS_ACCESS_KEY_ID`
    /// - `AWS_SECRET_ACCESS_KEY`
    /// - `AWS_SESSION_TOKEN` (optional)
    pub fn from_env() -> Result<Credentials, CredentialsError> {
        let access_key = std::env::var("AWS_ACCESS_KEY_ID").map_err(|_| {
            CredentialsError::MissingCredentials("AWS_ACCESS_KEY_ID not set".into())
        })?;

        let secret_key = std::env::var("AWS_SECRET_ACCESS_KEY").map_err(|_| {
            CredentialsError::MissingCredentials("AWS_SECRET_ACCESS_KEY not set".into())
        })?;

        Ok(match std::env::var("AWS_SESSION_TOKEN").ok() {
            Some(token) if !token.is_empty() => {
                Credentials::temporary(access_key, secret_key, token)
            }
            _ => Credentials::direct(access_key, secret_key),
        })
    }

    /// Load credentials from S3Config, falling back to the environment
    ///
    /// Keys set in the config win; the environment fills in only when both
    /// `access_key` and `secret_key` are absent.
    pub fn from_config(config: &S3Config) -> Result<Credentials, CredentialsError> {
        match (&config.access_key, &config.secret_key) {
            (Some(access_key), Some(secret_key)) => Ok(match &config.session_token {
                Some(token) if !token.is_empty() => {
                    Credentials::temporary(access_key, secret_key, token)
                }
                _ => Credentials::direct(access_key, secret_key),
            }),
            (None, None) => Self::from_env(),
            (None, Some(_)) => Err(CredentialsError::MissingCredentials(
                "access_key not set in config".into(),
            )),
            (Some(_), None) => Err(CredentialsError::MissingCredentials(
                "secret_key not set in config".into(),
            )),
        }
    }

    /// Build a `StorageCredential` for one configured backend
    pub fn storage_credential(
        config: &S3Config,
        path_style: bool,
    ) -> Result<StorageCredential, CredentialsError> {
        let credential = StorageCredential {
            credentials: Self::from_config(config)?,
            bucket: config.bucket.clone(),
            region: config.region.clone(),
            endpoint: config.endpoint.clone(),
            path_style,
            dir: config.dir.clone(),
        };
        credential.validate()?;
        Ok(credential)
    }
}
