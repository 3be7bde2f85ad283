//! Configuration module for Mizuchi Storage
//!
//! Handles loading and parsing of YAML configuration files with support for
//! environment variable expansion and validation.
//!
//! ```yaml
//! backends:
//!   - name: minio
//!     adapter: minio
//!     s3:
//!       bucket: uploads
//!       region: us-east-1
//!       endpoint: http://localhost:9000
//!       access_key: ${MINIO_ACCESS_KEY}
//!       secret_key: ${MINIO_SECRET_KEY:-minioadmin}
//!     upload:
//!       part_size: 8388608
//!       concurrency: 5
//! ```

use crate::s3::{Platform, TransportConfig, MAX_SINGLE_PUT_SIZE};
use crate::upload::retry::RetryPolicy;
use crate::upload::strategy::MIN_PART_SIZE;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

mod loader;

pub use loader::ConfigLoader;

// ============================================================================
// Environment Variable Expansion
// ============================================================================

/// Expand environment variables in a string.
///
/// Supports two syntaxes:
/// - `${VAR_NAME}` - Simple expansion, keeps placeholder if var not found
/// - `${VAR_NAME:-default}` - Expansion with default value
///
/// Variable names must start with a letter or underscore and contain only
/// uppercase letters, digits, and underscores.
pub(crate) fn expand_env_vars(s: &str) -> String {
    let Ok(re) = regex_lite::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}") else {
        return s.to_string();
    };
    let mut last_match = 0;
    let mut result = String::with_capacity(s.len());

    for cap in re.captures_iter(s) {
        let (Some(full_match), Some(var_name)) = (cap.get(0), cap.get(1)) else {
            continue;
        };

        result.push_str(&s[last_match..full_match.start()]);

        let value = match std::env::var(var_name.as_str()) {
            Ok(val) => val,
            Err(_) => match cap.get(2) {
                Some(default) => default.as_str().to_string(),
                // No env var and no default. Keep the original placeholder.
                None => full_match.as_str().to_string(),
            },
        };
        result.push_str(&value);

        last_match = full_match.end();
    }

    result.push_str(&s[last_match..]);
    result
}

// ============================================================================
// Validation Helpers
// ============================================================================

/// Validate that a URL starts with http:// or https://
fn is_valid_http_url(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub backends: Vec<BackendConfig>,
    /// Backend used when none is named; defaults to the first one
    #[serde(default)]
    pub default_backend: Option<String>,
}

impl Config {
    /// Load configuration from a file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        ConfigLoader::load(path)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.backends.is_empty() {
            return Err(ConfigError::ValidationError(
                "At least one backend must be configured".into(),
            ));
        }

        let mut names = HashSet::new();
        for backend in &self.backends {
            if backend.name.trim().is_empty() {
                return Err(ConfigError::ValidationError(
                    "Backend name cannot be empty".into(),
                ));
            }
            if !names.insert(backend.name.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "Duplicate backend name '{}'",
                    backend.name
                )));
            }
            backend.validate()?;
        }

        if let Some(default) = &self.default_backend {
            if !names.contains(default.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "default_backend '{}' is not a configured backend",
                    default
                )));
            }
        }

        Ok(())
    }

    /// Look up a backend by name, or the default backend when `name` is `None`
    pub fn backend(&self, name: Option<&str>) -> Option<&BackendConfig> {
        match name.or(self.default_backend.as_deref()) {
            Some(name) => self.backends.iter().find(|b| b.name == name),
            None => self.backends.first(),
        }
    }
}

/// One storage backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    pub name: String,
    #[serde(default)]
    pub adapter: Platform,
    pub s3: S3Config,
    #[serde(default)]
    pub upload: UploadConfig,
}

impl BackendConfig {
    /// MinIO always uses path-style; otherwise path-style is the default only
    /// for custom endpoints
    pub fn path_style(&self) -> bool {
        match self.adapter {
            Platform::Minio => true,
            Platform::S3 => self.s3.path_style.unwrap_or(self.s3.endpoint.is_some()),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| ConfigError::ValidationError(format!("Backend '{}': {}", self.name, msg));

        if self.s3.bucket.trim().is_empty() {
            return Err(invalid("bucket cannot be empty".into()));
        }
        if self.s3.region.trim().is_empty() {
            return Err(invalid("region cannot be empty".into()));
        }
        if let Some(endpoint) = &self.s3.endpoint {
            if !is_valid_http_url(endpoint) {
                return Err(invalid(format!(
                    "invalid endpoint '{}': must start with http:// or https://",
                    endpoint
                )));
            }
        }
        if let Some(sts_endpoint) = &self.s3.sts_endpoint {
            if !is_valid_http_url(sts_endpoint) {
                return Err(invalid(format!(
                    "invalid sts_endpoint '{}': must start with http:// or https://",
                    sts_endpoint
                )));
            }
        }

        let upload = &self.upload;
        if upload.part_size < MIN_PART_SIZE || upload.part_size > MAX_SINGLE_PUT_SIZE {
            return Err(invalid(format!(
                "part_size {} must be between {} and {} bytes",
                upload.part_size, MIN_PART_SIZE, MAX_SINGLE_PUT_SIZE
            )));
        }
        if upload.concurrency == 0 {
            return Err(invalid("concurrency must be at least 1".into()));
        }
        if upload.timeout_seconds == 0 {
            return Err(invalid("timeout_seconds must be at least 1".into()));
        }

        Ok(())
    }
}

/// S3 backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3Config {
    pub bucket: String,
    pub region: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub access_key: Option<String>,
    #[serde(default)]
    pub secret_key: Option<String>,
    #[serde(default)]
    pub session_token: Option<String>,
    #[serde(default)]
    pub path_style: Option<bool>,
    /// Key prefix for uploads
    #[serde(default)]
    pub dir: Option<String>,
    /// When set, the pool exchanges the keys above for temporary credentials
    #[serde(default)]
    pub role_arn: Option<String>,
    /// Defaults to the storage endpoint
    #[serde(default)]
    pub sts_endpoint: Option<String>,
}

/// Upload configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    #[serde(default = "default_part_size")]
    pub part_size: u64,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_max_part_retries")]
    pub max_part_retries: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default = "default_connect_timeout_seconds")]
    pub connect_timeout_seconds: u64,
    #[serde(default = "default_presign_expires_seconds")]
    pub presign_expires_seconds: u64,
    #[serde(default = "default_abort_on_failure")]
    pub abort_on_failure: bool,
    #[serde(default)]
    pub verify_part_etag: bool,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            part_size: default_part_size(),
            concurrency: default_concurrency(),
            max_part_retries: default_max_part_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            timeout_seconds: default_timeout_seconds(),
            connect_timeout_seconds: default_connect_timeout_seconds(),
            presign_expires_seconds: default_presign_expires_seconds(),
            abort_on_failure: default_abort_on_failure(),
            verify_part_etag: false,
        }
    }
}

impl UploadConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_part_retries,
            Duration::from_millis(self.retry_base_delay_ms),
        )
    }

    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            timeout: Duration::from_secs(self.timeout_seconds),
            connect_timeout: Duration::from_secs(self.connect_timeout_seconds),
        }
    }
}

fn default_part_size() -> u64 {
    8388608 // 8MB
}

fn default_concurrency() -> usize {
    5
}

fn default_max_part_retries() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    200
}

fn default_timeout_seconds() -> u64 {
    300
}

fn default_connect_timeout_seconds() -> u64 {
    10
}

fn default_presign_expires_seconds() -> u64 {
    3600
}

fn default_abort_on_failure() -> bool {
    true
}

/// Session name used for AssumeRole calls
pub fn default_session_name() -> String {
    "mizuchi-storage".to_string()
}
