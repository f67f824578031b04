//! Configuration module for Mizuchi Fanout
//!
//! Handles loading and parsing of YAML configuration files with support for
//! environment variable expansion and validation. Everything here is resolved
//! once when a [`StorageEngine`](crate::engine::StorageEngine) is constructed
//! and treated as immutable afterwards.
//!
//! # Example
//!
//! ```yaml
//! storage:
//!   bucket: "${UPLOAD_BUCKET}"
//!   region: "us-east-1"
//! upload:
//!   acl: "public-read"
//!   key_prefix: "thumb"
//!   sizes:
//!     - suffix: "sm"
//!       width: 160
//!     - suffix: "lg"
//!       width: 1280
//! transform:
//!   kind: "image"
//!   quality: 85
//! ```

use crate::storage::multipart::MIN_PART_SIZE;
use crate::transform::{Fit, OutputFormat, TransformOptions, VariantSpec};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use thiserror::Error;

mod loader;

pub use loader::ConfigLoader;

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

    #[error("Missing storage identity: {0}")]
    MissingIdentity(#[from] crate::storage::credentials::CredentialsError),
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub storage: StorageConfig,
    #[serde(default)]
    pub upload: UploadConfig,
    #[serde(default)]
    pub transform: TransformConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Config {
    /// Load configuration from a file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        ConfigLoader::load(path)
    }

    /// Parse configuration from an in-memory YAML document
    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
        ConfigLoader::parse(content)
    }

    /// Minimal configuration for a bucket, everything else defaulted
    pub fn for_bucket(bucket: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            storage: StorageConfig {
                bucket: bucket.into(),
                region: region.into(),
                endpoint: None,
                public_url: None,
                access_key: None,
                secret_key: None,
                session_token: None,
                part_size: default_part_size(),
            },
            upload: UploadConfig::default(),
            transform: TransformConfig::default(),
            logging: LoggingConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.storage.bucket.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "storage.bucket must be set".into(),
            ));
        }

        if self.storage.region.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "storage.region must be set".into(),
            ));
        }

        for (field, url) in [
            ("endpoint", &self.storage.endpoint),
            ("public_url", &self.storage.public_url),
        ] {
            if let Some(url) = url {
                if !is_valid_http_url(url) {
                    return Err(ConfigError::ValidationError(format!(
                        "Invalid storage.{}: must start with http:// or https://",
                        field
                    )));
                }
            }
        }

        if self.storage.part_size < MIN_PART_SIZE {
            return Err(ConfigError::ValidationError(format!(
                "storage.part_size {} is below the multipart minimum of {} bytes",
                self.storage.part_size, MIN_PART_SIZE
            )));
        }

        if !(1..=100).contains(&self.transform.quality) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid transform.quality {}: must be between 1 and 100",
                self.transform.quality
            )));
        }

        let mut seen = HashSet::new();
        for size in &self.upload.sizes {
            if size.suffix.is_empty() {
                return Err(ConfigError::ValidationError(
                    "upload.sizes entries must have a non-empty suffix".into(),
                ));
            }
            if !seen.insert(size.suffix.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "Duplicate variant suffix '{}' in upload.sizes",
                    size.suffix
                )));
            }
            if let Some(quality) = size.quality {
                if !(1..=100).contains(&quality) {
                    return Err(ConfigError::ValidationError(format!(
                        "Invalid quality {} for variant '{}'",
                        quality, size.suffix
                    )));
                }
            }
        }

        Ok(())
    }
}

/// Object store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub bucket: String,
    pub region: String,
    /// Custom endpoint for S3-compatible stores (path-style addressing)
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Public host used when building result URLs. Falls back to the endpoint,
    /// then to the regional AWS host.
    #[serde(default)]
    pub public_url: Option<String>,
    #[serde(default)]
    pub access_key: Option<String>,
    #[serde(default)]
    pub secret_key: Option<String>,
    #[serde(default)]
    pub session_token: Option<String>,
    #[serde(default = "default_part_size")]
    pub part_size: usize,
}

fn default_part_size() -> usize {
    8388608 // 8MB
}

/// Per-upload write behaviour and default lookups
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UploadConfig {
    /// Canned ACL passed through to the store untouched
    #[serde(default)]
    pub acl: Option<String>,
    #[serde(default)]
    pub gzip: bool,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub destination: Option<String>,
    #[serde(default)]
    pub key_prefix: Option<String>,
    #[serde(default)]
    pub sizes: Vec<VariantSpec>,
    #[serde(default)]
    pub failure_policy: FailurePolicy,
}

/// What the orchestrator does with in-flight variants once one has failed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Cancel every sibling pipeline and wait for it to tear down
    #[default]
    CancelSiblings,
    /// Return immediately and let siblings finish on their own
    Detach,
}

/// Transform the engine applies to every pipeline
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransformKind {
    /// Decode, resize and re-encode images
    #[default]
    Image,
    /// Store uploads byte-for-byte
    Identity,
}

/// Global transform options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformConfig {
    #[serde(default)]
    pub kind: TransformKind,
    #[serde(default)]
    pub format: Option<OutputFormat>,
    #[serde(default = "default_quality")]
    pub quality: u8,
    #[serde(default)]
    pub fit: Fit,
    #[serde(default = "default_max_input_bytes")]
    pub max_input_bytes: usize,
}

impl Default for TransformConfig {
    fn default() -> Self {
        Self {
            kind: TransformKind::default(),
            format: None,
            quality: default_quality(),
            fit: Fit::default(),
            max_input_bytes: default_max_input_bytes(),
        }
    }
}

impl TransformConfig {
    pub fn options(&self) -> TransformOptions {
        TransformOptions {
            format: self.format,
            quality: self.quality,
            fit: self.fit,
            max_input_bytes: self.max_input_bytes,
        }
    }
}

fn default_quality() -> u8 {
    80
}

fn default_max_input_bytes() -> usize {
    52428800 // 50MB
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
        }
    }
}

fn default_metrics_enabled() -> bool {
    true
}
