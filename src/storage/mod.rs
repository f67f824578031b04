//! Storage module
//!
//! The object sink every pipeline writes into. One sink instance is created
//! per engine and shared by reference across all pipelines; it carries no
//! per-upload state.
//!
//! # Implementations
//!
//! - [`S3Sink`] - S3 and S3-compatible stores via `aws-sdk-s3`
//! - [`MemorySink`] - in-process store for tests and local runs

use crate::upload::ByteStream;
use async_trait::async_trait;
use std::collections::BTreeMap;
use thiserror::Error;

pub mod compress;
pub mod credentials;
pub mod memory;
pub mod multipart;
pub mod s3;

pub use compress::GzipStream;
pub use credentials::{Credentials, CredentialsProvider};
pub use memory::MemorySink;
pub use s3::S3Sink;

/// Store errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Object not found: {key}")]
    NotFound { key: String },

    #[error("Body error: {0}")]
    Body(#[from] std::io::Error),

    #[error("Request error: {0}")]
    Request(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Options applied to every object written for one upload
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteOptions {
    /// Canned ACL, passed through untouched
    pub acl: Option<String>,
    pub content_type: String,
    /// Custom object metadata
    pub metadata: BTreeMap<String, String>,
    /// Body is gzip-compressed; sinks set `Content-Encoding: gzip`
    pub gzip: bool,
}

impl WriteOptions {
    /// Same options with a different content type
    pub fn with_content_type(&self, content_type: &str) -> Self {
        Self {
            content_type: content_type.to_string(),
            ..self.clone()
        }
    }
}

/// A committed object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub key: String,
    pub bytes: u64,
    pub etag: Option<String>,
}

/// Destination for upload bytes
///
/// `put` either commits the whole body under `key` or fails. A body that
/// yields an error must fail the put and leave no object behind.
#[async_trait]
pub trait ObjectSink: Send + Sync {
    /// Bucket objects are written to
    fn bucket(&self) -> &str;

    /// Base URL public object paths are built on
    fn public_base_url(&self) -> String;

    /// Stream `body` into the object `key`
    async fn put(
        &self,
        key: &str,
        options: &WriteOptions,
        body: ByteStream,
    ) -> Result<StoredObject, StoreError>;

    /// Delete the object `key`
    async fn delete(&self, key: &str) -> Result<(), StoreError>;
}
