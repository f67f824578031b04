//! Upload module
//!
//! The streaming core: one upload in, one stored object per variant out.
//!
//! ```text
//!                      ┌─► transform(sm) ─► sink("…-sm.png") ─► ResultRecord
//! source ─► fan-out ───┼─► transform(md) ─► sink("…-md.png") ─► ResultRecord ─► AggregateResult
//!                      └─► transform(lg) ─► sink("…-lg.png") ─► ResultRecord
//! ```
//!
//! Without variants the fan-out is skipped and the source feeds a single
//! pipeline directly.

use crate::storage::StoreError;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io;
use std::path::Path;
use thiserror::Error;
use tokio::io::AsyncRead;
use tokio_util::io::ReaderStream;

pub mod fanout;
pub mod key;
pub mod orchestrator;
pub mod pipeline;

pub use fanout::{FanoutStats, StreamFanout};
pub use orchestrator::Orchestrator;
pub use pipeline::{Pipeline, UploadPlan};

/// A stream of upload bytes
pub type ByteStream = BoxStream<'static, io::Result<Bytes>>;

/// Upload errors
#[derive(Error, Debug)]
pub enum UploadError {
    #[error("{resolver} lookup failed: {source}")]
    Resolver {
        resolver: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("Transform failed{}: {source}", variant_label(.suffix))]
    Transform {
        suffix: Option<String>,
        #[source]
        source: io::Error,
    },

    #[error("Store failed{}: {source}", variant_label(.suffix))]
    Store {
        suffix: Option<String>,
        #[source]
        source: StoreError,
    },

    #[error("Reading the upload failed: {0}")]
    Source(#[source] io::Error),

    #[error("Upload cancelled{}", variant_label(.suffix))]
    Cancelled { suffix: Option<String> },

    #[error("Pipeline task failed: {0}")]
    Task(String),
}

fn variant_label(suffix: &Option<String>) -> String {
    match suffix {
        Some(suffix) => format!(" for variant '{}'", suffix),
        None => String::new(),
    }
}

impl UploadError {
    /// Short error class, used as a metrics label
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Resolver { .. } => "resolver",
            Self::Transform { .. } => "transform",
            Self::Store { .. } => "store",
            Self::Source(_) => "source",
            Self::Cancelled { .. } => "cancelled",
            Self::Task(_) => "task",
        }
    }

    /// Variant the error belongs to, if any
    pub fn suffix(&self) -> Option<&str> {
        match self {
            Self::Transform { suffix, .. }
            | Self::Store { suffix, .. }
            | Self::Cancelled { suffix } => suffix.as_deref(),
            _ => None,
        }
    }
}

/// Metadata of an uploaded file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    /// Form field the file arrived in
    #[serde(default)]
    pub field_name: String,
    pub original_name: String,
    pub mimetype: String,
}

impl FileInfo {
    pub fn new(original_name: impl Into<String>, mimetype: impl Into<String>) -> Self {
        Self {
            field_name: String::new(),
            original_name: original_name.into(),
            mimetype: mimetype.into(),
        }
    }

    /// Extension of the original file name, without the dot
    pub fn extension(&self) -> Option<&str> {
        Path::new(&self.original_name)
            .extension()
            .and_then(|ext| ext.to_str())
            .filter(|ext| !ext.is_empty())
    }
}

/// An incoming upload: metadata plus its byte stream
pub struct FileUpload {
    pub info: FileInfo,
    pub stream: ByteStream,
}

impl FileUpload {
    pub fn from_stream(info: FileInfo, stream: ByteStream) -> Self {
        Self { info, stream }
    }

    /// Upload whose content is already in memory
    pub fn from_bytes(info: FileInfo, data: impl Into<Bytes>) -> Self {
        let data = data.into();
        Self::from_stream(info, stream::once(async move { Ok(data) }).boxed())
    }

    /// Upload read from any async reader
    pub fn from_reader<R>(info: FileInfo, reader: R) -> Self
    where
        R: AsyncRead + Send + 'static,
    {
        Self::from_stream(info, ReaderStream::new(reader).boxed())
    }
}

impl std::fmt::Debug for FileUpload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileUpload")
            .field("info", &self.info)
            .finish_non_exhaustive()
    }
}

/// What one pipeline stored
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub mimetype: String,
    /// Percent-encoded public URL of the object
    pub path: String,
    /// Object key
    pub filename: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suffix: Option<String>,
}

/// Location of one stored variant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariantLocation {
    pub path: String,
    pub filename: String,
}

impl From<&ResultRecord> for VariantLocation {
    fn from(record: &ResultRecord) -> Self {
        Self {
            path: record.path.clone(),
            filename: record.filename.clone(),
        }
    }
}

/// Variants of one upload, keyed by suffix
pub type AggregateResult = BTreeMap<String, VariantLocation>;

/// Result of handling one file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum UploadOutcome {
    Single(ResultRecord),
    Variants(AggregateResult),
}

impl UploadOutcome {
    pub fn as_single(&self) -> Option<&ResultRecord> {
        match self {
            Self::Single(record) => Some(record),
            Self::Variants(_) => None,
        }
    }

    pub fn as_variants(&self) -> Option<&AggregateResult> {
        match self {
            Self::Variants(variants) => Some(variants),
            Self::Single(_) => None,
        }
    }
}

/// A previously stored file, as handed back for removal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDescriptor {
    #[serde(flatten)]
    pub info: FileInfo,
    /// Filename recorded at upload time
    pub filename: String,
}

impl FileDescriptor {
    pub fn new(info: FileInfo, filename: impl Into<String>) -> Self {
        Self {
            info,
            filename: filename.into(),
        }
    }
}
