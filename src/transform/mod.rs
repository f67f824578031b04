//! Transform module
//!
//! A transform turns the bytes of an uploaded file into the bytes of one
//! stored variant. The engine never looks inside a transform: it asks a
//! [`TransformFactory`] for a fresh [`Transformer`] per variant, hands it an
//! input [`ByteStream`] and stores whatever comes out.
//!
//! Failures are reported in-band: an `Err` item on the output stream means the
//! transform failed and nothing it produced may be stored.

use crate::upload::ByteStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::oneshot;

pub mod raster;
pub mod passthrough;

pub use raster::ImageTransforms;
pub use passthrough::PassThrough;

/// Transform construction errors
#[derive(Error, Debug)]
pub enum TransformError {
    #[error("Invalid transform parameters: {0}")]
    InvalidParams(String),

    #[error("Input exceeds {limit} bytes")]
    InputTooLarge { limit: usize },

    #[error("Processing failed: {0}")]
    ProcessingFailed(String),
}

impl From<TransformError> for std::io::Error {
    fn from(err: TransformError) -> Self {
        std::io::Error::other(err)
    }
}

/// Output format a transform can declare
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[serde(alias = "jpg")]
    Jpeg,
    Png,
    #[serde(rename = "webp")]
    WebP,
    Gif,
}

impl OutputFormat {
    /// Parse a format name, case-insensitively
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "jpeg" | "jpg" => Some(Self::Jpeg),
            "png" => Some(Self::Png),
            "webp" => Some(Self::WebP),
            "gif" => Some(Self::Gif),
            _ => None,
        }
    }

    /// Content-Type of the encoded output
    pub fn content_type(&self) -> &'static str {
        match self {
            Self::Jpeg => "image/jpeg",
            Self::Png => "image/png",
            Self::WebP => "image/webp",
            Self::Gif => "image/gif",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Self::Jpeg => "jpg",
            Self::Png => "png",
            Self::WebP => "webp",
            Self::Gif => "gif",
        }
    }
}

/// How a resize target box is applied
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Fit {
    /// Preserve aspect ratio, fit within the box
    #[default]
    Inside,
    /// Stretch to exactly the box
    Fill,
    /// Preserve aspect ratio, fill the box and crop the overflow
    Cover,
}

/// One desired output of an upload
///
/// Results are keyed by `suffix`, so suffixes must be unique within a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariantSpec {
    pub suffix: String,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
    #[serde(default)]
    pub format: Option<OutputFormat>,
    #[serde(default)]
    pub quality: Option<u8>,
}

impl VariantSpec {
    pub fn new(suffix: impl Into<String>) -> Self {
        Self {
            suffix: suffix.into(),
            width: None,
            height: None,
            format: None,
            quality: None,
        }
    }

    pub fn with_size(mut self, width: Option<u32>, height: Option<u32>) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = Some(format);
        self
    }
}

/// Global transform options, shared by every variant of every request
#[derive(Debug, Clone)]
pub struct TransformOptions {
    pub format: Option<OutputFormat>,
    pub quality: u8,
    pub fit: Fit,
    pub max_input_bytes: usize,
}

impl Default for TransformOptions {
    fn default() -> Self {
        crate::config::TransformConfig::default().options()
    }
}

impl TransformOptions {
    /// Format a transform for `variant` will produce, if it forces one
    pub fn format_for(&self, variant: Option<&VariantSpec>) -> Option<OutputFormat> {
        variant.and_then(|v| v.format).or(self.format)
    }

    pub fn quality_for(&self, variant: Option<&VariantSpec>) -> u8 {
        variant.and_then(|v| v.quality).unwrap_or(self.quality)
    }
}

/// Dimensions and format of a produced variant
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransformInfo {
    pub width: u32,
    pub height: u32,
    pub format: OutputFormat,
    pub size: usize,
}

/// A running transform: its output plus an optional informational event
pub struct TransformStream {
    pub output: ByteStream,
    pub info: Option<oneshot::Receiver<TransformInfo>>,
}

/// One transform instance, used for exactly one variant of one upload
pub trait Transformer: Send {
    /// Format the output will be in, when the transform decides it up front
    fn output_format(&self) -> Option<OutputFormat>;

    /// Start transforming `input`
    fn transform(self: Box<Self>, input: ByteStream) -> TransformStream;
}

/// Creates transforms from the global options and a variant
pub trait TransformFactory: Send + Sync {
    fn create(
        &self,
        options: &TransformOptions,
        variant: Option<&VariantSpec>,
    ) -> Result<Box<dyn Transformer>, TransformError>;
}

/// Receives the informational event of each transform
///
/// Purely advisory: the pipeline ignores anything an observer does.
pub trait TransformObserver: Send + Sync {
    fn on_info(&self, key: &str, suffix: Option<&str>, info: &TransformInfo);
}

/// Observer that logs transform info at debug level
#[derive(Debug, Default, Clone, Copy)]
pub struct LogObserver;

impl TransformObserver for LogObserver {
    fn on_info(&self, key: &str, suffix: Option<&str>, info: &TransformInfo) {
        tracing::debug!(
            key = %key,
            suffix = ?suffix,
            width = info.width,
            height = info.height,
            format = ?info.format,
            size = info.size,
            "Transform produced variant"
        );
    }
}
