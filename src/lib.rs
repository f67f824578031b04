//! Mizuchi Fanout Library
//!
//! Multi-variant streaming upload engine: one upload stream in, one stored
//! object per variant out.
//!
//! # Features
//!
//! - **Single Read**: The upload is read once and forked to every variant
//! - **Streaming**: Each variant flows through its transform into the store
//!   without touching disk
//! - **S3 Compatible**: Any S3 API endpoint, multipart for large bodies
//! - **Pluggable**: Transforms, lookups and object sinks are traits
//!
//! # Example
//!
//! ```no_run
//! use mizuchi_fanout::resolve::RequestContext;
//! use mizuchi_fanout::upload::{FileInfo, FileUpload};
//! use mizuchi_fanout::{Config, StorageEngine};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.yaml")?;
//!     mizuchi_fanout::telemetry::init(&config.logging)?;
//!
//!     let engine = StorageEngine::connect(&config)?;
//!     let upload = FileUpload::from_bytes(FileInfo::new("cat.png", "image/png"), vec![0u8; 16]);
//!     let outcome = engine.handle_file(&RequestContext::new(), upload).await?;
//!     println!("{:?}", outcome);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod engine;
pub mod metrics;
pub mod resolve;
pub mod storage;
pub mod telemetry;
pub mod transform;
pub mod upload;

// Re-export commonly used types
pub use config::Config;
pub use engine::StorageEngine;
pub use upload::{AggregateResult, ResultRecord, UploadError, UploadOutcome};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
