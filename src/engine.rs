//! Storage engine
//!
//! The entry point a host application talks to. It owns the object sink, the
//! transform factory and the four per-request lookups, and exposes the two
//! file handler operations:
//!
//! - [`StorageEngine::handle_file`] stores an upload, either as one object or
//!   as one object per configured variant
//! - [`StorageEngine::remove_file`] deletes a previously stored file
//!
//! # Example
//!
//! ```no_run
//! use mizuchi_fanout::engine::StorageEngine;
//! use mizuchi_fanout::resolve::RequestContext;
//! use mizuchi_fanout::upload::{FileInfo, FileUpload};
//! use mizuchi_fanout::Config;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = Config::load("config.yaml")?;
//! let engine = StorageEngine::connect(&config)?;
//!
//! let file = tokio::fs::File::open("cat.png").await?;
//! let upload = FileUpload::from_reader(FileInfo::new("cat.png", "image/png"), file);
//! let outcome = engine.handle_file(&RequestContext::new(), upload).await?;
//! println!("{}", serde_json::to_string(&outcome)?);
//! # Ok(())
//! # }
//! ```

use crate::config::{Config, ConfigError, FailurePolicy, TransformKind};
use crate::metrics;
use crate::resolve::{RequestContext, Resolver, Resolvers};
use crate::storage::{CredentialsProvider, ObjectSink, S3Sink, StoreError, WriteOptions};
use crate::transform::{
    ImageTransforms, LogObserver, PassThrough, TransformFactory, TransformObserver, VariantSpec,
};
use crate::upload::{
    key, AggregateResult, FileDescriptor, FileUpload, Orchestrator, Pipeline, UploadError,
    UploadOutcome, UploadPlan,
};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// Multi-variant upload engine bound to one bucket
#[derive(Clone)]
pub struct StorageEngine {
    pipeline: Arc<Pipeline>,
    policy: FailurePolicy,
    resolvers: Resolvers,
    write: WriteOptions,
}

impl StorageEngine {
    /// Create an engine writing to `sink`
    pub fn new(config: &Config, sink: Arc<dyn ObjectSink>) -> Result<Self, ConfigError> {
        config.validate()?;

        let transforms: Arc<dyn TransformFactory> = match config.transform.kind {
            TransformKind::Image => Arc::new(ImageTransforms),
            TransformKind::Identity => Arc::new(PassThrough),
        };
        let pipeline = Pipeline::new(
            sink,
            transforms,
            config.transform.options(),
            Arc::new(LogObserver),
        )
        .with_metrics(config.metrics.enabled);

        Ok(Self {
            pipeline: Arc::new(pipeline),
            policy: config.upload.failure_policy,
            resolvers: Resolvers::from_config(&config.upload),
            write: WriteOptions {
                acl: config.upload.acl.clone(),
                content_type: String::new(),
                metadata: config.upload.metadata.clone(),
                gzip: config.upload.gzip,
            },
        })
    }

    /// Create an engine writing to the configured S3 bucket
    ///
    /// Fails when no credentials are configured or present in the
    /// environment.
    pub fn connect(config: &Config) -> Result<Self, ConfigError> {
        config.validate()?;
        let credentials = CredentialsProvider::resolve(&config.storage)?;
        let sink = S3Sink::new(&config.storage, &credentials);

        tracing::info!(
            bucket = %config.storage.bucket,
            region = %config.storage.region,
            endpoint = ?config.storage.endpoint,
            "Connected storage engine"
        );
        Self::new(config, Arc::new(sink))
    }

    pub fn with_transforms(mut self, transforms: Arc<dyn TransformFactory>) -> Self {
        Arc::make_mut(&mut self.pipeline).set_transforms(transforms);
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn TransformObserver>) -> Self {
        Arc::make_mut(&mut self.pipeline).set_observer(observer);
        self
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_destination(mut self, resolver: impl Resolver<Option<String>> + 'static) -> Self {
        self.resolvers.destination = Arc::new(resolver);
        self
    }

    pub fn with_filename(mut self, resolver: impl Resolver<String> + 'static) -> Self {
        self.resolvers.filename = Arc::new(resolver);
        self
    }

    pub fn with_sizes(
        mut self,
        resolver: impl Resolver<Option<Vec<VariantSpec>>> + 'static,
    ) -> Self {
        self.resolvers.sizes = Arc::new(resolver);
        self
    }

    pub fn with_key_prefix(mut self, resolver: impl Resolver<Option<String>> + 'static) -> Self {
        self.resolvers.key_prefix = Arc::new(resolver);
        self
    }

    pub fn bucket(&self) -> &str {
        self.pipeline.sink().bucket()
    }

    pub fn sink(&self) -> &Arc<dyn ObjectSink> {
        self.pipeline.sink()
    }

    /// Store an upload
    ///
    /// Resolves destination, filename, sizes and key prefix in that order,
    /// then stores one object, or one object per variant when sizes were
    /// resolved. No pipeline starts unless every lookup succeeded.
    #[tracing::instrument(
        name = "engine.handle_file",
        skip_all,
        fields(
            s3.bucket = %self.bucket(),
            file.name = %file.info.original_name,
            file.mimetype = %file.info.mimetype,
            upload.mode = tracing::field::Empty
        ),
        err
    )]
    pub async fn handle_file(
        &self,
        ctx: &RequestContext,
        file: FileUpload,
    ) -> Result<UploadOutcome, UploadError> {
        let start = Instant::now();
        let FileUpload { info, stream } = file;

        let lookups = match self.resolvers.resolve_all(ctx, &info).await {
            Ok(lookups) => lookups,
            Err(e) => {
                if self.pipeline.metrics_enabled() {
                    metrics::record_error(e.kind());
                }
                return Err(e);
            }
        };

        let plan = UploadPlan {
            file: info,
            destination: lookups.destination,
            filename: lookups.filename,
            key_prefix: lookups.key_prefix,
            write: self.write.clone(),
        };

        let (mode, result) = match lookups.sizes {
            None => {
                let result = self
                    .pipeline
                    .run(&plan, None, stream, &CancellationToken::new())
                    .await
                    .map(UploadOutcome::Single);
                ("single", result)
            }
            Some(sizes) => {
                let result = Orchestrator::new(self.pipeline.clone(), self.policy)
                    .run(Arc::new(plan), sizes, stream)
                    .await
                    .map(UploadOutcome::Variants);
                ("variants", result)
            }
        };

        let duration = start.elapsed();
        tracing::Span::current().record("upload.mode", mode);
        if self.pipeline.metrics_enabled() {
            metrics::record_upload(self.bucket(), mode, result.is_ok(), duration.as_secs_f64());
        }

        match &result {
            Ok(UploadOutcome::Single(record)) => tracing::info!(
                key = %record.filename,
                duration_ms = duration.as_millis() as u64,
                "Upload stored"
            ),
            Ok(UploadOutcome::Variants(variants)) => tracing::info!(
                variants = variants.len(),
                duration_ms = duration.as_millis() as u64,
                "Upload variants stored"
            ),
            Err(e) => tracing::error!(
                error = %e,
                kind = e.kind(),
                duration_ms = duration.as_millis() as u64,
                "Upload failed"
            ),
        }
        result
    }

    /// Delete a previously stored file
    ///
    /// The key is rebuilt from the resolved destination and the recorded
    /// filename. Store errors, including a missing object, are returned
    /// unchanged.
    #[tracing::instrument(
        name = "engine.remove_file",
        skip_all,
        fields(s3.bucket = %self.bucket(), s3.key = tracing::field::Empty),
        err
    )]
    pub async fn remove_file(
        &self,
        ctx: &RequestContext,
        file: &FileDescriptor,
    ) -> Result<(), UploadError> {
        let destination = self.resolvers.destination(ctx, &file.info).await?;
        let key = key::stored_key(destination.as_deref(), &file.filename);
        tracing::Span::current().record("s3.key", key.as_str());

        self.delete(&key, None).await
    }

    /// Delete every stored variant of an upload
    ///
    /// Stops at the first failed delete.
    pub async fn remove_variants(
        &self,
        _ctx: &RequestContext,
        variants: &AggregateResult,
    ) -> Result<(), UploadError> {
        for (suffix, location) in variants {
            self.delete(&location.filename, Some(suffix)).await?;
        }
        Ok(())
    }

    async fn delete(&self, key: &str, suffix: Option<&str>) -> Result<(), UploadError> {
        let result = self.sink().delete(key).await;
        if self.pipeline.metrics_enabled() {
            let status = match &result {
                Ok(()) => "success",
                Err(StoreError::NotFound { .. }) => "not_found",
                Err(_) => "failure",
            };
            metrics::record_removal(self.bucket(), status);
        }

        match result {
            Ok(()) => {
                tracing::info!(key, "Object removed");
                Ok(())
            }
            Err(e) => Err(UploadError::Store {
                suffix: suffix.map(String::from),
                source: e,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolve::Static;
    use crate::storage::MemorySink;
    use crate::upload::FileInfo;

    fn engine(sink: Arc<MemorySink>) -> StorageEngine {
        let mut config = Config::for_bucket("media", "us-east-1");
        config.metrics.enabled = false;
        StorageEngine::new(&config, sink)
            .unwrap()
            .with_transforms(Arc::new(PassThrough))
    }

    #[test]
    fn test_new_validates_config() {
        let config = Config::for_bucket("", "us-east-1");
        let result = StorageEngine::new(&config, Arc::new(MemorySink::new("media")));
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));
    }

    #[tokio::test]
    async fn test_write_options_follow_config() {
        let sink = Arc::new(MemorySink::new("media"));
        let mut config = Config::for_bucket("media", "us-east-1");
        config.transform.kind = TransformKind::Identity;
        config.upload.acl = Some("public-read".into());
        config.upload.metadata.insert("owner".into(), "alice".into());

        let engine = StorageEngine::new(&config, sink.clone())
            .unwrap()
            .with_filename(Static("doc".to_string()));
        engine
            .handle_file(
                &RequestContext::new(),
                FileUpload::from_bytes(FileInfo::new("doc.txt", "text/plain"), "hello"),
            )
            .await
            .unwrap();

        let object = sink.get("doc").unwrap();
        assert_eq!(object.options.acl.as_deref(), Some("public-read"));
        assert_eq!(object.options.metadata["owner"], "alice");
        assert_eq!(object.options.content_type, "text/plain");
    }

    #[tokio::test]
    async fn test_remove_file_under_destination() {
        let sink = Arc::new(MemorySink::new("media"));
        let engine = engine(sink.clone())
            .with_destination(Static(Some("docs".to_string())))
            .with_filename(Static("notes".to_string()));

        let outcome = engine
            .handle_file(
                &RequestContext::new(),
                FileUpload::from_bytes(FileInfo::new("notes.txt", "text/plain"), "x"),
            )
            .await
            .unwrap();
        assert_eq!(outcome.as_single().unwrap().filename, "docs/notes");

        let descriptor = FileDescriptor::new(FileInfo::new("notes.txt", "text/plain"), "notes");
        engine
            .remove_file(&RequestContext::new(), &descriptor)
            .await
            .unwrap();
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn test_remove_variants() {
        let sink = Arc::new(MemorySink::new("media"));
        let engine = engine(sink.clone())
            .with_filename(Static("cat".to_string()))
            .with_sizes(Static(Some(vec![VariantSpec::new("sm"), VariantSpec::new("lg")])));

        let outcome = engine
            .handle_file(
                &RequestContext::new(),
                FileUpload::from_bytes(FileInfo::new("cat.png", "image/png"), "img"),
            )
            .await
            .unwrap();
        assert_eq!(sink.len(), 2);

        engine
            .remove_variants(&RequestContext::new(), outcome.as_variants().unwrap())
            .await
            .unwrap();
        assert!(sink.is_empty());
    }

    #[test]
    #[serial_test::serial]
    fn test_connect_requires_identity() {
        std::env::remove_var("AWS_ACCESS_KEY_ID");
        std::env::remove_var("AWS_SECRET_ACCESS_KEY");

        let config = Config::for_bucket("media", "us-east-1");
        let result = StorageEngine::connect(&config);
        assert!(matches!(result, Err(ConfigError::MissingIdentity(_))));
    }
}
