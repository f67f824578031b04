//! Storage Engine Integration Tests
//!
//! Drives `StorageEngine::handle_file` / `remove_file` end to end against the
//! in-memory sink.
//!
//! ## Test Coverage
//!
//! - Single-output records and multi-variant aggregates
//! - Variant key naming with and without a key prefix
//! - Removal, including removing the same file twice
//! - Failure handling under both failure policies
//! - Resolver failures, source failures, gzip bodies
//! - Real image variants through the image transform

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use futures::{stream, StreamExt};
    use mizuchi_fanout::config::{Config, FailurePolicy, TransformKind};
    use mizuchi_fanout::resolve::{Dynamic, RequestContext, Static};
    use mizuchi_fanout::storage::{MemorySink, StoreError};
    use mizuchi_fanout::transform::{
        OutputFormat, TransformError, TransformFactory, TransformOptions, TransformStream,
        Transformer, VariantSpec,
    };
    use mizuchi_fanout::upload::{ByteStream, FileDescriptor, FileInfo, FileUpload};
    use mizuchi_fanout::{StorageEngine, UploadError, UploadOutcome};
    use std::io;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::Notify;

    fn config() -> Config {
        let mut config = Config::for_bucket("media", "us-east-1");
        config.transform.kind = TransformKind::Identity;
        config.metrics.enabled = false;
        config
    }

    fn engine(sink: Arc<MemorySink>) -> StorageEngine {
        StorageEngine::new(&config(), sink)
            .unwrap()
            .with_filename(Static("cat".to_string()))
    }

    fn sizes(suffixes: &[&str]) -> Static<Option<Vec<VariantSpec>>> {
        Static(Some(suffixes.iter().map(|s| VariantSpec::new(*s)).collect()))
    }

    fn cat() -> FileUpload {
        FileUpload::from_bytes(FileInfo::new("cat.png", "image/png"), "not really a png")
    }

    /// Fails variant "sm"; holds every other variant until the gate opens
    struct GatedFailure {
        gate: Arc<Notify>,
    }

    struct GatedTransformer {
        fail: bool,
        gate: Arc<Notify>,
    }

    impl TransformFactory for GatedFailure {
        fn create(
            &self,
            _options: &TransformOptions,
            variant: Option<&VariantSpec>,
        ) -> Result<Box<dyn Transformer>, TransformError> {
            Ok(Box::new(GatedTransformer {
                fail: variant.is_some_and(|v| v.suffix == "sm"),
                gate: self.gate.clone(),
            }))
        }
    }

    impl Transformer for GatedTransformer {
        fn output_format(&self) -> Option<OutputFormat> {
            None
        }

        fn transform(self: Box<Self>, input: ByteStream) -> TransformStream {
            let output: ByteStream = if self.fail {
                stream::iter(vec![Err(io::Error::other("cannot resize"))]).boxed()
            } else {
                let gate = self.gate;
                stream::once(async move {
                    gate.notified().await;
                    input
                })
                .flatten()
                .boxed()
            };
            TransformStream { output, info: None }
        }
    }

    async fn wait_for(sink: &MemorySink, key: &str) -> bool {
        for _ in 0..100 {
            if sink.contains(key) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    // ========================================================================
    // Single output
    // ========================================================================

    #[tokio::test]
    async fn test_single_upload_record() {
        let sink = Arc::new(MemorySink::new("media"));
        let outcome = engine(sink.clone())
            .handle_file(&RequestContext::new(), cat())
            .await
            .unwrap();

        let record = outcome.as_single().expect("single record");
        assert_eq!(record.filename, "cat");
        assert_eq!(record.mimetype, "image/png");
        assert!(record.path.contains("media"));
        assert!(record.path.ends_with(&record.filename));
        assert!(record.suffix.is_none());

        let json = serde_json::to_value(&outcome).unwrap();
        assert!(json.get("suffix").is_none());
        assert_eq!(json["filename"], "cat");

        assert_eq!(
            sink.get("cat").unwrap().data,
            Bytes::from_static(b"not really a png")
        );
    }

    #[tokio::test]
    async fn test_random_filename_by_default() {
        let sink = Arc::new(MemorySink::new("media"));
        let engine = StorageEngine::new(&config(), sink.clone()).unwrap();

        let outcome = engine
            .handle_file(&RequestContext::new(), cat())
            .await
            .unwrap();
        let filename = &outcome.as_single().unwrap().filename;
        assert_eq!(filename.len(), 32);
        assert!(sink.contains(filename));
    }

    // ========================================================================
    // Variants
    // ========================================================================

    #[tokio::test]
    async fn test_variants_aggregate() {
        let sink = Arc::new(MemorySink::new("media"));
        let outcome = engine(sink.clone())
            .with_sizes(sizes(&["sm", "lg"]))
            .handle_file(&RequestContext::new(), cat())
            .await
            .unwrap();

        let variants = outcome.as_variants().expect("aggregate");
        assert_eq!(variants.len(), 2);
        assert_eq!(variants["sm"].filename, "cat-sm.png");
        assert_eq!(variants["lg"].filename, "cat-lg.png");
        assert_eq!(variants["sm"].path, "https://storage.local/media/cat-sm.png");

        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["lg"]["path"], "https://storage.local/media/cat-lg.png");
        assert_eq!(json["lg"]["filename"], "cat-lg.png");

        assert_eq!(sink.get("cat-sm.png").unwrap().data, sink.get("cat-lg.png").unwrap().data);
    }

    #[tokio::test]
    async fn test_variant_key_prefix() {
        let sink = Arc::new(MemorySink::new("media"));
        let outcome = engine(sink.clone())
            .with_sizes(sizes(&["sm"]))
            .with_key_prefix(Static(Some("thumb".to_string())))
            .handle_file(&RequestContext::new(), cat())
            .await
            .unwrap();

        assert_eq!(outcome.as_variants().unwrap()["sm"].filename, "thumb-cat-sm.png");
        assert_eq!(sink.keys(), vec!["thumb-cat-sm.png".to_string()]);
    }

    #[tokio::test]
    async fn test_dynamic_lookups_from_request() {
        let sink = Arc::new(MemorySink::new("media"));
        let engine = engine(sink.clone())
            .with_destination(Dynamic(|ctx: &RequestContext, _: &FileInfo| {
                let user = ctx.field("user").unwrap_or("anonymous").to_string();
                async move { Ok::<_, anyhow::Error>(Some(format!("users/{}", user))) }
            }))
            .with_sizes(sizes(&["sm"]));

        let ctx = RequestContext::new().with_field("user", "alice");
        let outcome = engine.handle_file(&ctx, cat()).await.unwrap();
        assert_eq!(
            outcome.as_variants().unwrap()["sm"].filename,
            "users/alice/cat-sm.png"
        );
    }

    // ========================================================================
    // Failures
    // ========================================================================

    #[tokio::test]
    async fn test_detached_sibling_completes_after_failure() {
        let sink = Arc::new(MemorySink::new("media"));
        let gate = Arc::new(Notify::new());
        let engine = engine(sink.clone())
            .with_failure_policy(FailurePolicy::Detach)
            .with_transforms(Arc::new(GatedFailure { gate: gate.clone() }))
            .with_sizes(sizes(&["sm", "lg"]));

        let err = engine
            .handle_file(&RequestContext::new(), cat())
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::Transform { .. }));
        assert_eq!(err.suffix(), Some("sm"));

        // lg was still in flight when the upload failed
        assert!(!sink.contains("cat-lg.png"));
        gate.notify_one();
        assert!(wait_for(&sink, "cat-lg.png").await);
        assert!(!sink.contains("cat-sm.png"));
    }

    #[tokio::test]
    async fn test_cancelled_siblings_are_torn_down() {
        let sink = Arc::new(MemorySink::new("media"));
        // never opened: lg can only finish by being cancelled
        let gate = Arc::new(Notify::new());
        let engine = engine(sink.clone())
            .with_failure_policy(FailurePolicy::CancelSiblings)
            .with_transforms(Arc::new(GatedFailure { gate }))
            .with_sizes(sizes(&["sm", "lg", "xl"]));

        let err = tokio::time::timeout(
            Duration::from_secs(5),
            engine.handle_file(&RequestContext::new(), cat()),
        )
        .await
        .expect("siblings were not cancelled")
        .unwrap_err();

        assert_eq!(err.suffix(), Some("sm"));
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn test_resolver_failure_starts_nothing() {
        let sink = Arc::new(MemorySink::new("media"));
        let engine = engine(sink.clone()).with_sizes(Dynamic(|_: &RequestContext, _: &FileInfo| async {
            Err::<Option<Vec<VariantSpec>>, _>(anyhow::anyhow!("size service unavailable"))
        }));

        let err = engine
            .handle_file(&RequestContext::new(), cat())
            .await
            .unwrap_err();
        match &err {
            UploadError::Resolver { resolver, .. } => assert_eq!(*resolver, "sizes"),
            other => panic!("unexpected error: {other}"),
        }
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn test_source_failure_rejects_aggregate() {
        let sink = Arc::new(MemorySink::new("media"));
        let source: ByteStream = stream::iter(vec![
            Ok(Bytes::from_static(b"first chunk")),
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "client went away")),
        ])
        .boxed();

        let err = engine(sink.clone())
            .with_sizes(sizes(&["sm", "lg"]))
            .handle_file(
                &RequestContext::new(),
                FileUpload::from_stream(FileInfo::new("cat.png", "image/png"), source),
            )
            .await
            .unwrap_err();

        assert_eq!(err.kind(), "source");
        assert!(sink.is_empty());
    }

    // ========================================================================
    // Removal
    // ========================================================================

    #[tokio::test]
    async fn test_remove_twice() {
        let sink = Arc::new(MemorySink::new("media"));
        let engine = engine(sink.clone());
        let ctx = RequestContext::new();

        let outcome = engine.handle_file(&ctx, cat()).await.unwrap();
        let descriptor = FileDescriptor::new(
            FileInfo::new("cat.png", "image/png"),
            outcome.as_single().unwrap().filename.clone(),
        );

        engine.remove_file(&ctx, &descriptor).await.unwrap();
        let err = engine.remove_file(&ctx, &descriptor).await.unwrap_err();
        match err {
            UploadError::Store { source, .. } => {
                assert!(matches!(source, StoreError::NotFound { .. }))
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    // ========================================================================
    // Write options
    // ========================================================================

    #[tokio::test]
    async fn test_gzip_upload() {
        use std::io::Read;

        let sink = Arc::new(MemorySink::new("media"));
        let mut config = config();
        config.upload.gzip = true;
        let engine = StorageEngine::new(&config, sink.clone())
            .unwrap()
            .with_filename(Static("notes".to_string()));

        engine
            .handle_file(
                &RequestContext::new(),
                FileUpload::from_bytes(FileInfo::new("notes.txt", "text/plain"), "plain text body"),
            )
            .await
            .unwrap();

        let object = sink.get("notes").unwrap();
        assert!(object.options.gzip);
        let mut text = String::new();
        flate2::read::GzDecoder::new(&object.data[..])
            .read_to_string(&mut text)
            .unwrap();
        assert_eq!(text, "plain text body");
    }

    // ========================================================================
    // Image variants
    // ========================================================================

    fn png(width: u32, height: u32) -> Vec<u8> {
        let img = image::RgbImage::from_pixel(width, height, image::Rgb([200, 40, 40]));
        let mut out = std::io::Cursor::new(Vec::new());
        img.write_to(&mut out, image::ImageFormat::Png).unwrap();
        out.into_inner()
    }

    fn jpeg(width: u32, height: u32) -> Vec<u8> {
        let img = image::RgbImage::from_pixel(width, height, image::Rgb([40, 200, 40]));
        let mut out = std::io::Cursor::new(Vec::new());
        img.write_to(&mut out, image::ImageFormat::Jpeg).unwrap();
        out.into_inner()
    }

    #[tokio::test]
    async fn test_image_keeps_declared_mimetype_without_format() {
        let sink = Arc::new(MemorySink::new("media"));
        let mut config = config();
        config.transform.kind = TransformKind::Image;
        let engine = StorageEngine::new(&config, sink.clone())
            .unwrap()
            .with_filename(Static("cat".to_string()))
            .with_sizes(Static(Some(vec![
                VariantSpec::new("sm").with_size(Some(8), None)
            ])));

        // JPEG bytes sent as image/png
        engine
            .handle_file(
                &RequestContext::new(),
                FileUpload::from_bytes(FileInfo::new("cat.png", "image/png"), jpeg(16, 16)),
            )
            .await
            .unwrap();

        let small = sink.get("cat-sm.png").unwrap();
        assert_eq!(small.options.content_type, "image/png");
        assert_eq!(&small.data[..2], &[0xff, 0xd8]);
    }

    #[tokio::test]
    async fn test_image_variants() {
        let sink = Arc::new(MemorySink::new("media"));
        let mut config = config();
        config.transform.kind = TransformKind::Image;
        let engine = StorageEngine::new(&config, sink.clone())
            .unwrap()
            .with_filename(Static("cat".to_string()))
            .with_sizes(Static(Some(vec![
                VariantSpec::new("sm").with_size(Some(10), None),
                VariantSpec::new("lg")
                    .with_size(Some(20), None)
                    .with_format(OutputFormat::Jpeg),
            ])));

        let outcome = engine
            .handle_file(
                &RequestContext::new(),
                FileUpload::from_bytes(FileInfo::new("cat.png", "image/png"), png(40, 20)),
            )
            .await
            .unwrap();
        assert!(matches!(outcome, UploadOutcome::Variants(_)));

        let small = sink.get("cat-sm.png").unwrap();
        assert_eq!(small.options.content_type, "image/png");
        let decoded = image::load_from_memory(&small.data).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (10, 5));

        let large = sink.get("cat-lg.png").unwrap();
        assert_eq!(large.options.content_type, "image/jpeg");
        assert_eq!(&large.data[..2], &[0xff, 0xd8]);
    }
}
