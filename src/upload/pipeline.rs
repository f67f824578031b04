//! Variant pipeline
//!
//! One pipeline turns one input stream into one stored object:
//!
//! ```text
//! input ─► [watch: source] ─► transformer ─► [watch: transform, cancel] ─► [gzip] ─► sink.put
//! ```
//!
//! The watchers record the first failure seen on either side of the
//! transform, so a failed put can be attributed to the stage that broke it.
//! Cancellation is injected as a stream error, which makes the sink abandon
//! the object the same way it would for any other broken body.

use super::{key, ByteStream, FileInfo, ResultRecord, UploadError};
use crate::metrics;
use crate::storage::{GzipStream, ObjectSink, WriteOptions};
use crate::transform::{TransformFactory, TransformObserver, TransformOptions, VariantSpec};
use bytes::Bytes;
use futures::{ready, Future, Stream, StreamExt};
use parking_lot::Mutex;
use pin_project_lite::pin_project;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

/// Everything resolved for one upload, shared by all its pipelines
#[derive(Debug, Clone)]
pub struct UploadPlan {
    pub file: FileInfo,
    pub destination: Option<String>,
    pub filename: String,
    pub key_prefix: Option<String>,
    /// Object options; the content type is filled in per pipeline
    pub write: WriteOptions,
}

impl UploadPlan {
    pub fn new(file: FileInfo, filename: impl Into<String>) -> Self {
        Self {
            file,
            destination: None,
            filename: filename.into(),
            key_prefix: None,
            write: WriteOptions::default(),
        }
    }

    /// Object key for `variant`, or the single-output key without one
    pub fn key_for(&self, variant: Option<&VariantSpec>) -> String {
        match variant {
            Some(variant) => key::variant_key(
                self.destination.as_deref(),
                self.key_prefix.as_deref(),
                &self.filename,
                &variant.suffix,
                self.file.extension(),
            ),
            None => key::single_key(self.destination.as_deref(), &self.filename),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Stage {
    Source,
    Transform,
}

#[derive(Debug)]
enum Failure {
    Source(io::Error),
    Transform(io::Error),
    Cancelled,
}

type FailureSlot = Arc<Mutex<Option<Failure>>>;

fn record_failure(slot: &FailureSlot, failure: Failure) {
    let mut slot = slot.lock();
    if slot.is_none() {
        *slot = Some(failure);
    }
}

pin_project! {
    /// Stream adapter that records the first error it passes on
    struct Watched {
        #[pin]
        inner: ByteStream,
        stage: Stage,
        failure: FailureSlot,
        cancelled: Option<Pin<Box<WaitForCancellationFutureOwned>>>,
        done: bool,
    }
}

impl Watched {
    fn new(inner: ByteStream, stage: Stage, failure: FailureSlot) -> Self {
        Self {
            inner,
            stage,
            failure,
            cancelled: None,
            done: false,
        }
    }

    /// Also end the stream with an error once `token` is cancelled
    fn with_cancel(mut self, token: &CancellationToken) -> Self {
        self.cancelled = Some(Box::pin(token.clone().cancelled_owned()));
        self
    }
}

impl Stream for Watched {
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();
        if *this.done {
            return Poll::Ready(None);
        }

        if let Some(cancelled) = this.cancelled.as_mut() {
            if cancelled.as_mut().poll(cx).is_ready() {
                *this.done = true;
                record_failure(this.failure, Failure::Cancelled);
                return Poll::Ready(Some(Err(io::Error::new(
                    io::ErrorKind::Interrupted,
                    "upload cancelled",
                ))));
            }
        }

        match ready!(this.inner.poll_next(cx)) {
            Some(Err(e)) => {
                *this.done = true;
                let copy = io::Error::new(e.kind(), e.to_string());
                let failure = match this.stage {
                    Stage::Source => Failure::Source(copy),
                    Stage::Transform => Failure::Transform(copy),
                };
                record_failure(this.failure, failure);
                Poll::Ready(Some(Err(e)))
            }
            None => {
                *this.done = true;
                Poll::Ready(None)
            }
            item => Poll::Ready(item),
        }
    }
}

/// Transform-and-store pipeline
///
/// Cheap to clone; every clone shares the sink, transform factory and
/// observer.
#[derive(Clone)]
pub struct Pipeline {
    sink: Arc<dyn ObjectSink>,
    transforms: Arc<dyn TransformFactory>,
    options: TransformOptions,
    observer: Arc<dyn TransformObserver>,
    metrics: bool,
}

impl Pipeline {
    pub fn new(
        sink: Arc<dyn ObjectSink>,
        transforms: Arc<dyn TransformFactory>,
        options: TransformOptions,
        observer: Arc<dyn TransformObserver>,
    ) -> Self {
        Self {
            sink,
            transforms,
            options,
            observer,
            metrics: true,
        }
    }

    pub fn with_metrics(mut self, enabled: bool) -> Self {
        self.metrics = enabled;
        self
    }

    pub fn sink(&self) -> &Arc<dyn ObjectSink> {
        &self.sink
    }

    pub fn metrics_enabled(&self) -> bool {
        self.metrics
    }

    pub(crate) fn set_transforms(&mut self, transforms: Arc<dyn TransformFactory>) {
        self.transforms = transforms;
    }

    pub(crate) fn set_observer(&mut self, observer: Arc<dyn TransformObserver>) {
        self.observer = observer;
    }

    /// Transform `source` and store it under the key for `variant`
    ///
    /// Nothing is left in the store when this returns an error.
    #[tracing::instrument(
        name = "upload.pipeline",
        skip_all,
        fields(
            variant = variant.map(|v| v.suffix.as_str()).unwrap_or("-"),
            s3.key = tracing::field::Empty
        ),
        err
    )]
    pub async fn run(
        &self,
        plan: &UploadPlan,
        variant: Option<&VariantSpec>,
        source: ByteStream,
        cancel: &CancellationToken,
    ) -> Result<ResultRecord, UploadError> {
        let suffix = variant.map(|v| v.suffix.clone());
        let key = plan.key_for(variant);
        tracing::Span::current().record("s3.key", key.as_str());

        let result = self.execute(plan, variant, &key, source, cancel).await;
        if self.metrics {
            match &result {
                Ok((_, bytes)) => metrics::record_variant_success(self.sink.bucket(), *bytes),
                Err(e) => metrics::record_variant_failure(self.sink.bucket(), e.kind()),
            }
        }

        result.map(|(mimetype, _)| ResultRecord {
            mimetype,
            path: key::public_url(&self.sink.public_base_url(), self.sink.bucket(), &key),
            filename: key,
            suffix,
        })
    }

    async fn execute(
        &self,
        plan: &UploadPlan,
        variant: Option<&VariantSpec>,
        key: &str,
        source: ByteStream,
        cancel: &CancellationToken,
    ) -> Result<(String, u64), UploadError> {
        let suffix = || variant.map(|v| v.suffix.clone());

        let transformer = self
            .transforms
            .create(&self.options, variant)
            .map_err(|e| UploadError::Transform {
                suffix: suffix(),
                source: e.into(),
            })?;
        let mimetype = transformer
            .output_format()
            .map(|format| format.content_type().to_string())
            .unwrap_or_else(|| plan.file.mimetype.clone());

        let failure: FailureSlot = Arc::new(Mutex::new(None));
        let input = Watched::new(source, Stage::Source, failure.clone()).boxed();
        let running = transformer.transform(input);
        let mut info = running.info;

        let mut body = Watched::new(running.output, Stage::Transform, failure.clone())
            .with_cancel(cancel)
            .boxed();
        if plan.write.gzip {
            body = GzipStream::new(body).boxed();
        }

        let options = plan.write.with_content_type(&mimetype);
        let stored = self.sink.put(key, &options, body).await;

        let failure = failure.lock().take();
        if let Some(failure) = failure {
            if stored.is_ok() {
                // the sink accepted a body that ended in an error
                if let Err(e) = self.sink.delete(key).await {
                    tracing::warn!(key, error = %e, "Failed to remove partial object");
                }
            }
            return Err(match failure {
                Failure::Source(e) => UploadError::Source(e),
                Failure::Transform(e) => UploadError::Transform {
                    suffix: suffix(),
                    source: e,
                },
                Failure::Cancelled => UploadError::Cancelled { suffix: suffix() },
            });
        }

        let stored = stored.map_err(|e| UploadError::Store {
            suffix: suffix(),
            source: e,
        })?;

        if let Some(info) = info.as_mut().and_then(|rx| rx.try_recv().ok()) {
            self.observer.on_info(key, variant.map(|v| v.suffix.as_str()), &info);
        }
        tracing::debug!(key, bytes = stored.bytes, mimetype = %mimetype, "Variant stored");

        Ok((mimetype, stored.bytes))
    }
}
