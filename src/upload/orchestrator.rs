//! Multi-variant orchestration
//!
//! Forks one upload into one pipeline per variant, runs them concurrently
//! and folds their records into an [`AggregateResult`].
//!
//! The first failure decides the outcome. What happens to the pipelines
//! still running depends on the [`FailurePolicy`]:
//!
//! - `CancelSiblings`: they are cancelled and awaited, and the fan-out pump
//!   is stopped, before the error is returned.
//! - `Detach`: they keep running in the background and their results are
//!   discarded.

use super::{
    AggregateResult, ByteStream, Pipeline, ResultRecord, StreamFanout, UploadError, UploadPlan,
    VariantLocation,
};
use crate::config::FailurePolicy;
use crate::metrics;
use crate::transform::VariantSpec;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

fn task_error(err: JoinError) -> UploadError {
    if err.is_panic() {
        UploadError::Task("pipeline panicked".into())
    } else {
        UploadError::Task(err.to_string())
    }
}

/// Runs the variant pipelines of one upload
#[derive(Clone)]
pub struct Orchestrator {
    pipeline: Arc<Pipeline>,
    policy: FailurePolicy,
}

impl Orchestrator {
    pub fn new(pipeline: Arc<Pipeline>, policy: FailurePolicy) -> Self {
        Self { pipeline, policy }
    }

    pub fn policy(&self) -> FailurePolicy {
        self.policy
    }

    /// Store every variant of `source`
    ///
    /// Returns the aggregate once all pipelines succeeded, or the first
    /// error. Variants sharing a suffix all run; the one that finishes last
    /// wins the aggregate entry.
    #[tracing::instrument(
        name = "upload.fanout",
        skip_all,
        fields(variants = variants.len(), filename = %plan.filename),
        err
    )]
    pub async fn run(
        &self,
        plan: Arc<UploadPlan>,
        variants: Vec<VariantSpec>,
        source: ByteStream,
    ) -> Result<AggregateResult, UploadError> {
        let mut seen = HashSet::new();
        for variant in &variants {
            if !seen.insert(variant.suffix.as_str()) {
                tracing::warn!(suffix = %variant.suffix, "Duplicate variant suffix");
            }
        }

        let cancel = CancellationToken::new();
        let mut fanout = StreamFanout::new(source);
        let mut tasks = JoinSet::new();

        for variant in variants {
            let input = fanout.subscribe();
            let pipeline = self.pipeline.clone();
            let plan = plan.clone();
            let token = cancel.child_token();
            tasks.spawn(
                async move {
                    pipeline
                        .run(&plan, Some(&variant), input, &token)
                        .await
                }
                .in_current_span(),
            );
        }

        let pump = fanout.spawn();
        let mut records: Vec<ResultRecord> = Vec::with_capacity(tasks.len());
        let mut failure: Option<UploadError> = None;

        while let Some(joined) = tasks.join_next().await {
            match joined.map_err(task_error).and_then(|result| result) {
                Ok(record) => records.push(record),
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        if let Some(err) = failure {
            match self.policy {
                FailurePolicy::CancelSiblings => {
                    cancel.cancel();
                    while let Some(joined) = tasks.join_next().await {
                        match joined.map_err(task_error).and_then(|result| result) {
                            Ok(record) => tracing::debug!(
                                key = %record.filename,
                                "Sibling finished before cancellation"
                            ),
                            Err(e) => tracing::debug!(error = %e, "Sibling pipeline stopped"),
                        }
                    }
                    pump.abort();
                }
                FailurePolicy::Detach => {
                    tracing::debug!(remaining = tasks.len(), "Detaching sibling pipelines");
                    tasks.detach_all();
                }
            }
            return Err(err);
        }

        match pump.await {
            Ok(stats) if self.pipeline.metrics_enabled() => metrics::record_source_bytes(stats.bytes),
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "Fan-out pump failed"),
        }

        let mut aggregate = AggregateResult::new();
        for record in &records {
            if let Some(suffix) = &record.suffix {
                if aggregate
                    .insert(suffix.clone(), VariantLocation::from(record))
                    .is_some()
                {
                    tracing::warn!(%suffix, key = %record.filename, "Variant result overwritten");
                }
            }
        }
        Ok(aggregate)
    }
}
