//! Bounded, retrying execution of a per-resource operation over many resources.
use std::{error::Error, fmt::Write, future::Future, time::Duration};

use futures::{StreamExt, stream};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::{
    convert, optimizer,
    resource::{ResourceKey, VersionedResource},
    store,
};

/// Errors which can tell whether retrying the failed operation may succeed.
pub trait RetryableError: Error {
    fn is_retryable(&self) -> bool;
}

impl RetryableError for convert::Error {
    /// Conversions are deterministic, the same input fails the same way again.
    fn is_retryable(&self) -> bool {
        false
    }
}

impl RetryableError for optimizer::Error {
    fn is_retryable(&self) -> bool {
        false
    }
}

impl RetryableError for store::Error {
    fn is_retryable(&self) -> bool {
        self.is_transient()
    }
}

/// Renders `error` and all of its sources on a single line.
pub fn error_chain(error: &dyn Error) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(error) = source {
        // Writing into a String can not fail
        let _ = write!(message, ": {error}");
        source = error.source();
    }
    message
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BatchConfig {
    pub batch_size: usize,
    pub max_concurrency: usize,

    /// Attempts per resource, including the first one.
    pub max_attempts: u32,
    pub retry_delay: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            max_concurrency: 5,
            max_attempts: 3,
            retry_delay: Duration::from_secs(1),
        }
    }
}

impl BatchConfig {
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceFailure {
    pub key: ResourceKey,
    pub message: String,
    pub attempts: u32,
}

/// The audit record of a batch run.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchResult {
    /// Resources which were attempted, successfully or not.
    pub total_processed: usize,
    pub successful: usize,
    pub failed: usize,

    /// Every retry attempt of every resource.
    pub retry_count: u64,
    pub batches_processed: usize,

    /// Resources which were never attempted because the run was cancelled.
    pub skipped: usize,
    pub cancelled: bool,

    /// Migrated resources written back in their source version because the
    /// migration failed.
    pub rolled_back: usize,

    #[serde(rename = "perResourceErrors")]
    pub errors: Vec<ResourceFailure>,
}

impl BatchResult {
    /// Records a resource which failed before it reached the batch processor.
    pub fn record_failure(&mut self, failure: ResourceFailure) {
        self.total_processed += 1;
        self.failed += 1;
        self.errors.push(failure);
    }

    /// Adds the counters of `other` to this result.
    pub fn merge(&mut self, other: Self) {
        self.total_processed += other.total_processed;
        self.successful += other.successful;
        self.failed += other.failed;
        self.retry_count += other.retry_count;
        self.batches_processed += other.batches_processed;
        self.skipped += other.skipped;
        self.cancelled |= other.cancelled;
        self.rolled_back += other.rolled_back;
        self.errors.extend(other.errors);
    }

    /// Records the outcomes of one batch. A batch counts as processed if at
    /// least one of its resources was attempted.
    fn record_batch(&mut self, outcomes: Vec<Outcome>) {
        if outcomes.iter().any(|outcome| !matches!(outcome, Outcome::Skipped)) {
            self.batches_processed += 1;
        }
        for outcome in outcomes {
            self.record(outcome);
        }
    }

    fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Succeeded { retries } => {
                self.total_processed += 1;
                self.successful += 1;
                self.retry_count += u64::from(retries);
            }
            Outcome::Failed { failure } => {
                self.retry_count += u64::from(failure.attempts.saturating_sub(1));
                self.record_failure(failure);
            }
            Outcome::Skipped => self.skipped += 1,
        }
    }
}

#[derive(Debug)]
enum Outcome {
    Succeeded { retries: u32 },
    Failed { failure: ResourceFailure },
    Skipped,
}

#[derive(Clone, Debug, Default)]
pub struct BatchProcessor {
    config: BatchConfig,
}

impl BatchProcessor {
    pub fn new(config: BatchConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    /// Runs `operation` for every resource, at most `max_concurrency` at a
    /// time, in batches of `batch_size`.
    ///
    /// Failures never abort the run. Once `cancel` is triggered no further
    /// resource is started and pending retries are abandoned, but operations
    /// in flight are awaited and the partial result is returned.
    #[instrument(skip_all, fields(resources = resources.len()))]
    pub async fn process_batch<F, Fut, E>(
        &self,
        resources: Vec<VersionedResource>,
        operation: F,
        cancel: &CancellationToken,
    ) -> BatchResult
    where
        F: Fn(VersionedResource) -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: RetryableError,
    {
        let batch_size = self.config.batch_size.max(1);
        let max_concurrency = self.config.max_concurrency.max(1);
        let mut result = BatchResult::default();

        let mut remaining = resources.into_iter().peekable();
        while remaining.peek().is_some() {
            let batch: Vec<_> = remaining.by_ref().take(batch_size).collect();
            if cancel.is_cancelled() {
                result.skipped += batch.len();
                continue;
            }

            let outcomes: Vec<_> = stream::iter(batch)
                .map(|resource| self.process_one(resource, &operation, cancel))
                .buffer_unordered(max_concurrency)
                .collect()
                .await;

            result.record_batch(outcomes);

            tracing::debug!(
                batch = result.batches_processed,
                successful = result.successful,
                failed = result.failed,
                "processed batch"
            );
        }

        result.cancelled = cancel.is_cancelled();
        tracing::info!(
            total_processed = result.total_processed,
            successful = result.successful,
            failed = result.failed,
            retry_count = result.retry_count,
            skipped = result.skipped,
            cancelled = result.cancelled,
            "finished batch processing"
        );
        result
    }

    async fn process_one<F, Fut, E>(
        &self,
        resource: VersionedResource,
        operation: &F,
        cancel: &CancellationToken,
    ) -> Outcome
    where
        F: Fn(VersionedResource) -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: RetryableError,
    {
        if cancel.is_cancelled() {
            return Outcome::Skipped;
        }

        let key = resource.key();
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempts = 0;

        let error = loop {
            attempts += 1;
            let error = match operation(resource.clone()).await {
                Ok(()) => {
                    return Outcome::Succeeded {
                        retries: attempts - 1,
                    };
                }
                Err(error) => error,
            };

            if !error.is_retryable() || attempts >= max_attempts {
                break error;
            }

            tracing::debug!(
                resource = %key,
                attempts,
                error = %error_chain(&error),
                "retrying failed resource"
            );
            tokio::select! {
                () = cancel.cancelled() => break error,
                () = tokio::time::sleep(self.config.retry_delay) => {}
            }
        };

        let message = error_chain(&error);
        tracing::warn!(resource = %key, attempts, error = %message, "failed to process resource");
        Outcome::Failed {
            failure: ResourceFailure {
                key,
                message,
                attempts,
            },
        }
    }
}
