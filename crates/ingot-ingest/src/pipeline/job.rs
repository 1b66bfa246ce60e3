//! Fetch → process → persist orchestration
//!
//! [`Job::run`] drains the fetcher into batches of `batch_size` consecutive
//! items, pushes each batch through the processor, hands batches with at
//! least one success to the persistence adapter and folds every outcome into
//! the run's counts. Batches run one after another and always complete.
//!
//! The run stops early, still returning statistics, when:
//! - the fetcher yields an error (items buffered before it are processed),
//! - `max_consecutive_failed_batches` batches in a row produce no success.
//!
//! A failed write turns the batch's successes into failures and is also
//! tallied separately in [`Statistics::persist_failures`].

use chrono::Utc;
use futures::StreamExt;
use std::marker::PhantomData;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::counts::{Counts, CountsAccumulator, Statistics};
use super::fetcher::Fetcher;
use super::outcome::{Cause, Outcome};
use super::processor::Processor;
use crate::persist::PersistenceAdapter;

/// Default number of items per batch
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Settings of one job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobConfig {
    /// Name used in logs and statistics
    pub name: String,
    pub batch_size: usize,
    /// Abort after this many consecutive batches without a single success
    pub max_consecutive_failed_batches: Option<usize>,
}

impl JobConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            batch_size: DEFAULT_BATCH_SIZE,
            max_consecutive_failed_batches: None,
        }
    }

    /// Items per batch (at least 1)
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_max_consecutive_failed_batches(mut self, limit: usize) -> Self {
        self.max_consecutive_failed_batches = Some(limit.max(1));
        self
    }
}

/// One configured pipeline run
pub struct Job<I, O, F, P> {
    config: JobConfig,
    fetcher: F,
    processor: P,
    persistence: Box<dyn PersistenceAdapter<O>>,
    _input: PhantomData<fn() -> I>,
}

#[derive(Default)]
struct RunState {
    counts: CountsAccumulator,
    batches: u64,
    batches_persisted: u64,
    persist_failures: u64,
    consecutive_failed: usize,
}

impl<I, O, F, P> Job<I, O, F, P>
where
    I: Send + 'static,
    O: Send + Sync + 'static,
    F: Fetcher<I>,
    P: Processor<I, O>,
{
    pub fn new(
        config: JobConfig,
        fetcher: F,
        processor: P,
        persistence: impl PersistenceAdapter<O> + 'static,
    ) -> Self {
        Self {
            config,
            fetcher,
            processor,
            persistence: Box::new(persistence),
            _input: PhantomData,
        }
    }

    pub fn config(&self) -> &JobConfig {
        &self.config
    }

    /// Execute the job to completion (or abort) and report
    pub async fn run(self) -> Statistics {
        let Job {
            config,
            fetcher,
            processor,
            mut persistence,
            ..
        } = self;

        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let batch_size = config.batch_size.max(1);
        info!(job = %config.name, %run_id, batch_size, "Starting job");

        let mut state = RunState::default();
        let mut aborted: Option<String> = None;
        let mut stream = fetcher.fetch_all();
        let mut buffer: Vec<Outcome<I>> = Vec::with_capacity(batch_size);

        loop {
            let (exhausted, flush) = match stream.next().await {
                Some(Ok(item)) => {
                    buffer.push(Outcome::from(item));
                    (false, buffer.len() >= batch_size)
                },
                Some(Err(e)) => {
                    error!(job = %config.name, error = %format!("{:#}", e), "Fetch failed, aborting run");
                    aborted = Some(format!("fetch failed: {:#}", e));
                    (true, true)
                },
                None => (true, true),
            };

            if flush && !buffer.is_empty() {
                let batch = std::mem::replace(&mut buffer, Vec::with_capacity(batch_size));
                let counts = run_batch(&config, &processor, persistence.as_mut(), &mut state, batch).await;

                if counts.success == 0 {
                    state.consecutive_failed += 1;
                } else {
                    state.consecutive_failed = 0;
                }

                if let Some(limit) = config.max_consecutive_failed_batches {
                    if aborted.is_none() && state.consecutive_failed >= limit {
                        warn!(
                            job = %config.name,
                            consecutive = state.consecutive_failed,
                            "Too many consecutive failed batches, aborting run"
                        );
                        aborted = Some(format!(
                            "{} consecutive batches without a success",
                            state.consecutive_failed
                        ));
                    }
                }
            }

            if exhausted || aborted.is_some() {
                break;
            }
        }

        let stats = Statistics::new(
            run_id,
            config.name,
            state.counts.snapshot(),
            state.batches,
            state.batches_persisted,
            state.persist_failures,
            aborted,
            started_at,
        );
        info!(%run_id, "{}", stats.summary());
        stats
    }
}

/// Process one batch, persist it if anything succeeded and fold its outcomes
/// into the run state. Returns the batch's final counts.
async fn run_batch<I, O, P>(
    config: &JobConfig,
    processor: &P,
    persistence: &mut dyn PersistenceAdapter<O>,
    state: &mut RunState,
    batch: Vec<Outcome<I>>,
) -> Counts
where
    I: Send + 'static,
    O: Send + Sync + 'static,
    P: Processor<I, O>,
{
    state.batches += 1;
    let number = state.batches;
    let size = batch.len();

    let outcomes = processor.process(batch).await;
    let mut counts = Counts::of(&outcomes);
    if outcomes.len() != size {
        warn!(
            job = %config.name,
            batch = number,
            inputs = size,
            outcomes = outcomes.len(),
            "Processor changed batch cardinality"
        );
    }

    if counts.success > 0 {
        let destination = persistence.destination(&outcomes);
        match persistence.write(&destination, &outcomes).await {
            Ok(persisted) => {
                state.batches_persisted += 1;
                debug!(
                    job = %config.name,
                    batch = number,
                    path = %persisted.path.display(),
                    records = persisted.records,
                    "Persisted batch"
                );
            },
            Err(e) => {
                state.persist_failures += 1;
                let cause = Cause::new(anyhow::Error::new(e));
                error!(
                    job = %config.name,
                    batch = number,
                    path = %destination.display(),
                    error = %cause,
                    "Failed to persist batch"
                );
                let flipped: Vec<Outcome<O>> = outcomes
                    .into_iter()
                    .map(|outcome| match outcome {
                        Outcome::Success { id, .. } => Outcome::failure(id, cause.clone()),
                        failure => failure,
                    })
                    .collect();
                counts = Counts::of(&flipped);
            },
        }
    }

    state.counts.add(counts);
    info!(
        job = %config.name,
        batch = number,
        success = counts.success,
        failure = counts.failure,
        "Batch complete"
    );
    counts
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::persist::{Discard, MemorySink, PersistError, PersistedBatch};
    use crate::pipeline::fetcher::{CollectionFetcher, ListingFetcher};
    use crate::pipeline::outcome::Item;
    use crate::pipeline::processor::BatchProcessor;
    use async_trait::async_trait;
    use std::path::{Path, PathBuf};

    fn doubler() -> impl Processor<u32, u32> {
        BatchProcessor::new(|xs: Vec<u32>| async move {
            Ok::<_, anyhow::Error>(xs.into_iter().map(|x| x * 2).collect::<Vec<_>>())
        })
    }

    struct FailingWriter;

    #[async_trait]
    impl PersistenceAdapter<u32> for FailingWriter {
        fn destination(&mut self, _batch: &[Outcome<u32>]) -> PathBuf {
            PathBuf::from("/nowhere/batch_1")
        }

        async fn write(
            &mut self,
            _destination: &Path,
            _batch: &[Outcome<u32>],
        ) -> Result<PersistedBatch, PersistError> {
            Err(PersistError::Rejected("disk full".to_string()))
        }
    }

    #[tokio::test]
    async fn test_batches_respect_size_and_order() {
        let sink = MemorySink::new();
        let job = Job::new(
            JobConfig::new("doubling").with_batch_size(2),
            CollectionFetcher::from_values(vec![1u32, 2, 3, 4, 5]),
            doubler(),
            sink.clone(),
        );

        let stats = job.run().await;

        assert_eq!(stats.batches(), 3);
        assert_eq!(stats.batches_persisted(), 3);
        assert_eq!(stats.success(), 5);
        assert!(stats.all_success());

        let stored = sink.batches();
        let sizes: Vec<usize> = stored.iter().map(|b| b.outcomes.len()).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
        assert_eq!(stored[2].name, "memory_3");
        assert_eq!(stored[2].outcomes[0].value(), Some(&10));
    }

    #[tokio::test]
    async fn test_failed_batch_is_counted_but_not_persisted() {
        let sink = MemorySink::new();
        let failing = BatchProcessor::new(|_xs: Vec<u32>| async move {
            Err::<Vec<u32>, _>(anyhow::anyhow!("service down"))
        });
        let job = Job::new(
            JobConfig::new("failing").with_batch_size(3),
            CollectionFetcher::from_values(vec![1u32, 2, 3]),
            failing,
            sink.clone(),
        );

        let stats = job.run().await;

        assert_eq!(stats.failure(), 3);
        assert!(stats.all_failed());
        assert_eq!(stats.batches_persisted(), 0);
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn test_persist_failure_flips_successes() {
        let job = Job::new(
            JobConfig::new("unwritable").with_batch_size(10),
            CollectionFetcher::from_values(vec![1u32, 2]),
            doubler(),
            FailingWriter,
        );

        let stats = job.run().await;

        assert_eq!(stats.success(), 0);
        assert_eq!(stats.failure(), 2);
        assert_eq!(stats.persist_failures(), 1);
        assert_eq!(stats.batches_persisted(), 0);
    }

    #[tokio::test]
    async fn test_fetch_error_aborts_after_buffered_items() {
        let fetcher = ListingFetcher::new(|| async {
            Err::<Vec<Item<u32>>, _>(anyhow::anyhow!("listing refused"))
        });
        let job = Job::new(JobConfig::new("listing"), fetcher, doubler(), Discard);

        let stats = job.run().await;

        assert_eq!(stats.total(), 0);
        assert_eq!(stats.aborted(), Some("fetch failed: listing refused"));
    }

    #[tokio::test]
    async fn test_empty_run_reports_vacuous_success() {
        let job = Job::new(
            JobConfig::new("empty"),
            CollectionFetcher::<u32>::new(Vec::new()),
            doubler(),
            Discard,
        );

        let stats = job.run().await;

        assert_eq!(stats.total(), 0);
        assert_eq!(stats.batches(), 0);
        assert!(stats.all_success() && stats.all_failed());
        assert!(stats.aborted().is_none());
    }

    #[tokio::test]
    async fn test_consecutive_failed_batches_abort_run() {
        let failing = BatchProcessor::new(|_xs: Vec<u32>| async move {
            Err::<Vec<u32>, _>(anyhow::anyhow!("rejected"))
        });
        let job = Job::new(
            JobConfig::new("hopeless")
                .with_batch_size(1)
                .with_max_consecutive_failed_batches(2),
            CollectionFetcher::from_values(vec![1u32, 2, 3, 4, 5]),
            failing,
            Discard,
        );

        let stats = job.run().await;

        assert_eq!(stats.batches(), 2);
        assert_eq!(stats.failure(), 2);
        assert!(stats.aborted().unwrap().contains("2 consecutive batches"));
    }
}
