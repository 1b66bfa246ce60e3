//! Retryable batch pipeline
//!
//! ```text
//! Fetcher ──items──▶ Job ──batches──▶ Processor(s) ──outcomes──▶ PersistenceAdapter
//!                     │                                              │
//!                     └──────────────── Counts ◀────────────────────┘
//! ```
//!
//! Items keep their originating [`ItemId`] through every stage, failures
//! are relayed rather than dropped, and every outcome ends up in the run's
//! [`Statistics`].

pub mod counts;
pub mod fetcher;
pub mod job;
pub mod outcome;
pub mod processor;
pub mod retry;

pub use counts::{Counts, CountsAccumulator, Statistics};
pub use fetcher::{CollectionFetcher, Fetcher, ItemStream, ListingFetcher};
pub use job::{Job, JobConfig, DEFAULT_BATCH_SIZE};
pub use outcome::{Cause, Item, ItemId, Outcome};
pub use processor::{
    BatchFn, BatchProcessor, Chain, Processor, ProcessorExt, RetryingProcessor,
    DEFAULT_FALLBACK_CONCURRENCY,
};
pub use retry::{Backoff, RetryPolicy};
