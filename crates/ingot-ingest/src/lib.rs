//! Ingot Ingest Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Batch file ingestion: fetch identified work items, process them in
//! bounded batches with retry on partial failure, persist the results to
//! sharded locations and report success/failure counts.
//!
//! On top of the generic pipeline sits the control-file transfer workflow,
//! which moves data files and their `.ok` companions between the incoming,
//! processing, archived and skipped folders of a remote file server.
//!
//! # Modules
//!
//! - [`pipeline`]: outcomes, counts, fetchers, processors, retry policy, jobs
//! - [`persist`]: persistence adapters and directory sharding
//! - [`remote`]: remote file server access (FTP, in-memory, retrying)
//! - [`transfer`]: file types, paired moves, the transfer job
//! - [`config`]: environment configuration of the binary
//!
//! # Example
//!
//! ```no_run
//! use ingot_ingest::persist::{BatchFileWriter, SubdirStrategy};
//! use ingot_ingest::pipeline::{CollectionFetcher, Job, JobConfig, RetryingProcessor};
//!
//! #[tokio::main]
//! async fn main() {
//!     let processor = RetryingProcessor::new(|ids: Vec<u32>| async move {
//!         Ok::<_, anyhow::Error>(ids.into_iter().map(|id| id * 2).collect::<Vec<_>>())
//!     });
//!     let writer = BatchFileWriter::new("./out")
//!         .with_prefix("doubled")
//!         .with_subdir(SubdirStrategy::HASH_THREE_LETTERS_TWO_LEVELS);
//!
//!     let stats = Job::new(
//!         JobConfig::new("doubling").with_batch_size(100),
//!         CollectionFetcher::from_values(1..=1000u32),
//!         processor,
//!         writer,
//!     )
//!     .run()
//!     .await;
//!
//!     println!("{}", stats.summary());
//! }
//! ```

pub mod config;
pub mod persist;
pub mod pipeline;
pub mod remote;
pub mod transfer;

pub use config::{ConfigError, IngestConfig};
pub use pipeline::{Counts, Job, JobConfig, Outcome, Statistics};
pub use transfer::{ControlFileTransferJob, TransferConfig, TransferMode};
