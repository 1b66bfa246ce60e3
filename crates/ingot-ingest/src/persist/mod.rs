//! Persistence of processed batches
//!
//! A [`PersistenceAdapter`] is handed every batch that produced at least one
//! success, with the full outcome set. It first names the destination, then
//! writes. Names are `<prefix>_<n>` with `n` counting from 1 per adapter
//! instance and advancing only on a successful write, so persisted batches
//! are numbered without gaps and two batches of one run never collide.

pub mod subdir;

pub use subdir::{ParseSubdirError, SubdirStrategy};

use async_trait::async_trait;
use ingot_common::checksum::sha256_hex;
use serde::Serialize;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::io::AsyncWriteExt as _;
use tracing::debug;

use crate::pipeline::outcome::{ItemId, Outcome};

/// Default batch name prefix
pub const DEFAULT_PREFIX: &str = "batch";

/// What a successful write produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedBatch {
    pub path: PathBuf,
    /// Records written (successes, plus failures if recorded)
    pub records: usize,
    pub bytes: u64,
    /// SHA-256 of the written payload, empty when nothing was written
    pub sha256: String,
}

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("I/O error writing {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize record {id}: {source}")]
    Serialization {
        id: ItemId,
        #[source]
        source: serde_json::Error,
    },

    #[error("batch rejected: {0}")]
    Rejected(String),
}

impl PersistError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        PersistError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Destination naming plus durable write of one batch
#[async_trait]
pub trait PersistenceAdapter<O: Send + Sync>: Send {
    /// Name the destination of the next batch. The name stays the same
    /// until a write succeeds.
    fn destination(&mut self, batch: &[Outcome<O>]) -> PathBuf;

    async fn write(
        &mut self,
        destination: &Path,
        batch: &[Outcome<O>],
    ) -> Result<PersistedBatch, PersistError>;
}

/// `<prefix>_<n>` counter owned by one adapter instance
#[derive(Debug)]
struct Sequence {
    prefix: String,
    next: u64,
}

impl Sequence {
    fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            next: 1,
        }
    }

    fn peek(&self) -> String {
        format!("{}_{}", self.prefix, self.next)
    }

    fn commit(&mut self) {
        self.next += 1;
    }
}

/// Writes each batch as JSON Lines under a root directory.
///
/// Files land at `<root>/<subdir(<prefix>_<n>)>`; missing parent
/// directories are created.
pub struct BatchFileWriter {
    root: PathBuf,
    subdir: SubdirStrategy,
    include_failures: bool,
    sequence: Sequence,
}

impl BatchFileWriter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            subdir: SubdirStrategy::Flat,
            include_failures: false,
            sequence: Sequence::new(DEFAULT_PREFIX),
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.sequence = Sequence::new(prefix);
        self
    }

    pub fn with_subdir(mut self, subdir: SubdirStrategy) -> Self {
        self.subdir = subdir;
        self
    }

    /// Also record failures, as `{"id", "error"}` lines
    pub fn with_failures(mut self, include: bool) -> Self {
        self.include_failures = include;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn render<O: Serialize>(&self, batch: &[Outcome<O>]) -> Result<(Vec<u8>, usize), PersistError> {
        let mut payload = Vec::new();
        let mut records = 0;

        for outcome in batch {
            let line = match outcome {
                Outcome::Success { id, value } => {
                    let value = serde_json::to_value(value).map_err(|source| {
                        PersistError::Serialization {
                            id: id.clone(),
                            source,
                        }
                    })?;
                    json!({ "id": id, "value": value })
                },
                Outcome::Failure { id, cause } if self.include_failures => {
                    json!({ "id": id, "error": format!("{:#}", cause) })
                },
                Outcome::Failure { .. } => continue,
            };
            payload.extend_from_slice(line.to_string().as_bytes());
            payload.push(b'\n');
            records += 1;
        }

        Ok((payload, records))
    }
}

#[async_trait]
impl<O> PersistenceAdapter<O> for BatchFileWriter
where
    O: Serialize + Send + Sync,
{
    fn destination(&mut self, _batch: &[Outcome<O>]) -> PathBuf {
        self.root.join(self.subdir.apply(&self.sequence.peek()))
    }

    async fn write(
        &mut self,
        destination: &Path,
        batch: &[Outcome<O>],
    ) -> Result<PersistedBatch, PersistError> {
        let (payload, records) = self.render(batch)?;

        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| PersistError::io(parent, e))?;
        }

        let mut file = tokio::fs::File::create(destination)
            .await
            .map_err(|e| PersistError::io(destination, e))?;
        file.write_all(&payload)
            .await
            .map_err(|e| PersistError::io(destination, e))?;
        file.sync_all()
            .await
            .map_err(|e| PersistError::io(destination, e))?;

        debug!(
            path = %destination.display(),
            records,
            bytes = payload.len(),
            "Wrote batch file"
        );
        self.sequence.commit();

        Ok(PersistedBatch {
            path: destination.to_path_buf(),
            records,
            bytes: payload.len() as u64,
            sha256: sha256_hex(&payload),
        })
    }
}

/// One batch kept by a [`MemorySink`]
#[derive(Debug, Clone)]
pub struct StoredBatch<O> {
    pub name: String,
    pub outcomes: Vec<Outcome<O>>,
}

#[derive(Debug)]
struct SinkState<O> {
    batches: Vec<StoredBatch<O>>,
    sequence: Sequence,
}

/// Keeps batches in memory; clones share the same storage and numbering.
///
/// The stored name is assigned under the lock at write time, so clones
/// writing concurrently still get distinct names.
#[derive(Debug)]
pub struct MemorySink<O> {
    shared: Arc<Mutex<SinkState<O>>>,
}

impl<O> Clone for MemorySink<O> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<O> Default for MemorySink<O> {
    fn default() -> Self {
        Self::new()
    }
}

impl<O> MemorySink<O> {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Mutex::new(SinkState {
                batches: Vec::new(),
                sequence: Sequence::new("memory"),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SinkState<O>> {
        match self.shared.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Snapshot of everything stored so far
    pub fn batches(&self) -> Vec<StoredBatch<O>>
    where
        O: Clone,
    {
        self.lock().batches.clone()
    }

    pub fn len(&self) -> usize {
        self.lock().batches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl<O> PersistenceAdapter<O> for MemorySink<O>
where
    O: Clone + Send + Sync,
{
    fn destination(&mut self, _batch: &[Outcome<O>]) -> PathBuf {
        PathBuf::from(self.lock().sequence.peek())
    }

    async fn write(
        &mut self,
        _destination: &Path,
        batch: &[Outcome<O>],
    ) -> Result<PersistedBatch, PersistError> {
        let mut guard = self
            .shared
            .lock()
            .map_err(|_| PersistError::Rejected("memory sink lock poisoned".to_string()))?;
        let name = guard.sequence.peek();
        guard.sequence.commit();
        guard.batches.push(StoredBatch {
            name: name.clone(),
            outcomes: batch.to_vec(),
        });

        Ok(PersistedBatch {
            path: PathBuf::from(name),
            records: batch.len(),
            bytes: 0,
            sha256: String::new(),
        })
    }
}

/// Persists nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct Discard;

#[async_trait]
impl<O: Send + Sync> PersistenceAdapter<O> for Discard {
    fn destination(&mut self, _batch: &[Outcome<O>]) -> PathBuf {
        PathBuf::new()
    }

    async fn write(
        &mut self,
        destination: &Path,
        batch: &[Outcome<O>],
    ) -> Result<PersistedBatch, PersistError> {
        Ok(PersistedBatch {
            path: destination.to_path_buf(),
            records: batch.len(),
            bytes: 0,
            sha256: String::new(),
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::pipeline::outcome::Cause;
    use tempfile::TempDir;

    fn batch() -> Vec<Outcome<u32>> {
        vec![
            Outcome::success(1u64, 10),
            Outcome::failure(2u64, Cause::msg("timed out")),
            Outcome::success(3u64, 30),
        ]
    }

    #[tokio::test]
    async fn test_file_writer_names_batches_in_sequence() {
        let temp = TempDir::new().unwrap();
        let mut writer = BatchFileWriter::new(temp.path()).with_prefix("out");
        let outcomes = batch();

        let first = writer.destination(&outcomes);
        writer.write(&first, &outcomes).await.unwrap();
        let second = writer.destination(&outcomes);

        assert_eq!(first, temp.path().join("out_1"));
        assert_eq!(second, temp.path().join("out_2"));
    }

    #[tokio::test]
    async fn test_failed_write_keeps_its_number() {
        let temp = TempDir::new().unwrap();
        let mut writer = BatchFileWriter::new(temp.path())
            .with_prefix("out")
            .with_subdir(SubdirStrategy::Prefix { chars: 5, levels: 1 });
        let outcomes = batch();

        // "out_1" shards into "out_1/out_1"; a plain file blocks that folder
        std::fs::write(temp.path().join("out_1"), b"not a directory").unwrap();
        let blocked = writer.destination(&outcomes);
        assert!(writer.write(&blocked, &outcomes).await.is_err());

        std::fs::remove_file(temp.path().join("out_1")).unwrap();
        let retried = writer.destination(&outcomes);
        assert_eq!(retried, blocked);
        writer.write(&retried, &outcomes).await.unwrap();

        let next = writer.destination(&outcomes);
        assert_eq!(next, temp.path().join("out_2").join("out_2"));
    }

    #[tokio::test]
    async fn test_file_writer_writes_successes_as_json_lines() {
        let temp = TempDir::new().unwrap();
        let mut writer = BatchFileWriter::new(temp.path());
        let outcomes = batch();

        let destination = writer.destination(&outcomes);
        let persisted = writer.write(&destination, &outcomes).await.unwrap();

        let content = std::fs::read_to_string(&persisted.path).unwrap();
        assert_eq!(content, "{\"id\":\"1\",\"value\":10}\n{\"id\":\"3\",\"value\":30}\n");
        assert_eq!(persisted.records, 2);
        assert_eq!(persisted.bytes, content.len() as u64);
        ingot_common::checksum::verify_sha256_file(&persisted.path, &persisted.sha256).unwrap();
    }

    #[tokio::test]
    async fn test_file_writer_records_failures_when_asked() {
        let temp = TempDir::new().unwrap();
        let mut writer = BatchFileWriter::new(temp.path()).with_failures(true);
        let outcomes = batch();

        let destination = writer.destination(&outcomes);
        let persisted = writer.write(&destination, &outcomes).await.unwrap();

        let content = std::fs::read_to_string(&persisted.path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[1], "{\"error\":\"timed out\",\"id\":\"2\"}");
    }

    #[tokio::test]
    async fn test_file_writer_shards_into_subdirs() {
        let temp = TempDir::new().unwrap();
        let mut writer = BatchFileWriter::new(temp.path())
            .with_prefix("abc")
            .with_subdir(SubdirStrategy::Prefix { chars: 2, levels: 1 });
        let outcomes = batch();

        let destination = writer.destination(&outcomes);
        writer.write(&destination, &outcomes).await.unwrap();

        assert_eq!(destination, temp.path().join("ab").join("abc_1"));
        assert!(destination.is_file());
    }

    #[tokio::test]
    async fn test_unwritable_root_is_an_io_error() {
        let temp = TempDir::new().unwrap();
        let blocker = temp.path().join("taken");
        std::fs::write(&blocker, b"not a directory").unwrap();
        let mut writer = BatchFileWriter::new(blocker.join("nested"));
        let outcomes = batch();

        let destination = writer.destination(&outcomes);
        let err = writer.write(&destination, &outcomes).await.unwrap_err();

        assert!(matches!(err, PersistError::Io { .. }));
    }

    #[tokio::test]
    async fn test_memory_sink_shares_storage_between_clones() {
        let sink = MemorySink::<u32>::new();
        let mut writer = sink.clone();
        let outcomes = batch();

        let destination = writer.destination(&outcomes);
        writer.write(&destination, &outcomes).await.unwrap();

        let stored = sink.batches();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].name, "memory_1");
        assert_eq!(stored[0].outcomes.len(), 3);
    }

    #[tokio::test]
    async fn test_memory_sink_clones_share_numbering() {
        let sink = MemorySink::<u32>::new();
        let mut first = sink.clone();
        let mut second = sink.clone();
        let outcomes = batch();

        let a = first.destination(&outcomes);
        let b = second.destination(&outcomes);
        first.write(&a, &outcomes).await.unwrap();
        let persisted = second.write(&b, &outcomes).await.unwrap();

        assert_eq!(persisted.path, PathBuf::from("memory_2"));
        let names: Vec<String> = sink.batches().into_iter().map(|b| b.name).collect();
        assert_eq!(names, vec!["memory_1", "memory_2"]);
    }
}
