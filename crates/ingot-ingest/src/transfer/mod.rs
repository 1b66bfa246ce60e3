//! Control-file driven transfer between remote staging folders
//!
//! Producers drop a data file plus its `.ok` control file into the incoming
//! folder. An intake run moves, per logical file, the newest pair to
//! processing and every older pair to skipped. An archive run moves every
//! pair found under processing to archived. Both runs are ordinary pipeline
//! jobs: the fetcher lists and plans, the processor performs paired moves,
//! nothing is persisted locally.

pub mod filetype;
pub mod moves;

pub use filetype::{
    data_file_of_ok_file, embedded_timestamp, is_ok_file, logical_key, matches, DataFileNaming,
    FileType, FileTypeDefinition, ALL_FILES_NAME, OK_SUFFIX,
};
pub use moves::{move_data_and_control_file, MovedPair, TransferError};

use async_trait::async_trait;
use chrono::NaiveDateTime;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

use crate::persist::{Discard, SubdirStrategy};
use crate::pipeline::{
    Item, Job, JobConfig, ListingFetcher, Outcome, Processor, Statistics, DEFAULT_BATCH_SIZE,
};
use crate::remote::{join_path, RemoteClient, RemoteError};

/// Default number of pairs moved concurrently within a batch
pub const DEFAULT_TRANSFER_CONCURRENCY: usize = 4;

/// Where a control file stands in the transfer workflow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferState {
    /// Found, not (yet) attributed to a file type
    Pending,
    /// Older delivery of a logical file, bound for the skipped folder
    Skipped,
    /// Newest delivery, bound for the next stage
    ToProcess,
    /// Pair relocated to the next stage
    Moved,
}

/// Which stage a run drives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferMode {
    /// incoming → processing (newest) or skipped (older)
    Intake,
    /// processing → archived
    Archive,
}

impl TransferMode {
    pub fn job_name(&self) -> &'static str {
        match self {
            TransferMode::Intake => "transfer",
            TransferMode::Archive => "archive",
        }
    }
}

impl fmt::Display for TransferMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.job_name())
    }
}

/// The four staging folders on the remote server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFolders {
    pub incoming: String,
    pub processing: String,
    pub archived: String,
    pub skipped: String,
}

impl Default for RemoteFolders {
    fn default() -> Self {
        Self {
            incoming: "/incoming".to_string(),
            processing: "/processing".to_string(),
            archived: "/archived".to_string(),
            skipped: "/skipped".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransferConfig {
    pub folders: RemoteFolders,
    /// Checked in order; the first type pairing a control file claims it
    pub file_types: Vec<FileType>,
    pub date_from: Option<NaiveDateTime>,
    pub date_to: Option<NaiveDateTime>,
    /// Sharding below each destination folder
    pub subdir: SubdirStrategy,
    pub batch_size: usize,
    pub concurrency: usize,
    pub max_consecutive_failed_batches: Option<usize>,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            folders: RemoteFolders::default(),
            file_types: vec![FileType::all_files()],
            date_from: None,
            date_to: None,
            subdir: SubdirStrategy::Flat,
            batch_size: DEFAULT_BATCH_SIZE,
            concurrency: DEFAULT_TRANSFER_CONCURRENCY,
            max_consecutive_failed_batches: None,
        }
    }
}

impl TransferConfig {
    fn source(&self, mode: TransferMode) -> (&str, usize) {
        match mode {
            TransferMode::Intake => (self.folders.incoming.as_str(), 0),
            TransferMode::Archive => (self.folders.processing.as_str(), self.subdir.depth()),
        }
    }

    fn in_date_range(&self, filename: &str) -> bool {
        if self.date_from.is_none() && self.date_to.is_none() {
            return true;
        }
        match embedded_timestamp(filename) {
            Some(ts) => {
                self.date_from.is_none_or(|from| ts >= from)
                    && self.date_to.is_none_or(|to| ts <= to)
            },
            None => false,
        }
    }

    fn claim(&self, ok_file: &str) -> Option<&FileType> {
        self.file_types
            .iter()
            .find(|ft| data_file_of_ok_file(ft, ok_file).is_some())
    }
}

/// A control file found by a listing, and where its pair should go
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedMove {
    pub ok_file: String,
    /// `None` when no configured type pairs the control file with a data file
    pub file_type: Option<FileType>,
    pub state: TransferState,
    pub timestamp: Option<NaiveDateTime>,
    pub from_dir: String,
    pub to_dir: String,
}

impl PlannedMove {
    /// Full remote path of the control file, used as the item identity
    pub fn ok_path(&self) -> String {
        join_path(&[self.from_dir.as_str(), self.ok_file.as_str()])
    }
}

/// Decide the disposition of each control file found in the source folder.
///
/// `control_files` holds `(folder, name)` pairs. Files outside the date
/// range are left alone. In intake mode the newest delivery per logical key
/// (greatest embedded timestamp, ties to the greatest filename) goes to
/// processing and the rest to skipped.
pub fn plan_moves(
    mode: TransferMode,
    control_files: &[(String, String)],
    config: &TransferConfig,
) -> Vec<PlannedMove> {
    let mut plan: Vec<PlannedMove> = control_files
        .iter()
        .filter(|(_, name)| is_ok_file(name) && config.in_date_range(name))
        .map(|(dir, name)| {
            let file_type = config.claim(name).cloned();
            let state = if file_type.is_some() {
                TransferState::ToProcess
            } else {
                TransferState::Pending
            };
            let to_dir = match mode {
                TransferMode::Intake => config.folders.processing.clone(),
                TransferMode::Archive => config.folders.archived.clone(),
            };
            PlannedMove {
                ok_file: name.clone(),
                file_type,
                state,
                timestamp: embedded_timestamp(name),
                from_dir: dir.clone(),
                to_dir,
            }
        })
        .collect();

    if mode == TransferMode::Intake {
        let mut newest: HashMap<String, usize> = HashMap::new();
        for (index, planned) in plan.iter().enumerate() {
            let Some(ref file_type) = planned.file_type else {
                continue;
            };
            let key = logical_key(file_type, &planned.ok_file);
            let rank = (planned.timestamp, planned.ok_file.as_str());
            newest
                .entry(key)
                .and_modify(|best| {
                    if rank > (plan[*best].timestamp, plan[*best].ok_file.as_str()) {
                        *best = index;
                    }
                })
                .or_insert(index);
        }

        let winners: Vec<usize> = newest.into_values().collect();
        for (index, planned) in plan.iter_mut().enumerate() {
            if planned.state == TransferState::ToProcess && !winners.contains(&index) {
                planned.state = TransferState::Skipped;
                planned.to_dir = config.folders.skipped.clone();
            }
        }
    }

    plan.sort_by(|a, b| (&a.from_dir, &a.ok_file).cmp(&(&b.from_dir, &b.ok_file)));
    plan
}

/// Control files under `root`, descending at most `depth` folder levels
async fn collect_control_files(
    remote: &dyn RemoteClient,
    root: &str,
    depth: usize,
) -> Result<Vec<(String, String)>, RemoteError> {
    let mut found = Vec::new();
    let mut pending = vec![(root.to_string(), 0usize)];

    while let Some((dir, level)) = pending.pop() {
        let names = match remote.list_folder(&dir).await {
            Ok(names) => names,
            // a plain file at a shard level
            Err(e) if level > 0 && e.is_not_found() => continue,
            Err(e) => return Err(e),
        };
        for name in names {
            if is_ok_file(&name) {
                found.push((dir.clone(), name));
            } else if level < depth && embedded_timestamp(&name).is_none() {
                pending.push((join_path(&[dir.as_str(), name.as_str()]), level + 1));
            }
        }
    }

    found.sort();
    Ok(found)
}

/// A pair that reached its destination
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedMove {
    pub pair: MovedPair,
    /// [`TransferState::Moved`] or [`TransferState::Skipped`]
    pub state: TransferState,
}

/// Performs the planned paired moves of a batch
pub struct MoveProcessor {
    remote: Arc<dyn RemoteClient>,
    subdir: SubdirStrategy,
    concurrency: usize,
}

impl MoveProcessor {
    pub fn new(remote: Arc<dyn RemoteClient>, subdir: SubdirStrategy, concurrency: usize) -> Self {
        Self {
            remote,
            subdir,
            concurrency: concurrency.max(1),
        }
    }

    async fn execute(&self, item: Item<PlannedMove>) -> Outcome<CompletedMove> {
        let Item { id, value: planned } = item;

        let Some(ref file_type) = planned.file_type else {
            let error = TransferError::NoMatchingDataFile {
                ok_file: planned.ok_file.clone(),
                file_type: "any configured type".to_string(),
            };
            warn!(ok_file = %planned.ok_file, "{}", error);
            return Outcome::failure(id, anyhow::Error::new(error));
        };

        let result = move_data_and_control_file(
            self.remote.as_ref(),
            &planned.ok_file,
            file_type,
            &planned.from_dir,
            &planned.to_dir,
            &self.subdir,
        )
        .await;

        match result {
            Ok(pair) => {
                let state = match planned.state {
                    TransferState::Skipped => TransferState::Skipped,
                    _ => TransferState::Moved,
                };
                Outcome::success(id, CompletedMove { pair, state })
            },
            Err(e) => {
                let error = anyhow::Error::new(e);
                warn!(ok_file = %planned.ok_file, error = %format!("{:#}", error), "Paired move failed");
                Outcome::failure(id, error)
            },
        }
    }
}

#[async_trait]
impl Processor<PlannedMove, CompletedMove> for MoveProcessor {
    async fn process(&self, batch: Vec<Outcome<PlannedMove>>) -> Vec<Outcome<CompletedMove>> {
        stream::iter(batch)
            .map(|outcome| async move {
                match outcome.into_item::<CompletedMove>() {
                    Ok(item) => self.execute(item).await,
                    Err(relayed) => relayed,
                }
            })
            .buffered(self.concurrency)
            .collect()
            .await
    }
}

/// The transfer workflow as a pipeline job
pub struct ControlFileTransferJob {
    remote: Arc<dyn RemoteClient>,
    config: TransferConfig,
}

impl ControlFileTransferJob {
    pub fn new(remote: Arc<dyn RemoteClient>, config: TransferConfig) -> Self {
        Self { remote, config }
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    /// List the source folder and plan, without moving anything
    pub async fn plan(&self, mode: TransferMode) -> Result<Vec<PlannedMove>, RemoteError> {
        plan_remote(self.remote.as_ref(), &self.config, mode).await
    }

    pub async fn run(&self, mode: TransferMode) -> Statistics {
        let remote = self.remote.clone();
        let config = self.config.clone();
        let fetcher = ListingFetcher::new(move || async move {
            let planned = plan_remote(remote.as_ref(), &config, mode).await?;
            Ok::<_, anyhow::Error>(
                planned
                    .into_iter()
                    .map(|p| Item::new(p.ok_path(), p))
                    .collect::<Vec<_>>(),
            )
        });

        let mut job_config =
            JobConfig::new(mode.job_name()).with_batch_size(self.config.batch_size);
        job_config.max_consecutive_failed_batches = self.config.max_consecutive_failed_batches;

        let processor = MoveProcessor::new(
            self.remote.clone(),
            self.config.subdir,
            self.config.concurrency,
        );

        Job::new(job_config, fetcher, processor, Discard).run().await
    }
}

async fn plan_remote(
    remote: &dyn RemoteClient,
    config: &TransferConfig,
    mode: TransferMode,
) -> Result<Vec<PlannedMove>, RemoteError> {
    let (source, depth) = config.source(mode);
    let control_files = collect_control_files(remote, source, depth).await?;
    let plan = plan_moves(mode, &control_files, config);

    let skipped = plan
        .iter()
        .filter(|p| p.state == TransferState::Skipped)
        .count();
    info!(
        mode = %mode,
        source,
        control_files = control_files.len(),
        planned = plan.len(),
        skipped,
        "Planned transfer"
    );
    Ok(plan)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::remote::MemoryRemoteClient;

    fn listing(names: &[&str]) -> Vec<(String, String)> {
        names
            .iter()
            .map(|n| ("/incoming".to_string(), n.to_string()))
            .collect()
    }

    fn states(plan: &[PlannedMove]) -> Vec<(&str, TransferState)> {
        plan.iter().map(|p| (p.ok_file.as_str(), p.state)).collect()
    }

    #[test]
    fn test_newest_delivery_wins() {
        let plan = plan_moves(
            TransferMode::Intake,
            &listing(&[
                "feed_20200102_000000.csv.ok",
                "feed_20200101_000000.csv.ok",
                "feed_20200101_000000.csv",
                "other_20200101_000000.csv.ok",
            ]),
            &TransferConfig::default(),
        );

        assert_eq!(
            states(&plan),
            vec![
                ("feed_20200101_000000.csv.ok", TransferState::Skipped),
                ("feed_20200102_000000.csv.ok", TransferState::ToProcess),
                ("other_20200101_000000.csv.ok", TransferState::ToProcess),
            ]
        );
        assert_eq!(plan[0].to_dir, "/skipped");
        assert_eq!(plan[1].to_dir, "/processing");
    }

    #[test]
    fn test_equal_timestamps_break_ties_by_filename() {
        // same logical key "a_b.csv" and the same instant
        let plan = plan_moves(
            TransferMode::Intake,
            &listing(&["a_20200101_000000b.csv.ok", "a_b20200101_000000.csv.ok"]),
            &TransferConfig::default(),
        );

        assert_eq!(
            states(&plan),
            vec![
                ("a_20200101_000000b.csv.ok", TransferState::Skipped),
                ("a_b20200101_000000.csv.ok", TransferState::ToProcess),
            ]
        );
    }

    #[test]
    fn test_unclaimed_control_file_stays_pending() {
        let plan = plan_moves(
            TransferMode::Intake,
            &listing(&["readme.ok"]),
            &TransferConfig::default(),
        );

        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].state, TransferState::Pending);
        assert!(plan[0].file_type.is_none());
    }

    #[test]
    fn test_date_range_filters_plan() {
        let config = TransferConfig {
            date_from: embedded_timestamp("x_20200102_000000"),
            ..TransferConfig::default()
        };
        let plan = plan_moves(
            TransferMode::Intake,
            &listing(&["feed_20200101_000000.csv.ok", "feed_20200103_000000.csv.ok"]),
            &config,
        );

        assert_eq!(states(&plan), vec![("feed_20200103_000000.csv.ok", TransferState::ToProcess)]);
    }

    #[test]
    fn test_archive_moves_every_pair() {
        let files = vec![
            ("/processing".to_string(), "feed_20200101_000000.csv.ok".to_string()),
            ("/processing".to_string(), "feed_20200102_000000.csv.ok".to_string()),
        ];
        let plan = plan_moves(TransferMode::Archive, &files, &TransferConfig::default());

        assert!(plan.iter().all(|p| p.state == TransferState::ToProcess));
        assert!(plan.iter().all(|p| p.to_dir == "/archived"));
    }

    #[tokio::test]
    async fn test_collect_descends_into_shards() {
        let remote = MemoryRemoteClient::new()
            .with_file("/processing/fee/d_2/feed_20200101_000000.csv", b"")
            .with_file("/processing/fee/d_2/feed_20200101_000000.csv.ok", b"")
            .with_file("/processing/top_20200101_000000.csv.ok", b"");

        let found = collect_control_files(&remote, "/processing", 2).await.unwrap();

        assert_eq!(
            found,
            vec![
                ("/processing".to_string(), "top_20200101_000000.csv.ok".to_string()),
                (
                    "/processing/fee/d_2".to_string(),
                    "feed_20200101_000000.csv.ok".to_string()
                ),
            ]
        );
    }
}
