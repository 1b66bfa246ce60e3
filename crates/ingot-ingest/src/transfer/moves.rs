//! Paired move of a data file and its control file
//!
//! The data file always moves first and the control file follows only once
//! the data file is in place, so a control file never points at a missing
//! data file. A crash between the two moves leaves the control file behind
//! in the source folder; the next attempt notices the data file already
//! sitting at the destination and completes the pair. A rename whose reply
//! was lost, then retried, is recognized the same way for either file.

use thiserror::Error;
use tracing::{debug, warn};

use super::filetype::{data_file_of_ok_file, FileType};
use crate::persist::SubdirStrategy;
use crate::remote::{join_path, RemoteClient, RemoteError};

/// A completed pair move
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MovedPair {
    pub ok_file: String,
    pub data_file: String,
    /// Folder both files now live in
    pub destination: String,
    /// The data file had already been moved by an interrupted run
    pub reconciled: bool,
}

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("no data file of type {file_type} pairs with {ok_file}")]
    NoMatchingDataFile { ok_file: String, file_type: String },

    #[error("data file {data_file} is missing from {from_dir} and {to_dir}")]
    MissingDataFile {
        data_file: String,
        from_dir: String,
        to_dir: String,
    },

    #[error("failed to list {folder} while checking for {file}")]
    Reconcile {
        folder: String,
        file: String,
        #[source]
        source: RemoteError,
    },

    #[error("failed to prepare destination {folder}")]
    Destination {
        folder: String,
        #[source]
        source: RemoteError,
    },

    #[error("failed to move data file {data_file}")]
    DataMove {
        data_file: String,
        #[source]
        source: RemoteError,
    },

    #[error("data file {data_file} moved but control file {ok_file} was not")]
    ControlMove {
        ok_file: String,
        data_file: String,
        #[source]
        source: RemoteError,
    },
}

/// Create `to_dir` and each shard level below it, one folder at a time
async fn ensure_destination(
    remote: &dyn RemoteClient,
    to_dir: &str,
    segments: &[String],
) -> Result<String, TransferError> {
    let mut folder = to_dir.trim_end_matches('/').to_string();
    if folder.is_empty() {
        folder.push('/');
    }

    let create = |folder: String| async move {
        let source = match remote.create_folder_if_not_exist(&folder).await {
            Ok(()) => return Ok(()),
            Err(source) => source,
        };
        // a concurrent mover may have created it between check and create
        let (parent, name) = split_folder(&folder);
        match remote.list_folder(parent).await {
            Ok(names) if names.iter().any(|n| n == name) => {
                debug!(folder = %folder, "Destination created concurrently");
                Ok(())
            },
            _ => Err(TransferError::Destination {
                folder: folder.clone(),
                source,
            }),
        }
    };

    create(folder.clone()).await?;
    for segment in segments {
        folder = join_path(&[folder.as_str(), segment.as_str()]);
        create(folder.clone()).await?;
    }
    Ok(folder)
}

fn split_folder(folder: &str) -> (&str, &str) {
    match folder.rsplit_once('/') {
        Some(("", name)) => ("/", name),
        Some((parent, name)) => (parent, name),
        None => ("/", folder),
    }
}

/// Whether `file` is listed in `folder`
async fn present_in(
    remote: &dyn RemoteClient,
    folder: &str,
    file: &str,
) -> Result<bool, TransferError> {
    remote
        .list_folder(folder)
        .await
        .map(|names| names.iter().any(|name| name == file))
        .map_err(|source| TransferError::Reconcile {
            folder: folder.to_string(),
            file: file.to_string(),
            source,
        })
}

/// Move the data file paired with `ok_file` and then `ok_file` itself from
/// `from_dir` into `to_dir`, sharded by `subdir` on the data filename
pub async fn move_data_and_control_file(
    remote: &dyn RemoteClient,
    ok_file: &str,
    file_type: &FileType,
    from_dir: &str,
    to_dir: &str,
    subdir: &SubdirStrategy,
) -> Result<MovedPair, TransferError> {
    let data_file = data_file_of_ok_file(file_type, ok_file).ok_or_else(|| {
        TransferError::NoMatchingDataFile {
            ok_file: ok_file.to_string(),
            file_type: file_type.name().to_string(),
        }
    })?;

    let destination = ensure_destination(remote, to_dir, &subdir.segments(&data_file)).await?;

    let data_source = join_path(&[from_dir, data_file.as_str()]);
    let data_target = join_path(&[destination.as_str(), data_file.as_str()]);
    let mut reconciled = false;

    match remote.move_file(&data_source, &data_target).await {
        Ok(()) => {},
        Err(e) if e.is_not_found() => {
            if !present_in(remote, &destination, &data_file).await? {
                return Err(TransferError::MissingDataFile {
                    data_file,
                    from_dir: from_dir.to_string(),
                    to_dir: destination,
                });
            }
            warn!(
                data_file = %data_file,
                destination = %destination,
                "Data file already at destination, completing interrupted move"
            );
            reconciled = true;
        },
        Err(source) => {
            return Err(TransferError::DataMove { data_file, source });
        },
    }

    let ok_source = join_path(&[from_dir, ok_file]);
    let ok_target = join_path(&[destination.as_str(), ok_file]);
    if let Err(source) = remote.move_file(&ok_source, &ok_target).await {
        let landed = source.is_not_found() && present_in(remote, &destination, ok_file).await?;
        if !landed {
            return Err(TransferError::ControlMove {
                ok_file: ok_file.to_string(),
                data_file,
                source,
            });
        }
        warn!(
            ok_file,
            destination = %destination,
            "Control file already at destination, earlier rename went through"
        );
        reconciled = true;
    }

    debug!(ok_file, data_file = %data_file, destination = %destination, "Moved file pair");
    Ok(MovedPair {
        ok_file: ok_file.to_string(),
        data_file,
        destination,
        reconciled,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::pipeline::{Backoff, RetryPolicy};
    use crate::remote::{MemoryRemoteClient, RetryingRemote};
    use std::sync::Arc;

    const DATA: &str = "de_dev_ho_pwhg_data_0-2_20151122_120000.csv";
    const OK: &str = "de_dev_ho_pwhg_data_0-2_20151122_120000.csv.ok";

    fn pwhg() -> FileType {
        FileType::new("pwhg", "_ho_pwhg_dat{1}").unwrap()
    }

    fn server() -> MemoryRemoteClient {
        MemoryRemoteClient::new()
            .with_file(&format!("/incoming/{}", DATA), b"rows")
            .with_file(&format!("/incoming/{}", OK), b"")
    }

    #[tokio::test]
    async fn test_pair_moves_data_then_control() {
        let remote = server();

        let moved = move_data_and_control_file(
            &remote,
            OK,
            &pwhg(),
            "/incoming",
            "/processing",
            &SubdirStrategy::Flat,
        )
        .await
        .unwrap();

        assert_eq!(moved.destination, "/processing");
        assert!(!moved.reconciled);
        assert_eq!(
            remote.files(),
            vec![format!("/processing/{}", DATA), format!("/processing/{}", OK)]
        );
        let moves: Vec<String> = remote
            .operations()
            .into_iter()
            .filter(|op| op.starts_with("MOVE"))
            .collect();
        assert!(moves[0].contains(&format!("/incoming/{} ->", DATA)));
        assert!(moves[1].contains(&format!("/incoming/{} ->", OK)));
    }

    #[tokio::test]
    async fn test_pair_lands_in_shard() {
        let remote = server();

        let moved = move_data_and_control_file(
            &remote,
            OK,
            &pwhg(),
            "/incoming",
            "/processing",
            &SubdirStrategy::THREE_LETTERS_TWO_LEVELS,
        )
        .await
        .unwrap();

        assert_eq!(moved.destination, "/processing/de_/dev");
        assert!(remote.exists(&format!("/processing/de_/dev/{}", OK)));
    }

    #[tokio::test]
    async fn test_unpaired_control_file_touches_nothing() {
        let remote = MemoryRemoteClient::new().with_file("/incoming/readme.ok", b"");

        let err = move_data_and_control_file(
            &remote,
            "readme.ok",
            &pwhg(),
            "/incoming",
            "/processing",
            &SubdirStrategy::Flat,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, TransferError::NoMatchingDataFile { .. }));
        assert!(remote.operations().is_empty());
    }

    #[tokio::test]
    async fn test_control_file_stays_when_data_move_fails() {
        let remote = server();
        remote.fail_moves_from(&format!("/incoming/{}", DATA));

        let err = move_data_and_control_file(
            &remote,
            OK,
            &pwhg(),
            "/incoming",
            "/processing",
            &SubdirStrategy::Flat,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, TransferError::DataMove { .. }));
        assert!(remote.exists(&format!("/incoming/{}", DATA)));
        assert!(remote.exists(&format!("/incoming/{}", OK)));
    }

    #[tokio::test]
    async fn test_interrupted_pair_is_completed() {
        let remote = MemoryRemoteClient::new()
            .with_file(&format!("/processing/{}", DATA), b"rows")
            .with_file(&format!("/incoming/{}", OK), b"");

        let moved = move_data_and_control_file(
            &remote,
            OK,
            &pwhg(),
            "/incoming",
            "/processing",
            &SubdirStrategy::Flat,
        )
        .await
        .unwrap();

        assert!(moved.reconciled);
        assert!(remote.exists(&format!("/processing/{}", OK)));
        assert!(!remote.exists(&format!("/incoming/{}", OK)));
    }

    #[tokio::test]
    async fn test_missing_data_file_everywhere() {
        let remote = MemoryRemoteClient::new().with_file(&format!("/incoming/{}", OK), b"");

        let err = move_data_and_control_file(
            &remote,
            OK,
            &pwhg(),
            "/incoming",
            "/processing",
            &SubdirStrategy::Flat,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, TransferError::MissingDataFile { .. }));
        assert!(remote.exists(&format!("/incoming/{}", OK)));
    }

    #[tokio::test]
    async fn test_lost_reply_on_control_move_is_reconciled() {
        let server = Arc::new(server());
        server.lose_move_reply_from(&format!("/incoming/{}", OK));
        let remote = RetryingRemote::new(server.clone(), RetryPolicy::new(3, Backoff::None));

        let moved = move_data_and_control_file(
            &remote,
            OK,
            &pwhg(),
            "/incoming",
            "/processing",
            &SubdirStrategy::Flat,
        )
        .await
        .unwrap();

        assert!(moved.reconciled);
        assert_eq!(
            server.files(),
            vec![format!("/processing/{}", DATA), format!("/processing/{}", OK)]
        );
    }

    #[tokio::test]
    async fn test_failed_listing_is_not_reported_as_missing_data() {
        let remote = MemoryRemoteClient::new()
            .with_file(&format!("/processing/{}", DATA), b"rows")
            .with_file(&format!("/incoming/{}", OK), b"");
        remote.fail_listings_of("/processing");

        let err = move_data_and_control_file(
            &remote,
            OK,
            &pwhg(),
            "/incoming",
            "/processing",
            &SubdirStrategy::Flat,
        )
        .await
        .unwrap_err();

        match err {
            TransferError::Reconcile { ref folder, ref source, .. } => {
                assert_eq!(folder, "/processing");
                assert!(source.is_retryable());
            },
            other => panic!("unexpected error: {}", other),
        }
        assert!(remote.exists(&format!("/incoming/{}", OK)));
    }

    #[tokio::test]
    async fn test_destination_created_by_another_mover_is_accepted() {
        let remote = server().with_folder("/processing/de_/dev");
        remote.reject_existing_folders();

        let moved = move_data_and_control_file(
            &remote,
            OK,
            &pwhg(),
            "/incoming",
            "/processing",
            &SubdirStrategy::THREE_LETTERS_TWO_LEVELS,
        )
        .await
        .unwrap();

        assert_eq!(moved.destination, "/processing/de_/dev");
        assert!(remote.exists(&format!("/processing/de_/dev/{}", OK)));
    }

    #[tokio::test]
    async fn test_destination_under_missing_parent_still_fails() {
        let remote = server();
        remote.reject_existing_folders();

        let err = move_data_and_control_file(
            &remote,
            OK,
            &pwhg(),
            "/incoming",
            "/nowhere/processing",
            &SubdirStrategy::Flat,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, TransferError::Destination { .. }));
        assert!(remote.exists(&format!("/incoming/{}", DATA)));
    }
}
