//! Remote file server access
//!
//! [`RemoteClient`] is the narrow set of operations the transfer workflow
//! needs. Paths are `/`-separated and absolute on the server.

pub mod ftp;
pub mod memory;
pub mod retrying;

pub use ftp::{FtpConfig, FtpRemoteClient};
pub use memory::MemoryRemoteClient;
pub use retrying::RetryingRemote;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::pipeline::fetcher::ListingFetcher;
use crate::pipeline::outcome::Item;

#[derive(Debug, Clone, Error)]
pub enum RemoteError {
    /// Connection, protocol or server-side failure; worth retrying
    #[error("transport error during {operation} on {path}: {message}")]
    Transport {
        operation: &'static str,
        path: String,
        message: String,
    },

    #[error("{path} not found")]
    NotFound { path: String },

    #[error("{operation} on {path} timed out after {}ms", .after.as_millis())]
    Timeout {
        operation: &'static str,
        path: String,
        after: Duration,
    },
}

impl RemoteError {
    pub fn transport(
        operation: &'static str,
        path: impl Into<String>,
        message: impl std::fmt::Display,
    ) -> Self {
        RemoteError::Transport {
            operation,
            path: path.into(),
            message: message.to_string(),
        }
    }

    pub fn not_found(path: impl Into<String>) -> Self {
        RemoteError::NotFound { path: path.into() }
    }

    /// Transport failures and timeouts may succeed on another attempt
    pub fn is_retryable(&self) -> bool {
        !self.is_not_found()
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, RemoteError::NotFound { .. })
    }
}

pub type RemoteResult<T> = std::result::Result<T, RemoteError>;

/// Operations on a remote file server
#[async_trait]
pub trait RemoteClient: Send + Sync {
    /// Names (not paths) of the entries of `folder`, sorted
    async fn list_folder(&self, folder: &str) -> RemoteResult<Vec<String>>;

    async fn download_file(&self, path: &str) -> RemoteResult<Vec<u8>>;

    /// Rename `from` to `to`; the parent of `to` must exist
    async fn move_file(&self, from: &str, to: &str) -> RemoteResult<()>;

    async fn delete_file(&self, path: &str) -> RemoteResult<()>;

    /// Create `folder` unless it already exists; the parent must exist
    async fn create_folder_if_not_exist(&self, folder: &str) -> RemoteResult<()>;
}

#[async_trait]
impl<C: RemoteClient + ?Sized> RemoteClient for Arc<C> {
    async fn list_folder(&self, folder: &str) -> RemoteResult<Vec<String>> {
        (**self).list_folder(folder).await
    }

    async fn download_file(&self, path: &str) -> RemoteResult<Vec<u8>> {
        (**self).download_file(path).await
    }

    async fn move_file(&self, from: &str, to: &str) -> RemoteResult<()> {
        (**self).move_file(from, to).await
    }

    async fn delete_file(&self, path: &str) -> RemoteResult<()> {
        (**self).delete_file(path).await
    }

    async fn create_folder_if_not_exist(&self, folder: &str) -> RemoteResult<()> {
        (**self).create_folder_if_not_exist(folder).await
    }
}

/// Join path segments with `/`, ignoring empty segments and stray slashes
pub fn join_path<S: AsRef<str>>(segments: &[S]) -> String {
    let mut joined = String::new();
    for (i, segment) in segments.iter().enumerate() {
        let segment = segment.as_ref();
        let trimmed = if i == 0 {
            segment.trim_end_matches('/')
        } else {
            segment.trim_matches('/')
        };
        if trimmed.is_empty() {
            if i == 0 && segment.starts_with('/') {
                joined.push('/');
            }
            continue;
        }
        if !joined.is_empty() && !joined.ends_with('/') {
            joined.push('/');
        }
        joined.push_str(trimmed);
    }
    joined
}

/// Fetcher over the entries of a remote folder, each name its own identity
pub fn remote_listing<C>(
    client: Arc<C>,
    folder: impl Into<String>,
) -> ListingFetcher<impl FnOnce() -> futures::future::BoxFuture<'static, anyhow::Result<Vec<Item<String>>>>>
where
    C: RemoteClient + ?Sized + 'static,
{
    let folder = folder.into();
    ListingFetcher::new(move || -> futures::future::BoxFuture<'static, anyhow::Result<Vec<Item<String>>>> {
        Box::pin(async move {
            let names = client
                .list_folder(&folder)
                .await
                .map_err(|e| anyhow::Error::new(e).context(format!("listing {}", folder)))?;
            Ok(names
                .into_iter()
                .map(|name| Item::new(name.clone(), name))
                .collect())
        })
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::pipeline::fetcher::Fetcher;
    use futures::StreamExt;

    #[test]
    fn test_join_path() {
        assert_eq!(join_path(&["/in", "a.ok"]), "/in/a.ok");
        assert_eq!(join_path(&["/out/", "/56b/", "6f0", "a.csv"]), "/out/56b/6f0/a.csv");
        assert_eq!(join_path(&["/", "a"]), "/a");
        assert_eq!(join_path(&["rel", "", "x"]), "rel/x");
    }

    #[test]
    fn test_only_not_found_is_final() {
        assert!(RemoteError::transport("RETR", "/a", "reset").is_retryable());
        assert!(RemoteError::Timeout {
            operation: "LIST",
            path: "/".into(),
            after: Duration::from_secs(1),
        }
        .is_retryable());
        assert!(!RemoteError::not_found("/a").is_retryable());
    }

    #[tokio::test]
    async fn test_remote_listing_names_items_by_filename() {
        let client = Arc::new(
            MemoryRemoteClient::new()
                .with_file("/in/b.ok", b"")
                .with_file("/in/a.ok", b""),
        );

        let items: Vec<Item<String>> = remote_listing(client, "/in")
            .fetch_all()
            .map(|r| r.unwrap())
            .collect()
            .await;

        let ids: Vec<&str> = items.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["a.ok", "b.ok"]);
    }

    #[tokio::test]
    async fn test_remote_listing_reports_missing_folder() {
        let client = Arc::new(MemoryRemoteClient::new());

        let elements: Vec<_> = remote_listing(client, "/missing").fetch_all().collect().await;

        assert_eq!(elements.len(), 1);
        let err = elements[0].as_ref().unwrap_err();
        assert_eq!(format!("{:#}", err), "listing /missing: /missing not found");
    }
}
