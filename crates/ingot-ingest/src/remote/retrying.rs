//! Retry and timeout decorator for any [`RemoteClient`]

use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;

use super::{RemoteClient, RemoteError, RemoteResult};
use crate::pipeline::retry::RetryPolicy;

/// Wraps a client so every call is bounded by `timeout` and transport
/// failures (timeouts included) are retried under `policy`. `NotFound` is
/// returned at once.
pub struct RetryingRemote<C> {
    inner: C,
    policy: RetryPolicy,
    timeout: Option<Duration>,
}

impl<C: RemoteClient> RetryingRemote<C> {
    pub fn new(inner: C, policy: RetryPolicy) -> Self {
        Self {
            inner,
            policy,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }

    async fn call<T, F, Fut>(&self, operation: &'static str, path: &str, op: F) -> RemoteResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = RemoteResult<T>>,
    {
        let timeout = self.timeout;
        let op = &op;
        self.policy
            .retry(
                operation,
                move || async move {
                    match timeout {
                        Some(after) => tokio::time::timeout(after, op())
                            .await
                            .unwrap_or_else(|_| {
                                Err(RemoteError::Timeout {
                                    operation,
                                    path: path.to_string(),
                                    after,
                                })
                            }),
                        None => op().await,
                    }
                },
                RemoteError::is_retryable,
            )
            .await
    }
}

#[async_trait]
impl<C: RemoteClient> RemoteClient for RetryingRemote<C> {
    async fn list_folder(&self, folder: &str) -> RemoteResult<Vec<String>> {
        self.call("LIST", folder, || self.inner.list_folder(folder)).await
    }

    async fn download_file(&self, path: &str) -> RemoteResult<Vec<u8>> {
        self.call("RETR", path, || self.inner.download_file(path)).await
    }

    async fn move_file(&self, from: &str, to: &str) -> RemoteResult<()> {
        self.call("RNFR", from, || self.inner.move_file(from, to)).await
    }

    async fn delete_file(&self, path: &str) -> RemoteResult<()> {
        self.call("DELE", path, || self.inner.delete_file(path)).await
    }

    async fn create_folder_if_not_exist(&self, folder: &str) -> RemoteResult<()> {
        self.call("MKD", folder, || self.inner.create_folder_if_not_exist(folder))
            .await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::pipeline::retry::Backoff;
    use crate::remote::MemoryRemoteClient;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_are_retried() {
        let memory = MemoryRemoteClient::new().with_file("/in/a.csv", b"data");
        memory.fail_next_calls(2);
        let client = RetryingRemote::new(memory, RetryPolicy::new(3, Backoff::Fixed { delay_ms: 500 }));

        let data = client.download_file("/in/a.csv").await.unwrap();

        assert_eq!(data, b"data");
    }

    #[tokio::test]
    async fn test_not_found_is_not_retried() {
        let memory = MemoryRemoteClient::new().with_folder("/in");
        let client = RetryingRemote::new(memory, RetryPolicy::new(5, Backoff::None));

        let err = client.download_file("/in/missing.csv").await.unwrap_err();

        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_budget_exhaustion_returns_last_error() {
        let memory = MemoryRemoteClient::new().with_file("/in/a.csv", b"data");
        memory.fail_next_calls(10);
        let client = RetryingRemote::new(memory, RetryPolicy::new(3, Backoff::None));

        let err = client.download_file("/in/a.csv").await.unwrap_err();

        assert!(matches!(err, RemoteError::Transport { .. }));
        client.inner().clear_failures();
        assert!(client.download_file("/in/a.csv").await.is_ok());
    }

    struct Stalled {
        calls: AtomicU32,
    }

    #[async_trait]
    impl RemoteClient for Stalled {
        async fn list_folder(&self, _folder: &str) -> RemoteResult<Vec<String>> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n == 0 {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            Ok(vec!["a.ok".to_string()])
        }

        async fn download_file(&self, path: &str) -> RemoteResult<Vec<u8>> {
            Err(RemoteError::not_found(path))
        }

        async fn move_file(&self, from: &str, _to: &str) -> RemoteResult<()> {
            Err(RemoteError::not_found(from))
        }

        async fn delete_file(&self, path: &str) -> RemoteResult<()> {
            Err(RemoteError::not_found(path))
        }

        async fn create_folder_if_not_exist(&self, _folder: &str) -> RemoteResult<()> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_retryable() {
        let client = RetryingRemote::new(
            Stalled {
                calls: AtomicU32::new(0),
            },
            RetryPolicy::new(2, Backoff::None),
        )
        .with_timeout(Duration::from_secs(30));

        let names = client.list_folder("/in").await.unwrap();

        assert_eq!(names, vec!["a.ok"]);
        assert_eq!(client.inner().calls.load(Ordering::SeqCst), 2);
    }
}
