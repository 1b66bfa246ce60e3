//! FTP transport
//!
//! Each operation opens its own session on a blocking thread
//! (`spawn_blocking`), uses Extended Passive Mode (EPSV) and binary
//! transfers, then quits. Retries and timeouts are layered on top with
//! [`RetryingRemote`](super::RetryingRemote).

use async_trait::async_trait;
use std::io::Read;
use suppaftp::{FtpError, FtpStream, Status};
use tracing::{debug, warn};

use super::{RemoteClient, RemoteError, RemoteResult};

/// Default FTP control port
pub const DEFAULT_FTP_PORT: u16 = 21;

/// Connection settings
#[derive(Debug, Clone)]
pub struct FtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

impl Default for FtpConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: DEFAULT_FTP_PORT,
            username: "anonymous".to_string(),
            password: "anonymous@localhost".to_string(),
        }
    }
}

impl FtpConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// [`RemoteClient`] backed by `suppaftp`
#[derive(Debug, Clone)]
pub struct FtpRemoteClient {
    config: FtpConfig,
}

impl FtpRemoteClient {
    pub fn new(config: FtpConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &FtpConfig {
        &self.config
    }

    /// Run `op` on a fresh logged-in session, off the async runtime
    async fn session<T, F>(&self, operation: &'static str, path: &str, op: F) -> RemoteResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut FtpStream) -> Result<T, FtpError> + Send + 'static,
    {
        let config = self.config.clone();
        let target = path.to_string();

        let joined = tokio::task::spawn_blocking(move || {
            let mut ftp_stream = connect(&config)?;
            let result = op(&mut ftp_stream);
            if let Err(e) = ftp_stream.quit() {
                warn!("Failed to quit FTP session gracefully: {}", e);
            }
            result
        })
        .await;

        match joined {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(map_error(operation, path, e)),
            Err(e) => Err(RemoteError::transport(
                operation,
                target,
                format!("FTP task panicked: {}", e),
            )),
        }
    }
}

fn connect(config: &FtpConfig) -> Result<FtpStream, FtpError> {
    debug!("Connecting to FTP server: {}", config.address());
    let mut ftp_stream = FtpStream::connect(config.address())?;

    // Use Extended Passive Mode - better for NAT/Docker environments
    ftp_stream.set_mode(suppaftp::Mode::ExtendedPassive);

    debug!("Logging in as: {}", config.username);
    ftp_stream.login(&config.username, &config.password)?;
    ftp_stream.transfer_type(suppaftp::types::FileType::Binary)?;
    Ok(ftp_stream)
}

/// 550 means the file or folder is missing; everything else is transport
fn map_error(operation: &'static str, path: &str, error: FtpError) -> RemoteError {
    match error {
        FtpError::UnexpectedResponse(ref response) if response.status == Status::FileUnavailable => {
            RemoteError::not_found(path)
        },
        other => RemoteError::transport(operation, path, other),
    }
}

/// NLST may answer with bare names or full paths
fn entry_name(entry: &str) -> Option<String> {
    let name = entry.trim().trim_end_matches('/').rsplit('/').next()?;
    match name {
        "" | "." | ".." => None,
        name => Some(name.to_string()),
    }
}

#[async_trait]
impl RemoteClient for FtpRemoteClient {
    async fn list_folder(&self, folder: &str) -> RemoteResult<Vec<String>> {
        let dir = folder.to_string();
        let mut names: Vec<String> = self
            .session("LIST", folder, move |ftp| {
                ftp.cwd(&dir)?;
                match ftp.nlst(None) {
                    Ok(entries) => Ok(entries),
                    // some servers refuse NLST on an empty folder
                    Err(FtpError::UnexpectedResponse(ref r)) if r.status == Status::FileUnavailable => {
                        Ok(Vec::new())
                    },
                    Err(e) => Err(e),
                }
            })
            .await?
            .iter()
            .filter_map(|entry| entry_name(entry))
            .collect();
        names.sort();
        debug!("Listed {} ({} entries)", folder, names.len());
        Ok(names)
    }

    async fn download_file(&self, path: &str) -> RemoteResult<Vec<u8>> {
        let file = path.to_string();
        let data = self
            .session("RETR", path, move |ftp| {
                let mut reader = ftp.retr_as_buffer(&file)?;
                let mut data = Vec::new();
                reader
                    .read_to_end(&mut data)
                    .map_err(FtpError::ConnectionError)?;
                Ok(data)
            })
            .await?;
        debug!("Downloaded {} bytes from {}", data.len(), path);
        Ok(data)
    }

    async fn move_file(&self, from: &str, to: &str) -> RemoteResult<()> {
        let (source, destination) = (from.to_string(), to.to_string());
        self.session("RNFR", from, move |ftp| ftp.rename(&source, &destination))
            .await?;
        debug!("Moved {} -> {}", from, to);
        Ok(())
    }

    async fn delete_file(&self, path: &str) -> RemoteResult<()> {
        let file = path.to_string();
        self.session("DELE", path, move |ftp| ftp.rm(&file)).await
    }

    async fn create_folder_if_not_exist(&self, folder: &str) -> RemoteResult<()> {
        let dir = folder.to_string();
        self.session("MKD", folder, move |ftp| {
            if ftp.cwd(&dir).is_ok() {
                return Ok(());
            }
            match ftp.mkdir(&dir) {
                Ok(()) => Ok(()),
                // another session created it after the first check
                Err(_) if ftp.cwd(&dir).is_ok() => Ok(()),
                Err(e) => Err(e),
            }
        })
        .await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_name_normalizes_paths() {
        assert_eq!(entry_name("/in/a.ok").as_deref(), Some("a.ok"));
        assert_eq!(entry_name("a.ok\r").as_deref(), Some("a.ok"));
        assert_eq!(entry_name("sub/").as_deref(), Some("sub"));
        assert_eq!(entry_name("."), None);
        assert_eq!(entry_name(""), None);
    }

    #[test]
    fn test_config_default() {
        let config = FtpConfig::default();
        assert_eq!(config.port, 21);
        assert_eq!(config.address(), "localhost:21");
    }

    #[tokio::test]
    async fn test_unreachable_server_is_a_transport_error() {
        let client = FtpRemoteClient::new(FtpConfig {
            host: "127.0.0.1".to_string(),
            port: 1,
            ..FtpConfig::default()
        });

        let err = client.list_folder("/in").await.unwrap_err();

        assert!(err.is_retryable());
    }
}
