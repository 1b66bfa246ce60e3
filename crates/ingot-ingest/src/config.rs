//! Ingestion configuration
//!
//! Loaded from `INGOT_*` environment variables (a `.env` file is honored by
//! the binary). Unset variables fall back to the `DEFAULT_*` constants; set
//! but malformed variables are errors rather than silently ignored.

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::persist::SubdirStrategy;
use crate::pipeline::retry::{Backoff, RetryPolicy};
use crate::remote::FtpConfig;
use crate::transfer::{FileType, RemoteFolders, TransferConfig};

pub use crate::remote::ftp::DEFAULT_FTP_PORT;

pub const DEFAULT_FTP_HOST: &str = "localhost";
pub const DEFAULT_FTP_USER: &str = "anonymous";
pub const DEFAULT_FTP_PASSWORD: &str = "anonymous@localhost";
pub const DEFAULT_INCOMING_DIR: &str = "/incoming";
pub const DEFAULT_PROCESSING_DIR: &str = "/processing";
pub const DEFAULT_ARCHIVED_DIR: &str = "/archived";
pub const DEFAULT_SKIPPED_DIR: &str = "/skipped";
pub const DEFAULT_BATCH_SIZE: usize = 50;
pub const DEFAULT_CONCURRENCY: usize = 4;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_RETRY_DELAY_MS: u64 = 5_000;
pub const DEFAULT_TIMEOUT_SECS: u64 = 120;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{key} has invalid value '{value}': {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error("{0}")]
    Validation(String),

    #[error("failed to read file types from {path}")]
    FileTypes {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },
}

impl ConfigError {
    fn invalid(key: &'static str, value: &str, reason: impl std::fmt::Display) -> Self {
        ConfigError::Invalid {
            key,
            value: value.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Everything the `ingot-ingest` binary needs
#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub ftp: FtpConfig,
    pub folders: RemoteFolders,
    pub batch_size: usize,
    /// Paired moves in flight within a batch
    pub concurrency: usize,
    /// Attempts per remote call, including the first
    pub max_attempts: u32,
    /// Linear backoff step between remote attempts
    pub retry_delay_ms: u64,
    /// Bound on a single remote call
    pub timeout_secs: u64,
    pub subdir: SubdirStrategy,
    pub date_from: Option<NaiveDateTime>,
    pub date_to: Option<NaiveDateTime>,
    /// JSON array of file type definitions; all files when unset
    pub file_types_path: Option<PathBuf>,
    pub max_consecutive_failed_batches: Option<usize>,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            ftp: FtpConfig {
                host: DEFAULT_FTP_HOST.to_string(),
                port: DEFAULT_FTP_PORT,
                username: DEFAULT_FTP_USER.to_string(),
                password: DEFAULT_FTP_PASSWORD.to_string(),
            },
            folders: RemoteFolders {
                incoming: DEFAULT_INCOMING_DIR.to_string(),
                processing: DEFAULT_PROCESSING_DIR.to_string(),
                archived: DEFAULT_ARCHIVED_DIR.to_string(),
                skipped: DEFAULT_SKIPPED_DIR.to_string(),
            },
            batch_size: DEFAULT_BATCH_SIZE,
            concurrency: DEFAULT_CONCURRENCY,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            subdir: SubdirStrategy::Flat,
            date_from: None,
            date_to: None,
            file_types_path: None,
            max_consecutive_failed_batches: None,
        }
    }
}

fn parse_var<T>(key: &'static str, raw: Option<String>, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match raw {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|e| ConfigError::invalid(key, &value, e)),
        None => Ok(default),
    }
}

impl IngestConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup
    pub fn from_lookup<L>(lookup: L) -> Result<Self, ConfigError>
    where
        L: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let date_from = var("INGOT_DATE_FROM")
            .map(|v| parse_date_bound("INGOT_DATE_FROM", &v, false))
            .transpose()?;
        let date_to = var("INGOT_DATE_TO")
            .map(|v| parse_date_bound("INGOT_DATE_TO", &v, true))
            .transpose()?;
        let max_consecutive_failed_batches = var("INGOT_MAX_CONSECUTIVE_FAILED_BATCHES")
            .map(|v| {
                v.trim().parse::<usize>().map_err(|e| {
                    ConfigError::invalid("INGOT_MAX_CONSECUTIVE_FAILED_BATCHES", &v, e)
                })
            })
            .transpose()?;

        let config = Self {
            ftp: FtpConfig {
                host: var("INGOT_FTP_HOST").unwrap_or(defaults.ftp.host),
                port: parse_var("INGOT_FTP_PORT", var("INGOT_FTP_PORT"), defaults.ftp.port)?,
                username: var("INGOT_FTP_USER").unwrap_or(defaults.ftp.username),
                password: var("INGOT_FTP_PASSWORD").unwrap_or(defaults.ftp.password),
            },
            folders: RemoteFolders {
                incoming: var("INGOT_INCOMING_DIR").unwrap_or(defaults.folders.incoming),
                processing: var("INGOT_PROCESSING_DIR").unwrap_or(defaults.folders.processing),
                archived: var("INGOT_ARCHIVED_DIR").unwrap_or(defaults.folders.archived),
                skipped: var("INGOT_SKIPPED_DIR").unwrap_or(defaults.folders.skipped),
            },
            batch_size: parse_var("INGOT_BATCH_SIZE", var("INGOT_BATCH_SIZE"), defaults.batch_size)?,
            concurrency: parse_var(
                "INGOT_CONCURRENCY",
                var("INGOT_CONCURRENCY"),
                defaults.concurrency,
            )?,
            max_attempts: parse_var(
                "INGOT_MAX_ATTEMPTS",
                var("INGOT_MAX_ATTEMPTS"),
                defaults.max_attempts,
            )?,
            retry_delay_ms: parse_var(
                "INGOT_RETRY_DELAY_MS",
                var("INGOT_RETRY_DELAY_MS"),
                defaults.retry_delay_ms,
            )?,
            timeout_secs: parse_var(
                "INGOT_TIMEOUT_SECS",
                var("INGOT_TIMEOUT_SECS"),
                defaults.timeout_secs,
            )?,
            subdir: parse_var("INGOT_SUBDIR", var("INGOT_SUBDIR"), defaults.subdir)?,
            date_from,
            date_to,
            file_types_path: var("INGOT_FILE_TYPES").map(PathBuf::from),
            max_consecutive_failed_batches,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ftp.host.trim().is_empty() {
            return Err(ConfigError::Validation("INGOT_FTP_HOST must not be empty".into()));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::Validation("INGOT_BATCH_SIZE must be greater than 0".into()));
        }
        if self.concurrency == 0 {
            return Err(ConfigError::Validation("INGOT_CONCURRENCY must be greater than 0".into()));
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::Validation("INGOT_MAX_ATTEMPTS must be greater than 0".into()));
        }
        if self.timeout_secs == 0 {
            return Err(ConfigError::Validation("INGOT_TIMEOUT_SECS must be greater than 0".into()));
        }
        if self.max_consecutive_failed_batches == Some(0) {
            return Err(ConfigError::Validation(
                "INGOT_MAX_CONSECUTIVE_FAILED_BATCHES must be greater than 0".into(),
            ));
        }
        if let (Some(from), Some(to)) = (self.date_from, self.date_to) {
            if from > to {
                return Err(ConfigError::Validation(format!(
                    "INGOT_DATE_FROM ({}) is after INGOT_DATE_TO ({})",
                    from, to
                )));
            }
        }

        let folders = [
            &self.folders.incoming,
            &self.folders.processing,
            &self.folders.archived,
            &self.folders.skipped,
        ];
        for (i, a) in folders.iter().enumerate() {
            if a.trim().is_empty() {
                return Err(ConfigError::Validation("remote folders must not be empty".into()));
            }
            if folders[i + 1..].iter().any(|b| b.trim_end_matches('/') == a.trim_end_matches('/')) {
                return Err(ConfigError::Validation(format!(
                    "remote folder {} is configured for more than one role",
                    a
                )));
            }
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            Backoff::Linear {
                delay_ms: self.retry_delay_ms,
            },
        )
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Configured file types, or the all-files wildcard
    pub fn file_types(&self) -> Result<Vec<FileType>, ConfigError> {
        match self.file_types_path {
            Some(ref path) => load_file_types(path),
            None => Ok(vec![FileType::all_files()]),
        }
    }

    pub fn transfer_config(&self) -> Result<TransferConfig, ConfigError> {
        Ok(TransferConfig {
            folders: self.folders.clone(),
            file_types: self.file_types()?,
            date_from: self.date_from,
            date_to: self.date_to,
            subdir: self.subdir,
            batch_size: self.batch_size,
            concurrency: self.concurrency,
            max_consecutive_failed_batches: self.max_consecutive_failed_batches,
        })
    }
}

/// Read a JSON array of file type definitions
pub fn load_file_types(path: &Path) -> Result<Vec<FileType>, ConfigError> {
    let wrap = |source: anyhow::Error| ConfigError::FileTypes {
        path: path.to_path_buf(),
        source,
    };
    let content = std::fs::read_to_string(path).map_err(|e| wrap(e.into()))?;
    let types: Vec<FileType> = serde_json::from_str(&content).map_err(|e| wrap(e.into()))?;
    if types.is_empty() {
        return Err(wrap(anyhow::anyhow!("no file types defined")));
    }
    Ok(types)
}

/// Parse a date bound: `YYYY-MM-DD`, `YYYY-MM-DDTHH:MM:SS` or the filename
/// form `YYYYMMDD_HHMMSS`. A bare date as upper bound means end of that day.
pub fn parse_date_bound(
    key: &'static str,
    value: &str,
    upper: bool,
) -> Result<NaiveDateTime, ConfigError> {
    let value = value.trim();

    for format in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S", "%Y%m%d_%H%M%S"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(value, format) {
            return Ok(dt);
        }
    }

    let date = NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(value, "%Y%m%d"))
        .map_err(|_| {
            ConfigError::invalid(
                key,
                value,
                "expected YYYY-MM-DD, YYYY-MM-DDTHH:MM:SS or YYYYMMDD_HHMMSS",
            )
        })?;

    let time = if upper {
        NaiveTime::from_hms_opt(23, 59, 59)
    } else {
        NaiveTime::from_hms_opt(0, 0, 0)
    };
    time.map(|t| date.and_time(t))
        .ok_or_else(|| ConfigError::invalid(key, value, "invalid time of day"))
}
