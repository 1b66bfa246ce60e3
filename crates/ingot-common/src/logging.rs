//! Logging configuration and initialization
//!
//! All ingot binaries log through `tracing`. This module builds the global
//! subscriber from a [`LogConfig`]:
//!
//! - console output, human-readable text or JSON
//! - optional daily-rolling log files (no ANSI colors)
//! - level and per-module filter directives
//!
//! Library code never prints; use `trace!` .. `error!` with structured
//! fields, e.g. `info!(batch = n, succeeded, "Batch processed")`.
//!
//! # Example
//!
//! ```no_run
//! use ingot_common::logging::{init_logging, LogConfig};
//!
//! let config = LogConfig::from_env().unwrap_or_default();
//! // keep the guard alive until shutdown so buffered file logs are flushed
//! let _guard = init_logging(&config).unwrap();
//! ```

use crate::error::{IngotError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, MakeWriter},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

/// Default level directive when nothing else is configured
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Default prefix for rolling log files
pub const DEFAULT_LOG_FILE_PREFIX: &str = "ingot";

/// Log line format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable text format
    #[default]
    Text,
    /// One JSON object per line
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = IngotError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" | "pretty" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            _ => Err(IngotError::Logging(format!("Invalid log format: {}", s))),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Base level directive (`trace`, `debug`, `info`, `warn`, `error`)
    pub level: String,

    /// Output format for every sink
    pub format: LogFormat,

    /// When set, logs are also written to daily files in this directory
    pub log_dir: Option<PathBuf>,

    /// Log file name prefix (`ingot` -> `ingot.2026-01-18`)
    pub log_file_prefix: String,

    /// Extra comma-separated directives, e.g. `suppaftp=warn,ingot_ingest=debug`
    pub filter_directives: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: DEFAULT_LOG_LEVEL.to_string(),
            format: LogFormat::Text,
            log_dir: None,
            log_file_prefix: DEFAULT_LOG_FILE_PREFIX.to_string(),
            filter_directives: None,
        }
    }
}

impl LogConfig {
    /// Load configuration from environment variables
    ///
    /// - `LOG_LEVEL`: base level
    /// - `LOG_FORMAT`: `text` or `json`
    /// - `LOG_DIR`: enables file output into this directory
    /// - `LOG_FILE_PREFIX`: rolling file prefix
    /// - `LOG_FILTER`: additional filter directives
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(level) = std::env::var("LOG_LEVEL") {
            config.level = level;
        }

        if let Ok(format) = std::env::var("LOG_FORMAT") {
            config.format = format.parse()?;
        }

        if let Ok(dir) = std::env::var("LOG_DIR") {
            config.log_dir = Some(PathBuf::from(dir));
        }

        if let Ok(prefix) = std::env::var("LOG_FILE_PREFIX") {
            config.log_file_prefix = prefix;
        }

        if let Ok(filter) = std::env::var("LOG_FILTER") {
            config.filter_directives = Some(filter);
        }

        Ok(config)
    }

    /// Raise the base level to `debug` when `verbose` is set
    pub fn verbose(mut self, verbose: bool) -> Self {
        if verbose {
            self.level = "debug".to_string();
        }
        self
    }

    fn env_filter(&self) -> Result<EnvFilter> {
        let mut directives = self.level.clone();
        if let Some(ref extra) = self.filter_directives {
            directives.push(',');
            directives.push_str(extra);
        }

        EnvFilter::try_new(&directives)
            .map_err(|e| IngotError::Logging(format!("Invalid filter '{}': {}", directives, e)))
    }
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

fn fmt_layer<W>(writer: W, format: LogFormat, ansi: bool) -> BoxedLayer
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let layer = fmt::layer()
        .with_writer(writer)
        .with_target(true)
        .with_ansi(ansi);

    match format {
        LogFormat::Text => layer.boxed(),
        LogFormat::Json => layer.json().boxed(),
    }
}

/// Install the global tracing subscriber.
///
/// Must be called once at startup. When file output is enabled the returned
/// guard has to outlive the program's logging, dropping it flushes and stops
/// the background writer.
pub fn init_logging(config: &LogConfig) -> Result<Option<WorkerGuard>> {
    let filter = config.env_filter()?;

    let mut layers: Vec<BoxedLayer> = vec![fmt_layer(std::io::stdout, config.format, true)];
    let mut guard = None;

    if let Some(ref dir) = config.log_dir {
        std::fs::create_dir_all(dir)?;
        let appender = tracing_appender::rolling::daily(dir, &config.log_file_prefix);
        let (writer, file_guard) = tracing_appender::non_blocking(appender);
        layers.push(fmt_layer(writer, config.format, false));
        guard = Some(file_guard);
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init()
        .map_err(|e| IngotError::Logging(e.to_string()))?;

    Ok(guard)
}
