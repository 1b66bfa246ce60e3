//! Ingot Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared error handling, logging and checksum helpers for the ingot
//! workspace members.
//!
//! # Example
//!
//! ```no_run
//! use ingot_common::checksum::md5_hex;
//! use ingot_common::logging::{init_logging, LogConfig};
//!
//! fn main() -> anyhow::Result<()> {
//!     let _guard = init_logging(&LogConfig::from_env()?)?;
//!     tracing::info!(digest = %md5_hex(b"abc.txt"), "started");
//!     Ok(())
//! }
//! ```

pub mod checksum;
pub mod error;
pub mod logging;

// Re-export commonly used types
pub use error::{IngotError, Result};
