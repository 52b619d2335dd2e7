//! DATASUS Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Ambient plumbing shared by the DATASUS ETL workspace members.
//!
//! - **Logging**: `tracing` subscriber setup driven by a [`logging::LogConfig`]
//!
//! # Example
//!
//! ```no_run
//! use datasus_common::logging::{init_logging, LogConfig};
//!
//! fn main() -> anyhow::Result<()> {
//!     init_logging(&LogConfig::from_env()?)?;
//!     Ok(())
//! }
//! ```

pub mod logging;

pub use logging::{init_logging, LogConfig, LogFormat, LogLevel, LogOutput};
