//! DATASUS ETL
//!
//! Batch ETL for the files DATASUS publishes on its public FTP archive.
//!
//! # Overview
//!
//! - **Identifiers**: `PA<UF><YY><MM>` monthly records and `POPSBR<YY>`
//!   yearly population files ([`identifier`])
//! - **Stages**: download, decompress, transform, each an async trait with an
//!   "already exists" skip signal ([`stage`])
//! - **Runner**: drives one identifier through the stages in a private
//!   scratch workspace and places the final artifact ([`runner`],
//!   [`workspace`])
//! - **Scheduler**: runs a date window of identifiers with bounded
//!   concurrency ([`scheduler`])
//! - **Adapters**: FTP, blast-dbf/zip, SQLite and optionally Postgres
//!   ([`adapters`])

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod adapters;
pub mod cli;
pub mod config;
pub mod dbf;
pub mod error;
pub mod identifier;
pub mod runner;
pub mod scheduler;
pub mod stage;
pub mod workspace;

// Re-export commonly used types
pub use cli::{Cli, Commands, StoreKind};
pub use config::EtlConfig;
pub use error::{ErrorKind, EtlError, Result};
pub use identifier::{DatasetIdentifier, Family, IdentifierTemplate, YearMonth};
pub use runner::{PipelineRunner, RunReport, RunStatus};
pub use scheduler::{PeriodReport, PeriodScheduler, ScheduleWindow};
pub use stage::{Decompressor, Downloader, Loader, PipelineOptions, StageOutcome};
pub use workspace::WorkspaceManager;
