//! Stage adapter contract
//!
//! A pipeline run is three stages: download, decompress, transform/load. Each
//! stage is an async trait so the runner can be driven by the real FTP and
//! codec adapters in production and by in-memory fakes in tests.
//!
//! Every implementation must:
//!
//! 1. check for its output before doing any work and, unless `overwrite` is
//!    set, return [`StageOutcome::SkippedAlreadyExists`] without side effects
//! 2. never leave a partially written output behind
//! 3. report every other failure as [`StageOutcome::Failed`]

use crate::error::{EtlError, Result};
use crate::identifier::DatasetIdentifier;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Per-invocation options threaded from the entry point into every run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineOptions {
    /// Destination directory for final artifacts
    pub workdir: PathBuf,

    /// Re-execute stages whose output already exists
    pub overwrite: bool,

    /// Move downloaded and decompressed files into `workdir` as well
    pub keep_intermediates: bool,
}

impl PipelineOptions {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
            overwrite: false,
            keep_intermediates: false,
        }
    }

    pub fn with_overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    pub fn with_keep_intermediates(mut self, keep: bool) -> Self {
        self.keep_intermediates = keep;
        self
    }
}

/// Result of executing one stage
#[derive(Debug)]
pub enum StageOutcome<T = PathBuf> {
    /// The stage produced its output
    Completed(T),
    /// The output was already present; carries the path the next stage reads
    SkippedAlreadyExists(T),
    Failed(EtlError),
}

impl<T> StageOutcome<T> {
    /// Collapse into the value the next stage consumes, or the fatal error
    pub fn into_result(self) -> Result<T> {
        match self {
            StageOutcome::Completed(value) | StageOutcome::SkippedAlreadyExists(value) => Ok(value),
            StageOutcome::Failed(err) => Err(err),
        }
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, StageOutcome::SkippedAlreadyExists(_))
    }
}

impl From<Result<PathBuf>> for StageOutcome<PathBuf> {
    fn from(result: Result<PathBuf>) -> Self {
        match result {
            Ok(path) => StageOutcome::Completed(path),
            Err(EtlError::AlreadyExists(path)) => StageOutcome::SkippedAlreadyExists(path),
            Err(err) => StageOutcome::Failed(err),
        }
    }
}

impl From<Result<Option<PathBuf>>> for StageOutcome<Option<PathBuf>> {
    fn from(result: Result<Option<PathBuf>>) -> Self {
        match result {
            Ok(path) => StageOutcome::Completed(path),
            Err(EtlError::AlreadyExists(path)) => StageOutcome::SkippedAlreadyExists(Some(path)),
            Err(err) => StageOutcome::Failed(err),
        }
    }
}

/// The three pipeline stages, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageKind {
    Download,
    Decompress,
    Transform,
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageKind::Download => write!(f, "download"),
            StageKind::Decompress => write!(f, "decompress"),
            StageKind::Transform => write!(f, "transform"),
        }
    }
}

/// Fetches the archive file for an identifier into a local directory
#[async_trait]
pub trait Downloader: Send + Sync {
    async fn download(
        &self,
        identifier: &DatasetIdentifier,
        dest_dir: &Path,
        overwrite: bool,
    ) -> StageOutcome;
}

/// Turns a downloaded archive into a plain DBF table
#[async_trait]
pub trait Decompressor: Send + Sync {
    async fn decompress(&self, input: &Path, dest_dir: &Path, overwrite: bool) -> StageOutcome;
}

/// Transforms a DBF table into its final store
#[async_trait]
pub trait Loader: Send + Sync {
    /// Load `input`; the outcome carries the produced file, or `None` when
    /// the records went into a shared store
    async fn load(&self, input: &Path, overwrite: bool) -> StageOutcome<Option<PathBuf>>;

    /// File name of the final artifact for `identifier`, used as the
    /// run-level idempotency marker. `None` for shared stores.
    fn artifact_name(&self, identifier: &DatasetIdentifier) -> Option<String>;
}

/// Fail with [`EtlError::AlreadyExists`] when `path` exists and overwriting
/// was not requested
pub(crate) async fn guard_existing(path: &Path, overwrite: bool) -> Result<()> {
    if !overwrite && tokio::fs::try_exists(path).await? {
        return Err(EtlError::AlreadyExists(path.to_path_buf()));
    }
    Ok(())
}

/// Sibling path used while an output is being written
pub(crate) fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".partial");
    path.with_file_name(name)
}
