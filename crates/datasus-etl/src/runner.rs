//! Pipeline runner
//!
//! Drives one identifier through download → decompress → transform, then
//! places the final artifact. The run moves through
//! `Created → Downloading → Decompressing → Transforming → Finalizing` and
//! ends in `Succeeded` or `Failed`. Stages never overlap, and the first
//! failure that is not an "already exists" skip aborts the run.
//!
//! # Example
//!
//! ```rust,ignore
//! let runner = PipelineRunner::new(downloader, decompressor, loader);
//! let report = runner.run(&"PAMS2501".parse()?, &PipelineOptions::new("./data")).await?;
//! ```

use crate::error::Result;
use crate::identifier::DatasetIdentifier;
use crate::stage::{Decompressor, Downloader, Loader, PipelineOptions, StageKind, StageOutcome};
use crate::workspace::{relocate, ScratchHandle, WorkspaceManager};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, info_span, warn, Instrument};

/// Lifecycle of a single pipeline run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Created,
    Downloading,
    Decompressing,
    Transforming,
    Finalizing,
    Succeeded,
    Failed,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunState::Created => "created",
            RunState::Downloading => "downloading",
            RunState::Decompressing => "decompressing",
            RunState::Transforming => "transforming",
            RunState::Finalizing => "finalizing",
            RunState::Succeeded => "succeeded",
            RunState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// How a stage that let the run continue finished
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageStatus {
    Completed,
    SkippedAlreadyExists,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageRecord {
    pub stage: StageKind,
    pub status: StageStatus,
    pub output: Option<PathBuf>,
}

/// Terminal status of an identifier
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunStatus {
    /// All stages ran; `artifact` is the placed final file, if any
    Succeeded { artifact: Option<PathBuf> },
    /// The final artifact was already in the workdir; nothing ran
    Skipped { artifact: PathBuf },
    /// The archive has no file for this identifier
    NotFound,
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub identifier: DatasetIdentifier,
    pub status: RunStatus,
    pub stages: Vec<StageRecord>,
}

/// Mutable state of one in-flight run
struct PipelineRun {
    identifier: DatasetIdentifier,
    state: RunState,
    stages: Vec<StageRecord>,
}

impl PipelineRun {
    fn new(identifier: DatasetIdentifier) -> Self {
        Self {
            identifier,
            state: RunState::Created,
            stages: Vec::with_capacity(3),
        }
    }

    fn transition(&mut self, to: RunState) {
        debug!(from = %self.state, to = %to, "Run state changed");
        self.state = to;
    }

    /// Record a stage outcome and hand its output to the next stage
    fn settle<T: StageOutput>(&mut self, stage: StageKind, outcome: StageOutcome<T>) -> Result<T> {
        let (status, value) = match outcome {
            StageOutcome::Completed(value) => (StageStatus::Completed, value),
            StageOutcome::SkippedAlreadyExists(value) => (StageStatus::SkippedAlreadyExists, value),
            StageOutcome::Failed(err) => {
                warn!(stage = %stage, error = %err, "Stage failed");
                return Err(err);
            }
        };
        let output = value.output_path().map(Path::to_path_buf);

        match status {
            StageStatus::Completed => info!(stage = %stage, "> {} finished", stage),
            StageStatus::SkippedAlreadyExists => info!(
                stage = %stage,
                path = ?output,
                "> output already exists. Skipping {} step", stage
            ),
        }

        self.stages.push(StageRecord {
            stage,
            status,
            output,
        });
        Ok(value)
    }

    fn into_report(self, status: RunStatus) -> RunReport {
        RunReport {
            identifier: self.identifier,
            status,
            stages: self.stages,
        }
    }
}

trait StageOutput {
    fn output_path(&self) -> Option<&Path>;
}

impl StageOutput for PathBuf {
    fn output_path(&self) -> Option<&Path> {
        Some(self)
    }
}

impl StageOutput for Option<PathBuf> {
    fn output_path(&self) -> Option<&Path> {
        self.as_deref()
    }
}

/// Runs identifiers through the three stage adapters
#[derive(Clone)]
pub struct PipelineRunner {
    downloader: Arc<dyn Downloader>,
    decompressor: Arc<dyn Decompressor>,
    loader: Arc<dyn Loader>,
    workspace: WorkspaceManager,
}

impl PipelineRunner {
    pub fn new(
        downloader: Arc<dyn Downloader>,
        decompressor: Arc<dyn Decompressor>,
        loader: Arc<dyn Loader>,
    ) -> Self {
        Self {
            downloader,
            decompressor,
            loader,
            workspace: WorkspaceManager::new(),
        }
    }

    pub fn with_workspace(mut self, workspace: WorkspaceManager) -> Self {
        self.workspace = workspace;
        self
    }

    /// Where the final artifact for `identifier` lands, if the loader
    /// produces one
    pub fn final_artifact_path(
        &self,
        identifier: &DatasetIdentifier,
        options: &PipelineOptions,
    ) -> Option<PathBuf> {
        self.loader
            .artifact_name(identifier)
            .map(|name| options.workdir.join(name))
    }

    /// Run every stage for `identifier`
    ///
    /// Returns `Skipped` without touching any stage when the final artifact
    /// already exists and `options.overwrite` is false.
    pub async fn run(
        &self,
        identifier: &DatasetIdentifier,
        options: &PipelineOptions,
    ) -> Result<RunReport> {
        let span = info_span!("pipeline", identifier = %identifier);
        self.run_inner(identifier, options).instrument(span).await
    }

    async fn run_inner(
        &self,
        identifier: &DatasetIdentifier,
        options: &PipelineOptions,
    ) -> Result<RunReport> {
        info!("Starting ETL process for {}", identifier);

        if let Some(artifact) = self.final_artifact_path(identifier, options) {
            if !options.overwrite && tokio::fs::try_exists(&artifact).await? {
                warn!(
                    artifact = %artifact.display(),
                    "> final artifact already exists. Skipping ETL process."
                );
                return Ok(PipelineRun::new(identifier.clone())
                    .into_report(RunStatus::Skipped { artifact }));
            }
        }

        let scratch = self.workspace.acquire()?;
        debug!(
            workdir = %options.workdir.display(),
            overwrite = options.overwrite,
            keep_intermediates = options.keep_intermediates,
            scratch = %scratch.root().display(),
            "Run options"
        );

        let mut run = PipelineRun::new(identifier.clone());
        let result = self.drive(&mut run, &scratch, options).await;

        if let Err(e) = scratch.release() {
            warn!(error = %e, "Failed to remove scratch workspace");
        }

        match result {
            Ok(artifact) => {
                run.transition(RunState::Succeeded);
                info!("ETL process completed successfully for {}", identifier);
                Ok(run.into_report(RunStatus::Succeeded { artifact }))
            }
            Err(e) => {
                run.transition(RunState::Failed);
                Err(e)
            }
        }
    }

    async fn drive(
        &self,
        run: &mut PipelineRun,
        scratch: &ScratchHandle,
        options: &PipelineOptions,
    ) -> Result<Option<PathBuf>> {
        let overwrite = options.overwrite;

        run.transition(RunState::Downloading);
        info!("Downloading {}...", run.identifier.archive_filename());
        let outcome = self
            .downloader
            .download(&run.identifier, scratch.root(), overwrite)
            .await;
        let downloaded = run.settle(StageKind::Download, outcome)?;

        run.transition(RunState::Decompressing);
        info!("Uncompressing {}...", downloaded.display());
        let outcome = self
            .decompressor
            .decompress(&downloaded, scratch.root(), overwrite)
            .await;
        let decompressed = run.settle(StageKind::Decompress, outcome)?;

        run.transition(RunState::Transforming);
        info!("Transforming {}...", decompressed.display());
        let outcome = self.loader.load(&decompressed, overwrite).await;
        let loaded = run.settle(StageKind::Transform, outcome)?;

        run.transition(RunState::Finalizing);
        if options.keep_intermediates {
            for intermediate in [&downloaded, &decompressed] {
                if tokio::fs::try_exists(intermediate).await? {
                    relocate(intermediate, &options.workdir).await?;
                } else {
                    warn!(path = %intermediate.display(), "Intermediate file vanished before relocation");
                }
            }
        }

        // The final artifact marks the identifier as done, so it goes last
        match loaded {
            Some(path) => Ok(Some(relocate(&path, &options.workdir).await?)),
            None => Ok(None),
        }
    }
}

impl fmt::Debug for PipelineRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineRunner")
            .field("workspace", &self.workspace)
            .finish_non_exhaustive()
    }
}

/// Fold a run result into a status, downgrading a missing remote file to
/// [`RunStatus::NotFound`]
pub fn settle_not_found(
    identifier: &DatasetIdentifier,
    result: Result<RunReport>,
) -> Result<RunReport> {
    match result {
        Err(e) if e.is_not_found() => {
            warn!(identifier = %identifier, error = %e, "Data for {} not found on server. Skipping.", identifier);
            Ok(RunReport {
                identifier: identifier.clone(),
                status: RunStatus::NotFound,
                stages: Vec::new(),
            })
        }
        other => other,
    }
}
