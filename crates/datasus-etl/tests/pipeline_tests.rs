//! Runner and scheduler behaviour with in-memory stage adapters

use async_trait::async_trait;
use datasus_etl::runner::settle_not_found;
use datasus_etl::{
    DatasetIdentifier, Decompressor, Downloader, ErrorKind, EtlError, IdentifierTemplate, Loader,
    PeriodScheduler, PipelineOptions, PipelineRunner, RunStatus, ScheduleWindow, StageOutcome,
    WorkspaceManager,
};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

/// Stage fake that writes marker files and records every call
#[derive(Default)]
struct FakeStages {
    downloads: AtomicUsize,
    decompressions: AtomicUsize,
    loads: AtomicUsize,

    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,

    /// `<stage>:<identifier>` in call order
    events: Mutex<Vec<String>>,
    /// Identifiers in the order their download finished
    finished: Mutex<Vec<String>>,

    missing: HashSet<String>,
    broken_archives: HashSet<String>,
    download_delay: HashMap<String, Duration>,
    default_delay: Duration,
}

impl FakeStages {
    fn new() -> Self {
        Self::default()
    }

    fn with_missing(mut self, id: &str) -> Self {
        self.missing.insert(id.to_string());
        self
    }

    fn with_broken_archive(mut self, id: &str) -> Self {
        self.broken_archives.insert(id.to_string());
        self
    }

    fn with_delay(mut self, id: &str, delay: Duration) -> Self {
        self.download_delay.insert(id.to_string(), delay);
        self
    }

    fn with_default_delay(mut self, delay: Duration) -> Self {
        self.default_delay = delay;
        self
    }

    fn record(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }

    fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    fn calls(&self) -> (usize, usize, usize) {
        (
            self.downloads.load(Ordering::SeqCst),
            self.decompressions.load(Ordering::SeqCst),
            self.loads.load(Ordering::SeqCst),
        )
    }
}

fn stem(path: &Path) -> String {
    path.file_stem().unwrap().to_string_lossy().into_owned()
}

#[async_trait]
impl Downloader for FakeStages {
    async fn download(
        &self,
        identifier: &DatasetIdentifier,
        dest_dir: &Path,
        overwrite: bool,
    ) -> StageOutcome {
        let id = identifier.to_string();
        self.record(format!("download:{}", id));

        let dest = dest_dir.join(identifier.archive_filename());
        if dest.exists() && !overwrite {
            return StageOutcome::SkippedAlreadyExists(dest);
        }

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let delay = self.download_delay.get(&id).copied().unwrap_or(self.default_delay);
        tokio::time::sleep(delay).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        self.downloads.fetch_add(1, Ordering::SeqCst);
        self.finished.lock().unwrap().push(id.clone());

        if self.missing.contains(&id) {
            return StageOutcome::Failed(EtlError::SourceNotFound(identifier.archive_filename()));
        }
        std::fs::write(&dest, format!("archive:{}", id)).unwrap();
        StageOutcome::Completed(dest)
    }
}

#[async_trait]
impl Decompressor for FakeStages {
    async fn decompress(&self, input: &Path, dest_dir: &Path, overwrite: bool) -> StageOutcome {
        let id = stem(input);
        self.record(format!("decompress:{}", id));

        let dest = dest_dir.join(format!("{}.dbf", id));
        if dest.exists() && !overwrite {
            return StageOutcome::SkippedAlreadyExists(dest);
        }
        self.decompressions.fetch_add(1, Ordering::SeqCst);

        if self.broken_archives.contains(&id) {
            return StageOutcome::Failed(EtlError::Decompress {
                path: input.to_path_buf(),
                reason: "corrupt archive".to_string(),
            });
        }
        std::fs::write(&dest, format!("table:{}", id)).unwrap();
        StageOutcome::Completed(dest)
    }
}

#[async_trait]
impl Loader for FakeStages {
    async fn load(&self, input: &Path, overwrite: bool) -> StageOutcome<Option<PathBuf>> {
        let id = stem(input);
        self.record(format!("load:{}", id));

        let dest = input.with_extension("sqlite");
        if dest.exists() && !overwrite {
            return StageOutcome::SkippedAlreadyExists(Some(dest));
        }
        let generation = self.loads.fetch_add(1, Ordering::SeqCst) + 1;
        std::fs::write(&dest, format!("rows:{}:{}", id, generation)).unwrap();
        StageOutcome::Completed(Some(dest))
    }

    fn artifact_name(&self, identifier: &DatasetIdentifier) -> Option<String> {
        Some(identifier.filename_with("sqlite"))
    }
}

/// Temp dirs for one test: destination workdir and scratch parent
struct Fixture {
    workdir: TempDir,
    scratch: TempDir,
    stages: Arc<FakeStages>,
}

impl Fixture {
    fn new(stages: FakeStages) -> Self {
        Self {
            workdir: TempDir::new().unwrap(),
            scratch: TempDir::new().unwrap(),
            stages: Arc::new(stages),
        }
    }

    fn runner(&self) -> PipelineRunner {
        PipelineRunner::new(self.stages.clone(), self.stages.clone(), self.stages.clone())
            .with_workspace(WorkspaceManager::with_root(self.scratch.path()))
    }

    fn options(&self) -> PipelineOptions {
        PipelineOptions::new(self.workdir.path())
    }

    fn workdir_files(&self) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(self.workdir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    fn assert_scratch_clean(&self) {
        let leftovers = std::fs::read_dir(self.scratch.path()).unwrap().count();
        assert_eq!(leftovers, 0, "scratch workspaces left behind");
    }
}

fn id(text: &str) -> DatasetIdentifier {
    text.parse().unwrap()
}

fn window(since: &str, until: &str, concurrency: usize) -> ScheduleWindow {
    ScheduleWindow::new(since.parse().unwrap(), until.parse().unwrap(), concurrency).unwrap()
}

// ============================================================================
// Pipeline runner
// ============================================================================

#[tokio::test]
async fn test_fresh_run_places_only_the_final_artifact() {
    let fx = Fixture::new(FakeStages::new());

    let report = fx.runner().run(&id("PAMS2501"), &fx.options()).await.unwrap();

    let artifact = fx.workdir.path().join("PAMS2501.sqlite");
    assert_eq!(
        report.status,
        RunStatus::Succeeded {
            artifact: Some(artifact.clone())
        }
    );
    assert_eq!(report.stages.len(), 3);
    assert_eq!(fx.workdir_files(), ["PAMS2501.sqlite"]);
    assert_eq!(std::fs::read_to_string(&artifact).unwrap(), "rows:PAMS2501:1");
    assert_eq!(
        fx.stages.events(),
        ["download:PAMS2501", "decompress:PAMS2501", "load:PAMS2501"]
    );
    fx.assert_scratch_clean();
}

#[tokio::test]
async fn test_existing_artifact_skips_every_stage() {
    let fx = Fixture::new(FakeStages::new());
    let artifact = fx.workdir.path().join("PAMS2501.sqlite");
    std::fs::write(&artifact, "previous").unwrap();

    let report = fx.runner().run(&id("PAMS2501"), &fx.options()).await.unwrap();

    assert_eq!(report.status, RunStatus::Skipped { artifact: artifact.clone() });
    assert!(report.stages.is_empty());
    assert_eq!(fx.stages.calls(), (0, 0, 0));
    assert!(fx.stages.events().is_empty());
    assert_eq!(std::fs::read_to_string(&artifact).unwrap(), "previous");
    fx.assert_scratch_clean();
}

#[tokio::test]
async fn test_override_reruns_every_stage() {
    let fx = Fixture::new(FakeStages::new());
    let artifact = fx.workdir.path().join("PAMS2501.sqlite");
    std::fs::write(&artifact, "previous").unwrap();

    let options = fx.options().with_overwrite(true);
    let report = fx.runner().run(&id("PAMS2501"), &options).await.unwrap();

    assert!(matches!(report.status, RunStatus::Succeeded { .. }));
    assert_eq!(fx.stages.calls(), (1, 1, 1));
    assert_eq!(std::fs::read_to_string(&artifact).unwrap(), "rows:PAMS2501:1");
}

#[tokio::test]
async fn test_keep_intermediates_moves_them_to_workdir() {
    let fx = Fixture::new(FakeStages::new());

    let options = fx.options().with_keep_intermediates(true);
    fx.runner().run(&id("POPSBR25"), &options).await.unwrap();

    assert_eq!(
        fx.workdir_files(),
        ["POPSBR25.dbf", "POPSBR25.sqlite", "POPSBR25.zip"]
    );
    fx.assert_scratch_clean();
}

#[tokio::test]
async fn test_blocked_intermediate_leaves_no_artifact_and_reruns() {
    let fx = Fixture::new(FakeStages::new());
    let blocker = fx.workdir.path().join("PAMS2501.dbc");
    std::fs::create_dir(&blocker).unwrap();

    let options = fx.options().with_keep_intermediates(true);
    let err = fx.runner().run(&id("PAMS2501"), &options).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Fatal);
    assert_eq!(fx.workdir_files(), ["PAMS2501.dbc"]);
    assert!(blocker.is_dir());
    fx.assert_scratch_clean();

    // Without the marker, the next run does all the work again
    std::fs::remove_dir(&blocker).unwrap();
    let report = fx.runner().run(&id("PAMS2501"), &options).await.unwrap();

    assert!(matches!(report.status, RunStatus::Succeeded { .. }));
    assert_eq!(fx.stages.calls(), (2, 2, 2));
    assert_eq!(
        fx.workdir_files(),
        ["PAMS2501.dbc", "PAMS2501.dbf", "PAMS2501.sqlite"]
    );
}

#[tokio::test]
async fn test_stage_failure_aborts_run_and_cleans_up() {
    let fx = Fixture::new(FakeStages::new().with_broken_archive("PAMS2501"));

    let err = fx.runner().run(&id("PAMS2501"), &fx.options()).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Fatal);
    assert_eq!(fx.stages.calls(), (1, 1, 0));
    assert!(fx.workdir_files().is_empty());
    fx.assert_scratch_clean();
}

#[tokio::test]
async fn test_missing_source_settles_as_not_found() {
    let fx = Fixture::new(FakeStages::new().with_missing("PAMS2501"));
    let identifier = id("PAMS2501");

    let result = fx.runner().run(&identifier, &fx.options()).await;
    assert_eq!(result.as_ref().unwrap_err().kind(), ErrorKind::SourceNotFound);

    let report = settle_not_found(&identifier, result).unwrap();
    assert_eq!(report.status, RunStatus::NotFound);
    assert!(fx.workdir_files().is_empty());
    fx.assert_scratch_clean();
}

#[tokio::test]
async fn test_runs_are_isolated_from_each_other() {
    let fx = Fixture::new(FakeStages::new().with_default_delay(Duration::from_millis(20)));
    let runner = fx.runner();
    let options = fx.options();

    let a = id("PAMS2501");
    let b = id("PAMS2502");
    let (ra, rb) = tokio::join!(runner.run(&a, &options), runner.run(&b, &options));
    ra.unwrap();
    rb.unwrap();

    assert_eq!(fx.workdir_files(), ["PAMS2501.sqlite", "PAMS2502.sqlite"]);
    fx.assert_scratch_clean();
}

// ============================================================================
// Period scheduler
// ============================================================================

#[tokio::test]
async fn test_period_submits_in_date_order() {
    let stages = FakeStages::new()
        .with_delay("PAAB0801", Duration::from_millis(150))
        .with_delay("PAAB0802", Duration::from_millis(10))
        .with_delay("PAAB0803", Duration::from_millis(10));
    let fx = Fixture::new(stages);
    let template: IdentifierTemplate = "PAAB".parse().unwrap();

    let report = PeriodScheduler::new(fx.runner())
        .run(&window("200801", "200803", 2), &template, &fx.options())
        .await;

    let downloads: Vec<String> = fx
        .stages
        .events()
        .into_iter()
        .filter(|e| e.starts_with("download:"))
        .collect();
    assert_eq!(
        downloads,
        ["download:PAAB0801", "download:PAAB0802", "download:PAAB0803"]
    );
    assert_eq!(fx.stages.finished.lock().unwrap()[0], "PAAB0802");

    let labels: Vec<&str> = report.outcomes.iter().map(|o| o.label.as_str()).collect();
    assert_eq!(labels, ["PAAB0801", "PAAB0802", "PAAB0803"]);
    assert!(report.is_success());
    assert_eq!(report.succeeded(), 3);
}

#[tokio::test]
async fn test_period_never_exceeds_concurrency() {
    let fx = Fixture::new(FakeStages::new().with_default_delay(Duration::from_millis(30)));
    let template: IdentifierTemplate = "PAMS".parse().unwrap();

    let report = PeriodScheduler::new(fx.runner())
        .run(&window("202401", "202406", 3), &template, &fx.options())
        .await;

    assert_eq!(report.outcomes.len(), 6);
    assert_eq!(fx.stages.max_in_flight.load(Ordering::SeqCst), 3);
    fx.assert_scratch_clean();
}

#[tokio::test]
async fn test_period_with_missing_file_still_succeeds() {
    let fx = Fixture::new(FakeStages::new().with_missing("PAMS2402"));
    let template: IdentifierTemplate = "PAMS".parse().unwrap();

    let report = PeriodScheduler::new(fx.runner())
        .run(&window("202401", "202403", 2), &template, &fx.options())
        .await;

    assert!(report.is_success());
    assert_eq!(report.succeeded(), 2);
    assert_eq!(report.not_found(), 1);
    assert_eq!(fx.workdir_files(), ["PAMS2401.sqlite", "PAMS2403.sqlite"]);
}

#[tokio::test]
async fn test_period_failure_does_not_cancel_siblings() {
    let fx = Fixture::new(FakeStages::new().with_broken_archive("PAMS2402"));
    let template: IdentifierTemplate = "PAMS".parse().unwrap();

    let report = PeriodScheduler::new(fx.runner())
        .run(&window("202401", "202403", 1), &template, &fx.options())
        .await;

    assert!(!report.is_success());
    let failures: Vec<&str> = report.failures().map(|(label, _)| label).collect();
    assert_eq!(failures, ["PAMS2402"]);
    assert_eq!(report.succeeded(), 2);
    fx.assert_scratch_clean();
}

#[tokio::test]
async fn test_period_reruns_are_idempotent() {
    let fx = Fixture::new(FakeStages::new());
    let template: IdentifierTemplate = "POPSBR".parse().unwrap();
    let scheduler = PeriodScheduler::new(fx.runner());
    let window = window("202201", "202412", 2);

    let first = scheduler.run(&window, &template, &fx.options()).await;
    assert_eq!(first.succeeded(), 3);

    let second = scheduler.run(&window, &template, &fx.options()).await;
    assert_eq!(second.skipped(), 3);
    assert_eq!(fx.stages.calls(), (3, 3, 3));
}

#[tokio::test]
async fn test_period_reports_months_before_2008_as_failures() {
    let fx = Fixture::new(FakeStages::new());
    let template: IdentifierTemplate = "PAMS".parse().unwrap();

    let report = PeriodScheduler::new(fx.runner())
        .run(&window("200711", "200802", 2), &template, &fx.options())
        .await;

    let failures: Vec<(&str, ErrorKind)> = report
        .failures()
        .map(|(label, e)| (label, e.kind()))
        .collect();
    assert_eq!(
        failures,
        [
            ("PAMS@200711", ErrorKind::InvalidIdentifier),
            ("PAMS@200712", ErrorKind::InvalidIdentifier)
        ]
    );
    assert_eq!(report.succeeded(), 2);
}
