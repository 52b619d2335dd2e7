//! DATASUS ETL - Main entry point

use clap::Parser;
use datasus_common::logging::{init_logging, LogConfig, LogLevel, LogOutput};
use datasus_etl::adapters::{ArchiveDecompressor, FtpDownloader, SqliteLoader};
use datasus_etl::runner::{settle_not_found, RunStatus};
use datasus_etl::{
    Cli, Commands, DatasetIdentifier, EtlConfig, IdentifierTemplate, Loader, PeriodScheduler,
    PipelineOptions, PipelineRunner, ScheduleWindow, StoreKind, WorkspaceManager, YearMonth,
};
use std::process;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Exit status after a Ctrl-C
const EXIT_INTERRUPTED: i32 = 130;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    // Parse command-line arguments; clap exits with status 2 on usage errors
    let cli = Cli::parse();

    let log_config = LogConfig::builder()
        .level(if cli.verbose {
            LogLevel::Debug
        } else {
            LogLevel::Info
        })
        .output(LogOutput::Console)
        .log_file_prefix("datasus")
        .build();

    // Environment variables take precedence
    let log_config = log_config.clone().merge_env().unwrap_or(log_config);
    let guard = match init_logging(&log_config) {
        Ok(guard) => Some(guard),
        Err(e) => {
            eprintln!("Warning: logging disabled: {:#}", e);
            None
        }
    };

    let code = match execute(&cli).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "Command failed");
            eprintln!("Error: {:#}", e);
            1
        }
    };

    // Flush file logs before exiting
    drop(guard);
    process::exit(code);
}

/// Execute the CLI command and return the process exit status
async fn execute(cli: &Cli) -> anyhow::Result<i32> {
    let config = EtlConfig::from_env()?;
    let options = cli.pipeline_options(&config);
    let runner = build_runner(cli, &config).await?;

    // Dropping the in-flight runs removes their scratch workspaces
    tokio::select! {
        code = dispatch(&cli.command, &runner, &options) => code,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, abandoning in-flight runs");
            eprintln!("Interrupted.");
            Ok(EXIT_INTERRUPTED)
        }
    }
}

async fn dispatch(
    command: &Commands,
    runner: &PipelineRunner,
    options: &PipelineOptions,
) -> anyhow::Result<i32> {
    match command {
        Commands::Run { identifier } => run_one(runner, identifier, options).await,
        Commands::RunRange {
            prefix,
            since,
            until,
            concurrency,
        } => {
            let now = YearMonth::current();
            let window = ScheduleWindow::new(
                since.unwrap_or(now),
                until.unwrap_or(now),
                *concurrency,
            )?;
            run_range(runner, prefix, &window, options).await
        }
    }
}

async fn build_runner(cli: &Cli, config: &EtlConfig) -> anyhow::Result<PipelineRunner> {
    let loader: Arc<dyn Loader> = match cli.store {
        StoreKind::Sqlite => Arc::new(SqliteLoader::new()),
        StoreKind::Postgres => postgres_loader(config).await?,
    };

    let workspace = match &config.scratch_dir {
        Some(root) => WorkspaceManager::with_root(root),
        None => WorkspaceManager::new(),
    };

    Ok(PipelineRunner::new(
        Arc::new(FtpDownloader::new(config.ftp.clone())),
        Arc::new(ArchiveDecompressor::new(config.blast_dbf.clone())),
        loader,
    )
    .with_workspace(workspace))
}

#[cfg(feature = "database")]
async fn postgres_loader(config: &EtlConfig) -> anyhow::Result<Arc<dyn Loader>> {
    let url = config
        .database
        .url
        .as_deref()
        .ok_or_else(|| anyhow::anyhow!("DATASUS_DATABASE_URL must be set for --store postgres"))?;
    let loader = datasus_etl::adapters::PostgresLoader::connect(
        url,
        config.database.schema.clone(),
        config.database.max_connections,
    )
    .await?;
    Ok(Arc::new(loader))
}

#[cfg(not(feature = "database"))]
async fn postgres_loader(_config: &EtlConfig) -> anyhow::Result<Arc<dyn Loader>> {
    anyhow::bail!("--store postgres requires a build with the `database` feature")
}

async fn run_one(
    runner: &PipelineRunner,
    identifier: &DatasetIdentifier,
    options: &PipelineOptions,
) -> anyhow::Result<i32> {
    match settle_not_found(identifier, runner.run(identifier, options).await) {
        Ok(report) => {
            match report.status {
                RunStatus::Succeeded {
                    artifact: Some(path),
                } => println!("✓ {} -> {}", identifier, path.display()),
                RunStatus::Succeeded { artifact: None } => println!("✓ {} loaded", identifier),
                RunStatus::Skipped { artifact } => {
                    println!("- {} already processed ({})", identifier, artifact.display())
                }
                RunStatus::NotFound => println!("- {} not found on server", identifier),
            }
            Ok(0)
        }
        Err(e) => {
            error!(identifier = %identifier, error = %e, "✗ ETL process failed");
            eprintln!("✗ {}: {}", identifier, e);
            Ok(1)
        }
    }
}

async fn run_range(
    runner: &PipelineRunner,
    template: &IdentifierTemplate,
    window: &ScheduleWindow,
    options: &PipelineOptions,
) -> anyhow::Result<i32> {
    let scheduler = PeriodScheduler::new(runner.clone());
    let report = scheduler.run(window, template, options).await;

    println!("{}", report.summary());
    for (label, e) in report.failures() {
        eprintln!("✗ {}: {}", label, e);
    }

    if report.is_success() {
        info!("All identifiers processed");
        Ok(0)
    } else {
        Ok(1)
    }
}
