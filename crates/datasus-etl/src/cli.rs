//! Command-line interface definition

use crate::config::EtlConfig;
use crate::identifier::{DatasetIdentifier, IdentifierTemplate, YearMonth};
use crate::stage::PipelineOptions;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// DATASUS ETL - download, uncompress and transform DATASUS public files
#[derive(Parser, Debug)]
#[command(name = "datasus")]
#[command(author, version, about, long_about = None)]
#[command(arg_required_else_help = true)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Destination directory for final artifacts
    #[arg(short, long, env = "DATASUS_WORKDIR", global = true)]
    pub workdir: Option<PathBuf>,

    /// Re-run stages whose output already exists
    #[arg(long = "override", global = true)]
    pub overwrite: bool,

    /// Also keep the downloaded and uncompressed files in the workdir
    #[arg(long, global = true)]
    pub keep_intermediates: bool,

    /// Where transformed records go
    #[arg(long, value_enum, default_value_t = StoreKind::Sqlite, global = true)]
    pub store: StoreKind,
}

/// Available CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Download, uncompress and transform a single <PAUFYYMM|POPSBRYY> file
    Run {
        /// Dataset identifier, e.g. PAMS2501 or POPSBR25
        #[arg(value_parser = parse_identifier)]
        identifier: DatasetIdentifier,
    },

    /// Download, uncompress and transform <PAUF|POPSBR> files in a given period
    RunRange {
        /// Identifier prefix, e.g. PAMS or POPSBR
        #[arg(short, long, default_value = "PAMS", value_parser = parse_template)]
        prefix: IdentifierTemplate,

        /// First month of the period (YYYYMM), defaults to the current month
        #[arg(short, long, value_parser = parse_year_month)]
        since: Option<YearMonth>,

        /// Last month of the period (YYYYMM), defaults to the current month
        #[arg(short, long, value_parser = parse_year_month)]
        until: Option<YearMonth>,

        /// Number of identifiers processed at once
        #[arg(short, long, default_value_t = 1, value_parser = parse_concurrency)]
        concurrency: usize,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StoreKind {
    /// One `<identifier>.sqlite` file per identifier in the workdir
    Sqlite,
    /// One table per identifier in a shared Postgres schema
    Postgres,
}

impl Cli {
    /// Options for every run of this invocation; `--workdir` wins over the
    /// configured default
    pub fn pipeline_options(&self, config: &EtlConfig) -> PipelineOptions {
        let workdir = self.workdir.clone().unwrap_or_else(|| config.workdir.clone());
        PipelineOptions::new(workdir)
            .with_overwrite(self.overwrite)
            .with_keep_intermediates(self.keep_intermediates)
    }
}

fn parse_identifier(s: &str) -> Result<DatasetIdentifier, String> {
    s.parse().map_err(|e: crate::EtlError| e.to_string())
}

fn parse_template(s: &str) -> Result<IdentifierTemplate, String> {
    s.parse().map_err(|e: crate::EtlError| e.to_string())
}

fn parse_year_month(s: &str) -> Result<YearMonth, String> {
    s.parse().map_err(|e: crate::EtlError| e.to_string())
}

fn parse_concurrency(s: &str) -> Result<usize, String> {
    match s.parse::<usize>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err("Concurrency must be a positive integer.".to_string()),
    }
}
