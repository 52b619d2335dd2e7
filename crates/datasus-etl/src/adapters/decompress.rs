//! Archive decompressors
//!
//! Monthly files are `.dbc`, a DATASUS-specific compressed DBF that only the
//! external `blast-dbf` tool understands. Yearly files are ordinary zip
//! archives holding one `.dbf` table.

use super::file_stem;
use crate::error::{EtlError, Result};
use crate::stage::{guard_existing, partial_path, Decompressor, StageOutcome};
use async_trait::async_trait;
use std::fs::File;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::debug;

pub const DEFAULT_BLAST_DBF: &str = "./deps/blast-dbf/blast-dbf";

/// Output path for a decompressed table: `<dest_dir>/<stem>.dbf`
fn dbf_output(input: &Path, dest_dir: &Path) -> PathBuf {
    dest_dir.join(format!("{}.dbf", file_stem(input)))
}

async fn require_input(input: &Path) -> Result<()> {
    if !tokio::fs::try_exists(input).await? {
        return Err(EtlError::Decompress {
            path: input.to_path_buf(),
            reason: "input file not found".to_string(),
        });
    }
    Ok(())
}

/// Runs `blast-dbf <input.dbc> <output.dbf>`
#[derive(Debug, Clone)]
pub struct BlastDbfDecompressor {
    tool: PathBuf,
}

impl Default for BlastDbfDecompressor {
    fn default() -> Self {
        Self::new(DEFAULT_BLAST_DBF)
    }
}

impl BlastDbfDecompressor {
    pub fn new(tool: impl Into<PathBuf>) -> Self {
        Self { tool: tool.into() }
    }

    async fn run(&self, input: &Path, dest_dir: &Path, overwrite: bool) -> Result<PathBuf> {
        require_input(input).await?;
        let output = dbf_output(input, dest_dir);
        guard_existing(&output, overwrite).await?;

        if !tokio::fs::try_exists(&self.tool).await? {
            return Err(EtlError::ExternalToolMissing(self.tool.clone()));
        }

        let staging = partial_path(&output);
        debug!(tool = %self.tool.display(), input = %input.display(), "Running blast-dbf");

        let result = Command::new(&self.tool)
            .arg(input)
            .arg(&staging)
            .kill_on_drop(true)
            .output()
            .await;

        let out = match result {
            Ok(out) => out,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(EtlError::ExternalToolMissing(self.tool.clone()));
            }
            Err(e) => return Err(e.into()),
        };

        if !out.status.success() {
            let _ = tokio::fs::remove_file(&staging).await;
            let stderr = String::from_utf8_lossy(&out.stderr);
            return Err(EtlError::Decompress {
                path: input.to_path_buf(),
                reason: format!("blast-dbf exited with {}: {}", out.status, stderr.trim()),
            });
        }

        tokio::fs::rename(&staging, &output).await?;
        Ok(output)
    }
}

#[async_trait]
impl Decompressor for BlastDbfDecompressor {
    async fn decompress(&self, input: &Path, dest_dir: &Path, overwrite: bool) -> StageOutcome {
        self.run(input, dest_dir, overwrite).await.into()
    }
}

/// Extracts the `.dbf` table from a zip archive
#[derive(Debug, Clone, Copy, Default)]
pub struct ZipDecompressor;

impl ZipDecompressor {
    async fn run(&self, input: &Path, dest_dir: &Path, overwrite: bool) -> Result<PathBuf> {
        require_input(input).await?;
        let output = dbf_output(input, dest_dir);
        guard_existing(&output, overwrite).await?;

        let input = input.to_path_buf();
        let target = output.clone();
        tokio::task::spawn_blocking(move || extract_dbf(&input, &target)).await??;
        Ok(output)
    }
}

#[async_trait]
impl Decompressor for ZipDecompressor {
    async fn decompress(&self, input: &Path, dest_dir: &Path, overwrite: bool) -> StageOutcome {
        self.run(input, dest_dir, overwrite).await.into()
    }
}

/// Copy the `<stem>.dbf` entry (case-insensitive, else the first `.dbf`
/// entry) from `archive` to `output`
fn extract_dbf(archive: &Path, output: &Path) -> Result<()> {
    let mut zip = zip::ZipArchive::new(File::open(archive)?)?;

    let wanted = format!("{}.dbf", file_stem(archive)).to_lowercase();
    let mut exact = None;
    let mut first_dbf = None;
    for i in 0..zip.len() {
        let entry = zip.by_index(i)?;
        let name = entry.name().rsplit('/').next().unwrap_or("").to_lowercase();
        if name == wanted {
            exact = Some(i);
            break;
        }
        if first_dbf.is_none() && name.ends_with(".dbf") {
            first_dbf = Some(i);
        }
    }

    let index = exact.or(first_dbf).ok_or_else(|| EtlError::Decompress {
        path: archive.to_path_buf(),
        reason: "archive holds no .dbf entry".to_string(),
    })?;

    let mut entry = zip.by_index(index)?;
    debug!(entry = entry.name(), size = entry.size(), "Extracting zip entry");

    let staging = partial_path(output);
    let copied = File::create(&staging).and_then(|mut file| std::io::copy(&mut entry, &mut file));
    if let Err(e) = copied {
        let _ = std::fs::remove_file(&staging);
        return Err(e.into());
    }
    std::fs::rename(&staging, output)?;
    Ok(())
}

/// Picks the decompressor from the input extension
#[derive(Debug, Clone, Default)]
pub struct ArchiveDecompressor {
    dbc: BlastDbfDecompressor,
    zip: ZipDecompressor,
}

impl ArchiveDecompressor {
    pub fn new(blast_dbf: impl Into<PathBuf>) -> Self {
        Self {
            dbc: BlastDbfDecompressor::new(blast_dbf),
            zip: ZipDecompressor,
        }
    }
}

#[async_trait]
impl Decompressor for ArchiveDecompressor {
    async fn decompress(&self, input: &Path, dest_dir: &Path, overwrite: bool) -> StageOutcome {
        let extension = input
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_default();

        match extension.as_str() {
            "dbc" => self.dbc.decompress(input, dest_dir, overwrite).await,
            "zip" => self.zip.decompress(input, dest_dir, overwrite).await,
            other => StageOutcome::Failed(EtlError::Decompress {
                path: input.to_path_buf(),
                reason: format!("unsupported archive extension '{}'", other),
            }),
        }
    }
}
