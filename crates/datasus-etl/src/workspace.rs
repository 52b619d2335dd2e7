//! Scratch workspaces and artifact placement
//!
//! Each pipeline run gets a private temporary directory. The handle is an RAII
//! guard around [`tempfile::TempDir`], so the directory is removed on every
//! exit path: explicit release, error propagation, or the run future being
//! dropped mid-flight (e.g. on Ctrl-C).

use crate::error::Result;
use crate::stage::partial_path;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, warn};

/// Prefix of every scratch directory name
pub const SCRATCH_PREFIX: &str = "datasus-";

/// Creates scratch workspaces under a root directory
#[derive(Debug, Clone, Default)]
pub struct WorkspaceManager {
    /// Parent of the scratch directories; the system temp dir when `None`
    scratch_root: Option<PathBuf>,
}

impl WorkspaceManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Place scratch directories under `root` instead of the system temp dir
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            scratch_root: Some(root.into()),
        }
    }

    /// Create a uniquely named scratch directory
    pub fn acquire(&self) -> Result<ScratchHandle> {
        let mut builder = tempfile::Builder::new();
        builder.prefix(SCRATCH_PREFIX);

        let dir = match &self.scratch_root {
            Some(root) => {
                std::fs::create_dir_all(root)?;
                builder.tempdir_in(root)?
            }
            None => builder.tempdir()?,
        };

        debug!(scratch = %dir.path().display(), "Acquired scratch workspace");
        Ok(ScratchHandle { dir })
    }
}

/// Exclusive scratch directory owned by one pipeline run
#[derive(Debug)]
pub struct ScratchHandle {
    dir: TempDir,
}

impl ScratchHandle {
    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    /// Join `filename` onto the workspace root. Nothing is created.
    pub fn resolve(&self, filename: &str) -> PathBuf {
        self.dir.path().join(filename)
    }

    /// Recursively remove the workspace, reporting any failure.
    ///
    /// Dropping the handle also removes it, but silently.
    pub fn release(self) -> Result<()> {
        let path = self.dir.path().to_path_buf();
        self.dir.close()?;
        debug!(scratch = %path.display(), "Released scratch workspace");
        Ok(())
    }
}

/// Move `src` into `dest_dir`, replacing any file of the same name.
///
/// A plain rename is tried first. When that fails (typically because the
/// scratch dir lives on another filesystem) the file is copied to a partial
/// sibling inside `dest_dir`, renamed into place, and only then is the source
/// removed. Readers never observe a half-written destination.
pub async fn relocate(src: &Path, dest_dir: &Path) -> Result<PathBuf> {
    tokio::fs::create_dir_all(dest_dir).await?;

    let file_name = src.file_name().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("Cannot relocate path without a file name: {}", src.display()),
        )
    })?;
    let dest = dest_dir.join(file_name);

    if tokio::fs::rename(src, &dest).await.is_ok() {
        debug!(from = %src.display(), to = %dest.display(), "Relocated by rename");
        return Ok(dest);
    }

    let staging = partial_path(&dest);
    if let Err(e) = tokio::fs::copy(src, &staging).await {
        let _ = tokio::fs::remove_file(&staging).await;
        return Err(e.into());
    }
    if let Err(e) = tokio::fs::rename(&staging, &dest).await {
        let _ = tokio::fs::remove_file(&staging).await;
        return Err(e.into());
    }

    if let Err(e) = tokio::fs::remove_file(src).await {
        warn!(path = %src.display(), error = %e, "Failed to remove relocated source");
    }

    debug!(from = %src.display(), to = %dest.display(), "Relocated by copy");
    Ok(dest)
}
