//! FTP downloader for the DATASUS public archive
//!
//! Uses the synchronous `suppaftp` client inside `spawn_blocking`, in
//! Extended Passive Mode, with a binary transfer. A 550 reply to `RETR`
//! means the archive has no file for that identifier and is reported as
//! [`EtlError::SourceNotFound`]. Transfers are not retried.

use crate::error::{EtlError, Result};
use crate::identifier::{DatasetIdentifier, Family};
use crate::stage::{guard_existing, partial_path, Downloader, StageOutcome};
use async_trait::async_trait;
use std::fs::File;
use std::path::{Path, PathBuf};
use suppaftp::types::FtpError;
use suppaftp::{FtpStream, Status};
use tracing::{debug, info, warn};

pub const DEFAULT_HOST: &str = "ftp.datasus.gov.br";
pub const DEFAULT_MONTHLY_DIR: &str = "/dissemin/publicos/SIASUS/200801_/Dados";
pub const DEFAULT_YEARLY_DIR: &str = "/dissemin/publicos/IBGE/POP";

/// Connection settings and remote layout
#[derive(Debug, Clone)]
pub struct FtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,

    /// Directory holding `PA<UF><YY><MM>.dbc` files
    pub monthly_dir: String,

    /// Directory holding `POPSBR<YY>.zip` files
    pub yearly_dir: String,
}

impl Default for FtpConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: 21,
            username: "anonymous".to_string(),
            password: "anonymous@".to_string(),
            monthly_dir: DEFAULT_MONTHLY_DIR.to_string(),
            yearly_dir: DEFAULT_YEARLY_DIR.to_string(),
        }
    }
}

impl FtpConfig {
    /// Absolute remote path of the archive for `identifier`
    pub fn remote_path(&self, identifier: &DatasetIdentifier) -> String {
        let dir = match identifier.family() {
            Family::MonthlyRecords => &self.monthly_dir,
            Family::YearlyPopulation => &self.yearly_dir,
        };
        format!(
            "{}/{}",
            dir.trim_end_matches('/'),
            identifier.archive_filename()
        )
    }
}

pub struct FtpDownloader {
    config: FtpConfig,
}

impl FtpDownloader {
    pub fn new(config: FtpConfig) -> Self {
        Self { config }
    }

    async fn fetch(
        &self,
        identifier: &DatasetIdentifier,
        dest_dir: &Path,
        overwrite: bool,
    ) -> Result<PathBuf> {
        let dest = dest_dir.join(identifier.archive_filename());
        guard_existing(&dest, overwrite).await?;
        tokio::fs::create_dir_all(dest_dir).await?;

        let remote = self.config.remote_path(identifier);
        let bytes = tokio::task::spawn_blocking({
            let config = self.config.clone();
            let remote = remote.clone();
            let dest = dest.clone();
            move || download_sync(&config, &remote, &dest)
        })
        .await??;

        info!("Downloaded {} ({} bytes)", remote, bytes);
        Ok(dest)
    }
}

#[async_trait]
impl Downloader for FtpDownloader {
    async fn download(
        &self,
        identifier: &DatasetIdentifier,
        dest_dir: &Path,
        overwrite: bool,
    ) -> StageOutcome {
        self.fetch(identifier, dest_dir, overwrite).await.into()
    }
}

/// Stream `remote` into a partial sibling of `dest`, then rename it into
/// place. Returns the number of bytes transferred.
fn download_sync(config: &FtpConfig, remote: &str, dest: &Path) -> Result<u64> {
    debug!("Connecting to FTP server: {}:{}", config.host, config.port);

    let mut ftp_stream = FtpStream::connect(format!("{}:{}", config.host, config.port))
        .map_err(|e| classify(remote, e))?;

    // Extended Passive Mode works behind NAT and in containers
    ftp_stream.set_mode(suppaftp::Mode::ExtendedPassive);

    ftp_stream
        .login(&config.username, &config.password)
        .map_err(|e| classify(remote, e))?;
    ftp_stream
        .transfer_type(suppaftp::types::FileType::Binary)
        .map_err(|e| classify(remote, e))?;

    debug!("Downloading file: {}", remote);
    let staging = partial_path(dest);

    // The file is only created once the server has accepted RETR
    let transferred = ftp_stream.retr(remote, |reader| {
        let mut file = File::create(&staging).map_err(FtpError::ConnectionError)?;
        let bytes = std::io::copy(reader, &mut file).map_err(FtpError::ConnectionError)?;
        file.sync_all().map_err(FtpError::ConnectionError)?;
        Ok(bytes)
    });

    if let Err(e) = ftp_stream.quit() {
        warn!("Failed to quit FTP session gracefully: {}", e);
    }

    let placed = transferred
        .map_err(|e| classify(remote, e))
        .and_then(|bytes| {
            std::fs::rename(&staging, dest)?;
            Ok(bytes)
        });
    if placed.is_err() {
        let _ = std::fs::remove_file(&staging);
    }
    placed
}

/// Map a protocol error, treating "file unavailable" as a missing source
fn classify(remote: &str, err: FtpError) -> EtlError {
    match err {
        FtpError::UnexpectedResponse(response) if response.status == Status::FileUnavailable => {
            let name = remote.rsplit('/').next().unwrap_or(remote);
            EtlError::SourceNotFound(name.to_string())
        }
        source => EtlError::Ftp {
            path: remote.to_string(),
            source,
        },
    }
}
