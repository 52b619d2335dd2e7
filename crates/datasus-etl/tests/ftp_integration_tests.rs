//! Integration tests against the real DATASUS FTP server
//!
//! These tests need network access and are marked with #[ignore] to avoid
//! running in CI. Run them explicitly with:
//!
//! ```bash
//! cargo test -p datasus-etl --test ftp_integration_tests -- --ignored --nocapture
//! ```

use anyhow::Result;
use datasus_etl::adapters::{FtpConfig, FtpDownloader};
use datasus_etl::{DatasetIdentifier, Downloader, ErrorKind};
use tempfile::TempDir;
use tracing::info;

/// Initialize tracing for tests
fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,datasus_etl=debug")),
        )
        .with_test_writer()
        .try_init();
}

/// Test: download a small monthly file (Acre, January 2024)
#[tokio::test]
#[ignore] // Only run when explicitly requested: cargo test -- --ignored
async fn test_download_monthly_file_real() -> Result<()> {
    init_tracing();
    let dir = TempDir::new()?;
    let identifier: DatasetIdentifier = "PAAC2401".parse()?;

    info!("Downloading {}", identifier.archive_filename());
    let downloader = FtpDownloader::new(FtpConfig::default());
    let path = downloader
        .download(&identifier, dir.path(), false)
        .await
        .into_result()?;

    let size = std::fs::metadata(&path)?.len();
    info!("Downloaded {} ({} bytes)", path.display(), size);
    assert_eq!(path, dir.path().join("PAAC2401.dbc"));
    assert!(size > 0, "Archive should not be empty");

    // A second call must not hit the network
    let again = downloader.download(&identifier, dir.path(), false).await;
    assert!(again.is_skipped());
    Ok(())
}

/// Test: a file the archive does not carry is reported as not found
#[tokio::test]
#[ignore]
async fn test_missing_file_is_not_found_real() -> Result<()> {
    init_tracing();
    let dir = TempDir::new()?;
    let identifier: DatasetIdentifier = "PAZZ0801".parse()?;

    let err = FtpDownloader::new(FtpConfig::default())
        .download(&identifier, dir.path(), false)
        .await
        .into_result()
        .expect_err("PAZZ is not a state");

    info!("Got expected error: {}", err);
    assert_eq!(err.kind(), ErrorKind::SourceNotFound);
    assert!(!dir.path().join("PAZZ0801.dbc").exists());
    Ok(())
}
