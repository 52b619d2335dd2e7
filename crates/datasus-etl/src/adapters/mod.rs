//! Production stage adapters
//!
//! - [`ftp::FtpDownloader`]: fetches archives from the DATASUS FTP server
//! - [`decompress::ArchiveDecompressor`]: `.dbc` via the external blast-dbf
//!   tool, `.zip` in-process
//! - [`sqlite::SqliteLoader`]: one SQLite file per identifier
//! - `postgres::PostgresLoader` (feature `database`): one table per
//!   identifier in a shared schema

pub mod decompress;
pub mod ftp;
#[cfg(feature = "database")]
pub mod postgres;
pub mod sqlite;

pub use decompress::{ArchiveDecompressor, BlastDbfDecompressor, ZipDecompressor};
pub use ftp::{FtpConfig, FtpDownloader};
#[cfg(feature = "database")]
pub use postgres::PostgresLoader;
pub use sqlite::SqliteLoader;

use std::path::Path;

/// File name of `path` without its extension, e.g. `PAMS2501`
pub(crate) fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}
