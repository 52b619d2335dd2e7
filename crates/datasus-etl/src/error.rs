//! Error types for the ETL pipeline
//!
//! Every stage failure is an [`EtlError`]. The runner and scheduler never
//! inspect messages; they branch on [`EtlError::kind`].

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for ETL operations
pub type Result<T> = std::result::Result<T, EtlError>;

/// Stable classification of an [`EtlError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidIdentifier,
    AlreadyExists,
    SourceNotFound,
    ExternalToolMissing,
    StorageConflict,
    Fatal,
}

/// Main error type for the ETL pipeline
#[derive(Error, Debug)]
pub enum EtlError {
    #[error("Invalid identifier '{input}': {reason}")]
    InvalidIdentifier { input: String, reason: String },

    /// A stage found its output already on disk
    #[error("Output already exists: {}", .0.display())]
    AlreadyExists(PathBuf),

    #[error("Data for {0} not found on server")]
    SourceNotFound(String),

    #[error("External tool not found at {}. Build it or point DATASUS_BLAST_DBF at it.", .0.display())]
    ExternalToolMissing(PathBuf),

    #[error("Table {0} already exists. Use --override to replace it.")]
    StorageConflict(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("FTP error while fetching {path}: {source}")]
    Ftp {
        path: String,
        #[source]
        source: suppaftp::types::FtpError,
    },

    #[error("Archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("Malformed DBF file {}: {reason}", path.display())]
    Dbf { path: PathBuf, reason: String },

    #[error("Decompression of {} failed: {reason}", path.display())]
    Decompress { path: PathBuf, reason: String },

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[cfg(feature = "database")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl EtlError {
    pub fn invalid_identifier(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidIdentifier {
            input: input.into(),
            reason: reason.into(),
        }
    }

    pub fn dbf(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Dbf {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            EtlError::InvalidIdentifier { .. } => ErrorKind::InvalidIdentifier,
            EtlError::AlreadyExists(_) => ErrorKind::AlreadyExists,
            EtlError::SourceNotFound(_) => ErrorKind::SourceNotFound,
            EtlError::ExternalToolMissing(_) => ErrorKind::ExternalToolMissing,
            EtlError::StorageConflict(_) => ErrorKind::StorageConflict,
            _ => ErrorKind::Fatal,
        }
    }

    /// Whether the scheduler should downgrade this failure to a warning
    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::SourceNotFound
    }
}

impl From<tokio::task::JoinError> for EtlError {
    fn from(err: tokio::task::JoinError) -> Self {
        EtlError::Other(anyhow::anyhow!("Blocking task failed: {}", err))
    }
}
