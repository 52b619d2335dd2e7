//! Runtime configuration
//!
//! Everything here comes from environment variables (a `.env` file is loaded
//! by the binary first). Command-line flags override the workdir.
//!
//! | Variable | Default |
//! |---|---|
//! | `DATASUS_WORKDIR` | `./data` |
//! | `DATASUS_SCRATCH_DIR` | system temp dir |
//! | `DATASUS_BLAST_DBF` | `./deps/blast-dbf/blast-dbf` |
//! | `DATASUS_FTP_HOST` / `_PORT` | `ftp.datasus.gov.br` / `21` |
//! | `DATASUS_FTP_USER` / `_PASSWORD` | `anonymous` / `anonymous@` |
//! | `DATASUS_FTP_MONTHLY_DIR` | `/dissemin/publicos/SIASUS/200801_/Dados` |
//! | `DATASUS_FTP_YEARLY_DIR` | `/dissemin/publicos/IBGE/POP` |
//! | `DATASUS_DATABASE_URL` | unset |
//! | `DATASUS_DB_SCHEMA` | `siasus_data` |
//! | `DATASUS_DB_MAX_CONNECTIONS` | `4` |

use crate::adapters::decompress::DEFAULT_BLAST_DBF;
use crate::adapters::FtpConfig;
use std::path::PathBuf;

pub const DEFAULT_WORKDIR: &str = "./data";
pub const DEFAULT_DB_SCHEMA: &str = "siasus_data";

/// Shared-store settings, used only with `--store postgres`
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: Option<String>,
    pub schema: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone)]
pub struct EtlConfig {
    /// Destination directory for final artifacts
    pub workdir: PathBuf,
    /// Parent of per-run scratch directories
    pub scratch_dir: Option<PathBuf>,
    /// Path to the blast-dbf executable
    pub blast_dbf: PathBuf,
    pub ftp: FtpConfig,
    pub database: DatabaseConfig,
}

impl EtlConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through `lookup`, which maps a variable name to
    /// its value
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let var = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());
        let ftp_defaults = FtpConfig::default();

        let port = match lookup("DATASUS_FTP_PORT") {
            Some(raw) => raw
                .parse()
                .map_err(|_| anyhow::anyhow!("DATASUS_FTP_PORT must be a port number, got '{}'", raw))?,
            None => ftp_defaults.port,
        };

        let max_connections = lookup("DATASUS_DB_MAX_CONNECTIONS")
            .and_then(|s| s.parse().ok())
            .unwrap_or(4);

        let config = Self {
            workdir: PathBuf::from(var("DATASUS_WORKDIR", DEFAULT_WORKDIR)),
            scratch_dir: lookup("DATASUS_SCRATCH_DIR")
                .filter(|s| !s.is_empty())
                .map(PathBuf::from),
            blast_dbf: PathBuf::from(var("DATASUS_BLAST_DBF", DEFAULT_BLAST_DBF)),
            ftp: FtpConfig {
                host: var("DATASUS_FTP_HOST", &ftp_defaults.host),
                port,
                username: var("DATASUS_FTP_USER", &ftp_defaults.username),
                password: var("DATASUS_FTP_PASSWORD", &ftp_defaults.password),
                monthly_dir: var("DATASUS_FTP_MONTHLY_DIR", &ftp_defaults.monthly_dir),
                yearly_dir: var("DATASUS_FTP_YEARLY_DIR", &ftp_defaults.yearly_dir),
            },
            database: DatabaseConfig {
                url: lookup("DATASUS_DATABASE_URL").filter(|s| !s.is_empty()),
                schema: var("DATASUS_DB_SCHEMA", DEFAULT_DB_SCHEMA),
                max_connections,
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.workdir.as_os_str().is_empty() {
            anyhow::bail!("DATASUS_WORKDIR must not be empty");
        }
        if self.ftp.host.is_empty() {
            anyhow::bail!("DATASUS_FTP_HOST must not be empty");
        }
        if self.ftp.port == 0 {
            anyhow::bail!("DATASUS_FTP_PORT must be greater than 0");
        }
        for (key, dir) in [
            ("DATASUS_FTP_MONTHLY_DIR", &self.ftp.monthly_dir),
            ("DATASUS_FTP_YEARLY_DIR", &self.ftp.yearly_dir),
        ] {
            if !dir.starts_with('/') {
                anyhow::bail!("{} must be an absolute remote path, got '{}'", key, dir);
            }
        }
        if self.database.schema.is_empty() {
            anyhow::bail!("DATASUS_DB_SCHEMA must not be empty");
        }
        if self.database.max_connections == 0 {
            anyhow::bail!("DATASUS_DB_MAX_CONNECTIONS must be greater than 0");
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> anyhow::Result<EtlConfig> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        EtlConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[]).unwrap();
        assert_eq!(config.workdir, PathBuf::from("./data"));
        assert_eq!(config.scratch_dir, None);
        assert_eq!(config.blast_dbf, PathBuf::from(DEFAULT_BLAST_DBF));
        assert_eq!(config.ftp.host, "ftp.datasus.gov.br");
        assert_eq!(config.ftp.port, 21);
        assert_eq!(config.database.schema, "siasus_data");
        assert!(config.database.url.is_none());
    }

    #[test]
    fn test_overrides() {
        let config = load(&[
            ("DATASUS_WORKDIR", "/srv/datasus"),
            ("DATASUS_SCRATCH_DIR", "/scratch"),
            ("DATASUS_FTP_HOST", "mirror.local"),
            ("DATASUS_FTP_PORT", "2121"),
            ("DATASUS_DATABASE_URL", "postgres://localhost/pet"),
        ])
        .unwrap();
        assert_eq!(config.workdir, PathBuf::from("/srv/datasus"));
        assert_eq!(config.scratch_dir, Some(PathBuf::from("/scratch")));
        assert_eq!(config.ftp.host, "mirror.local");
        assert_eq!(config.ftp.port, 2121);
        assert_eq!(config.database.url.as_deref(), Some("postgres://localhost/pet"));
    }

    #[test]
    fn test_rejects_bad_port() {
        assert!(load(&[("DATASUS_FTP_PORT", "ftp")]).is_err());
        assert!(load(&[("DATASUS_FTP_PORT", "0")]).is_err());
    }

    #[test]
    fn test_rejects_relative_remote_dir() {
        let err = load(&[("DATASUS_FTP_YEARLY_DIR", "IBGE/POP")]).unwrap_err();
        assert!(err.to_string().contains("DATASUS_FTP_YEARLY_DIR"));
    }
}
