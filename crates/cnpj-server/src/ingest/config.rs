//! Ingestion configuration
//!
//! Everything the pipeline reads from `ETL_*` environment variables.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Public Receita Federal listing of monthly CNPJ releases.
pub const DEFAULT_RECEITA_BASE_URL: &str =
    "https://arquivos.receitafederal.gov.br/dados/cnpj/dados_abertos_cnpj";

pub const DEFAULT_BATCH_SIZE: usize = 100_000;
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_DOWNLOAD_TIMEOUT_SECS: u64 = 3600;
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_MIN_FREE_GB: f64 = 15.0;
pub const DEFAULT_RECOMMENDED_FREE_GB: f64 = 30.0;
pub const DEFAULT_LOCK_STALE_SECS: u64 = 300;
pub const DEFAULT_HEARTBEAT_SECS: u64 = 30;
pub const DEFAULT_DB_CHECK_TIMEOUT_SECS: u64 = 5;

/// How decoded rows reach the database
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadMode {
    /// Batches streamed through `COPY ... FROM STDIN` on the pipeline session
    #[default]
    Streaming,
    /// Whole file staged on disk, then a server-side `COPY ... FROM '<path>'`
    Staged,
}

impl std::str::FromStr for LoadMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "streaming" | "stream" => Ok(LoadMode::Streaming),
            "staged" | "file" => Ok(LoadMode::Staged),
            _ => Err(anyhow::anyhow!(
                "Invalid ETL_LOAD_MODE: {}. Must be 'streaming' or 'staged'",
                s
            )),
        }
    }
}

/// Pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EtlConfig {
    /// Listing root; periods live at `{base_url}/{YYYY-MM}/`
    pub base_url: String,
    /// Where downloaded archives are kept until loaded
    pub data_dir: PathBuf,
    /// Root for per-archive extraction directories
    pub scratch_dir: PathBuf,
    pub batch_size: usize,
    pub http_timeout_secs: u64,
    pub download_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub min_free_gb: f64,
    pub recommended_free_gb: f64,
    /// A lock whose heartbeat is older than this is considered orphaned
    pub lock_stale_secs: u64,
    pub heartbeat_secs: u64,
    pub db_check_timeout_secs: u64,
    pub load_mode: LoadMode,
    /// Local directory for staged COPY files
    pub staging_dir: PathBuf,
    /// The same directory as seen by the database server, when it differs
    pub staging_server_dir: Option<PathBuf>,
    /// Superuser (or `pg_read_server_files`) connection for staged loads
    pub admin_database_url: Option<String>,
}

impl Default for EtlConfig {
    fn default() -> Self {
        let data_dir = PathBuf::from("./data/cnpj");
        Self {
            base_url: DEFAULT_RECEITA_BASE_URL.to_string(),
            scratch_dir: data_dir.join("extracted"),
            staging_dir: data_dir.join("staging"),
            data_dir,
            batch_size: DEFAULT_BATCH_SIZE,
            http_timeout_secs: DEFAULT_HTTP_TIMEOUT_SECS,
            download_timeout_secs: DEFAULT_DOWNLOAD_TIMEOUT_SECS,
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            min_free_gb: DEFAULT_MIN_FREE_GB,
            recommended_free_gb: DEFAULT_RECOMMENDED_FREE_GB,
            lock_stale_secs: DEFAULT_LOCK_STALE_SECS,
            heartbeat_secs: DEFAULT_HEARTBEAT_SECS,
            db_check_timeout_secs: DEFAULT_DB_CHECK_TIMEOUT_SECS,
            load_mode: LoadMode::Streaming,
            staging_server_dir: None,
            admin_database_url: None,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl EtlConfig {
    /// Load pipeline configuration from environment variables
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();

        let data_dir = std::env::var("ETL_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.data_dir);

        let load_mode = match std::env::var("ETL_LOAD_MODE") {
            Ok(mode) => mode.parse()?,
            Err(_) => LoadMode::Streaming,
        };

        let config = Self {
            base_url: std::env::var("ETL_RECEITA_BASE_URL")
                .unwrap_or(defaults.base_url)
                .trim_end_matches('/')
                .to_string(),
            scratch_dir: std::env::var("ETL_SCRATCH_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| data_dir.join("extracted")),
            staging_dir: std::env::var("ETL_STAGING_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| data_dir.join("staging")),
            data_dir,
            batch_size: env_parse("ETL_BATCH_SIZE", DEFAULT_BATCH_SIZE),
            http_timeout_secs: env_parse("ETL_HTTP_TIMEOUT_SECS", DEFAULT_HTTP_TIMEOUT_SECS),
            download_timeout_secs: env_parse(
                "ETL_DOWNLOAD_TIMEOUT_SECS",
                DEFAULT_DOWNLOAD_TIMEOUT_SECS,
            ),
            connect_timeout_secs: env_parse("ETL_CONNECT_TIMEOUT_SECS", DEFAULT_CONNECT_TIMEOUT_SECS),
            min_free_gb: env_parse("ETL_MIN_FREE_GB", DEFAULT_MIN_FREE_GB),
            recommended_free_gb: env_parse("ETL_RECOMMENDED_FREE_GB", DEFAULT_RECOMMENDED_FREE_GB),
            lock_stale_secs: env_parse("ETL_LOCK_STALE_SECS", DEFAULT_LOCK_STALE_SECS),
            heartbeat_secs: env_parse("ETL_HEARTBEAT_SECS", DEFAULT_HEARTBEAT_SECS),
            db_check_timeout_secs: env_parse(
                "ETL_DB_CHECK_TIMEOUT_SECS",
                DEFAULT_DB_CHECK_TIMEOUT_SECS,
            ),
            load_mode,
            staging_server_dir: std::env::var("ETL_STAGING_SERVER_DIR").ok().map(PathBuf::from),
            admin_database_url: std::env::var("ETL_ADMIN_DATABASE_URL").ok(),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.base_url.is_empty() {
            anyhow::bail!("ETL_RECEITA_BASE_URL cannot be empty");
        }
        if self.batch_size == 0 {
            anyhow::bail!("ETL_BATCH_SIZE must be greater than 0");
        }
        if self.min_free_gb > self.recommended_free_gb {
            anyhow::bail!(
                "ETL_MIN_FREE_GB ({}) cannot exceed ETL_RECOMMENDED_FREE_GB ({})",
                self.min_free_gb,
                self.recommended_free_gb
            );
        }
        if self.heartbeat_secs == 0 || self.heartbeat_secs >= self.lock_stale_secs {
            anyhow::bail!(
                "ETL_HEARTBEAT_SECS ({}) must be positive and below ETL_LOCK_STALE_SECS ({})",
                self.heartbeat_secs,
                self.lock_stale_secs
            );
        }
        if self.load_mode == LoadMode::Staged && self.admin_database_url.is_none() {
            anyhow::bail!("ETL_LOAD_MODE=staged requires ETL_ADMIN_DATABASE_URL");
        }
        Ok(())
    }

    /// Directory the database server reads staged files from
    pub fn server_staging_dir(&self) -> &std::path::Path {
        self.staging_server_dir.as_deref().unwrap_or(&self.staging_dir)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn lock_stale_after(&self) -> Duration {
        Duration::from_secs(self.lock_stale_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }

    /// Local directory holding one period's archives, `{data_dir}/{period}`
    pub fn period_dir(&self, period: &str) -> PathBuf {
        self.data_dir.join(period)
    }

    /// Period listing URL, e.g. `{base}/2024-05/`
    pub fn period_url(&self, period: &str) -> String {
        format!("{}/{}/", self.base_url, period)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = EtlConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.batch_size, 100_000);
        assert_eq!(config.load_mode, LoadMode::Streaming);
        assert_eq!(config.scratch_dir, PathBuf::from("./data/cnpj/extracted"));
    }

    #[test]
    fn test_load_mode_from_str() {
        assert_eq!("staged".parse::<LoadMode>().unwrap(), LoadMode::Staged);
        assert_eq!("STREAMING".parse::<LoadMode>().unwrap(), LoadMode::Streaming);
        assert!("psql".parse::<LoadMode>().is_err());
    }

    #[test]
    fn test_staged_mode_requires_admin_url() {
        let mut config = EtlConfig {
            load_mode: LoadMode::Staged,
            ..EtlConfig::default()
        };
        assert!(config.validate().is_err());

        config.admin_database_url = Some("postgresql://postgres@localhost/cnpj".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_inverted_disk_thresholds() {
        let config = EtlConfig {
            min_free_gb: 50.0,
            ..EtlConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_server_staging_dir_falls_back_to_local() {
        let mut config = EtlConfig::default();
        assert_eq!(config.server_staging_dir(), config.staging_dir.as_path());

        config.staging_server_dir = Some(PathBuf::from("/var/lib/postgresql/staging"));
        assert_eq!(
            config.server_staging_dir(),
            std::path::Path::new("/var/lib/postgresql/staging")
        );
    }

    #[test]
    fn test_period_url() {
        let config = EtlConfig {
            base_url: "http://localhost:9999/dados".to_string(),
            ..EtlConfig::default()
        };
        assert_eq!(config.period_url("2024-05"), "http://localhost:9999/dados/2024-05/");
    }

    #[test]
    fn test_period_dir_nests_under_data_dir() {
        let config = EtlConfig::default();
        assert_eq!(config.period_dir("2024-05"), PathBuf::from("./data/cnpj/2024-05"));
    }
}
