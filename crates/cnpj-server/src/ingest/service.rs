//! Control surface of the pipeline
//!
//! [`EtlService`] is cheap to clone and shared by the HTTP routes and the
//! CLI. Starting a job goes through the durable lock: the status row is
//! created and the lock claimed in one transaction, then the worker runs on
//! its own task.

use chrono::NaiveDate;
use cnpj_common::logging::LogConfig;
use serde::{Deserialize, Serialize};
use sqlx::{Connection, PgPool};
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

use super::config::EtlConfig;
use super::lock::{Acquire, JobLock};
use super::logs::{self, LogTail};
use super::manifest::{DatasetType, LoadGroup};
use super::preflight::{self, ValidationReport};
use super::status::{new_job_id, JobStatus, StatusRecord, StatusStore};
use super::worker::{EtlWorker, JobSpec};
use super::IngestError;

fn default_tables() -> Vec<String> {
    vec![LoadGroup::All.as_str().to_string()]
}

/// Parameters of `POST /start` and `cnpj-etl run`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartRequest {
    #[serde(default)]
    pub force: bool,
    #[serde(default)]
    pub skip_download: bool,
    #[serde(default = "default_tables")]
    pub tables: Vec<String>,
    #[serde(default)]
    pub period: Option<String>,
    #[serde(default)]
    pub truncate: bool,
    /// Skip archives the ledger already holds for this period. An archive that
    /// failed mid-load has no ledger entry, so its committed batches are
    /// loaded a second time; tables without a unique key keep both copies.
    /// The failure warning reports how many rows that is.
    #[serde(default)]
    pub resume: bool,
}

impl Default for StartRequest {
    fn default() -> Self {
        Self {
            force: false,
            skip_download: false,
            tables: default_tables(),
            period: None,
            truncate: false,
            resume: false,
        }
    }
}

#[derive(Debug, Error)]
pub enum StartError {
    #[error("An ETL job is already running: {job_id}")]
    AlreadyRunning { job_id: String },

    #[error("Pre-flight validation failed: {}", errors.join("; "))]
    ValidationFailed { errors: Vec<String> },

    #[error("{0}")]
    InvalidRequest(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("{0}")]
    Ingest(#[from] IngestError),
}

/// Control operation this pipeline does not offer
#[derive(Debug, Error)]
#[error("{0} is not implemented")]
pub struct Unsupported(pub &'static str);

/// `YYYY-MM` with a real month
pub fn is_valid_period(period: &str) -> bool {
    period.len() == 7 && NaiveDate::parse_from_str(&format!("{}-01", period), "%Y-%m-%d").is_ok()
}

/// Resolve the request's table names into datasets in dependency order
pub fn plan_tables(tables: &[String]) -> Result<Vec<DatasetType>, StartError> {
    let groups = tables
        .iter()
        .map(|t| LoadGroup::from_str(t.trim()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| StartError::InvalidRequest(e.to_string()))?;
    Ok(LoadGroup::plan(&groups))
}

#[derive(Clone)]
pub struct EtlService {
    pool: PgPool,
    config: Arc<EtlConfig>,
    log_config: Arc<LogConfig>,
    status: StatusStore,
}

impl EtlService {
    pub fn new(pool: PgPool, config: EtlConfig, log_config: LogConfig) -> Self {
        Self {
            status: StatusStore::new(pool.clone()),
            pool,
            config: Arc::new(config),
            log_config: Arc::new(log_config),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn config(&self) -> &EtlConfig {
        &self.config
    }

    pub async fn validate(&self) -> ValidationReport {
        preflight::validate(&self.pool, &self.config).await
    }

    /// Start a job in the background and return its id
    pub async fn start(&self, request: StartRequest) -> Result<String, StartError> {
        let worker = self.prepare(request).await?;
        let job_id = worker.job_id().to_string();
        tokio::spawn(async move {
            worker.run().await;
        });
        Ok(job_id)
    }

    /// Start a job and wait for it to reach a terminal state
    pub async fn run(&self, request: StartRequest) -> Result<(String, JobStatus), StartError> {
        let worker = self.prepare(request).await?;
        let job_id = worker.job_id().to_string();
        let outcome = worker.run().await;
        Ok((job_id, outcome))
    }

    async fn prepare(&self, request: StartRequest) -> Result<EtlWorker, StartError> {
        let datasets = plan_tables(&request.tables)?;
        if let Some(period) = &request.period {
            if !is_valid_period(period) {
                return Err(StartError::InvalidRequest(
                    cnpj_common::EtlError::InvalidPeriod(period.clone()).to_string(),
                ));
            }
        }
        if request.resume && request.truncate {
            return Err(StartError::InvalidRequest(
                "resume and truncate cannot be combined".to_string(),
            ));
        }

        let stale_after = self.config.lock_stale_after();
        if let Some(holder) = JobLock::holder(&self.pool).await? {
            if !holder.is_stale(stale_after) {
                return Err(StartError::AlreadyRunning { job_id: holder.job_id });
            }
        }

        let report = self.validate().await;
        if !report.can_proceed && !request.force {
            return Err(StartError::ValidationFailed { errors: report.errors });
        }

        let mut conn = self.pool.acquire().await?;
        let mut tx = conn.begin().await?;

        let job_id =
            StatusStore::create_unique(&mut tx, &new_job_id(), request.period.as_deref()).await?;

        match JobLock::try_acquire(&mut tx, &job_id, stale_after).await? {
            Acquire::Held(holder) => {
                tx.rollback().await?;
                return Err(StartError::AlreadyRunning { job_id: holder.job_id });
            },
            Acquire::Acquired { replaced } => {
                if let Some(previous) = replaced {
                    warn!(job_id = %job_id, previous = %previous, "Replaced stale job");
                }
            },
        }
        tx.commit().await?;

        info!(
            job_id = %job_id,
            tables = ?request.tables,
            period = ?request.period,
            force = request.force,
            skip_download = request.skip_download,
            truncate = request.truncate,
            resume = request.resume,
            "ETL job accepted"
        );

        let spec = JobSpec {
            job_id,
            period: request.period,
            datasets,
            force: request.force,
            skip_download: request.skip_download,
            truncate: request.truncate,
            resume: request.resume,
        };
        Ok(EtlWorker::new(self.pool.clone(), (*self.config).clone(), spec))
    }

    pub async fn status(&self) -> Result<StatusRecord, sqlx::Error> {
        self.status.snapshot().await
    }

    pub async fn job(&self, job_id: &str) -> Result<Option<StatusRecord>, sqlx::Error> {
        self.status.get(job_id).await
    }

    pub async fn logs(&self, lines: Option<usize>) -> anyhow::Result<LogTail> {
        let lines = logs::clamp_lines(lines);
        let log_config = Arc::clone(&self.log_config);
        tokio::task::spawn_blocking(move || logs::tail_latest(&log_config, lines)).await?
    }

    pub fn pause(&self) -> Result<(), Unsupported> {
        Err(Unsupported("Pausing a running job"))
    }

    /// Resuming a paused job; partial periods resume via `StartRequest::resume`
    pub fn resume(&self) -> Result<(), Unsupported> {
        Err(Unsupported("Resuming a paused job"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_request_defaults() {
        let request: StartRequest = serde_json::from_str("{}").unwrap();
        assert_eq!(request, StartRequest::default());
        assert_eq!(request.tables, vec!["all"]);
    }

    #[test]
    fn test_is_valid_period() {
        assert!(is_valid_period("2024-05"));
        assert!(!is_valid_period("2024-13"));
        assert!(!is_valid_period("2024-5"));
        assert!(!is_valid_period("latest"));
    }

    #[test]
    fn test_plan_tables() {
        let plan = plan_tables(&["socios".to_string(), "auxiliares".to_string()]).unwrap();
        assert_eq!(plan.first(), Some(&DatasetType::Cnae));
        assert_eq!(plan.last(), Some(&DatasetType::Socio));
        assert_eq!(plan.len(), 7);

        assert!(matches!(
            plan_tables(&["nope".to_string()]),
            Err(StartError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_start_error_messages() {
        let err = StartError::ValidationFailed {
            errors: vec!["a".to_string(), "b".to_string()],
        };
        assert_eq!(err.to_string(), "Pre-flight validation failed: a; b");
    }
}
