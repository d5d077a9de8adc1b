//! Persistent job status
//!
//! One `etl_status` row per run. Every mutating statement carries the
//! `status NOT IN ('completed', 'error')` guard, so a terminal row is never
//! rewritten, not even by a late heartbeat from a worker that lost its lock.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::{PgConnection, PgPool};
use std::collections::BTreeMap;
use std::fmt;

/// Job identifier reported when no run has ever been recorded
pub const NO_JOB_ID: &str = "none";

const TERMINAL_GUARD: &str = "status NOT IN ('completed', 'error')";

const SELECT_COLUMNS: &str = r#"
    job_id, status, period, current_step, current_file, current_table,
    progress_percent, files_processed, files_total, records_imported,
    disk_free_gb, disk_used_gb, started_at, completed_at, elapsed_seconds,
    estimated_remaining_seconds, error_message, warnings, metadata,
    heartbeat_at, created_at, updated_at
"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Idle,
    Running,
    /// Declared for the status vocabulary; no transition leads here
    Paused,
    Completed,
    Error,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Idle => "idle",
            JobStatus::Running => "running",
            JobStatus::Paused => "paused",
            JobStatus::Completed => "completed",
            JobStatus::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Error)
    }
}

impl From<&str> for JobStatus {
    fn from(s: &str) -> Self {
        match s {
            "running" => JobStatus::Running,
            "paused" => JobStatus::Paused,
            "completed" => JobStatus::Completed,
            "error" => JobStatus::Error,
            _ => JobStatus::Idle,
        }
    }
}

impl From<String> for JobStatus {
    fn from(s: String) -> Self {
        JobStatus::from(s.as_str())
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Archive that failed inside the per-archive boundary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedArchive {
    pub archive: String,
    pub error: String,
    /// Rows of this archive already committed when it failed. They carry no
    /// ledger entry, so a resumed run loads them again.
    #[serde(default)]
    pub rows_committed: u64,
}

/// Free-form diagnostics stored in `etl_status.metadata`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobMetadata {
    pub processed_files: Vec<String>,
    pub failed_files: Vec<FailedArchive>,
    pub decode_errors: u64,
    pub rows_per_table: BTreeMap<String, u64>,
    pub load_mode: Option<String>,
}

/// Row of `etl_status`
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct StatusRecord {
    pub job_id: String,
    pub status: String,
    pub period: Option<String>,
    pub current_step: Option<String>,
    pub current_file: Option<String>,
    pub current_table: Option<String>,
    pub progress_percent: f64,
    pub files_processed: i32,
    pub files_total: i32,
    pub records_imported: i64,
    pub disk_free_gb: Option<f64>,
    pub disk_used_gb: Option<f64>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub elapsed_seconds: Option<i64>,
    pub estimated_remaining_seconds: Option<i64>,
    pub error_message: Option<String>,
    pub warnings: Json<Vec<String>>,
    pub metadata: Json<JobMetadata>,
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StatusRecord {
    pub fn job_status(&self) -> JobStatus {
        JobStatus::from(self.status.as_str())
    }

    /// Snapshot reported before any job has run
    pub fn idle() -> Self {
        let now = Utc::now();
        Self {
            job_id: NO_JOB_ID.to_string(),
            status: JobStatus::Idle.as_str().to_string(),
            period: None,
            current_step: None,
            current_file: None,
            current_table: None,
            progress_percent: 0.0,
            files_processed: 0,
            files_total: 0,
            records_imported: 0,
            disk_free_gb: None,
            disk_used_gb: None,
            started_at: None,
            completed_at: None,
            elapsed_seconds: None,
            estimated_remaining_seconds: None,
            error_message: None,
            warnings: Json(Vec::new()),
            metadata: Json(JobMetadata::default()),
            heartbeat_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Counters written after every archive
#[derive(Debug, Clone, Default)]
pub struct ProgressUpdate {
    pub progress_percent: f64,
    pub files_processed: i32,
    pub files_total: i32,
    pub records_imported: i64,
    pub disk_free_gb: Option<f64>,
    pub disk_used_gb: Option<f64>,
    pub elapsed_seconds: i64,
    pub estimated_remaining_seconds: Option<i64>,
    pub metadata: JobMetadata,
}

/// `etl_YYYYMMDD_HHMMSS` in UTC
pub fn new_job_id() -> String {
    Utc::now().format("etl_%Y%m%d_%H%M%S").to_string()
}

#[derive(Clone)]
pub struct StatusStore {
    pool: PgPool,
}

impl StatusStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert the row for a new run; false when `job_id` is already taken
    pub async fn create(
        conn: &mut PgConnection,
        job_id: &str,
        period: Option<&str>,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            INSERT INTO etl_status (job_id, status, period, current_step, heartbeat_at)
            VALUES ($1, 'running', $2, 'queued', NOW())
            ON CONFLICT (job_id) DO NOTHING
            "#,
        )
        .bind(job_id)
        .bind(period)
        .execute(conn)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Insert a row under `base`, or `base_2`, `base_3`... when starts land in
    /// the same second. Returns the id actually used.
    pub async fn create_unique(
        conn: &mut PgConnection,
        base: &str,
        period: Option<&str>,
    ) -> Result<String, sqlx::Error> {
        let mut attempt = 1u32;
        loop {
            let candidate = match attempt {
                1 => base.to_string(),
                n => format!("{}_{}", base, n),
            };
            if Self::create(&mut *conn, &candidate, period).await? {
                return Ok(candidate);
            }
            attempt += 1;
        }
    }

    pub async fn mark_running(&self, job_id: &str) -> Result<bool, sqlx::Error> {
        let sql = format!(
            r#"
            UPDATE etl_status
            SET status = 'running',
                started_at = COALESCE(started_at, NOW()),
                current_step = 'preflight',
                heartbeat_at = NOW(),
                updated_at = NOW()
            WHERE job_id = $1 AND {TERMINAL_GUARD}
            "#
        );
        let result = sqlx::query(&sql).bind(job_id).execute(&self.pool).await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn set_period(&self, job_id: &str, period: &str) -> Result<(), sqlx::Error> {
        let sql = format!(
            "UPDATE etl_status SET period = $2, updated_at = NOW() \
             WHERE job_id = $1 AND {TERMINAL_GUARD}"
        );
        sqlx::query(&sql).bind(job_id).bind(period).execute(&self.pool).await?;
        Ok(())
    }

    pub async fn set_step(
        &self,
        job_id: &str,
        step: &str,
        file: Option<&str>,
        table: Option<&str>,
    ) -> Result<(), sqlx::Error> {
        let sql = format!(
            r#"
            UPDATE etl_status
            SET current_step = $2, current_file = $3, current_table = $4,
                heartbeat_at = NOW(), updated_at = NOW()
            WHERE job_id = $1 AND {TERMINAL_GUARD}
            "#
        );
        sqlx::query(&sql)
            .bind(job_id)
            .bind(step)
            .bind(file)
            .bind(table)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn update_progress(
        &self,
        job_id: &str,
        update: &ProgressUpdate,
    ) -> Result<bool, sqlx::Error> {
        let sql = format!(
            r#"
            UPDATE etl_status
            SET progress_percent = $2,
                files_processed = $3,
                files_total = $4,
                records_imported = $5,
                disk_free_gb = $6,
                disk_used_gb = $7,
                elapsed_seconds = $8,
                estimated_remaining_seconds = $9,
                metadata = $10,
                heartbeat_at = NOW(),
                updated_at = NOW()
            WHERE job_id = $1 AND {TERMINAL_GUARD}
            "#
        );
        let result = sqlx::query(&sql)
            .bind(job_id)
            .bind(update.progress_percent)
            .bind(update.files_processed)
            .bind(update.files_total)
            .bind(update.records_imported)
            .bind(update.disk_free_gb)
            .bind(update.disk_used_gb)
            .bind(update.elapsed_seconds)
            .bind(update.estimated_remaining_seconds)
            .bind(Json(&update.metadata))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Refresh the row heartbeat without touching counters
    pub async fn touch(&self, job_id: &str) -> Result<bool, sqlx::Error> {
        let sql = format!(
            "UPDATE etl_status SET heartbeat_at = NOW() WHERE job_id = $1 AND {TERMINAL_GUARD}"
        );
        let result = sqlx::query(&sql).bind(job_id).execute(&self.pool).await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn add_warning(&self, job_id: &str, warning: &str) -> Result<(), sqlx::Error> {
        self.add_warnings(job_id, &[warning.to_string()]).await
    }

    /// Append to the `warnings` array
    pub async fn add_warnings(&self, job_id: &str, warnings: &[String]) -> Result<(), sqlx::Error> {
        if warnings.is_empty() {
            return Ok(());
        }
        let sql = format!(
            "UPDATE etl_status SET warnings = warnings || $2, updated_at = NOW() \
             WHERE job_id = $1 AND {TERMINAL_GUARD}"
        );
        sqlx::query(&sql)
            .bind(job_id)
            .bind(Json(warnings))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn complete(&self, job_id: &str, update: &ProgressUpdate) -> Result<bool, sqlx::Error> {
        let sql = format!(
            r#"
            UPDATE etl_status
            SET status = 'completed',
                current_step = 'completed',
                current_file = NULL,
                current_table = NULL,
                progress_percent = 100,
                files_processed = $2,
                files_total = $3,
                records_imported = $4,
                disk_free_gb = $5,
                disk_used_gb = $6,
                elapsed_seconds = $7,
                estimated_remaining_seconds = 0,
                metadata = $8,
                completed_at = NOW(),
                heartbeat_at = NOW(),
                updated_at = NOW()
            WHERE job_id = $1 AND {TERMINAL_GUARD}
            "#
        );
        let result = sqlx::query(&sql)
            .bind(job_id)
            .bind(update.files_processed)
            .bind(update.files_total)
            .bind(update.records_imported)
            .bind(update.disk_free_gb)
            .bind(update.disk_used_gb)
            .bind(update.elapsed_seconds)
            .bind(Json(&update.metadata))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn fail(
        &self,
        job_id: &str,
        message: &str,
        elapsed_seconds: Option<i64>,
    ) -> Result<bool, sqlx::Error> {
        let mut conn = self.pool.acquire().await?;
        Self::fail_in(&mut conn, job_id, message, elapsed_seconds).await
    }

    /// Mark a run as failed on an existing connection or transaction
    pub async fn fail_in(
        conn: &mut PgConnection,
        job_id: &str,
        message: &str,
        elapsed_seconds: Option<i64>,
    ) -> Result<bool, sqlx::Error> {
        let sql = format!(
            r#"
            UPDATE etl_status
            SET status = 'error',
                error_message = $2,
                elapsed_seconds = COALESCE($3, elapsed_seconds),
                estimated_remaining_seconds = NULL,
                completed_at = NOW(),
                updated_at = NOW()
            WHERE job_id = $1 AND {TERMINAL_GUARD}
            "#
        );
        let result = sqlx::query(&sql)
            .bind(job_id)
            .bind(message)
            .bind(elapsed_seconds)
            .execute(conn)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn get(&self, job_id: &str) -> Result<Option<StatusRecord>, sqlx::Error> {
        let sql = format!("SELECT {SELECT_COLUMNS} FROM etl_status WHERE job_id = $1");
        sqlx::query_as::<_, StatusRecord>(&sql)
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
    }

    pub async fn latest(&self) -> Result<Option<StatusRecord>, sqlx::Error> {
        let sql =
            format!("SELECT {SELECT_COLUMNS} FROM etl_status ORDER BY created_at DESC, id DESC LIMIT 1");
        sqlx::query_as::<_, StatusRecord>(&sql)
            .fetch_optional(&self.pool)
            .await
    }

    /// Latest record, or the idle snapshot when the table is empty
    pub async fn snapshot(&self) -> Result<StatusRecord, sqlx::Error> {
        Ok(self.latest().await?.unwrap_or_else(StatusRecord::idle))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_status_round_trip() {
        for status in [
            JobStatus::Idle,
            JobStatus::Running,
            JobStatus::Paused,
            JobStatus::Completed,
            JobStatus::Error,
        ] {
            assert_eq!(JobStatus::from(status.as_str()), status);
        }
        assert_eq!(JobStatus::from("garbage"), JobStatus::Idle);
        assert!(JobStatus::Error.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
    }

    #[test]
    fn test_job_id_format() {
        let id = new_job_id();
        assert!(id.starts_with("etl_"));
        assert_eq!(id.len(), "etl_20240101_120000".len());
        assert_eq!(&id[12..13], "_");
    }

    #[test]
    fn test_idle_snapshot() {
        let idle = StatusRecord::idle();
        assert_eq!(idle.job_id, NO_JOB_ID);
        assert_eq!(idle.job_status(), JobStatus::Idle);
        let json = serde_json::to_value(&idle).unwrap();
        assert_eq!(json["status"], "idle");
        assert_eq!(json["warnings"], serde_json::json!([]));
    }

    #[test]
    fn test_metadata_tolerates_missing_fields() {
        let metadata: JobMetadata = serde_json::from_str(r#"{"decode_errors": 3}"#).unwrap();
        assert_eq!(metadata.decode_errors, 3);
        assert!(metadata.failed_files.is_empty());
    }
}
