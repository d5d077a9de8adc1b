//! Archives committed per period
//!
//! Written after each archive's rows commit; a resumed run skips every
//! archive already recorded for the same period.

use sqlx::PgPool;
use std::collections::HashSet;

use super::manifest::DatasetType;

#[derive(Clone)]
pub struct ArchiveLedger {
    pool: PgPool,
}

impl ArchiveLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn record(
        &self,
        period: &str,
        archive_name: &str,
        dataset: DatasetType,
        rows_loaded: u64,
        job_id: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO etl_loaded_archives (period, archive_name, dataset, rows_loaded, job_id)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (period, archive_name) DO UPDATE
            SET dataset = EXCLUDED.dataset,
                rows_loaded = EXCLUDED.rows_loaded,
                job_id = EXCLUDED.job_id,
                loaded_at = NOW()
            "#,
        )
        .bind(period)
        .bind(archive_name)
        .bind(dataset.as_str())
        .bind(i64::try_from(rows_loaded).unwrap_or(i64::MAX))
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Archive names already loaded for `period`
    pub async fn loaded(&self, period: &str) -> Result<HashSet<String>, sqlx::Error> {
        let names: Vec<String> =
            sqlx::query_scalar("SELECT archive_name FROM etl_loaded_archives WHERE period = $1")
                .bind(period)
                .fetch_all(&self.pool)
                .await?;
        Ok(names.into_iter().collect())
    }

    /// Forget a period, used when its tables are truncated
    pub async fn clear(&self, period: &str) -> Result<u64, sqlx::Error> {
        let result = sqlx::query("DELETE FROM etl_loaded_archives WHERE period = $1")
            .bind(period)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
