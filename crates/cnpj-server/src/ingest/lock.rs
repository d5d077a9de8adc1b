//! Durable single-job lock
//!
//! `etl_lock` holds exactly one row. A job owns it while its `job_id` is set
//! and its heartbeat is fresh; a lock whose heartbeat is older than the stale
//! window can be taken over, and the previous holder's status row is closed
//! as an orphan in the same transaction.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{Connection, PgConnection, PgPool};
use std::time::Duration;
use tracing::{info, warn};

use super::status::StatusStore;

pub const ORPHANED_MESSAGE: &str = "orphaned: heartbeat expired";

/// Current owner of the lock row
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct LockHolder {
    pub job_id: String,
    pub holder_host: Option<String>,
    pub acquired_at: Option<DateTime<Utc>>,
    pub heartbeat_at: Option<DateTime<Utc>>,
}

impl LockHolder {
    /// True when the heartbeat is missing or older than `stale_after`
    pub fn is_stale(&self, stale_after: Duration) -> bool {
        let Some(heartbeat) = self.heartbeat_at else {
            return true;
        };
        match chrono::Duration::from_std(stale_after) {
            Ok(window) => heartbeat < Utc::now() - window,
            Err(_) => false,
        }
    }
}

#[derive(Debug, Clone)]
pub enum Acquire {
    /// `replaced` names a stale holder that was taken over
    Acquired { replaced: Option<String> },
    Held(LockHolder),
}

pub struct JobLock;

impl JobLock {
    /// Claim the lock for `job_id` inside the caller's transaction
    pub async fn try_acquire(
        conn: &mut PgConnection,
        job_id: &str,
        stale_after: Duration,
    ) -> Result<Acquire, sqlx::Error> {
        let replaced: Option<Option<String>> = sqlx::query_scalar(
            r#"
            WITH previous AS (
                SELECT job_id, heartbeat_at FROM etl_lock WHERE id = 1 FOR UPDATE
            )
            UPDATE etl_lock AS l
            SET job_id = $1, holder_host = $2, acquired_at = NOW(), heartbeat_at = NOW()
            FROM previous AS p
            WHERE l.id = 1
              AND (p.job_id IS NULL
                   OR p.heartbeat_at IS NULL
                   OR p.heartbeat_at < NOW() - make_interval(secs => $3))
            RETURNING p.job_id
            "#,
        )
        .bind(job_id)
        .bind(host_name())
        .bind(stale_after.as_secs_f64())
        .fetch_optional(&mut *conn)
        .await?;

        match replaced {
            Some(previous) => {
                if let Some(ref stale_job) = previous {
                    warn!(stale_job, job_id, "Taking over stale ETL lock");
                    StatusStore::fail_in(conn, stale_job, ORPHANED_MESSAGE, None).await?;
                }
                Ok(Acquire::Acquired { replaced: previous })
            },
            None => {
                let holder = Self::holder_in(conn).await?;
                match holder {
                    Some(holder) => Ok(Acquire::Held(holder)),
                    None => Err(sqlx::Error::RowNotFound),
                }
            },
        }
    }

    /// Refresh the heartbeat; false when the lock is no longer ours
    pub async fn heartbeat(pool: &PgPool, job_id: &str) -> Result<bool, sqlx::Error> {
        let result =
            sqlx::query("UPDATE etl_lock SET heartbeat_at = NOW() WHERE id = 1 AND job_id = $1")
                .bind(job_id)
                .execute(pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Clear the lock, only when held by `job_id`
    pub async fn release(pool: &PgPool, job_id: &str) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE etl_lock
            SET job_id = NULL, holder_host = NULL, acquired_at = NULL, heartbeat_at = NULL
            WHERE id = 1 AND job_id = $1
            "#,
        )
        .bind(job_id)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn holder(pool: &PgPool) -> Result<Option<LockHolder>, sqlx::Error> {
        let mut conn = pool.acquire().await?;
        Self::holder_in(&mut conn).await
    }

    async fn holder_in(conn: &mut PgConnection) -> Result<Option<LockHolder>, sqlx::Error> {
        sqlx::query_as::<_, LockHolder>(
            r#"
            SELECT job_id, holder_host, acquired_at, heartbeat_at
            FROM etl_lock
            WHERE id = 1 AND job_id IS NOT NULL
            "#,
        )
        .fetch_optional(conn)
        .await
    }
}

/// Close every running job whose heartbeat expired and free the lock if one of
/// them held it. Returns the reconciled job ids.
pub async fn reconcile_orphans(pool: &PgPool, stale_after: Duration) -> Result<Vec<String>, sqlx::Error> {
    let mut conn = pool.acquire().await?;
    let mut tx = conn.begin().await?;

    let orphans: Vec<String> = sqlx::query_scalar(
        r#"
        UPDATE etl_status
        SET status = 'error',
            error_message = $1,
            completed_at = NOW(),
            updated_at = NOW()
        WHERE status = 'running'
          AND (heartbeat_at IS NULL OR heartbeat_at < NOW() - make_interval(secs => $2))
        RETURNING job_id
        "#,
    )
    .bind(ORPHANED_MESSAGE)
    .bind(stale_after.as_secs_f64())
    .fetch_all(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        UPDATE etl_lock
        SET job_id = NULL, holder_host = NULL, acquired_at = NULL, heartbeat_at = NULL
        WHERE id = 1
          AND job_id IS NOT NULL
          AND (job_id = ANY($1)
               OR heartbeat_at IS NULL
               OR heartbeat_at < NOW() - make_interval(secs => $2))
        "#,
    )
    .bind(&orphans)
    .bind(stale_after.as_secs_f64())
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;

    if !orphans.is_empty() {
        info!(count = orphans.len(), jobs = ?orphans, "Reconciled orphaned ETL jobs");
    }
    Ok(orphans)
}

fn host_name() -> Option<String> {
    hostname::get().ok().map(|h| h.to_string_lossy().into_owned())
}
