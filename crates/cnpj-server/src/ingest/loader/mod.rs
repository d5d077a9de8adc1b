//! Bulk loading into PostgreSQL
//!
//! [`BulkLoader`] owns the single pooled session a pipeline run writes
//! through. Batches go in via `COPY ... FROM STDIN`, one transaction per
//! batch; a failed batch rolls back alone and the error is returned to the
//! caller, which decides whether to move on to the next archive.

pub mod copy_text;
pub mod strategy;

use sqlx::pool::PoolConnection;
use sqlx::{Connection, PgPool, Postgres};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

use super::manifest::DatasetType;
use super::models::Batch;
use super::Result;

pub use strategy::{strategy_for, FileLoad, LoadStrategy, StagedFileCopy, StreamingCopy};

/// Keeps individual CopyData messages at a reasonable size
const COPY_CHUNK_BYTES: usize = 1 << 20;

/// Secondary indexes created once the run has loaded everything
pub const INDEX_STATEMENTS: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_empresas_razao_social ON empresas USING gin (to_tsvector('portuguese', coalesce(razao_social, '')))",
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_estabelecimentos_cnpj_completo ON estabelecimentos (cnpj_completo)",
    "CREATE INDEX IF NOT EXISTS idx_estabelecimentos_cnpj_basico ON estabelecimentos (cnpj_basico)",
    "CREATE INDEX IF NOT EXISTS idx_estabelecimentos_uf_municipio ON estabelecimentos (uf, municipio)",
    "CREATE INDEX IF NOT EXISTS idx_estabelecimentos_situacao ON estabelecimentos (situacao_cadastral)",
    "CREATE INDEX IF NOT EXISTS idx_socios_cnpj_basico ON socios (cnpj_basico)",
    "CREATE INDEX IF NOT EXISTS idx_socios_cpf_cnpj_socio ON socios (cpf_cnpj_socio)",
    "CREATE INDEX IF NOT EXISTS idx_socios_nome ON socios USING gin (to_tsvector('portuguese', coalesce(nome_socio, '')))",
];

/// Session-bound sink for decoded batches
pub struct BulkLoader {
    conn: PoolConnection<Postgres>,
    counts: BTreeMap<DatasetType, u64>,
}

impl BulkLoader {
    pub fn new(conn: PoolConnection<Postgres>) -> Self {
        Self {
            conn,
            counts: BTreeMap::new(),
        }
    }

    pub async fn connect(pool: &PgPool) -> Result<Self> {
        Ok(Self::new(pool.acquire().await?))
    }

    /// COPY one batch in its own transaction; returns the rows accepted.
    pub async fn bulk_insert(&mut self, batch: &Batch) -> Result<u64> {
        if batch.is_empty() {
            return Ok(0);
        }

        let payload = copy_text::encode_batch(batch);
        let statement = copy_text::copy_from_stdin(batch.dataset);

        let mut tx = self.conn.begin().await?;
        let mut copy = tx.copy_in_raw(&statement).await?;

        for chunk in payload.as_bytes().chunks(COPY_CHUNK_BYTES) {
            if let Err(e) = copy.send(chunk).await {
                if let Err(abort_err) = copy.abort(e.to_string()).await {
                    debug!(error = %abort_err, "COPY abort reported an error");
                }
                return Err(e.into());
            }
        }

        let rows = copy.finish().await?;
        tx.commit().await?;

        self.record_loaded(batch.dataset, rows);
        debug!(dataset = %batch.dataset, rows, "Batch committed");

        Ok(rows)
    }

    /// Count rows that reached the table through another channel
    pub fn record_loaded(&mut self, dataset: DatasetType, rows: u64) {
        *self.counts.entry(dataset).or_default() += rows;
    }

    /// Remove every row of the dataset's table, cascading to dependents
    pub async fn truncate_table(&mut self, dataset: DatasetType) -> Result<()> {
        warn!(table = dataset.table(), "Truncating table");
        let statement = format!("TRUNCATE TABLE {} CASCADE", dataset.table());
        sqlx::Executor::execute(&mut *self.conn, sqlx::raw_sql(&statement)).await?;
        Ok(())
    }

    /// Create the secondary indexes; failures come back as warnings
    pub async fn create_indexes(&mut self) -> Vec<String> {
        let mut warnings = Vec::new();

        for statement in INDEX_STATEMENTS {
            match sqlx::Executor::execute(&mut *self.conn, sqlx::raw_sql(statement)).await {
                Ok(_) => debug!(statement, "Index ready"),
                Err(e) => {
                    warn!(statement, error = %e, "Index creation failed");
                    warnings.push(format!("Index creation failed: {}: {}", statement, e));
                },
            }
        }

        info!(
            total = INDEX_STATEMENTS.len(),
            failed = warnings.len(),
            "Index creation finished"
        );
        warnings
    }

    /// ANALYZE each table; failures come back as warnings
    pub async fn update_statistics(&mut self, datasets: &[DatasetType]) -> Vec<String> {
        let mut warnings = Vec::new();

        for dataset in datasets {
            let statement = format!("ANALYZE {}", dataset.table());
            if let Err(e) = sqlx::Executor::execute(&mut *self.conn, sqlx::raw_sql(&statement)).await {
                warn!(table = dataset.table(), error = %e, "ANALYZE failed");
                warnings.push(format!("ANALYZE {} failed: {}", dataset.table(), e));
            }
        }

        warnings
    }

    /// Database-wide VACUUM ANALYZE; must run outside a transaction
    pub async fn vacuum_analyze(&mut self) -> Result<()> {
        info!("Running VACUUM ANALYZE");
        sqlx::Executor::execute(&mut *self.conn, sqlx::raw_sql("VACUUM ANALYZE")).await?;
        Ok(())
    }

    /// Establishments loaded without a full CNPJ
    pub async fn count_missing_composite(&mut self) -> Result<i64> {
        let missing: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM estabelecimentos WHERE cnpj_completo IS NULL")
                .fetch_one(&mut *self.conn)
                .await?;
        Ok(missing)
    }

    /// Rows loaded in this session, per dataset
    pub fn counts(&self) -> &BTreeMap<DatasetType, u64> {
        &self.counts
    }

    pub fn total_loaded(&self) -> u64 {
        self.counts.values().sum()
    }
}
