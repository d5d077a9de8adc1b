//! How a decoded file reaches its table
//!
//! [`StreamingCopy`] pushes decoder batches through the pipeline session.
//! [`StagedFileCopy`] writes the whole file as COPY text into a directory
//! the database server can read, then issues one server-side `COPY FROM
//! '<path>'` over the administrative pool. It avoids per-batch round trips
//! on multi-million-row archives.

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::{copy_text, BulkLoader};
use crate::ingest::config::{EtlConfig, LoadMode};
use crate::ingest::decoder::RecordDecoder;
use crate::ingest::manifest::DatasetType;
use crate::ingest::models::DecodeStats;
use crate::ingest::{IngestError, Result};

/// Outcome of loading one extracted file
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileLoad {
    pub rows: u64,
    pub stats: DecodeStats,
}

#[async_trait]
pub trait LoadStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    async fn load_file(
        &self,
        loader: &mut BulkLoader,
        decoder: &RecordDecoder,
        path: &Path,
        dataset: DatasetType,
    ) -> Result<FileLoad>;
}

/// Strategy selected by `ETL_LOAD_MODE`
pub fn strategy_for(config: &EtlConfig) -> Result<Box<dyn LoadStrategy>> {
    match config.load_mode {
        LoadMode::Streaming => Ok(Box::new(StreamingCopy)),
        LoadMode::Staged => {
            let url = config.admin_database_url.as_deref().ok_or_else(|| {
                IngestError::Validation(
                    "ETL_LOAD_MODE=staged requires ETL_ADMIN_DATABASE_URL".to_string(),
                )
            })?;
            let admin_pool = PgPoolOptions::new().max_connections(1).connect_lazy(url)?;
            Ok(Box::new(StagedFileCopy::new(
                admin_pool,
                config.staging_dir.clone(),
                config.server_staging_dir().to_path_buf(),
            )))
        },
    }
}

/// Decoder batches streamed through `COPY ... FROM STDIN`
pub struct StreamingCopy;

#[async_trait]
impl LoadStrategy for StreamingCopy {
    fn name(&self) -> &'static str {
        "streaming"
    }

    async fn load_file(
        &self,
        loader: &mut BulkLoader,
        decoder: &RecordDecoder,
        path: &Path,
        dataset: DatasetType,
    ) -> Result<FileLoad> {
        let mut batches = decoder.decode_file(path, dataset)?;
        let mut rows = 0;

        for batch in batches.by_ref() {
            rows += loader.bulk_insert(&batch?).await?;
        }

        Ok(FileLoad {
            rows,
            stats: batches.stats(),
        })
    }
}

/// Whole-file staging plus a server-side COPY on the admin channel
pub struct StagedFileCopy {
    admin_pool: PgPool,
    staging_dir: PathBuf,
    server_dir: PathBuf,
}

impl StagedFileCopy {
    pub fn new(admin_pool: PgPool, staging_dir: PathBuf, server_dir: PathBuf) -> Self {
        Self {
            admin_pool,
            staging_dir,
            server_dir,
        }
    }
}

/// Deletes the staging file on every exit path
struct StagingFile(PathBuf);

impl Drop for StagingFile {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.0) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
                warn!(file = %self.0.display(), error = %e, "Failed to remove staging file");
            },
            _ => {},
        }
    }
}

fn staging_file_name(path: &Path, dataset: DatasetType) -> String {
    let source = path
        .file_name()
        .map(|n| n.to_string_lossy().replace(['$', ' ', '\''], "_"))
        .unwrap_or_default();
    format!("{}_{}.copy", dataset.table(), source)
}

/// Decode `source` into COPY text at `target`; returns rows written
pub fn write_staging_file(
    decoder: &RecordDecoder,
    source: &Path,
    dataset: DatasetType,
    target: &Path,
) -> Result<(u64, DecodeStats)> {
    let mut writer = BufWriter::new(File::create(target)?);
    let mut batches = decoder.decode_file(source, dataset)?;
    let mut rows = 0u64;

    for batch in batches.by_ref() {
        for record in &batch?.records {
            copy_text::write_record(&mut writer, record)?;
            rows += 1;
        }
    }
    writer.flush()?;

    Ok((rows, batches.stats()))
}

#[async_trait]
impl LoadStrategy for StagedFileCopy {
    fn name(&self) -> &'static str {
        "staged"
    }

    async fn load_file(
        &self,
        loader: &mut BulkLoader,
        decoder: &RecordDecoder,
        path: &Path,
        dataset: DatasetType,
    ) -> Result<FileLoad> {
        std::fs::create_dir_all(&self.staging_dir)?;

        let file_name = staging_file_name(path, dataset);
        let local_path = self.staging_dir.join(&file_name);
        let _staging = StagingFile(local_path.clone());

        let decoder = *decoder;
        let source = path.to_path_buf();
        let target = local_path.clone();
        let (written, stats) = tokio::task::spawn_blocking(move || {
            write_staging_file(&decoder, &source, dataset, &target)
        })
        .await
        .map_err(|e| IngestError::Io(std::io::Error::other(e)))??;

        debug!(file = %local_path.display(), rows = written, "Staging file written");

        let server_path = self.server_dir.join(&file_name);
        let statement = copy_text::copy_from_file(dataset, &server_path.to_string_lossy());
        let result = sqlx::raw_sql(&statement).execute(&self.admin_pool).await?;
        let rows = result.rows_affected();

        if rows != written {
            warn!(
                dataset = %dataset,
                written,
                copied = rows,
                "Server COPY row count differs from staged rows"
            );
        }

        loader.record_loaded(dataset, rows);
        info!(dataset = %dataset, rows, "Staged COPY committed");

        Ok(FileLoad { rows, stats })
    }
}
