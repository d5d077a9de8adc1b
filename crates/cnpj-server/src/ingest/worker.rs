//! End-to-end execution of one ingestion job
//!
//! The worker runs on its own tokio task and processes archives strictly
//! one after another, in dependency order. A failure inside one archive is
//! recorded and the run moves on; anything outside that boundary ends the
//! job in `error`. The durable lock is released on every exit path.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Instant;

use sqlx::PgPool;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::catalog::ArchiveCatalog;
use super::config::EtlConfig;
use super::decoder::{ArchiveExtraction, RecordDecoder};
use super::fetcher::Fetcher;
use super::ledger::ArchiveLedger;
use super::loader::{strategy_for, BulkLoader, LoadStrategy};
use super::lock::JobLock;
use super::manifest::DatasetType;
use super::models::{Archive, DecodeStats};
use super::preflight;
use super::progress::ProgressTracker;
use super::status::{FailedArchive, JobMetadata, JobStatus, ProgressUpdate, StatusStore};
use super::{IngestError, Result};

/// Parameters of one run, resolved from a start request
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub job_id: String,
    pub period: Option<String>,
    /// Selected datasets in dependency order
    pub datasets: Vec<DatasetType>,
    pub force: bool,
    pub skip_download: bool,
    pub truncate: bool,
    pub resume: bool,
}

/// Rows and decoder counters for one archive
#[derive(Debug, Clone, Copy, Default)]
struct ArchiveLoad {
    rows: u64,
    stats: DecodeStats,
}

pub struct EtlWorker {
    pool: PgPool,
    config: EtlConfig,
    spec: JobSpec,
    status: StatusStore,
    ledger: ArchiveLedger,
}

impl EtlWorker {
    pub fn new(pool: PgPool, config: EtlConfig, spec: JobSpec) -> Self {
        Self {
            status: StatusStore::new(pool.clone()),
            ledger: ArchiveLedger::new(pool.clone()),
            pool,
            config,
            spec,
        }
    }

    pub fn job_id(&self) -> &str {
        &self.spec.job_id
    }

    /// Run the job to a terminal state and release the lock
    pub async fn run(self) -> JobStatus {
        let started = Instant::now();
        let job_id = self.spec.job_id.clone();
        info!(job_id = %job_id, datasets = ?self.spec.datasets, "ETL job started");

        let heartbeat = self.spawn_heartbeat();
        let result = self.execute(started).await;
        heartbeat.abort();

        let outcome = match result {
            Ok(()) => {
                info!(
                    job_id = %job_id,
                    elapsed_secs = started.elapsed().as_secs(),
                    "ETL job completed"
                );
                JobStatus::Completed
            },
            Err(e) => {
                error!(job_id = %job_id, error = %e, "ETL job failed");
                let elapsed = to_i64(started.elapsed().as_secs());
                if let Err(db_err) = self.status.fail(&job_id, &e.to_string(), Some(elapsed)).await {
                    error!(job_id = %job_id, error = %db_err, "Failed to record job failure");
                }
                JobStatus::Error
            },
        };

        match JobLock::release(&self.pool, &job_id).await {
            Ok(true) => debug!(job_id = %job_id, "ETL lock released"),
            Ok(false) => warn!(job_id = %job_id, "ETL lock was no longer held by this job"),
            Err(e) => error!(job_id = %job_id, error = %e, "Failed to release ETL lock"),
        }

        outcome
    }

    fn spawn_heartbeat(&self) -> JoinHandle<()> {
        let pool = self.pool.clone();
        let status = self.status.clone();
        let job_id = self.spec.job_id.clone();
        let every = self.config.heartbeat_interval();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match JobLock::heartbeat(&pool, &job_id).await {
                    Ok(true) => {},
                    Ok(false) => warn!(job_id = %job_id, "Heartbeat found the lock held by another job"),
                    Err(e) => warn!(job_id = %job_id, error = %e, "Lock heartbeat failed"),
                }
                if let Err(e) = status.touch(&job_id).await {
                    warn!(job_id = %job_id, error = %e, "Status heartbeat failed");
                }
            }
        })
    }

    async fn execute(&self, started: Instant) -> Result<()> {
        let job_id = self.spec.job_id.as_str();

        if !self.status.mark_running(job_id).await? {
            return Err(IngestError::Lock(format!("job {} is no longer active", job_id)));
        }

        // 1. Pre-flight
        let report = preflight::validate(&self.pool, &self.config).await;
        if !report.can_proceed {
            if !self.spec.force {
                return Err(IngestError::Validation(report.errors.join("; ")));
            }
            warn!(job_id, errors = ?report.errors, "Validation failed, continuing because force is set");
            let forced: Vec<String> =
                report.errors.iter().map(|e| format!("Forced past validation error: {}", e)).collect();
            self.status.add_warnings(job_id, &forced).await?;
        }
        self.status.add_warnings(job_id, &report.warnings).await?;

        // 2. Period, plan and archives
        let catalog = ArchiveCatalog::new(&self.config)?;
        let period = match &self.spec.period {
            Some(period) => period.clone(),
            None => catalog.latest_period().await,
        };
        self.status.set_period(job_id, &period).await?;
        info!(job_id, period = %period, "Period resolved");

        let mut metadata = JobMetadata::default();
        let archives = self.collect_archives(&period, &mut metadata).await?;
        let mut grouped = group_by_dataset(archives, &self.spec.datasets);

        if grouped.values().all(Vec::is_empty) {
            return Err(IngestError::Catalog(format!(
                "No archives found for period {} and the selected tables",
                period
            )));
        }

        if self.spec.resume {
            let loaded = self.ledger.loaded(&period).await?;
            let skipped = exclude_loaded(&mut grouped, &loaded);
            if skipped > 0 {
                info!(job_id, skipped, "Resuming: skipping archives already loaded");
            }
        }

        let files_total: usize = grouped.values().map(Vec::len).sum();
        let mut tracker = ProgressTracker::starting_at(started, u32::try_from(files_total).unwrap_or(u32::MAX));

        // 3. Load
        let mut loader = BulkLoader::connect(&self.pool).await?;
        let strategy = strategy_for(&self.config)?;
        let decoder = RecordDecoder::new(self.config.batch_size);
        metadata.load_mode = Some(strategy.name().to_string());

        if self.spec.truncate {
            self.status.set_step(job_id, "truncating", None, None).await?;
            for dataset in self.spec.datasets.iter().rev() {
                loader.truncate_table(*dataset).await?;
            }
            self.ledger.clear(&period).await?;
        }

        self.refresh_progress(&tracker, &metadata).await?;

        for dataset in &self.spec.datasets {
            let Some(archives) = grouped.get_mut(dataset) else {
                continue;
            };
            for archive in archives.iter_mut() {
                self.status
                    .set_step(job_id, "loading", Some(&archive.file_name), Some(dataset.table()))
                    .await?;

                let committed_before = loader.total_loaded();
                match self
                    .load_archive(&mut loader, strategy.as_ref(), &decoder, archive)
                    .await
                {
                    Ok(load) => {
                        self.ledger
                            .record(&period, &archive.file_name, *dataset, load.rows, job_id)
                            .await?;
                        if let Err(e) = archive.consume() {
                            warn!(archive = %archive.file_name, error = %e, "Failed to delete loaded archive");
                        }
                        metadata.processed_files.push(archive.file_name.clone());
                        *metadata.rows_per_table.entry(dataset.table().to_string()).or_default() +=
                            load.rows;
                        metadata.decode_errors += load.stats.errors;
                        tracker.archive_done(load.rows);
                        info!(
                            job_id,
                            archive = %archive.file_name,
                            rows = load.rows,
                            decode_errors = load.stats.errors,
                            "Archive loaded"
                        );
                    },
                    Err(e) => {
                        let rows_committed = loader.total_loaded().saturating_sub(committed_before);
                        error!(
                            job_id,
                            archive = %archive.file_name,
                            rows_committed,
                            error = %e,
                            "Archive failed"
                        );
                        let warning = failure_warning(&archive.file_name, &e, rows_committed);
                        metadata.failed_files.push(FailedArchive {
                            archive: archive.file_name.clone(),
                            error: e.to_string(),
                            rows_committed,
                        });
                        self.status.add_warning(job_id, &warning).await?;
                        tracker.archive_failed();
                    },
                }

                self.refresh_progress(&tracker, &metadata).await?;
            }
        }

        // 4. Post-processing
        self.status.set_step(job_id, "post_processing", None, None).await?;
        let mut warnings = Vec::new();

        if self.spec.datasets.contains(&DatasetType::Estabelecimento) {
            let missing = loader.count_missing_composite().await?;
            if missing > 0 {
                warn!(job_id, missing, "Establishments without a full CNPJ");
                warnings.push(format!("{} establishments have no cnpj_completo", missing));
            }
        }

        warnings.extend(loader.create_indexes().await);
        warnings.extend(loader.update_statistics(&self.spec.datasets).await);
        if let Err(e) = loader.vacuum_analyze().await {
            warn!(job_id, error = %e, "VACUUM ANALYZE failed");
            warnings.push(format!("VACUUM ANALYZE failed: {}", e));
        }
        self.status.add_warnings(job_id, &warnings).await?;

        // 5. Done
        let update = self.progress_update(&tracker, &metadata);
        self.status.complete(job_id, &update).await?;
        Ok(())
    }

    /// Archives for this run: downloaded now, or already in the period directory
    async fn collect_archives(&self, period: &str, metadata: &mut JobMetadata) -> Result<Vec<Archive>> {
        let job_id = self.spec.job_id.as_str();

        if self.spec.skip_download {
            let dir = self.config.period_dir(period);
            info!(job_id, dir = %dir.display(), "Using archives already on disk");
            return local_archives(&dir);
        }

        self.status.set_step(job_id, "downloading", None, None).await?;
        let fetcher = Fetcher::new(&self.config)?;
        let prefixes: Vec<String> =
            self.spec.datasets.iter().map(|d| d.archive_prefix().to_string()).collect();
        let report = fetcher.download_all(period, &prefixes).await;

        if !report.failed.is_empty() {
            let warnings: Vec<String> = report
                .failed
                .iter()
                .map(|(url, e)| format!("Download failed for {}: {}", url, e))
                .collect();
            self.status.add_warnings(job_id, &warnings).await?;
            metadata.failed_files.extend(report.failed.iter().map(|(url, e)| FailedArchive {
                archive: url.clone(),
                error: e.clone(),
                rows_committed: 0,
            }));
        }

        Ok(report.downloaded)
    }

    async fn load_archive(
        &self,
        loader: &mut BulkLoader,
        strategy: &dyn LoadStrategy,
        decoder: &RecordDecoder,
        archive: &Archive,
    ) -> Result<ArchiveLoad> {
        let zip_path = archive.local_path.clone();
        let scratch = self.config.scratch_dir.clone();
        let mut extraction =
            tokio::task::spawn_blocking(move || ArchiveExtraction::open(&zip_path, &scratch))
                .await
                .map_err(|e| IngestError::Io(std::io::Error::other(e)))??;

        let files = extraction.dataset_files();
        let mut load = ArchiveLoad::default();
        load.stats.skipped_files = (extraction.files().len() - files.len()) as u64;

        for (path, dataset) in files {
            if Some(dataset) != archive.dataset {
                debug!(
                    archive = %archive.file_name,
                    file = %path.display(),
                    dataset = %dataset,
                    "Inner file belongs to another dataset"
                );
            }
            let file_load = strategy.load_file(loader, decoder, &path, dataset).await?;
            load.rows += file_load.rows;
            load.stats.merge(&file_load.stats);
        }

        if let Err(e) = extraction.cleanup() {
            warn!(dir = %extraction.dir().display(), error = %e, "Failed to remove scratch directory");
        }
        Ok(load)
    }

    fn progress_update(&self, tracker: &ProgressTracker, metadata: &JobMetadata) -> ProgressUpdate {
        let disk = preflight::disk_usage(&self.config.data_dir).ok();
        ProgressUpdate {
            progress_percent: tracker.percent(),
            files_processed: i32::try_from(tracker.files_processed()).unwrap_or(i32::MAX),
            files_total: i32::try_from(tracker.files_total()).unwrap_or(i32::MAX),
            records_imported: to_i64(tracker.records_imported()),
            disk_free_gb: disk.map(|d| d.free_gb),
            disk_used_gb: disk.map(|d| d.used_gb),
            elapsed_seconds: to_i64(tracker.elapsed().as_secs()),
            estimated_remaining_seconds: tracker.eta().map(|d| to_i64(d.as_secs())),
            metadata: metadata.clone(),
        }
    }

    /// Persist counters and refresh both heartbeats
    async fn refresh_progress(&self, tracker: &ProgressTracker, metadata: &JobMetadata) -> Result<()> {
        let job_id = self.spec.job_id.as_str();
        let update = self.progress_update(tracker, metadata);
        self.status.update_progress(job_id, &update).await?;

        if !JobLock::heartbeat(&self.pool, job_id).await? {
            return Err(IngestError::Lock(format!(
                "job {} lost the ETL lock to another run",
                job_id
            )));
        }
        Ok(())
    }
}

/// Warning for an archive that failed mid-load. Batches committed before the
/// failure stay in the table without a ledger entry, so they are called out.
pub fn failure_warning(archive: &str, error: &dyn std::fmt::Display, rows_committed: u64) -> String {
    match rows_committed {
        0 => format!("Failed to process {}: {}", archive, error),
        n => format!(
            "Failed to process {}: {} ({} rows already committed; a resumed run loads them again)",
            archive, error, n
        ),
    }
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// `*.zip` files in `dir`, sorted by name
pub fn local_archives(dir: &Path) -> Result<Vec<Archive>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut paths: Vec<PathBuf> = Vec::new();
    for entry in entries {
        let path = entry?.path();
        let is_zip = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("zip"));
        if is_zip && path.is_file() {
            paths.push(path);
        }
    }
    paths.sort();

    paths
        .iter()
        .map(|p| Archive::from_local(p).map_err(IngestError::from))
        .collect()
}

/// Selected datasets mapped to their archives, each list sorted by file name
pub fn group_by_dataset(
    archives: Vec<Archive>,
    datasets: &[DatasetType],
) -> BTreeMap<DatasetType, Vec<Archive>> {
    let mut grouped: BTreeMap<DatasetType, Vec<Archive>> =
        datasets.iter().map(|d| (*d, Vec::new())).collect();

    for archive in archives {
        match archive.dataset.and_then(|d| grouped.get_mut(&d)) {
            Some(list) => list.push(archive),
            None => debug!(archive = %archive.file_name, "Archive not selected for this run"),
        }
    }

    for list in grouped.values_mut() {
        list.sort_by(|a, b| a.file_name.cmp(&b.file_name));
    }
    grouped
}

/// Drop archives named in `loaded`; returns how many were removed
pub fn exclude_loaded(
    grouped: &mut BTreeMap<DatasetType, Vec<Archive>>,
    loaded: &std::collections::HashSet<String>,
) -> usize {
    let mut skipped = 0;
    for list in grouped.values_mut() {
        let before = list.len();
        list.retain(|a| !loaded.contains(&a.file_name));
        skipped += before - list.len();
    }
    skipped
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn touch(dir: &Path, name: &str) {
        std::fs::write(dir.join(name), b"PK").unwrap();
    }

    #[test]
    fn test_local_archives_lists_zips_sorted() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "Socios0.zip");
        touch(dir.path(), "Cnaes.ZIP");
        touch(dir.path(), "notes.txt");

        let archives = local_archives(dir.path()).unwrap();
        let names: Vec<_> = archives.iter().map(|a| a.file_name.as_str()).collect();
        assert_eq!(names, vec!["Cnaes.ZIP", "Socios0.zip"]);
    }

    #[test]
    fn test_failure_warning_names_committed_rows() {
        let err = IngestError::Catalog("boom".to_string());
        assert_eq!(
            failure_warning("Socios0.zip", &err, 0),
            format!("Failed to process Socios0.zip: {}", err)
        );

        let warning = failure_warning("Socios0.zip", &err, 2_000);
        assert!(warning.starts_with("Failed to process Socios0.zip: "));
        assert!(warning.contains("2000 rows already committed"));
    }

    #[test]
    fn test_local_archives_missing_dir() {
        let dir = tempfile::tempdir().unwrap();
        assert!(local_archives(&dir.path().join("absent")).unwrap().is_empty());
    }

    #[test]
    fn test_group_by_dataset_filters_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["Empresas1.zip", "Empresas0.zip", "Socios0.zip", "Cnaes.zip"] {
            touch(dir.path(), name);
        }
        let archives = local_archives(dir.path()).unwrap();

        let grouped = group_by_dataset(archives, &[DatasetType::Cnae, DatasetType::Empresa]);
        assert_eq!(grouped.len(), 2);
        let empresas: Vec<_> =
            grouped[&DatasetType::Empresa].iter().map(|a| a.file_name.as_str()).collect();
        assert_eq!(empresas, vec!["Empresas0.zip", "Empresas1.zip"]);
        assert_eq!(grouped[&DatasetType::Cnae].len(), 1);
    }

    #[test]
    fn test_exclude_loaded() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["Empresas0.zip", "Empresas1.zip"] {
            touch(dir.path(), name);
        }
        let mut grouped =
            group_by_dataset(local_archives(dir.path()).unwrap(), &[DatasetType::Empresa]);
        let loaded: HashSet<String> = ["Empresas0.zip".to_string()].into_iter().collect();

        assert_eq!(exclude_loaded(&mut grouped, &loaded), 1);
        assert_eq!(grouped[&DatasetType::Empresa][0].file_name, "Empresas1.zip");
    }
}
