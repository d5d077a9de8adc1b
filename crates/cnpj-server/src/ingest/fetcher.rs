//! Archive downloads
//!
//! Downloads are idempotent per destination path: a file already present is
//! never fetched again. Bytes stream into `<name>.part` and are renamed into
//! place only once complete, so an interrupted transfer never looks present.

use futures::StreamExt;
use reqwest::Client;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info, warn};

use super::catalog::ArchiveCatalog;
use super::config::EtlConfig;
use super::models::Archive;
use super::{IngestError, Result};

/// Progress callback: `(bytes_so_far, total_bytes)`
pub type ProgressFn = dyn Fn(u64, u64) + Send + Sync;

/// Outcome of a period download
#[derive(Debug, Default)]
pub struct DownloadReport {
    pub downloaded: Vec<Archive>,
    /// `(url, error message)`
    pub failed: Vec<(String, String)>,
}

impl DownloadReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

pub struct Fetcher {
    client: Client,
    catalog: ArchiveCatalog,
    data_dir: PathBuf,
}

impl Fetcher {
    pub fn new(config: &EtlConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.download_timeout())
            .connect_timeout(config.connect_timeout())
            .user_agent("cnpj-etl/0.1")
            .build()?;

        Ok(Self {
            client,
            catalog: ArchiveCatalog::new(config)?,
            data_dir: config.data_dir.clone(),
        })
    }

    pub fn catalog(&self) -> &ArchiveCatalog {
        &self.catalog
    }

    /// Local path an archive URL downloads to by default
    pub fn default_destination(&self, url: &str) -> PathBuf {
        self.data_dir.join(file_name_from_url(url))
    }

    /// Where a period's archive is kept: `{data_dir}/{period}/{name}`.
    /// Periods never share files, so a leftover from one month cannot stand
    /// in for another.
    pub fn period_destination(&self, period: &str, url: &str) -> PathBuf {
        self.data_dir.join(period).join(file_name_from_url(url))
    }

    /// Download `url` to `dest` (or the data directory) unless already present
    pub async fn download(
        &self,
        url: &str,
        dest: Option<&Path>,
        progress: Option<&ProgressFn>,
    ) -> Result<PathBuf> {
        let dest = dest
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.default_destination(url));

        if tokio::fs::try_exists(&dest).await? {
            info!(file = %dest.display(), "Archive already present, skipping download");
            return Ok(dest);
        }

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        info!(url, "Downloading archive");
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(IngestError::HttpStatus {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let total = response.content_length();
        let partial = partial_path(&dest);
        let mut file = tokio::fs::File::create(&partial).await?;
        let mut received: u64 = 0;
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    drop(file);
                    discard_partial(&partial).await;
                    return Err(e.into());
                },
            };
            if let Err(e) = file.write_all(&chunk).await {
                drop(file);
                discard_partial(&partial).await;
                return Err(e.into());
            }
            received += chunk.len() as u64;
            if let (Some(report), Some(total)) = (progress, total) {
                report(received, total);
            }
        }

        file.flush().await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&partial, &dest).await?;

        info!(
            url,
            file = %dest.display(),
            bytes = received,
            "Download complete"
        );
        Ok(dest)
    }

    /// Download every archive of `period` whose file name contains one of
    /// `filters` (all archives when `filters` is empty).
    ///
    /// Failures are recorded per archive; the remaining archives still download.
    pub async fn download_all(&self, period: &str, filters: &[String]) -> DownloadReport {
        let urls = self.catalog.list_archives(period).await;
        let selected: Vec<String> = urls
            .into_iter()
            .filter(|url| matches_filters(&file_name_from_url(url), filters))
            .collect();

        info!(period, count = selected.len(), "Downloading period archives");

        let mut report = DownloadReport::default();
        for url in selected {
            let dest = self.period_destination(period, &url);
            let result = match self.download(&url, Some(&dest), None).await {
                Ok(path) => Archive::from_download(&url, &path).map_err(IngestError::from),
                Err(e) => Err(e),
            };
            match result {
                Ok(archive) => report.downloaded.push(archive),
                Err(e) => {
                    error!(url = %url, error = %e, "Archive download failed");
                    report.failed.push((url, e.to_string()));
                },
            }
        }

        if !report.is_complete() {
            warn!(
                period,
                downloaded = report.downloaded.len(),
                failed = report.failed.len(),
                "Period download finished with failures"
            );
        }
        report
    }
}

/// Last path segment of a URL, ignoring query strings
pub fn file_name_from_url(url: &str) -> String {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    path.trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(path)
        .to_string()
}

pub fn matches_filters(file_name: &str, filters: &[String]) -> bool {
    filters.is_empty() || filters.iter().any(|f| file_name.contains(f.as_str()))
}

fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().unwrap_or_default().to_os_string();
    name.push(".part");
    dest.with_file_name(name)
}

async fn discard_partial(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        debug!(file = %path.display(), error = %e, "Could not remove partial download");
    }
}
