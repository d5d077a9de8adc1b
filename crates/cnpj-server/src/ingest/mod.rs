//! CNPJ ingestion pipeline
//!
//! Data flows one way through the submodules:
//!
//! - **catalog**: lists the monthly archive URLs from the Receita directory listing
//! - **fetcher**: downloads archives idempotently into the data directory
//! - **decoder**: extracts one ZIP into scratch space and decodes its Latin-1 rows into batches
//! - **loader**: bulk-copies batches into PostgreSQL and runs post-load maintenance
//! - **worker**: runs one job end to end in dependency order
//! - **service**: the control surface (validate, start, status, logs)
//!
//! Durable state lives in three tables: `etl_status` (status), `etl_lock`
//! (lock) and `etl_loaded_archives` (ledger).

pub mod catalog;
pub mod config;
pub mod decoder;
pub mod fetcher;
pub mod ledger;
pub mod loader;
pub mod lock;
pub mod logs;
pub mod manifest;
pub mod models;
pub mod preflight;
pub mod progress;
pub mod service;
pub mod status;
pub mod worker;

pub use catalog::ArchiveCatalog;
pub use config::{EtlConfig, LoadMode};
pub use decoder::{ArchiveExtraction, RecordDecoder};
pub use fetcher::{DownloadReport, Fetcher};
pub use loader::BulkLoader;
pub use manifest::{DatasetType, LoadGroup, MANIFEST_VERSION};
pub use models::{Archive, ArchiveState, Batch, DecodeStats, Record};
pub use service::{EtlService, StartRequest};
pub use status::{JobStatus, StatusRecord, StatusStore};
pub use worker::EtlWorker;

/// Result type for pipeline operations
pub type Result<T> = std::result::Result<T, IngestError>;

/// Error types for the ingestion pipeline
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("Download error: {0}")]
    Download(#[from] reqwest::Error),

    #[error("HTTP {status} for {url}")]
    HttpStatus { url: String, status: u16 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Invalid archive entry name: {0}")]
    UnsafeEntry(String),

    #[error("Catalog error: {0}")]
    Catalog(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Lock error: {0}")]
    Lock(String),

    #[error(transparent)]
    Etl(#[from] cnpj_common::EtlError),
}

impl From<regex::Error> for IngestError {
    fn from(err: regex::Error) -> Self {
        IngestError::Catalog(err.to_string())
    }
}
