//! Archive extraction and record decoding
//!
//! Receita publishes each dataset as ZIPs of header-less, `;`-separated,
//! `"`-quoted ISO-8859-1 text. [`ArchiveExtraction`] unpacks one ZIP into a
//! scratch directory that is removed when the extraction is dropped;
//! [`RecordDecoder`] turns one extracted file into a lazy sequence of
//! [`Batch`]es.
//!
//! Decoding rules:
//! - each byte is one Latin-1 code point; NUL bytes are dropped
//! - fields are trimmed and an empty result becomes `None`
//! - columns are strictly positional (missing trailing fields are `None`,
//!   extra fields are ignored)
//! - rows without the key column, and rows the CSV reader rejects, are
//!   counted in [`DecodeStats::errors`] and skipped
//! - establishments get `cnpj_completo = basico + ordem + dv` only when all
//!   three parts are present

use csv::{ByteRecord, ReaderBuilder};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::manifest::DatasetType;
use super::models::{Batch, DecodeStats, Record};
use super::{IngestError, Result};

/// Upper bound for the initial batch allocation
const INITIAL_BATCH_CAPACITY: usize = 8192;

/// One ZIP unpacked under `scratch_root/<zip stem>/`
///
/// The directory is deleted on drop, whether the archive was consumed
/// completely or processing bailed out early.
#[derive(Debug)]
pub struct ArchiveExtraction {
    dir: PathBuf,
    files: Vec<PathBuf>,
    cleaned: bool,
}

impl ArchiveExtraction {
    pub fn open(zip_path: &Path, scratch_root: &Path) -> Result<Self> {
        let stem = zip_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .ok_or_else(|| IngestError::UnsafeEntry(zip_path.display().to_string()))?;
        let dir = scratch_root.join(stem);

        // Leftovers from an interrupted run
        if dir.exists() {
            std::fs::remove_dir_all(&dir)?;
        }
        std::fs::create_dir_all(&dir)?;

        let mut extraction = Self {
            dir,
            files: Vec::new(),
            cleaned: false,
        };
        extraction.extract_all(zip_path)?;

        info!(
            archive = %zip_path.display(),
            files = extraction.files.len(),
            dir = %extraction.dir.display(),
            "Extracted archive"
        );

        Ok(extraction)
    }

    fn extract_all(&mut self, zip_path: &Path) -> Result<()> {
        let file = File::open(zip_path)?;
        let mut archive = zip::ZipArchive::new(BufReader::new(file))?;

        for i in 0..archive.len() {
            let mut entry = archive.by_index(i)?;
            if entry.is_dir() {
                continue;
            }

            let relative = entry
                .enclosed_name()
                .ok_or_else(|| IngestError::UnsafeEntry(entry.name().to_string()))?;
            let out_path = self.dir.join(relative);

            if let Some(parent) = out_path.parent() {
                std::fs::create_dir_all(parent)?;
            }

            let mut out = File::create(&out_path)?;
            let bytes = std::io::copy(&mut entry, &mut out)?;
            debug!(entry = %out_path.display(), bytes, "Extracted entry");

            self.files.push(out_path);
        }

        Ok(())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    /// Extracted files with a known dataset type; unknown files are skipped.
    pub fn dataset_files(&self) -> Vec<(PathBuf, DatasetType)> {
        self.files
            .iter()
            .filter_map(|path| {
                let name = path.file_name()?.to_string_lossy();
                match DatasetType::classify(&name) {
                    Some(dataset) => Some((path.clone(), dataset)),
                    None => {
                        debug!(file = %name, "Skipping file outside the manifest");
                        None
                    },
                }
            })
            .collect()
    }

    /// Remove the extraction directory now instead of on drop
    pub fn cleanup(&mut self) -> std::io::Result<()> {
        if self.cleaned {
            return Ok(());
        }
        self.cleaned = true;
        match std::fs::remove_dir_all(&self.dir) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

impl Drop for ArchiveExtraction {
    fn drop(&mut self) {
        if let Err(e) = self.cleanup() {
            warn!(dir = %self.dir.display(), error = %e, "Failed to remove extraction directory");
        }
    }
}

/// Decodes extracted files into batches of [`Record`]s
#[derive(Debug, Clone, Copy)]
pub struct RecordDecoder {
    batch_size: usize,
}

impl RecordDecoder {
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
        }
    }

    pub fn decode_file(&self, path: &Path, dataset: DatasetType) -> Result<FileBatches<File>> {
        let file = File::open(path)?;
        debug!(file = %path.display(), dataset = %dataset, "Decoding file");
        Ok(self.decode_reader(file, dataset))
    }

    pub fn decode_reader<R: Read>(&self, reader: R, dataset: DatasetType) -> FileBatches<R> {
        let reader = ReaderBuilder::new()
            .delimiter(b';')
            .quote(b'"')
            .has_headers(false)
            .flexible(true)
            .from_reader(reader);

        FileBatches {
            reader,
            dataset,
            batch_size: self.batch_size,
            row: ByteRecord::new(),
            stats: DecodeStats::default(),
            finished: false,
        }
    }
}

/// Lazy batch sequence over one file
///
/// Yields a batch as soon as it fills and a trailing partial batch at end of
/// file. An I/O failure ends the sequence with an error.
pub struct FileBatches<R> {
    reader: csv::Reader<R>,
    dataset: DatasetType,
    batch_size: usize,
    row: ByteRecord,
    stats: DecodeStats,
    finished: bool,
}

impl<R> FileBatches<R> {
    pub fn stats(&self) -> DecodeStats {
        self.stats
    }
}

impl<R: Read> Iterator for FileBatches<R> {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        let mut batch =
            Batch::with_capacity(self.dataset, self.batch_size.min(INITIAL_BATCH_CAPACITY));

        loop {
            match self.reader.read_byte_record(&mut self.row) {
                Ok(true) => match decode_record(self.dataset, &self.row) {
                    Some(record) => {
                        self.stats.rows += 1;
                        batch.records.push(record);
                        if batch.len() >= self.batch_size {
                            return Some(Ok(batch));
                        }
                    },
                    None => {
                        self.stats.errors += 1;
                        debug!(
                            dataset = %self.dataset,
                            line = self.row.position().map(|p| p.line()),
                            "Skipping row without key column"
                        );
                    },
                },
                Ok(false) => {
                    self.finished = true;
                    return (!batch.is_empty()).then_some(Ok(batch));
                },
                Err(e) if matches!(e.kind(), csv::ErrorKind::Io(_)) => {
                    self.finished = true;
                    return Some(Err(e.into()));
                },
                Err(e) => {
                    self.stats.errors += 1;
                    warn!(dataset = %self.dataset, error = %e, "Skipping malformed row");
                },
            }
        }
    }
}

/// Decode one raw row; `None` when the key column is empty.
pub fn decode_record(dataset: DatasetType, row: &ByteRecord) -> Option<Record> {
    let values: Vec<Option<String>> = (0..dataset.columns().len())
        .map(|i| row.get(i).and_then(decode_field))
        .collect();

    if values.first().map_or(true, Option::is_none) {
        return None;
    }

    let composite_id = if dataset.has_derived_field() {
        composite_cnpj(&values)
    } else {
        None
    };

    Some(Record {
        dataset,
        values,
        composite_id,
    })
}

/// Latin-1 decode, drop NULs (PostgreSQL text cannot hold them), trim.
pub fn decode_field(raw: &[u8]) -> Option<String> {
    let text: String = raw.iter().filter(|b| **b != 0).map(|b| char::from(*b)).collect();
    let trimmed = text.trim();
    if trimmed.is_empty() {
        None
    } else if trimmed.len() == text.len() {
        Some(text)
    } else {
        Some(trimmed.to_string())
    }
}

fn composite_cnpj(values: &[Option<String>]) -> Option<String> {
    let basico = values.first()?.as_deref()?;
    let ordem = values.get(1)?.as_deref()?;
    let dv = values.get(2)?.as_deref()?;
    Some(format!("{}{}{}", basico, ordem, dv))
}
