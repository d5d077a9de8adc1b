//! Pipeline data types: archives, decoded records and batches

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::manifest::{DatasetType, COMPOSITE_COLUMN};

/// Lifecycle of one archive on local disk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveState {
    Absent,
    Downloading,
    Present,
    /// Loaded and deleted from disk
    Consumed,
}

/// One remote ZIP and its local copy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Archive {
    pub url: Option<String>,
    pub file_name: String,
    pub local_path: PathBuf,
    pub dataset: Option<DatasetType>,
    pub size_bytes: u64,
    pub state: ArchiveState,
}

impl Archive {
    /// Archive already on disk (downloaded earlier or placed by an operator)
    pub fn from_local(path: &Path) -> std::io::Result<Self> {
        let metadata = std::fs::metadata(path)?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        Ok(Self {
            url: None,
            dataset: DatasetType::classify(&file_name),
            file_name,
            local_path: path.to_path_buf(),
            size_bytes: metadata.len(),
            state: ArchiveState::Present,
        })
    }

    pub fn from_download(url: &str, path: &Path) -> std::io::Result<Self> {
        let mut archive = Self::from_local(path)?;
        archive.url = Some(url.to_string());
        Ok(archive)
    }

    /// Delete the local file once its rows are committed
    pub fn consume(&mut self) -> std::io::Result<()> {
        match std::fs::remove_file(&self.local_path) {
            Ok(()) => {},
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
            Err(e) => return Err(e),
        }
        self.state = ArchiveState::Consumed;
        Ok(())
    }
}

/// One decoded row, positionally aligned with `dataset.columns()`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub dataset: DatasetType,
    pub values: Vec<Option<String>>,
    /// Full CNPJ for establishments, set only when all three parts are present
    pub composite_id: Option<String>,
}

impl Record {
    pub fn get(&self, column: &str) -> Option<&str> {
        if column == COMPOSITE_COLUMN && self.dataset.has_derived_field() {
            return self.composite_id.as_deref();
        }
        self.dataset
            .column_index(column)
            .and_then(|i| self.values.get(i))
            .and_then(|v| v.as_deref())
    }

    /// Values in `dataset.load_columns()` order
    pub fn load_values(&self) -> impl Iterator<Item = Option<&str>> + '_ {
        let derived = self
            .dataset
            .has_derived_field()
            .then_some(self.composite_id.as_deref());
        self.values.iter().map(|v| v.as_deref()).chain(derived)
    }
}

/// Bounded run of records of one dataset type
#[derive(Debug, Clone)]
pub struct Batch {
    pub dataset: DatasetType,
    pub records: Vec<Record>,
}

impl Batch {
    pub fn with_capacity(dataset: DatasetType, capacity: usize) -> Self {
        Self {
            dataset,
            records: Vec::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Decoder counters, aggregated per archive and per job
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecodeStats {
    pub rows: u64,
    pub errors: u64,
    pub skipped_files: u64,
}

impl DecodeStats {
    pub fn merge(&mut self, other: &DecodeStats) {
        self.rows += other.rows;
        self.errors += other.errors;
        self.skipped_files += other.skipped_files;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn establishment(values: &[Option<&str>], composite: Option<&str>) -> Record {
        let mut padded: Vec<Option<String>> =
            values.iter().map(|v| v.map(str::to_string)).collect();
        padded.resize(DatasetType::Estabelecimento.columns().len(), None);
        Record {
            dataset: DatasetType::Estabelecimento,
            values: padded,
            composite_id: composite.map(str::to_string),
        }
    }

    #[test]
    fn test_record_get_by_column() {
        let record = establishment(
            &[Some("12345678"), Some("0001"), Some("90")],
            Some("12345678000190"),
        );
        assert_eq!(record.get("cnpj_ordem"), Some("0001"));
        assert_eq!(record.get("cnpj_completo"), Some("12345678000190"));
        assert_eq!(record.get("email"), None);
        assert_eq!(record.get("not_a_column"), None);
    }

    #[test]
    fn test_load_values_append_composite() {
        let record = establishment(&[Some("12345678")], None);
        let values: Vec<_> = record.load_values().collect();
        assert_eq!(values.len(), DatasetType::Estabelecimento.load_columns().len());
        assert_eq!(values[0], Some("12345678"));
        assert_eq!(values.last(), Some(&None));
    }

    #[test]
    fn test_load_values_lookup_has_no_derived_column() {
        let record = Record {
            dataset: DatasetType::Cnae,
            values: vec![Some("0111301".into()), Some("Cultivo de arroz".into())],
            composite_id: None,
        };
        assert_eq!(record.load_values().count(), 2);
    }

    #[test]
    fn test_archive_consume_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Cnaes.zip");
        std::fs::write(&path, b"zip").unwrap();

        let mut archive = Archive::from_local(&path).unwrap();
        assert_eq!(archive.dataset, Some(DatasetType::Cnae));
        assert_eq!(archive.size_bytes, 3);
        assert_eq!(archive.state, ArchiveState::Present);

        archive.consume().unwrap();
        assert!(!path.exists());
        assert_eq!(archive.state, ArchiveState::Consumed);
        // second consume is a no-op
        archive.consume().unwrap();
    }

    #[test]
    fn test_decode_stats_merge() {
        let mut total = DecodeStats::default();
        total.merge(&DecodeStats { rows: 10, errors: 1, skipped_files: 0 });
        total.merge(&DecodeStats { rows: 5, errors: 0, skipped_files: 2 });
        assert_eq!(total, DecodeStats { rows: 15, errors: 1, skipped_files: 2 });
    }
}
