//! Pre-flight checks run before a job starts and reported by `/validate`

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use super::config::EtlConfig;
use super::manifest::DatasetType;

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub can_proceed: bool,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
    pub disk_free_gb: Option<f64>,
    pub disk_used_gb: Option<f64>,
    pub database_reachable: bool,
    pub tables_exist: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub missing_tables: Vec<String>,
}

/// Disk usage of the filesystem holding a path, in GB
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DiskUsage {
    pub free_gb: f64,
    pub used_gb: f64,
}

pub fn bytes_to_gb(bytes: u64) -> f64 {
    bytes as f64 / BYTES_PER_GB
}

/// Disk usage for `path`, measured at its nearest existing ancestor
pub fn disk_usage(path: &Path) -> std::io::Result<DiskUsage> {
    let existing = nearest_existing(path);
    let available = fs2::available_space(&existing)?;
    let total = fs2::total_space(&existing)?;
    Ok(DiskUsage {
        free_gb: bytes_to_gb(available),
        used_gb: bytes_to_gb(total.saturating_sub(available)),
    })
}

fn nearest_existing(path: &Path) -> PathBuf {
    let mut current = path;
    loop {
        if current.exists() {
            return current.to_path_buf();
        }
        match current.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => current = parent,
            _ => return PathBuf::from("."),
        }
    }
}

/// Classify free space against the configured thresholds.
///
/// Returns `(errors, warnings)`.
pub fn assess_disk(free_gb: f64, config: &EtlConfig) -> (Vec<String>, Vec<String>) {
    if free_gb < config.min_free_gb {
        (
            vec![format!(
                "Insufficient disk space: {:.2} GB free, at least {:.2} GB required",
                free_gb, config.min_free_gb
            )],
            Vec::new(),
        )
    } else if free_gb < config.recommended_free_gb {
        (
            Vec::new(),
            vec![format!(
                "Low disk space: {:.2} GB free, {:.2} GB recommended",
                free_gb, config.recommended_free_gb
            )],
        )
    } else {
        (Vec::new(), Vec::new())
    }
}

/// Disk, connectivity and schema checks
pub async fn validate(pool: &PgPool, config: &EtlConfig) -> ValidationReport {
    let mut report = ValidationReport::default();

    match disk_usage(&config.data_dir) {
        Ok(usage) => {
            report.disk_free_gb = Some(usage.free_gb);
            report.disk_used_gb = Some(usage.used_gb);
            let (errors, warnings) = assess_disk(usage.free_gb, config);
            report.errors.extend(errors);
            report.warnings.extend(warnings);
        },
        Err(e) => {
            warn!(dir = %config.data_dir.display(), error = %e, "Disk check failed");
            report.warnings.push(format!("Could not determine free disk space: {}", e));
        },
    }

    let ping = tokio::time::timeout(
        std::time::Duration::from_secs(config.db_check_timeout_secs),
        sqlx::query_scalar::<_, i32>("SELECT 1").fetch_one(pool),
    )
    .await;

    report.database_reachable = match ping {
        Ok(Ok(_)) => true,
        Ok(Err(e)) => {
            report.errors.push(format!("Database unreachable: {}", e));
            false
        },
        Err(_) => {
            report.errors.push(format!(
                "Database check timed out after {}s",
                config.db_check_timeout_secs
            ));
            false
        },
    };

    if report.database_reachable {
        match missing_tables(pool).await {
            Ok(missing) => {
                report.tables_exist = missing.is_empty();
                if !missing.is_empty() {
                    report
                        .errors
                        .push(format!("Missing destination tables: {}", missing.join(", ")));
                }
                report.missing_tables = missing;
            },
            Err(e) => report.errors.push(format!("Schema check failed: {}", e)),
        }
    }

    report.can_proceed = report.errors.is_empty();
    debug!(
        can_proceed = report.can_proceed,
        errors = report.errors.len(),
        warnings = report.warnings.len(),
        "Pre-flight validation finished"
    );
    report
}

async fn missing_tables(pool: &PgPool) -> Result<Vec<String>, sqlx::Error> {
    let mut missing = Vec::new();
    for dataset in DatasetType::DEPENDENCY_ORDER {
        let exists: bool = sqlx::query_scalar("SELECT to_regclass($1) IS NOT NULL")
            .bind(dataset.table())
            .fetch_one(pool)
            .await?;
        if !exists {
            missing.push(dataset.table().to_string());
        }
    }
    Ok(missing)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> EtlConfig {
        EtlConfig {
            min_free_gb: 15.0,
            recommended_free_gb: 30.0,
            ..EtlConfig::default()
        }
    }

    #[test]
    fn test_assess_disk_thresholds() {
        let (errors, warnings) = assess_disk(10.0, &config());
        assert_eq!(errors.len(), 1);
        assert!(warnings.is_empty());

        let (errors, warnings) = assess_disk(20.0, &config());
        assert!(errors.is_empty());
        assert_eq!(warnings.len(), 1);

        let (errors, warnings) = assess_disk(30.0, &config());
        assert!(errors.is_empty());
        assert!(warnings.is_empty());
    }

    #[test]
    fn test_bytes_to_gb() {
        assert_eq!(bytes_to_gb(1024 * 1024 * 1024), 1.0);
        assert_eq!(bytes_to_gb(0), 0.0);
    }

    #[test]
    fn test_disk_usage_on_missing_path_uses_ancestor() {
        let dir = tempfile::tempdir().unwrap();
        let usage = disk_usage(&dir.path().join("not/yet/created")).unwrap();
        assert!(usage.free_gb >= 0.0);
        assert!(usage.used_gb >= 0.0);
    }
}
