//! Run-level progress arithmetic

use std::time::{Duration, Instant};

/// Tracks archives processed against the planned total
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    started: Instant,
    files_total: u32,
    files_processed: u32,
    files_failed: u32,
    records_imported: u64,
}

impl ProgressTracker {
    pub fn new(files_total: u32) -> Self {
        Self::starting_at(Instant::now(), files_total)
    }

    pub fn starting_at(started: Instant, files_total: u32) -> Self {
        Self {
            started,
            files_total,
            files_processed: 0,
            files_failed: 0,
            records_imported: 0,
        }
    }

    /// Count one archive whose rows committed
    pub fn archive_done(&mut self, rows: u64) {
        self.files_processed += 1;
        self.records_imported += rows;
    }

    /// Count one archive that failed; it advances the run but is not processed
    pub fn archive_failed(&mut self) {
        self.files_failed += 1;
    }

    pub fn files_total(&self) -> u32 {
        self.files_total
    }

    pub fn files_processed(&self) -> u32 {
        self.files_processed
    }

    pub fn files_failed(&self) -> u32 {
        self.files_failed
    }

    /// Archives finished either way
    pub fn files_attempted(&self) -> u32 {
        self.files_processed + self.files_failed
    }

    pub fn records_imported(&self) -> u64 {
        self.records_imported
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn percent(&self) -> f64 {
        percent(self.files_attempted(), self.files_total)
    }

    pub fn eta(&self) -> Option<Duration> {
        eta(self.elapsed(), self.files_attempted(), self.files_total)
    }
}

/// processed / total × 100, rounded to two decimals
pub fn percent(processed: u32, total: u32) -> f64 {
    if total == 0 {
        return 0.0;
    }
    let raw = f64::from(processed) / f64::from(total) * 100.0;
    (raw * 100.0).round() / 100.0
}

/// elapsed / processed × remaining; unknown before the first archive
pub fn eta(elapsed: Duration, processed: u32, total: u32) -> Option<Duration> {
    if processed == 0 {
        return None;
    }
    let remaining = total.saturating_sub(processed);
    Some(elapsed.mul_f64(f64::from(remaining) / f64::from(processed)))
}
