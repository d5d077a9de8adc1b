//! Tail of the newest log file written by the logging subsystem

use cnpj_common::logging::{list_log_files, LogConfig};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

pub const DEFAULT_LOG_LINES: usize = 100;
pub const MAX_LOG_LINES: usize = 10_000;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogTail {
    pub logs: Vec<String>,
    /// Lines in the whole file, not just the returned tail
    pub total_lines: usize,
}

/// Requested line count, defaulted and capped
pub fn clamp_lines(requested: Option<usize>) -> usize {
    requested.unwrap_or(DEFAULT_LOG_LINES).clamp(1, MAX_LOG_LINES)
}

/// Last `lines` lines of the newest log file; empty when none exists yet
pub fn tail_latest(config: &LogConfig, lines: usize) -> anyhow::Result<LogTail> {
    let files = list_log_files(&config.log_dir, &config.log_file_prefix)?;
    match files.first() {
        Some(newest) => Ok(tail_file(newest, lines)?),
        None => Ok(LogTail::default()),
    }
}

pub fn tail_file(path: &Path, lines: usize) -> std::io::Result<LogTail> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut tail = VecDeque::with_capacity(lines.min(MAX_LOG_LINES));
    let mut total_lines = 0;
    let mut buf = Vec::new();

    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf)? == 0 {
            break;
        }
        total_lines += 1;
        if tail.len() == lines {
            tail.pop_front();
        }
        if lines > 0 {
            let line = String::from_utf8_lossy(&buf);
            tail.push_back(line.trim_end_matches(['\n', '\r']).to_string());
        }
    }

    Ok(LogTail {
        logs: tail.into(),
        total_lines,
    })
}
