//! PostgreSQL COPY text format
//!
//! One line per row, columns separated by tabs, `\N` for NULL, and
//! backslash, tab, newline and carriage return escaped with a backslash.

use std::io::Write;

use crate::ingest::manifest::DatasetType;
use crate::ingest::models::{Batch, Record};

pub const NULL_TOKEN: &str = "\\N";

/// Escape one value for the text format
pub fn escape(value: &str) -> std::borrow::Cow<'_, str> {
    if !value.contains(['\\', '\t', '\n', '\r']) {
        return std::borrow::Cow::Borrowed(value);
    }

    let mut out = String::with_capacity(value.len() + 8);
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\t' => out.push_str("\\t"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            other => out.push(other),
        }
    }
    std::borrow::Cow::Owned(out)
}

fn push_record(out: &mut String, record: &Record) {
    for (i, value) in record.load_values().enumerate() {
        if i > 0 {
            out.push('\t');
        }
        match value {
            Some(v) => out.push_str(&escape(v)),
            None => out.push_str(NULL_TOKEN),
        }
    }
    out.push('\n');
}

/// Encode a whole batch into one COPY payload
pub fn encode_batch(batch: &Batch) -> String {
    let width = batch.dataset.load_columns().len();
    let mut out = String::with_capacity(batch.len() * width * 12);
    for record in &batch.records {
        push_record(&mut out, record);
    }
    out
}

/// Append one record to a staging file
pub fn write_record<W: Write>(writer: &mut W, record: &Record) -> std::io::Result<()> {
    let mut line = String::new();
    push_record(&mut line, record);
    writer.write_all(line.as_bytes())
}

fn column_list(dataset: DatasetType) -> String {
    dataset.load_columns().join(", ")
}

/// `COPY ... FROM STDIN` for the streaming path
pub fn copy_from_stdin(dataset: DatasetType) -> String {
    format!(
        "COPY {} ({}) FROM STDIN WITH (FORMAT text)",
        dataset.table(),
        column_list(dataset)
    )
}

/// Server-side `COPY ... FROM '<path>'` for the staged path
pub fn copy_from_file(dataset: DatasetType, server_path: &str) -> String {
    format!(
        "COPY {} ({}) FROM '{}' WITH (FORMAT text, ENCODING 'UTF8')",
        dataset.table(),
        column_list(dataset),
        server_path.replace('\'', "''")
    )
}
