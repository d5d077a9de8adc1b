//! ETL commands (write operations)

pub mod start_job;

pub use start_job::{StartJobCommand, StartJobResponse};
