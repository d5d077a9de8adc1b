//! CNPJ Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared error handling and logging for the CNPJ ingestion workspace.
//!
//! # Overview
//!
//! - **Error Handling**: [`EtlError`] and the [`Result`] alias
//! - **Logging**: centralized `tracing` setup with console and rolling file output
//!
//! # Example
//!
//! ```no_run
//! use cnpj_common::logging::{init_logging, LogConfig};
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = LogConfig::from_env()?;
//!     init_logging(&config)?;
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod logging;

// Re-export commonly used types
pub use error::{EtlError, Result};
