//! CNPJ ingestion server library
//!
//! Loads the Receita Federal CNPJ open dataset into PostgreSQL.
//!
//! # Overview
//!
//! - **Pipeline** ([`ingest`]): catalog discovery, idempotent downloads,
//!   ZIP extraction, Latin-1 decoding and ordered bulk COPY
//! - **Control API** ([`features`]): validate, start, status and logs routes
//!   nested under `/api/v1/etl`
//! - **Configuration** ([`config`]): environment-based, with `.env` support
//!
//! # Job model
//!
//! One job runs at a time, guarded by a durable lock row with a heartbeat.
//! Progress is persisted to `etl_status` after every archive, and each
//! committed archive is written to a ledger so an interrupted period can be
//! resumed.

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod config;
pub mod error;
pub mod features;
pub mod ingest;
pub mod middleware;

pub use error::AppError;
