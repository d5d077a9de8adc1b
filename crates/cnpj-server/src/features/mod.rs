//! Feature modules of the control API
//!
//! Each feature is a vertical slice with its own commands, queries and
//! routes. Commands and queries implement the mediator `Request` marker so
//! handlers stay independent of the HTTP layer.
//!
//! # Features
//!
//! - **etl**: validate, start, status, logs, pause and resume of ingestion runs

pub mod etl;

use axum::Router;

use crate::ingest::EtlService;

/// Creates the API router with every feature mounted under its prefix
///
/// - `/etl` - Ingestion control
pub fn router(service: EtlService) -> Router<()> {
    Router::new().nest("/etl", etl::etl_routes().with_state(service))
}
