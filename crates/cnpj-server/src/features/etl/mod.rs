//! ETL control feature
//!
//! Unauthenticated routes that drive the ingestion pipeline. Only one job
//! runs at a time; the durable lock decides.

pub mod commands;
pub mod queries;
pub mod routes;


pub use routes::etl_routes;
