//! Validate query
//!
//! Runs the pre-flight checks without starting anything.

use mediator::Request;
use serde::{Deserialize, Serialize};

use crate::ingest::preflight::ValidationReport;
use crate::ingest::EtlService;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidateQuery;

impl Request<ValidationReport> for ValidateQuery {}

pub async fn handle(service: EtlService, _query: ValidateQuery) -> ValidationReport {
    service.validate().await
}
