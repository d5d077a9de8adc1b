//! Get status query
//!
//! Latest job's status record, or an idle snapshot before any run.

use mediator::Request;
use serde::{Deserialize, Serialize};

use crate::ingest::{EtlService, StatusRecord};

/// Query for the current status; `job_id` selects a specific run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GetStatusQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum GetStatusError {
    #[error("Job not found: {0}")]
    NotFound(String),
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl Request<Result<StatusRecord, GetStatusError>> for GetStatusQuery {}

pub async fn handle(
    service: EtlService,
    query: GetStatusQuery,
) -> Result<StatusRecord, GetStatusError> {
    match query.job_id {
        Some(job_id) => service
            .job(&job_id)
            .await?
            .ok_or(GetStatusError::NotFound(job_id)),
        None => Ok(service.status().await?),
    }
}
