//! Start job command
//!
//! Claims the ETL lock and launches a background run.

use mediator::Request;
use serde::{Deserialize, Serialize};

use crate::ingest::service::{StartError, StartRequest};
use crate::ingest::EtlService;

/// Command to start an ingestion run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartJobCommand {
    #[serde(flatten)]
    pub request: StartRequest,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartJobResponse {
    pub status: String,
    pub job_id: String,
    pub message: String,
}

impl Request<Result<StartJobResponse, StartError>> for StartJobCommand {}

pub async fn handle(
    service: EtlService,
    command: StartJobCommand,
) -> Result<StartJobResponse, StartError> {
    let job_id = service.start(command.request).await?;

    Ok(StartJobResponse {
        status: "started".to_string(),
        message: format!("ETL job {} started in the background", job_id),
        job_id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_accepts_flat_body() {
        let command: StartJobCommand =
            serde_json::from_str(r#"{"force": true, "tables": ["empresas"]}"#).unwrap();
        assert!(command.request.force);
        assert_eq!(command.request.tables, vec!["empresas"]);
        assert!(!command.request.resume);
    }
}
