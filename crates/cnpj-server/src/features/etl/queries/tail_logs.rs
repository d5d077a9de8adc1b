//! Tail logs query

use mediator::Request;
use serde::{Deserialize, Serialize};

use crate::ingest::logs::LogTail;
use crate::ingest::EtlService;

/// `GET /logs?lines=N`; defaults to 100 and is capped at 10 000
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TailLogsQuery {
    pub lines: Option<usize>,
}

impl Request<anyhow::Result<LogTail>> for TailLogsQuery {}

pub async fn handle(service: EtlService, query: TailLogsQuery) -> anyhow::Result<LogTail> {
    service.logs(query.lines).await
}
