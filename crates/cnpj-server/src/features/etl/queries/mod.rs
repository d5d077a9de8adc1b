//! ETL queries (read operations)

pub mod get_status;
pub mod tail_logs;
pub mod validate;

pub use get_status::GetStatusQuery;
pub use tail_logs::TailLogsQuery;
pub use validate::ValidateQuery;
